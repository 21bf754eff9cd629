//! PEM loading helpers

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

use crate::CertError;

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Load every certificate from a PEM file
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let path = path.as_ref();
    let mut reader = open(path)?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Invalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(CertError::Empty {
            kind: "certificate",
            path: path.display().to_string(),
        });
    }

    debug!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, CertError> {
    let path = path.as_ref();
    let mut reader = open(path)?;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::Invalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::Empty {
            kind: "private key",
            path: path.display().to_string(),
        })
}

/// Build a trust pool from a CA bundle
pub fn load_root_store(path: impl AsRef<Path>) -> Result<RootCertStore, CertError> {
    let path = path.as_ref();
    let mut roots = RootCertStore::empty();

    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| CertError::Invalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    }

    Ok(roots)
}
