//! Development PKI generation
//!
//! Creates a throwaway certificate authority and issues one server and one
//! client certificate from it, which is everything the tunnel's mutual TLS
//! needs. **DO NOT use in production.**

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

use crate::CertError;

const VALIDITY_DAYS: i64 = 90;

/// A certificate with its private key, in both PEM and DER form
pub struct IssuedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl IssuedCertificate {
    fn new(cert: &Certificate, key: &KeyPair) -> Self {
        Self {
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}

/// CA, server and client certificates for one tunnel deployment
pub struct DevPki {
    pub ca: IssuedCertificate,
    pub server: IssuedCertificate,
    pub client: IssuedCertificate,
}

fn gen_err(e: rcgen::Error) -> CertError {
    CertError::GenerationFailed(e.to_string())
}

fn base_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "revtun dev");
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    params
}

impl DevPki {
    /// Generate a CA and issue a server certificate valid for `server_names`
    /// (DNS names or IP addresses) plus a client certificate.
    pub fn generate(server_names: &[String]) -> Result<Self, CertError> {
        let ca_key = KeyPair::generate().map_err(gen_err)?;
        let mut ca_params = base_params("revtun development CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = ca_params.self_signed(&ca_key).map_err(gen_err)?;

        let server_key = KeyPair::generate().map_err(gen_err)?;
        let mut server_params = base_params("revtun server");
        server_params.subject_alt_names = server_names
            .iter()
            .map(|name| match name.parse::<IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => Ia5String::try_from(name.as_str())
                    .map(SanType::DnsName)
                    .map_err(gen_err),
            })
            .collect::<Result<_, _>>()?;
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .map_err(gen_err)?;

        let client_key = KeyPair::generate().map_err(gen_err)?;
        let mut client_params = base_params("revtun client");
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .map_err(gen_err)?;

        Ok(Self {
            ca: IssuedCertificate::new(&ca_cert, &ca_key),
            server: IssuedCertificate::new(&server_cert, &server_key),
            client: IssuedCertificate::new(&client_cert, &client_key),
        })
    }

    /// Write `ca.crt`, `ca.key`, `server.crt`, `server.key`, `client.crt` and
    /// `client.key` into `dir`, creating it if needed.
    pub fn save_to_dir(&self, dir: &Path) -> Result<(), CertError> {
        std::fs::create_dir_all(dir).map_err(|source| CertError::Write {
            path: dir.display().to_string(),
            source,
        })?;

        let files = [
            ("ca.crt", &self.ca.cert_pem),
            ("ca.key", &self.ca.key_pem),
            ("server.crt", &self.server.cert_pem),
            ("server.key", &self.server.key_pem),
            ("client.crt", &self.client.cert_pem),
            ("client.key", &self.client.key_pem),
        ];

        for (name, contents) in files {
            let path = dir.join(name);
            std::fs::write(&path, contents).map_err(|source| CertError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }

        info!("Wrote development PKI to {}", dir.display());
        Ok(())
    }
}
