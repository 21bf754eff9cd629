//! Certificate handling for the tunnel's mutual TLS
//!
//! Loading PEM material from disk, and generating a development PKI
//! (one CA plus CA-signed server and client certificates).

pub mod dev_pki;
pub mod pem;

pub use dev_pki::{DevPki, IssuedCertificate};
pub use pem::{load_certs, load_private_key, load_root_store};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("No {kind} found in {path}")]
    Empty { kind: &'static str, path: String },

    #[error("Invalid certificate material in {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}
