use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rustls;
use interceptor_core::{CertificateConfig, InterceptorError};
use rcgen::{Certificate, CertificateParams, KeyPair};
use std::fs;
use std::path::Path;

/// An existing root CA loaded from disk.
///
/// The key pair and certificate are read from PEM; nothing is ever
/// generated. The certificate must already be trusted by the clients that
/// go through the proxy.
pub struct CertificateAuthority {
    ca_cert: Certificate,
}

impl CertificateAuthority {
    /// Load the CA named by the certificate config
    pub fn load(config: &CertificateConfig) -> Result<Self, InterceptorError> {
        Self::load_files(&config.ca_cert_path, &config.ca_key_path)
    }

    pub fn load_files(cert_path: &Path, key_path: &Path) -> Result<Self, InterceptorError> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
            InterceptorError::Certificate(format!("Failed to read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| {
            InterceptorError::Certificate(format!("Failed to read {}: {}", key_path.display(), e))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Create a CertificateAuthority from PEM strings (cert and key).
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, InterceptorError> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| InterceptorError::Certificate(format!("Failed to parse CA key: {}", e)))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
            InterceptorError::Certificate(format!("Failed to parse CA certificate: {}", e))
        })?;
        let ca_cert = Certificate::from_params(params)
            .map_err(|e| InterceptorError::Certificate(format!("Failed to load CA: {}", e)))?;

        Ok(Self { ca_cert })
    }

    /// Signing authority for hudsucker, caching up to `cache_size` leaf
    /// certificates
    pub fn authority(&self, cache_size: u64) -> Result<RcgenAuthority, InterceptorError> {
        // Hudsucker/Rustls expects DER, not PEM.
        let cert_der = self.ca_cert.serialize_der().map_err(|e| {
            InterceptorError::Certificate(format!("Failed to serialize CA cert DER: {}", e))
        })?;
        let key_der = self.ca_cert.serialize_private_key_der();

        RcgenAuthority::new(
            rustls::PrivateKey(key_der),
            rustls::Certificate(cert_der),
            cache_size,
        )
        .map_err(|e| InterceptorError::Certificate(format!("Failed to create CA authority: {}", e)))
    }
}
