//! TLS certificate loading for the delegated backend.

use std::io;
use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::TlsConfig;

/// Load a rustls configuration from PEM certificate and key files.
pub async fn load_tls_config(config: &TlsConfig) -> io::Result<RustlsConfig> {
    ensure_exists(Path::new(&config.cert_path), "certificate")?;
    ensure_exists(Path::new(&config.key_path), "private key")?;
    RustlsConfig::from_pem_file(&config.cert_path, &config.key_path).await
}

fn ensure_exists(path: &Path, what: &str) -> io::Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{what} file not found: {}", path.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_certificate_is_not_found() {
        let config = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        let err = load_tls_config(&config).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("certificate"));
    }
}
