//! Client TLS configuration for upstream connections.
//!
//! Certificates are always verified. Roots come from `ca_file` when set,
//! otherwise from the platform store.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};

use crate::config::UpstreamTlsConfig;

/// Build the base client config shared by every peer of an upstream.
pub fn load_client_config(config: &UpstreamTlsConfig) -> Result<Arc<ClientConfig>, io::Error> {
    let mut roots = RootCertStore::empty();

    match &config.ca_file {
        Some(path) => {
            let mut reader = BufReader::new(File::open(path).map_err(|e| {
                io::Error::new(e.kind(), format!("CA file {}: {e}", path.display()))
            })?);
            for cert in rustls_pemfile::certs(&mut reader) {
                roots
                    .add(cert?)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                if roots.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            if !native.errors.is_empty() {
                tracing::warn!(errors = ?native.errors, "Some native certificates failed to load");
            }
        }
    }

    if roots.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no trusted root certificates"));
    }

    let mut client = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    client.alpn_protocols = vec![b"http/1.1".to_vec()];

    tracing::debug!(
        server_name = ?config.server_name,
        session_cache_size = config.session_cache_size,
        "Upstream TLS configured"
    );
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_ca_file_is_an_error() {
        let config = UpstreamTlsConfig {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(load_client_config(&config).is_err());
    }

    #[test]
    fn empty_ca_file_has_no_roots() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# no certificates").unwrap();
        let config = UpstreamTlsConfig {
            ca_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let err = load_client_config(&config).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
