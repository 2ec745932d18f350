//! Transport credential resolution.

use std::path::{Path, PathBuf};

use tokio_native_tls::TlsConnector;
use tracing::{debug, error, info};

use runner_core::{Error, Result, ServerConfig};

/// Certificate file name inside the TLS directory.
pub const CERT_FILE: &str = "cert.pem";

/// Private key file name inside the TLS directory.
pub const KEY_FILE: &str = "key.pem";

/// PEM material for a TLS connection to the runner server.
#[derive(Clone)]
pub struct TlsMaterial {
    dir: PathBuf,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("dir", &self.dir)
            .field("cert_bytes", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Load `cert.pem` and `key.pem` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        debug!("Loading TLS material from {}", dir.display());

        let cert_pem = std::fs::read(&cert_path).map_err(|e| {
            error!("Failed to read certificate {}: {}", cert_path.display(), e);
            Error::Credentials(format!(
                "failed to read certificate {}: {e}",
                cert_path.display()
            ))
        })?;
        let key_pem = std::fs::read(&key_path).map_err(|e| {
            error!("Failed to read private key {}: {}", key_path.display(), e);
            Error::Credentials(format!(
                "failed to read private key {}: {e}",
                key_path.display()
            ))
        })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            cert_pem,
            key_pem,
        })
    }

    /// Directory the material was loaded from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Certificate PEM bytes.
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }
}

/// Channel credentials for the runner connection.
#[derive(Debug, Clone)]
pub enum TransportCredentials {
    /// Explicitly insecure (plain TCP) channel
    Insecure,
    /// TLS with a client identity; the certificate is also the trusted root
    Tls(TlsMaterial),
}

impl TransportCredentials {
    /// Resolve credentials for `config`.
    ///
    /// Missing or unreadable TLS files are fatal.
    pub fn resolve(config: &ServerConfig) -> Result<Self> {
        if config.tls_enabled {
            let material = TlsMaterial::load(&config.tls_dir)?;
            info!("Using TLS credentials from {}", config.tls_dir.display());
            Ok(Self::Tls(material))
        } else {
            info!("Using insecure channel credentials");
            Ok(Self::Insecure)
        }
    }

    /// Whether the channel is encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Build a TLS connector, or `None` for insecure channels.
    pub fn connector(&self) -> Result<Option<TlsConnector>> {
        let material = match self {
            Self::Insecure => return Ok(None),
            Self::Tls(material) => material,
        };

        let identity = native_tls::Identity::from_pkcs8(&material.cert_pem, &material.key_pem)
            .map_err(|e| Error::Credentials(format!("invalid client identity: {e}")))?;
        let root = native_tls::Certificate::from_pem(&material.cert_pem)
            .map_err(|e| Error::Credentials(format!("invalid certificate: {e}")))?;
        let connector = native_tls::TlsConnector::builder()
            .identity(identity)
            .add_root_certificate(root)
            .build()
            .map_err(|e| Error::Credentials(format!("failed to build TLS connector: {e}")))?;

        Ok(Some(TlsConnector::from(connector)))
    }
}
