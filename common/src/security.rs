//! Process-wide encryption and credential state, passed around as an
//! explicit handle.

use std::{
    fmt, fs,
    io::BufReader,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig,
};
use rustls_pemfile::{certs, private_key};

use crate::{
    auth::{Mechanism, UserDatabase},
    config::{ClientCertPath, ServerCertPath},
    error::PmError,
};

/// What the provider loads on first use.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    /// Identity presented when accepting encrypted connections
    pub server:     Option<ServerCertPath>,
    /// Identity and trust roots used when connecting out
    pub client:     Option<ClientCertPath>,
    /// Accounts checked by the credential exchange
    pub users:      UserDatabase,
    /// Mechanisms offered to connecting clients; empty means all
    pub mechanisms: Vec<Mechanism>,
}

struct Loaded {
    server_optional:  Option<Arc<ServerConfig>>,
    server_mandatory: Option<Arc<ServerConfig>>,
    client:           Option<Arc<ClientConfig>>,
    client_identity:  bool,
}

struct Inner {
    config: SecurityConfig,
    lock:   Mutex<()>,
    loaded: OnceLock<Loaded>,
    runs:   AtomicUsize,
}

/// Shared handle to the encryption and credential libraries' state.
///
/// Cloning is cheap. [`SecurityProvider::initialize`] does its work once per
/// provider and is safe to call from several threads.
#[derive(Clone)]
pub struct SecurityProvider {
    inner: Arc<Inner>,
}

impl SecurityProvider {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                lock: Mutex::new(()),
                loaded: OnceLock::new(),
                runs: AtomicUsize::new(0),
            }),
        }
    }

    /// Install the crypto provider and load certificate material. Later
    /// calls return immediately.
    pub fn initialize(&self) -> Result<(), PmError> {
        if self.inner.loaded.get().is_some() {
            return Ok(());
        }
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| PmError::SecureChannel("security provider lock poisoned".into()))?;
        if self.inner.loaded.get().is_some() {
            return Ok(());
        }

        // Install default crypto provider for rustls if not already installed
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let loaded = self.load()?;
        self.inner.runs.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.loaded.set(loaded);
        tracing::info!("✓ Security provider initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.loaded.get().is_some()
    }

    /// How many times initialization actually ran. At most one.
    pub fn initializations(&self) -> usize {
        self.inner.runs.load(Ordering::SeqCst)
    }

    pub fn users(&self) -> &UserDatabase {
        &self.inner.config.users
    }

    /// Mechanisms this side offers as a server.
    pub fn mechanisms(&self) -> Vec<Mechanism> {
        if self.inner.config.mechanisms.is_empty() {
            Mechanism::ALL.to_vec()
        } else {
            self.inner.config.mechanisms.clone()
        }
    }

    fn loaded(&self) -> Result<&Loaded, PmError> {
        self.inner
            .loaded
            .get()
            .ok_or_else(|| PmError::SecureChannel("security provider not initialized".into()))
    }

    /// Acceptor configuration. With `cert_required` the peer must present a
    /// certificate that chains to the configured authority.
    pub fn server_config(&self, cert_required: bool) -> Result<Arc<ServerConfig>, PmError> {
        let loaded = self.loaded()?;
        let config = if cert_required {
            loaded.server_mandatory.as_ref()
        } else {
            loaded.server_optional.as_ref()
        };
        match config {
            Some(config) => Ok(Arc::clone(config)),
            None if cert_required && loaded.server_optional.is_some() => {
                Err(PmError::SecureChannel(
                    "client certificates required but no certificate authority is configured"
                        .into(),
                ))
            }
            None => Err(PmError::SecureChannel("no server certificate configured".into())),
        }
    }

    /// Connector configuration. A loaded client certificate is offered to
    /// any server that asks for one; with `require_identity` not having one
    /// is an error.
    pub fn client_config(&self, require_identity: bool) -> Result<Arc<ClientConfig>, PmError> {
        let loaded = self.loaded()?;
        if require_identity && !loaded.client_identity {
            return Err(PmError::NeedClientCert);
        }
        loaded
            .client
            .clone()
            .ok_or_else(|| PmError::SecureChannel("no certificate authority configured".into()))
    }

    fn load(&self) -> Result<Loaded, PmError> {
        let mut loaded = Loaded {
            server_optional:  None,
            server_mandatory: None,
            client:           None,
            client_identity:  false,
        };

        if let Some(paths) = &self.inner.config.server {
            tracing::info!("Loading relay certificates:");
            tracing::info!("  - Server cert: {:?}", paths.cert_path);
            tracing::info!("  - Server key: {:?}", paths.key_path);
            tracing::info!("  - CA cert: {:?}", paths.ca_path);
            let chain = load_certs(&paths.cert_path)?;
            let key = load_key(&paths.key_path)?;
            let roots = if paths.ca_path.is_file() {
                Some(Arc::new(load_roots(&paths.ca_path)?))
            } else {
                tracing::warn!(
                    "No CA at {:?}; client certificates cannot be verified",
                    paths.ca_path
                );
                None
            };

            let optional = match &roots {
                Some(roots) => {
                    let verifier = WebPkiClientVerifier::builder(Arc::clone(roots))
                        .allow_unauthenticated()
                        .build()
                        .map_err(|e| PmError::SecureChannel(e.to_string()))?;
                    ServerConfig::builder()
                        .with_client_cert_verifier(verifier)
                        .with_single_cert(chain.clone(), key.clone_key())?
                }
                None => ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(chain.clone(), key.clone_key())?,
            };
            loaded.server_optional = Some(Arc::new(optional));

            if let Some(roots) = roots {
                let verifier = WebPkiClientVerifier::builder(roots)
                    .build()
                    .map_err(|e| PmError::SecureChannel(e.to_string()))?;
                let mandatory = ServerConfig::builder()
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(chain, key)?;
                loaded.server_mandatory = Some(Arc::new(mandatory));
            }
        }

        if let Some(paths) = &self.inner.config.client {
            let roots = load_roots(&paths.ca_path)?;
            let config = if paths.has_identity() {
                let chain = load_certs(&paths.cert_path)?;
                let key = load_key(&paths.key_path)?;
                loaded.client_identity = true;
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_client_auth_cert(chain, key)?
            } else {
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            };
            loaded.client = Some(Arc::new(config));
        }

        Ok(loaded)
    }
}

impl fmt::Debug for SecurityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityProvider")
            .field("initialized", &self.is_initialized())
            .field("server", &self.inner.config.server.is_some())
            .field("client", &self.inner.config.client.is_some())
            .field("users", &self.inner.config.users)
            .finish()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, PmError> {
    fs::read(path).map_err(|e| PmError::SecureChannel(format!("failed to read {:?}: {}", path, e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, PmError> {
    let pem = read_pem(path)?;
    let chain = certs(&mut BufReader::new(&*pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PmError::SecureChannel(format!("failed to parse {:?}: {}", path, e)))?;
    if chain.is_empty() {
        return Err(PmError::SecureChannel(format!("no certificates in {:?}", path)));
    }
    Ok(chain)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, PmError> {
    let pem = read_pem(path)?;
    private_key(&mut BufReader::new(&*pem))
        .map_err(|e| PmError::SecureChannel(format!("failed to parse {:?}: {}", path, e)))?
        .ok_or_else(|| PmError::SecureChannel(format!("no private key found in {:?}", path)))
}

fn load_roots(path: &Path) -> Result<RootCertStore, PmError> {
    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(load_certs(path)?);
    if root_store.is_empty() {
        return Err(PmError::SecureChannel(format!(
            "No valid CA certificates found in {:?}",
            path
        )));
    }
    Ok(root_store)
}
