//! Connect handshake and schema bootstrap
//!
//! `connect` validates the configuration, opens (or adopts) a backend, and
//! runs a bounded handshake: a ping plus a version query, all of which must
//! finish within the connect timeout. The reported version picks the key
//! rules for the lifetime of the connection. Unless probing, the required
//! indexes are then created; creating them again is a no-op.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use tracing::{debug, info, instrument};

use crate::backend::{
    DocumentBackend, IndexSpec, MemoryBackend, RedbBackend, RedbBackendConfig, ServerVersion,
};
use crate::config::{ConnectMode, StoreConfig};
use crate::error::StoreError;
use crate::sanitize::{KeyRules, KeySanitizer};

/// Parsed backend address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddress {
    /// `memory://` or `memory://<label>`
    Memory(String),
    /// `redb://<path>` or a bare path ending in `.redb`
    Redb(PathBuf),
}

impl FromStr for BackendAddress {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(label) = s.strip_prefix("memory://") {
            return Ok(BackendAddress::Memory(label.to_string()));
        }
        if let Some(path) = s.strip_prefix("redb://") {
            if path.is_empty() {
                return Err(StoreError::configuration("redb:// address has no path"));
            }
            return Ok(BackendAddress::Redb(PathBuf::from(path)));
        }
        if s.ends_with(".redb") {
            return Ok(BackendAddress::Redb(PathBuf::from(s)));
        }
        Err(StoreError::configuration(format!(
            "unsupported connection '{s}': expected memory://, redb:// or a .redb path"
        )))
    }
}

/// Live handle produced by a successful connect
#[derive(Debug, Clone)]
pub struct Connection {
    backend: Arc<dyn DocumentBackend>,
    version: ServerVersion,
    rules: KeyRules,
}

impl Connection {
    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Version reported during the handshake
    pub fn version(&self) -> ServerVersion {
        self.version
    }

    /// Key rules fixed at connect time
    pub fn key_rules(&self) -> KeyRules {
        self.rules
    }

    pub fn sanitizer(&self) -> KeySanitizer {
        KeySanitizer::new(self.rules)
    }
}

/// Establishes and verifies connectivity to the configured backend
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    config: StoreConfig,
    injected: Option<Arc<dyn DocumentBackend>>,
}

impl ConnectionManager {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            injected: None,
        }
    }

    /// Connect through an already constructed backend instead of the address
    pub fn with_backend(config: StoreConfig, backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            config,
            injected: Some(backend),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Connect, verify, and (unless probing) bootstrap indexes
    #[instrument(skip(self), fields(connection = ?self.config.connection))]
    pub fn connect(&self, probe_only: bool) -> Result<Connection, StoreError> {
        self.config.validate()?;

        if self.config.mode == ConnectMode::Test {
            return Err(StoreError::connection(
                "test mode: connection failure forced",
            ));
        }

        let (backend, version) = self.handshake()?;
        let rules = KeyRules::for_version(&version);
        info!(%version, ?rules, "Connected to backend");

        if !probe_only {
            self.ensure_indexes(backend.as_ref())?;
        }

        Ok(Connection {
            backend,
            version,
            rules,
        })
    }

    /// Create the unique fingerprint index and the ledger compound index
    pub fn ensure_indexes(&self, backend: &dyn DocumentBackend) -> Result<(), StoreError> {
        let primary = self.config.primary_container();
        let ledger = self.config.ledger_container();
        if backend.ensure_index(&primary, &IndexSpec::unique_fingerprint())? {
            debug!(container = %primary, "Created unique fingerprint index");
        }
        if backend.ensure_index(&ledger, &IndexSpec::ledger_compound())? {
            debug!(container = %ledger, "Created ledger index");
        }
        Ok(())
    }

    /// Open the backend and query it, bounded by the connect timeout
    ///
    /// A handshake that times out is abandoned, not cancelled. Its thread
    /// keeps the backend until the slow call returns, so a redb file stays
    /// locked until then and reconnecting to the same path fails to open it.
    fn handshake(&self) -> Result<(Arc<dyn DocumentBackend>, ServerVersion), StoreError> {
        let timeout = self.config.connect_timeout();
        let (tx, rx) = mpsc::channel();

        let injected = self.injected.clone();
        let config = self.config.clone();
        thread::Builder::new()
            .name("logfold-connect".to_string())
            .spawn(move || {
                let result = open_backend(injected, &config).and_then(|backend| {
                    backend.ping()?;
                    let version = backend.server_version()?;
                    Ok((backend, version))
                });
                // the receiver is gone once the handshake timed out
                let _ = tx.send(result);
            })
            .map_err(|e| StoreError::connection(format!("failed to start handshake: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(handshake)) => Ok(handshake),
            Ok(Err(StoreError::Configuration(message))) => Err(StoreError::Configuration(message)),
            Ok(Err(e)) => Err(StoreError::connection(e.to_string())),
            Err(_) => Err(StoreError::connection(format!(
                "backend did not answer within {} ms",
                timeout.as_millis()
            ))),
        }
    }
}

fn open_backend(
    injected: Option<Arc<dyn DocumentBackend>>,
    config: &StoreConfig,
) -> Result<Arc<dyn DocumentBackend>, StoreError> {
    if let Some(backend) = injected {
        return Ok(backend);
    }

    let address = config
        .connection
        .as_deref()
        .ok_or_else(|| StoreError::configuration("no connection target configured"))?
        .parse::<BackendAddress>()?;

    match address {
        BackendAddress::Memory(_) => {
            let version = config.compat()?.unwrap_or_default();
            Ok(Arc::new(MemoryBackend::new().with_version(version)))
        }
        BackendAddress::Redb(db_path) => {
            let backend = RedbBackend::open(RedbBackendConfig {
                db_path,
                compat_version: config.compat()?,
                operation_timeout: config.operation_timeout(),
            })?;
            Ok(Arc::new(backend))
        }
    }
}
