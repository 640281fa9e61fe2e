//! At-most-one live connection per account.
//!
//! Concurrent openers for the same account serialize on an installer
//! barrier: the first caller constructs and sets up the connection while
//! the rest wait and then observe the installed entry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tracing::info;

use termlink_common::ApiError;

use crate::client::TerminalClient;
use crate::config::ClientOptions;
use crate::connection::{Account, TerminalConnection};
use crate::history::HistoryStorage;

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<String, TerminalConnection>,
    /// Per-account barrier receivers; a `true` observation means the
    /// installer finished (successfully or not).
    pending: HashMap<String, watch::Receiver<bool>>,
}

/// Process-wide registry of account connections.
pub struct ConnectionRegistry {
    client: Arc<dyn TerminalClient>,
    options: ClientOptions,
    inner: Mutex<RegistryInner>,
    // Handed to connections so their close path can leave the registry.
    self_ref: Weak<ConnectionRegistry>,
}

impl ConnectionRegistry {
    /// Creates a registry over the given gateway client.
    pub fn new(client: Arc<dyn TerminalClient>, options: ClientOptions) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            client,
            options,
            inner: Mutex::new(RegistryInner::default()),
            self_ref: self_ref.clone(),
        })
    }

    /// The application tag connections of this registry run under.
    pub fn application(&self) -> &str {
        &self.options.application
    }

    /// Returns the existing connection for the account or creates,
    /// initializes and subscribes a new one.
    ///
    /// Concurrent callers for the same account observe the same
    /// connection instance; setup runs exactly once.
    pub async fn connect(
        &self,
        account: Account,
        history_storage: Option<Arc<dyn HistoryStorage>>,
        history_start_time: Option<DateTime<Utc>>,
    ) -> Result<TerminalConnection, ApiError> {
        loop {
            let barrier_tx = {
                let mut inner = self.inner.lock().await;
                if let Some(existing) = inner.connections.get(&account.id) {
                    return Ok(existing.clone());
                }
                match inner.pending.get(&account.id) {
                    Some(waiter) => {
                        let mut waiter = waiter.clone();
                        drop(inner);
                        // Installer finished (or died, dropping the
                        // sender); either way re-check the map.
                        let _ = waiter.changed().await;
                        continue;
                    }
                    None => {
                        let (barrier_tx, barrier_rx) = watch::channel(false);
                        inner.pending.insert(account.id.clone(), barrier_rx);
                        barrier_tx
                    }
                }
            };

            let connection = TerminalConnection::new(
                self.client.clone(),
                account.clone(),
                history_storage.clone(),
                self.self_ref.clone(),
                history_start_time,
                &self.options,
            );
            let setup = async {
                connection.initialize().await?;
                connection.subscribe().await
            }
            .await;

            {
                let mut inner = self.inner.lock().await;
                inner.pending.remove(&account.id);
                if setup.is_ok() {
                    inner.connections.insert(account.id.clone(), connection.clone());
                }
            }
            let _ = barrier_tx.send(true);

            return match setup {
                Ok(()) => {
                    info!(account_id = %account.id, "Connection installed");
                    Ok(connection)
                }
                Err(error) => {
                    // Detach the half-built connection's listeners.
                    connection.close().await;
                    Err(error)
                }
            };
        }
    }

    /// Purges an account's entry. Called by `TerminalConnection::close`.
    pub async fn remove(&self, account_id: &str) {
        self.inner.lock().await.connections.remove(account_id);
    }

    /// Number of live connections, for diagnostics.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    /// Whether no connection is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.connections.is_empty()
    }
}
