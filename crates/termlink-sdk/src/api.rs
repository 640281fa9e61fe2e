//! SDK entry point.
//!
//! `TerminalApi` wires the shared transport, the typed gateway client and
//! the connection registry together. One instance serves every account on
//! a host; account connections are opened through [`TerminalApi::connect`].

use std::sync::Arc;

use chrono::{DateTime, Utc};

use termlink_common::ApiError;
use termlink_wire::{TransportConfig, WsTransport};

use crate::client::WsTerminalClient;
use crate::config::ClientOptions;
use crate::connection::{Account, TerminalConnection};
use crate::history::HistoryStorage;
use crate::registry::ConnectionRegistry;

/// Process-scoped SDK handle.
pub struct TerminalApi {
    transport: WsTransport,
    registry: Arc<ConnectionRegistry>,
}

impl TerminalApi {
    /// Builds the SDK against a gateway URL.
    ///
    /// The socket is not opened until [`start`]; connections opened
    /// before that wait out their request deadlines.
    ///
    /// [`start`]: TerminalApi::start
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        options: ClientOptions,
    ) -> Result<Self, ApiError> {
        options
            .validate()
            .map_err(|error| ApiError::Validation(error.to_string()))?;
        let mut transport_config: TransportConfig = options.transport_config(url);
        transport_config.token = token;
        let transport = WsTransport::new(transport_config);
        let client = Arc::new(WsTerminalClient::new(
            transport.clone(),
            options.application.clone(),
        ));
        let registry = ConnectionRegistry::new(client, options);
        Ok(Self {
            transport,
            registry,
        })
    }

    /// Opens the gateway socket.
    pub fn start(&self) {
        self.transport.start();
    }

    /// Returns the existing connection for the account or sets up a new
    /// one through the registry.
    pub async fn connect(
        &self,
        account: Account,
        history_storage: Option<Arc<dyn HistoryStorage>>,
        history_start_time: Option<DateTime<Utc>>,
    ) -> Result<TerminalConnection, ApiError> {
        self.registry
            .connect(account, history_storage, history_start_time)
            .await
    }

    /// The shared transport.
    pub fn transport(&self) -> &WsTransport {
        &self.transport
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Tears the transport down, failing in-flight requests.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}
