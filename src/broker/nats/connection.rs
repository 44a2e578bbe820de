//! NATS session setup: auth, TLS, timeouts, reconnect policy and lifecycle callbacks.

use std::sync::Arc;

use async_nats::{ClientError, ConnectOptions, Event};
use tracing::{debug, error, info, warn};

use crate::broker::{SessionCell, SessionState};
use crate::config::NatsConfig;

/// Errors establishing a broker session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("Invalid TLS configuration: {0}")]
    Tls(String),
}

/// Apply a lifecycle event to the session state and log it.
fn on_event(session: &SessionCell, url: &str, event: Event) {
    match event {
        Event::Connected => {
            if session.get() == SessionState::Reconnecting {
                info!(url = %url, "Reconnected to NATS");
            }
            session.set(SessionState::Connected);
        }
        Event::Disconnected => {
            warn!(url = %url, "Disconnected from NATS, reconnecting");
            session.set(SessionState::Reconnecting);
        }
        Event::Closed => {
            info!(url = %url, "NATS connection closed");
            session.set(SessionState::Closed);
        }
        Event::ClientError(ClientError::MaxReconnects) => {
            error!(url = %url, "Reconnect attempts exhausted, session closed");
            session.set(SessionState::Closed);
        }
        Event::ServerError(err) => {
            error!(url = %url, error = %err, "NATS server error");
        }
        Event::ClientError(err) => {
            error!(url = %url, error = %err, "NATS client error");
        }
        Event::SlowConsumer(sid) => {
            error!(url = %url, subscription = sid, "NATS slow consumer");
        }
        other => {
            debug!(url = %url, event = %other, "NATS connection event");
        }
    }
}

/// Build connect options from configuration.
///
/// Lifecycle events update `session` and are logged; they never fail open operations.
pub(super) fn connect_options(
    config: &NatsConfig,
    session: Arc<SessionCell>,
) -> Result<ConnectOptions, ConnectionError> {
    let reconnect_wait = config.reconnect_wait();
    let url = config.url.clone();

    let mut options = ConnectOptions::new()
        .connection_timeout(config.connect_timeout())
        .request_timeout(Some(config.request_timeout()))
        .max_reconnects(config.reconnect_limit())
        .reconnect_delay_callback(move |_attempts| reconnect_wait)
        .event_callback(move |event| {
            let session = Arc::clone(&session);
            let url = url.clone();
            async move { on_event(&session, &url, event) }
        });

    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        options = options.user_and_password(user.clone(), password.clone());
    }

    if config.tls_enabled() {
        options = options.require_tls(true);
        match (&config.tls_cert_file, &config.tls_key_file) {
            (Some(cert), Some(key)) => {
                options = options.add_client_certificate(cert.clone(), key.clone());
            }
            (None, None) => {}
            _ => {
                return Err(ConnectionError::Tls(
                    "client certificate and key must be configured together".to_string(),
                ))
            }
        }
        if let Some(ca) = &config.tls_ca_file {
            options = options.add_root_certificates(ca.clone());
        }
    }

    Ok(options)
}

/// Connect to the configured server.
pub(super) async fn connect(
    config: &NatsConfig,
    session: Arc<SessionCell>,
) -> Result<async_nats::Client, ConnectionError> {
    info!(url = %config.url, "Connecting to NATS");

    let options = connect_options(config, Arc::clone(&session))?;
    let client = options
        .connect(config.url.as_str())
        .await
        .map_err(|e| ConnectionError::Connect {
            url: config.url.clone(),
            message: e.to_string(),
        })?;

    session.set(SessionState::Connected);
    info!(url = %config.url, "Connected to NATS");
    Ok(client)
}
