//! Connection lifecycle hooks.
//!
//! Hooks observe what the dispatcher does without changing it. They run in
//! registration order, synchronously, so they must not block.

use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::dispatcher::{ConnectionError, DispatchError};

/// Observer of connection events.
pub trait ConnectionHook: Send + Sync {
    /// A connection was accepted.
    fn on_open(&self, _connection: &ConnectionHandle) {}

    /// A connection attempt was refused.
    fn on_rejected(&self, _app_key: &str, _error: &ConnectionError) {}

    /// A frame arrived from a client.
    fn on_message(&self, _connection: &ConnectionHandle, _frame: &str) {}

    /// Handling a frame failed.
    fn on_error(&self, _connection: &ConnectionHandle, _error: &DispatchError) {}

    /// A connection went away.
    fn on_close(&self, _connection: &ConnectionHandle) {}
}

/// Logs connection events through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct LoggingHook {
    /// Also log every inbound frame.
    pub verbose: bool,
}

impl LoggingHook {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ConnectionHook for LoggingHook {
    fn on_open(&self, connection: &ConnectionHandle) {
        info!(
            socket_id = %connection.socket_id(),
            app_id = %connection.app_id(),
            "Connection opened"
        );
    }

    fn on_rejected(&self, app_key: &str, error: &ConnectionError) {
        warn!(app_key = %app_key, code = error.code().code(), error = %error, "Connection rejected");
    }

    fn on_message(&self, connection: &ConnectionHandle, frame: &str) {
        if self.verbose {
            debug!(socket_id = %connection.socket_id(), frame = %frame, "Received frame");
        }
    }

    fn on_error(&self, connection: &ConnectionHandle, error: &DispatchError) {
        warn!(socket_id = %connection.socket_id(), error = %error, "Frame rejected");
    }

    fn on_close(&self, connection: &ConnectionHandle) {
        info!(
            socket_id = %connection.socket_id(),
            app_id = %connection.app_id(),
            "Connection closed"
        );
    }
}
