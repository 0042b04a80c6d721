//! Synchronous wrapper for applications without an async runtime.
//!
//! [`BlockingClient`] owns a small Tokio runtime with a single worker thread
//! that runs the transport's event loop. Each method hands its request to that
//! loop and blocks the calling thread until the reply comes back, so UI code
//! can treat `call()` as an ordinary function call while socket reads,
//! timeouts and reconnects keep running on the I/O thread.
//!
//! Do not use it from inside an async context; blocking on a runtime from
//! within another runtime panics.

use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast;

use crate::models::{Request, Response};
use crate::transport::{
    Client, ClientEvent, ClientOptions, ConnectionState, Endpoint, SupervisorStatus,
    TransportError,
};

/// Extra time allowed on drop beyond the disconnect grace period.
const DROP_SLACK: Duration = Duration::from_millis(100);

/// Blocking handle to a transport connection.
///
/// When dropped, closes the connection gracefully (bounded by the configured
/// grace period) and stops the I/O thread.
///
/// # Example
///
/// ```ignore
/// use storelink::blocking::BlockingClient;
/// use storelink::models::Request;
///
/// let mut client = BlockingClient::spawn(Default::default())?;
/// client.connect()?;
/// let response = client.request(&Request::new("login").with("username", "alice"));
/// if !response.success {
///     eprintln!("{}", response.error_message().unwrap_or("login failed"));
/// }
/// ```
pub struct BlockingClient {
    client: Client,
    runtime: Runtime,
    disconnect_grace: Duration,
}

impl BlockingClient {
    /// Start the I/O thread and the transport event loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be created.
    pub fn spawn(options: ClientOptions) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("storelink-io")
            .enable_all()
            .build()?;

        let disconnect_grace = options.disconnect_grace;
        let client = {
            let _guard = runtime.enter();
            Client::spawn(options)
        };

        Ok(Self {
            client,
            runtime,
            disconnect_grace,
        })
    }

    pub fn connect(&self) -> Result<(), TransportError> {
        self.runtime.block_on(self.client.connect())
    }

    pub fn connect_to(&self, endpoint: Endpoint) -> Result<(), TransportError> {
        self.runtime.block_on(self.client.connect_to(endpoint))
    }

    pub fn disconnect(&self) {
        self.runtime.block_on(self.client.disconnect())
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn set_call_timeout(&mut self, timeout: Duration) {
        self.client.set_call_timeout(timeout);
    }

    /// Send a request and block until its response, an error, or the timeout.
    pub fn call(&mut self, request: &Value) -> Result<Value, TransportError> {
        self.runtime.block_on(self.client.call(request))
    }

    pub fn call_with_timeout(
        &mut self,
        request: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        self.runtime
            .block_on(self.client.call_with_timeout(request, timeout))
    }

    /// Send a [`Request`]; failures come back as `success: false`.
    pub fn request(&mut self, request: &Request) -> Response {
        self.runtime.block_on(self.client.request(request))
    }

    /// Lifecycle events. Use `try_recv` from a UI tick or `blocking_recv`
    /// from a dedicated thread.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.client.subscribe()
    }

    pub fn status(&self) -> Result<SupervisorStatus, TransportError> {
        self.runtime.block_on(self.client.status())
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        let limit = self.disconnect_grace + DROP_SLACK;
        let client = &self.client;
        let closed = self
            .runtime
            .block_on(async { tokio::time::timeout(limit, client.disconnect()).await });

        if closed.is_err() {
            tracing::debug!(
                "Transport still closing after {}ms - abandoning",
                limit.as_millis()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blocking_call_without_connection() {
        let mut client = BlockingClient::spawn(ClientOptions::default()).unwrap();
        assert!(!client.is_connected());

        let started = std::time::Instant::now();
        let err = client.call(&json!({"action": "ping"})).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_blocking_connect_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = BlockingClient::spawn(ClientOptions {
            endpoint: Endpoint::tcp("127.0.0.1", port),
            ..ClientOptions::default()
        })
        .unwrap();

        assert!(matches!(
            client.connect(),
            Err(TransportError::Connect { .. })
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
