//! Storelink client transport.
//!
//! The seller, purchaser, admin and merchant consoles all talk to the same
//! backend through this crate:
//!
//! - `transport` - framing, the connection, synchronous-style calls, reconnect
//! - `blocking` - a thread-blocking wrapper for non-async applications
//! - `models` - request/response payload conventions
//! - `config` - endpoint, timeouts and reconnect policy
//!
//! # Example
//!
//! ```ignore
//! use storelink::blocking::BlockingClient;
//! use storelink::config::ClientConfig;
//! use storelink::models::Request;
//!
//! let config = ClientConfig::load()?;
//! let mut client = BlockingClient::spawn(config.client_options())?;
//! client.connect()?;
//! let orders = client.request(&Request::new("getOrders").with("userId", 7));
//! ```

pub mod blocking;
pub mod config;
pub mod models;
pub mod transport;
