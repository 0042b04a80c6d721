//! Client transport to the bookstore server.
//!
//! One connection, length-prefixed JSON frames, one request in flight at a
//! time, and automatic reconnection after the link drops.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  commands   ┌──────────────────────────────┐   TCP / Unix
//! │    Client    │ ──────────► │ event loop task              │ ◄──────────► server
//! │   (handle)   │ ◄────────── │  Connection + ReceiveBuffer  │
//! └──────────────┘   replies   │  pending call                │
//!        ▲                     │  ReconnectSupervisor         │
//!        └──── ClientEvent ─── └──────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! ```text
//! 00 00 00 11 {"action":"ping"}
//! └─ u32 BE ┘ └─── payload ───┘
//! ```
//!
//! The next frame received answers the outstanding request; there are no
//! request IDs on the wire.
//!
//! # Usage
//!
//! ```ignore
//! use storelink::transport::{Client, ClientOptions};
//! use serde_json::json;
//!
//! let mut client = Client::spawn(ClientOptions::default());
//! client.connect().await?;
//! let books = client.call(&json!({"action": "getBooks"})).await?;
//! ```

mod client;
mod connection;
mod error;
mod framing;
mod supervisor;

pub use client::{
    Client, ClientEvent, ClientOptions, DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_DISCONNECT_GRACE,
};
pub use connection::{Connection, ConnectionEvent, ConnectionState, Endpoint, LossReason};
pub use error::{ConnectFailure, TransportError};
pub use framing::{
    check_len, encode, encode_json, try_decode, FrameTooLarge, ReceiveBuffer, HEADER_LEN,
    MAX_FRAME_LEN,
};
pub use supervisor::{
    ReconnectPolicy, ReconnectSupervisor, SupervisorState, SupervisorStatus,
    DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL,
};
