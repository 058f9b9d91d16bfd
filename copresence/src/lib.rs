//! `copresence`: live presence and room-state synchronization client.
//!
//! Keeps a client's view of its partner's presence and of a shared room
//! consistent with a server of record, over an unreliable push channel
//! backed by an authoritative pull surface.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod presence;
pub mod room;
pub mod transport;

pub use client::{ClientCommand, ClientEvent, ClientOptions, spawn_client};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, Inbound, Session};
pub use error::SyncError;
