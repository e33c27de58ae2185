//! Patient/doctor chat backend: a persistent message log with read state,
//! per-doctor conversation summaries, a two-party realtime room broker and
//! the session controller both portals run against it.

pub mod auth;
pub mod broker;
pub mod chat;
pub mod client;
pub mod config;
pub mod conversation;
pub mod entity;
pub mod error;
pub mod server;
pub mod store;

pub use broker::RoomBroker;
pub use error::{ChatError, Result};
pub use store::Store;
