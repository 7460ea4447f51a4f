//! Per-connection request gateway for a replicated embedded SQLite database.
//!
//! The embedding server owns the accept loop, the wire codec and the
//! replication log; it feeds decoded [`proto::Request`]s to a
//! [`gateway::Gateway`] and writes out the [`proto::Response`]s the gateway
//! flushes through its [`gateway::Transport`].

pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod proto;
pub mod query;
pub mod statement;

pub use crate::cluster::{Cluster, DatabaseRef};
pub use crate::config::GatewayConfig;
pub use crate::error::Error;
pub use crate::gateway::{Gateway, Transport};
pub use crate::proto::{Request, Response};

pub type Result<T, E = Error> = std::result::Result<T, E>;
