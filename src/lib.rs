//! dockerbridge: privileged control plane between an untrusted multi-tenant
//! web front end and the Docker Engine.
//!
//! The front end never touches the engine socket. It speaks JSON-RPC to this
//! daemon, which validates every caller-supplied identifier, orchestrates
//! per-user data/application containers plus the shared infrastructure
//! containers, reaps idle sessions through a watchdog, and moves files in and
//! out of data volumes via single-shot helper containers.

pub mod bridge;
pub mod cli;
pub mod errors;
pub mod gateway;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod runtime;
pub mod util;
pub mod validate;
pub mod watchdog;

pub use errors::{BridgeError, Result};
