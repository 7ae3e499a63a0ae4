//! Container runtime interface.
//!
//! The engine is an external collaborator; everything above it talks through
//! the [`ContainerRuntime`] trait so tests can substitute a scripted runtime.
//! The surface is deliberately narrow: list, create, start, stop, remove,
//! inspect, logs, attach. Nothing else is used.

pub mod demux;
pub mod docker;
pub(crate) mod http;

use std::io::{Read, Write};
use std::time::Duration;

use crate::errors::Result;

/// One row of `list(all=true)`. Names carry the engine-imposed leading `/`.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
}

impl ContainerSummary {
    /// Exact-name match against the `/name` form. Never prefix or substring:
    /// `foo` must not match `foo2`.
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| {
            n.strip_prefix('/')
                .map(|stripped| stripped == name)
                .unwrap_or(n == name)
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub image: String,
    pub name: Option<String>,
    /// Argv form; sent as `Cmd`.
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
    /// Volume mount points created inside the container.
    pub volumes: Vec<String>,
    /// Uid (or user name) the container process runs as.
    pub user: Option<String>,
    pub tty: bool,
    pub stdin_open: bool,
}

#[derive(Debug, Clone)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_ip: String,
    /// None lets the engine pick an ephemeral host port.
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub port_bindings: Vec<PortBinding>,
    /// `name:alias` pairs.
    pub links: Vec<String>,
    pub volumes_from: Vec<String>,
    /// `host_path:container_path` bind mounts.
    pub binds: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub image: String,
    pub ip_address: String,
    pub running: bool,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub stdout: bool,
    pub stderr: bool,
    /// Engine-side line cap; None fetches the full log.
    pub tail: Option<u32>,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            stdout: true,
            stderr: true,
            tail: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// Raw duplex stream to an attached container.
///
/// Reads deliver the engine's multiplexed frame stream (see [`demux`]);
/// writes feed the container's stdin unframed. `shutdown_write` half-closes
/// so the container observes stdin EOF while output can still drain.
/// `set_read_timeout` bounds every subsequent read so a hung helper cannot
/// block a pump forever.
pub trait AttachStream: Read + Write + Send {
    fn shutdown_write(&mut self) -> std::io::Result<()>;
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
}

pub trait ContainerRuntime: Send + Sync {
    fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Returns the engine-assigned container id.
    fn create_container(&self, spec: &CreateSpec) -> Result<String>;

    fn start_container(&self, name: &str, opts: &StartOptions) -> Result<()>;

    fn stop_container(&self, name: &str, grace: Duration) -> Result<()>;

    fn remove_container(&self, name: &str, force: bool) -> Result<()>;

    fn inspect_container(&self, name: &str) -> Result<ContainerDetails>;

    /// Raw multiplexed log stream; the caller demultiplexes and caps.
    fn container_logs(&self, name: &str, opts: &LogOptions) -> Result<Box<dyn Read + Send>>;

    fn attach_container(&self, name: &str, opts: &AttachOptions) -> Result<Box<dyn AttachStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_exact_name_match() {
        let c = ContainerSummary {
            names: vec!["/foo".into()],
            ..Default::default()
        };
        assert!(c.has_name("foo"));
        assert!(!c.has_name("fo"));
        assert!(!c.has_name("foo2"));
    }
}
