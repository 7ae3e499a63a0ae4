//! Scripted container runtime for integration tests.
//!
//! Records every call, keeps an in-memory container table, and serves canned
//! multiplexed streams on attach/logs. Fault injection knobs cover the
//! leak-on-failure properties (failing start, failing mid-pump read).

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dockerbridge::errors::{BridgeError, Result};
use dockerbridge::runtime::{
    AttachOptions, AttachStream, ContainerDetails, ContainerRuntime, ContainerSummary, CreateSpec,
    LogOptions, StartOptions,
};

pub const HELPER_PREFIX: &str = "bridge_";

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub name: String,
    pub image: String,
    pub running: bool,
}

#[derive(Default)]
pub struct MockState {
    pub containers: Vec<MockContainer>,
    /// One entry per runtime call, e.g. `"create data_alice"`.
    pub calls: Vec<String>,
    pub created: Vec<CreateSpec>,
    pub started: Vec<(String, StartOptions)>,
    /// Multiplexed bytes served on attach, keyed by exact container name.
    pub attach_output: HashMap<String, Vec<u8>>,
    /// Served on attach for any helper (`bridge_*`) without an exact entry.
    pub helper_output: Option<Vec<u8>>,
    /// Multiplexed log bytes keyed by container name.
    pub log_output: HashMap<String, Vec<u8>>,
    pub ips: HashMap<String, String>,
    /// Attach reads fail after this many payload bytes were served.
    pub fail_read_after: Option<usize>,
    /// Starting a container whose name begins with one of these fails.
    pub fail_start_prefixes: Vec<String>,
    /// Bytes written into attached stdin, in attach order.
    pub stdin_writes: Vec<(String, Arc<Mutex<Vec<u8>>>)>,
    /// Half-close flags, in attach order.
    pub shutdowns: Vec<(String, Arc<AtomicBool>)>,
}

pub struct MockRuntime {
    pub state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Arc<MockRuntime> {
        Arc::new(MockRuntime {
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn with_containers(containers: &[(&str, &str)]) -> Arc<MockRuntime> {
        let rt = MockRuntime::new();
        {
            let mut st = rt.state.lock().unwrap();
            for (name, image) in containers {
                st.containers.push(MockContainer {
                    name: (*name).to_string(),
                    image: (*image).to_string(),
                    running: true,
                });
            }
        }
        rt
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Helper containers still present; must be empty after every bridge op.
    pub fn helper_leftovers(&self) -> Vec<String> {
        self.container_names()
            .into_iter()
            .filter(|n| n.starts_with(HELPER_PREFIX))
            .collect()
    }

    pub fn set_helper_output(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().helper_output = Some(bytes);
    }

    pub fn last_stdin_write(&self) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        st.stdin_writes
            .last()
            .map(|(_, buf)| buf.lock().unwrap().clone())
    }

    pub fn shutdown_count(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.shutdowns
            .iter()
            .filter(|(_, flag)| flag.load(Ordering::SeqCst))
            .count()
    }
}

/// Build a multiplexed stream from (kind, payload) frames; kind 1 is stdout,
/// 2 stderr.
pub fn mux(frames: &[(u8, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (kind, payload) in frames {
        out.push(*kind);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
    }
    out
}

impl ContainerRuntime for MockRuntime {
    fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push("list".to_string());
        Ok(st
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: format!("id-{}", c.name),
                names: vec![format!("/{}", c.name)],
                image: c.image.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }

    fn create_container(&self, spec: &CreateSpec) -> Result<String> {
        let mut st = self.state.lock().unwrap();
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("anon-{}", st.containers.len()));
        st.calls.push(format!("create {name}"));
        if st.containers.iter().any(|c| c.name == name) {
            return Err(BridgeError::runtime(format!(
                "create {name}: engine returned 409: name already in use"
            )));
        }
        st.containers.push(MockContainer {
            name: name.clone(),
            image: spec.image.clone(),
            running: false,
        });
        st.created.push(spec.clone());
        Ok(format!("id-{name}"))
    }

    fn start_container(&self, name: &str, opts: &StartOptions) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("start {name}"));
        if st
            .fail_start_prefixes
            .iter()
            .any(|p| name.starts_with(p.as_str()))
        {
            return Err(BridgeError::runtime(format!(
                "start {name}: engine returned 500: injected failure"
            )));
        }
        match st.containers.iter_mut().find(|c| c.name == name) {
            Some(c) => {
                c.running = true;
                st.started.push((name.to_string(), opts.clone()));
                Ok(())
            }
            None => Err(BridgeError::runtime(format!(
                "start {name}: engine returned 404: no such container"
            ))),
        }
    }

    fn stop_container(&self, name: &str, _grace: Duration) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("stop {name}"));
        match st.containers.iter_mut().find(|c| c.name == name) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(BridgeError::runtime(format!(
                "stop {name}: engine returned 404: no such container"
            ))),
        }
    }

    fn remove_container(&self, name: &str, _force: bool) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("remove {name}"));
        let before = st.containers.len();
        st.containers.retain(|c| c.name != name);
        if st.containers.len() == before {
            return Err(BridgeError::runtime(format!(
                "remove {name}: engine returned 404: no such container"
            )));
        }
        Ok(())
    }

    fn inspect_container(&self, name: &str) -> Result<ContainerDetails> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("inspect {name}"));
        let container = st
            .containers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                BridgeError::runtime(format!(
                    "inspect {name}: engine returned 404: no such container"
                ))
            })?;
        Ok(ContainerDetails {
            image: container.image.clone(),
            ip_address: st
                .ips
                .get(name)
                .cloned()
                .unwrap_or_else(|| "172.17.0.23".to_string()),
            running: container.running,
        })
    }

    fn container_logs(&self, name: &str, _opts: &LogOptions) -> Result<Box<dyn Read + Send>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("logs {name}"));
        if !st.containers.iter().any(|c| c.name == name) {
            return Err(BridgeError::runtime(format!(
                "logs {name}: engine returned 404: no such container"
            )));
        }
        let bytes = st.log_output.get(name).cloned().unwrap_or_default();
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn attach_container(&self, name: &str, _opts: &AttachOptions) -> Result<Box<dyn AttachStream>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("attach {name}"));
        let output = st
            .attach_output
            .get(name)
            .cloned()
            .or_else(|| {
                if name.starts_with(HELPER_PREFIX) {
                    st.helper_output.clone()
                } else {
                    None
                }
            })
            .unwrap_or_default();
        let written = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        st.stdin_writes.push((name.to_string(), written.clone()));
        st.shutdowns.push((name.to_string(), shutdown.clone()));
        Ok(Box::new(MockAttachStream {
            output: Cursor::new(output),
            written,
            shutdown,
            fail_read_after: st.fail_read_after,
            served: 0,
        }))
    }
}

struct MockAttachStream {
    output: Cursor<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
    fail_read_after: Option<usize>,
    served: usize,
}

impl Read for MockAttachStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(limit) = self.fail_read_after {
            if self.served >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "injected read failure",
                ));
            }
        }
        let n = self.output.read(buf)?;
        self.served += n;
        Ok(n)
    }
}

impl Write for MockAttachStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AttachStream for MockAttachStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}
