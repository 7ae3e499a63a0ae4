/*!
Docker Engine API client over the local Unix socket.

One short-lived connection per call (`Connection: close`), hand-written
HTTP/1.1 as in [`super::http`]. Attach upgrades the connection to a raw
duplex stream; logs come back as the multiplexed frame stream that
[`super::demux`] understands.
*/

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use super::http::{self, BodyReader, Framing, Request, ResponseHead};
use super::{
    AttachOptions, AttachStream, ContainerDetails, ContainerRuntime, ContainerSummary, CreateSpec,
    LogOptions, StartOptions,
};
use crate::errors::{BridgeError, Result};

/// Oldest API revision that carries everything we use.
const API_PREFIX: &str = "/v1.24";

const MAX_JSON_BODY: usize = 8 * 1024 * 1024;
const MAX_ERROR_BODY: usize = 16 * 1024;

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

pub struct DockerClient {
    socket_path: PathBuf,
    io_timeout: Duration,
}

impl DockerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        DockerClient {
            socket_path: socket_path.into(),
            io_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(socket_path: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        DockerClient {
            socket_path: socket_path.into(),
            io_timeout,
        }
    }

    fn connect(&self) -> Result<UnixStream> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        Ok(stream)
    }

    /// One request/response exchange; the whole body is read before returning.
    fn roundtrip(
        &self,
        method: &str,
        target: &str,
        body: Option<&Value>,
    ) -> Result<(ResponseHead, Vec<u8>)> {
        debug!(method, endpoint = target, "engine request");
        let mut stream = self.connect()?;
        let body_bytes = match body {
            Some(v) => Some(serde_json::to_vec(v).map_err(|e| BridgeError::protocol(e.to_string()))?),
            None => None,
        };
        http::write_request(
            &mut stream,
            &Request {
                method,
                target,
                body: body_bytes.as_deref(),
                content_type: body_bytes.as_ref().map(|_| "application/json"),
                upgrade: false,
            },
        )?;
        let (head, leftover) = http::read_response_head(&mut stream)?;
        let framing = Framing::from_head(&head);
        let reader = BodyReader::new(stream, leftover, framing);
        let (bytes, _) = http::read_body_capped(reader, MAX_JSON_BODY)?;
        Ok((head, bytes))
    }

    fn expect_success(
        &self,
        head: &ResponseHead,
        body: &[u8],
        context: &str,
    ) -> Result<()> {
        if head.is_success() || head.status == 304 {
            return Ok(());
        }
        Err(engine_error(head.status, body, context))
    }
}

/// Shape an engine failure into a Runtime error, preferring the `message`
/// field of a JSON error body.
fn engine_error(status: u16, body: &[u8], context: &str) -> BridgeError {
    let detail = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    BridgeError::runtime(format!("{context}: engine returned {status}: {detail}"))
}

fn encode(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

impl ContainerRuntime for DockerClient {
    fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let target = format!(
            "{API_PREFIX}/containers/json?all={}",
            if all { 1 } else { 0 }
        );
        let (head, body) = self.roundtrip("GET", &target, None)?;
        self.expect_success(&head, &body, "list containers")?;
        let rows: Value = serde_json::from_slice(&body)
            .map_err(|e| BridgeError::protocol(format!("container list: {e}")))?;
        let mut out = Vec::new();
        for row in rows.as_array().map(|a| a.as_slice()).unwrap_or_default() {
            out.push(ContainerSummary {
                id: row["Id"].as_str().unwrap_or_default().to_string(),
                names: row["Names"]
                    .as_array()
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(|n| n.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
                image: row["Image"].as_str().unwrap_or_default().to_string(),
                state: row["State"].as_str().unwrap_or_default().to_string(),
            });
        }
        Ok(out)
    }

    fn create_container(&self, spec: &CreateSpec) -> Result<String> {
        let mut target = format!("{API_PREFIX}/containers/create");
        if let Some(name) = &spec.name {
            target.push_str(&format!("?name={}", encode(name)));
        }
        let mut payload = json!({
            "Image": spec.image,
            "Tty": spec.tty,
            "OpenStdin": spec.stdin_open,
        });
        if let Some(cmd) = &spec.command {
            payload["Cmd"] = json!(cmd);
        }
        if let Some(entrypoint) = &spec.entrypoint {
            payload["Entrypoint"] = json!(entrypoint);
        }
        if !spec.env.is_empty() {
            let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
            payload["Env"] = json!(env);
        }
        if !spec.volumes.is_empty() {
            let mut vols = serde_json::Map::new();
            for v in &spec.volumes {
                vols.insert(v.clone(), json!({}));
            }
            payload["Volumes"] = Value::Object(vols);
        }
        if let Some(user) = &spec.user {
            payload["User"] = json!(user);
        }
        let (head, body) = self.roundtrip("POST", &target, Some(&payload))?;
        self.expect_success(&head, &body, "create container")?;
        let reply: Value = serde_json::from_slice(&body)
            .map_err(|e| BridgeError::protocol(format!("create reply: {e}")))?;
        Ok(reply["Id"].as_str().unwrap_or_default().to_string())
    }

    fn start_container(&self, name: &str, opts: &StartOptions) -> Result<()> {
        let target = format!("{API_PREFIX}/containers/{}/start", encode(name));
        let mut host = serde_json::Map::new();
        if !opts.port_bindings.is_empty() {
            let mut bindings = serde_json::Map::new();
            for pb in &opts.port_bindings {
                let host_port = pb.host_port.map(|p| p.to_string()).unwrap_or_default();
                bindings.insert(
                    format!("{}/tcp", pb.container_port),
                    json!([{ "HostIp": pb.host_ip, "HostPort": host_port }]),
                );
            }
            host.insert("PortBindings".into(), Value::Object(bindings));
        }
        if !opts.links.is_empty() {
            host.insert("Links".into(), json!(opts.links));
        }
        if !opts.volumes_from.is_empty() {
            host.insert("VolumesFrom".into(), json!(opts.volumes_from));
        }
        if !opts.binds.is_empty() {
            host.insert("Binds".into(), json!(opts.binds));
        }
        let payload = Value::Object(host);
        let (head, body) = self.roundtrip("POST", &target, Some(&payload))?;
        self.expect_success(&head, &body, "start container")
    }

    fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        let target = format!(
            "{API_PREFIX}/containers/{}/stop?t={}",
            encode(name),
            grace.as_secs()
        );
        let (head, body) = self.roundtrip("POST", &target, None)?;
        // 304: already stopped
        self.expect_success(&head, &body, "stop container")
    }

    fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        let target = format!(
            "{API_PREFIX}/containers/{}?force={}",
            encode(name),
            if force { 1 } else { 0 }
        );
        let (head, body) = self.roundtrip("DELETE", &target, None)?;
        self.expect_success(&head, &body, "remove container")
    }

    fn inspect_container(&self, name: &str) -> Result<ContainerDetails> {
        let target = format!("{API_PREFIX}/containers/{}/json", encode(name));
        let (head, body) = self.roundtrip("GET", &target, None)?;
        self.expect_success(&head, &body, "inspect container")?;
        let info: Value = serde_json::from_slice(&body)
            .map_err(|e| BridgeError::protocol(format!("inspect reply: {e}")))?;
        Ok(ContainerDetails {
            image: info["Config"]["Image"].as_str().unwrap_or_default().to_string(),
            ip_address: info["NetworkSettings"]["IPAddress"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            running: info["State"]["Running"].as_bool().unwrap_or(false),
        })
    }

    fn container_logs(&self, name: &str, opts: &LogOptions) -> Result<Box<dyn Read + Send>> {
        let mut target = format!(
            "{API_PREFIX}/containers/{}/logs?stdout={}&stderr={}",
            encode(name),
            if opts.stdout { 1 } else { 0 },
            if opts.stderr { 1 } else { 0 },
        );
        if let Some(tail) = opts.tail {
            target.push_str(&format!("&tail={tail}"));
        }
        debug!(endpoint = %target, "engine log stream");
        let mut stream = self.connect()?;
        http::write_request(
            &mut stream,
            &Request {
                method: "GET",
                target: &target,
                body: None,
                content_type: None,
                upgrade: false,
            },
        )?;
        let (head, leftover) = http::read_response_head(&mut stream)?;
        if !head.is_success() {
            let framing = Framing::from_head(&head);
            let reader = BodyReader::new(stream, leftover, framing);
            let (body, _) = http::read_body_capped(reader, MAX_ERROR_BODY)?;
            return Err(engine_error(head.status, &body, "container logs"));
        }
        let framing = Framing::from_head(&head);
        Ok(Box::new(BodyReader::new(stream, leftover, framing)))
    }

    fn attach_container(&self, name: &str, opts: &AttachOptions) -> Result<Box<dyn AttachStream>> {
        let target = format!(
            "{API_PREFIX}/containers/{}/attach?stream=1&stdin={}&stdout={}&stderr={}",
            encode(name),
            if opts.stdin { 1 } else { 0 },
            if opts.stdout { 1 } else { 0 },
            if opts.stderr { 1 } else { 0 },
        );
        debug!(endpoint = %target, "engine attach");
        let mut stream = self.connect()?;
        http::write_request(
            &mut stream,
            &Request {
                method: "POST",
                target: &target,
                body: None,
                content_type: None,
                upgrade: true,
            },
        )?;
        let (head, leftover) = http::read_response_head(&mut stream)?;
        // 101 on a proper upgrade; older engines answer 200 and hijack anyway.
        if head.status != 101 && !head.is_success() {
            let framing = Framing::from_head(&head);
            let reader = BodyReader::new(stream, leftover, framing);
            let (body, _) = http::read_body_capped(reader, MAX_ERROR_BODY)?;
            return Err(engine_error(head.status, &body, "attach container"));
        }
        Ok(Box::new(HijackedStream {
            stream,
            buffered: leftover,
            pos: 0,
        }))
    }
}

/// The raw duplex stream left behind after an attach upgrade, with any bytes
/// read past the header boundary served first.
struct HijackedStream {
    stream: UnixStream,
    buffered: Vec<u8>,
    pos: usize,
}

impl Read for HijackedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos < self.buffered.len() {
            let take = (self.buffered.len() - self.pos).min(buf.len());
            buf[..take].copy_from_slice(&self.buffered[self.pos..self.pos + take]);
            self.pos += take;
            return Ok(take);
        }
        self.stream.read(buf)
    }
}

impl Write for HijackedStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl AttachStream for HijackedStream {
    fn shutdown_write(&mut self) -> std::io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}
