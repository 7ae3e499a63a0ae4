/*!
Remote-call gateway: JSON-RPC 2.0 over HTTP.

Accept loop and per-connection threads in front of a static dispatch table.
Every caller-supplied identifier is validated here, before any runtime call;
validation failures come back as JSON-RPC `-32602` errors, runtime failures
keep the sentinel-result contract (`false`, `"error"`, empty) and never leak
engine detail to the caller.
*/

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::bridge::{absolute_userpath, FileBridge, DEFAULT_FILE_OWNER};
use crate::errors::BridgeError;
use crate::orchestrator::{data_container_name, Orchestrator};
use crate::util::find_header_end;
use crate::validate::{
    check_container_name, check_image_name, check_link, check_path, check_transfer_name,
};
use crate::watchdog::Watchdog;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const OPERATION_FAILED: i64 = -32000;

/// Fixed in-container location of the per-user auth secret.
const SECRET_PATH: &str = "/etc/rosauth/secret";

const MAX_BODY: usize = 32 * 1024 * 1024;
const HDR_CAP: usize = 64 * 1024;

/// The complete remote surface. Dispatch is a static name→handler mapping;
/// anything else is `-32601`.
pub static METHODS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "ensure_common_infrastructure",
        "create_user_data_container",
        "start_user_container",
        "start_webapp_container",
        "stop_container",
        "container_exists",
        "get_container_ip",
        "get_container_log",
        "refresh",
        "files_fromcontainer",
        "files_tocontainer",
        "files_largefromcontainer",
        "files_largetocontainer",
        "files_exists",
        "files_mkdir",
        "files_rm",
        "files_tar",
        "files_untar",
        "files_ls",
        "files_readsecret",
        "files_writesecret",
    ]
});

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }
}

/// Validation failures surface verbatim; everything else becomes a short,
/// stable failure the front end can branch on, with the detail logged here.
fn reject(method: &str, e: BridgeError) -> RpcError {
    if e.is_validation() {
        RpcError::new(INVALID_PARAMS, e.to_string())
    } else {
        error!(method, error = %e, "operation failed");
        RpcError::new(OPERATION_FAILED, "operation failed")
    }
}

/// Positional-or-named call parameters with typed accessors.
struct Params {
    positional: Vec<Value>,
    named: Map<String, Value>,
}

impl Params {
    fn new(raw: Option<Value>) -> Result<Params, RpcError> {
        match raw {
            None | Some(Value::Null) => Ok(Params {
                positional: Vec::new(),
                named: Map::new(),
            }),
            Some(Value::Array(positional)) => Ok(Params {
                positional,
                named: Map::new(),
            }),
            Some(Value::Object(named)) => Ok(Params {
                positional: Vec::new(),
                named,
            }),
            Some(_) => Err(RpcError::new(
                INVALID_REQUEST,
                "params must be an array or an object",
            )),
        }
    }

    fn get(&self, idx: usize, name: &str) -> Option<&Value> {
        self.positional.get(idx).or_else(|| self.named.get(name))
    }

    fn str_arg(&self, idx: usize, name: &str) -> Result<&str, RpcError> {
        self.get(idx, name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("missing string param {name}")))
    }

    fn opt_str_arg(&self, idx: usize, name: &str) -> Result<Option<&str>, RpcError> {
        match self.get(idx, name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(RpcError::new(
                INVALID_PARAMS,
                format!("param {name} must be a string"),
            )),
        }
    }

    fn list_arg(&self, idx: usize, name: &str) -> Result<Vec<String>, RpcError> {
        let raw = self
            .get(idx, name)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("missing list param {name}")))?;
        raw.as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|v| {
                        v.as_str().map(String::from).ok_or_else(|| {
                            RpcError::new(
                                INVALID_PARAMS,
                                format!("param {name} must be a list of strings"),
                            )
                        })
                    })
                    .collect::<Result<Vec<String>, RpcError>>()
            })
            .unwrap_or_else(|| {
                Err(RpcError::new(
                    INVALID_PARAMS,
                    format!("param {name} must be a list"),
                ))
            })
    }
}

pub struct Gateway {
    orchestrator: Arc<Orchestrator>,
    bridge: Arc<FileBridge>,
    watchdog: Watchdog,
    session_ttl: Duration,
}

impl Gateway {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        bridge: Arc<FileBridge>,
        watchdog: Watchdog,
        session_ttl: Duration,
    ) -> Self {
        Gateway {
            orchestrator,
            bridge,
            watchdog,
            session_ttl,
        }
    }

    /// Handle one JSON-RPC request body. Returns `None` for notifications
    /// (no id), a serialized response otherwise.
    pub fn handle_rpc(&self, body: &[u8]) -> Option<Vec<u8>> {
        let parsed: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                return Some(error_envelope(
                    Value::Null,
                    &RpcError::new(PARSE_ERROR, format!("parse error: {e}")),
                ))
            }
        };
        let id = parsed.get("id").cloned();
        let method = match parsed.get("method").and_then(|m| m.as_str()) {
            Some(m) => m.to_string(),
            None => {
                return Some(error_envelope(
                    id.unwrap_or(Value::Null),
                    &RpcError::new(INVALID_REQUEST, "missing method"),
                ))
            }
        };
        let outcome = Params::new(parsed.get("params").cloned())
            .and_then(|params| self.dispatch(&method, &params));
        let id = match id {
            Some(id) => id,
            None => {
                // Notification: execute, report nothing.
                if let Err(e) = &outcome {
                    debug!(method = %method, code = e.code, "notification failed");
                }
                return None;
            }
        };
        Some(match outcome {
            Ok(result) => result_envelope(id, result),
            Err(e) => error_envelope(id, &e),
        })
    }

    fn dispatch(&self, method: &str, p: &Params) -> Result<Value, RpcError> {
        let v = |e: BridgeError| reject(method, e);
        match method {
            "ensure_common_infrastructure" => {
                Ok(json!(self.orchestrator.ensure_common_infrastructure()))
            }

            "create_user_data_container" => {
                let name = p.str_arg(0, "container_name")?;
                check_container_name(name, "container_name").map_err(v)?;
                Ok(json!(self.orchestrator.create_user_data_container(name)))
            }

            "start_user_container" => {
                let name = p.str_arg(0, "container_name")?;
                let image = p.str_arg(1, "application_container")?;
                let links = p.list_arg(2, "links")?;
                let volumes = p.list_arg(3, "volumes")?;
                check_container_name(name, "container_name").map_err(v)?;
                check_image_name(image, "application_container").map_err(v)?;
                for link in &links {
                    check_link(link, "links").map_err(v)?;
                }
                for volume in &volumes {
                    check_container_name(volume, "volumes").map_err(v)?;
                }
                let ok = self
                    .orchestrator
                    .start_user_container(name, image, &links, &volumes);
                if ok {
                    self.watchdog.set(name, self.session_ttl);
                }
                Ok(json!(ok))
            }

            "start_webapp_container" => {
                let name = p.str_arg(0, "container_name")?;
                let image = p.str_arg(1, "webapp_container")?;
                let links = p.list_arg(2, "links")?;
                let volumes = p.list_arg(3, "volumes")?;
                check_container_name(name, "container_name").map_err(v)?;
                check_image_name(image, "webapp_container").map_err(v)?;
                for link in &links {
                    check_link(link, "links").map_err(v)?;
                }
                for volume in &volumes {
                    check_container_name(volume, "volumes").map_err(v)?;
                }
                Ok(json!(self
                    .orchestrator
                    .start_webapp_container(name, image, &links, &volumes)))
            }

            "stop_container" => {
                let name = p.str_arg(0, "user_container_name")?;
                check_container_name(name, "user_container_name").map_err(v)?;
                let ok = self.orchestrator.stop_container(name);
                self.watchdog.remove(name);
                Ok(json!(ok))
            }

            "container_exists" => {
                let name = p.str_arg(0, "user_container_name")?;
                check_container_name(name, "user_container_name").map_err(v)?;
                match p.opt_str_arg(1, "base_container_name")? {
                    Some(image) => {
                        check_image_name(image, "base_container_name").map_err(v)?;
                        Ok(json!(self.orchestrator.container_exists_with_image(name, image)))
                    }
                    None => Ok(json!(self.orchestrator.container_exists(name))),
                }
            }

            "get_container_ip" => {
                let name = p.str_arg(0, "user_container_name")?;
                check_container_name(name, "user_container_name").map_err(v)?;
                Ok(json!(self.orchestrator.get_container_ip(name)))
            }

            "get_container_log" => {
                let name = p.str_arg(0, "user_container_name")?;
                check_container_name(name, "user_container_name").map_err(v)?;
                Ok(json!(self.orchestrator.get_container_log(name)))
            }

            "refresh" => {
                let name = p.str_arg(0, "user_container_name")?;
                check_container_name(name, "user_container_name").map_err(v)?;
                self.watchdog.reset(name, self.session_ttl);
                Ok(json!(true))
            }

            "files_fromcontainer" => {
                let (container, path) = self.user_file_args(p, "sourcefile", method)?;
                let mut data = Vec::new();
                self.bridge
                    .read_file(&container, &path, &mut data)
                    .map_err(v)?;
                Ok(json!(BASE64.encode(&data)))
            }

            "files_tocontainer" => {
                let user = p.str_arg(0, "user_container_name")?;
                let data = p.str_arg(1, "data")?;
                let target = p.str_arg(2, "targetfile")?;
                check_container_name(user, "user_container_name").map_err(v)?;
                check_path(target, "targetfile").map_err(v)?;
                let bytes = BASE64.decode(data).map_err(|e| {
                    RpcError::new(INVALID_PARAMS, format!("data is not valid base64: {e}"))
                })?;
                let container = data_container_name(user);
                let path = self.userpath(target);
                self.bridge
                    .write_file(
                        &container,
                        &path,
                        &mut Cursor::new(bytes),
                        Some(DEFAULT_FILE_OWNER),
                    )
                    .map_err(v)?;
                Ok(json!(true))
            }

            "files_largefromcontainer" => {
                let user = p.str_arg(0, "user_container_name")?;
                let source = p.str_arg(1, "sourcefile")?;
                let target = p.str_arg(2, "targetfile")?;
                check_container_name(user, "user_container_name").map_err(v)?;
                check_path(source, "sourcefile").map_err(v)?;
                check_transfer_name(target, "targetfile").map_err(v)?;
                let container = data_container_name(user);
                self.bridge
                    .copy_with_host_mount(
                        &container,
                        &self.userpath(source),
                        &self.bridge.transfer_path(target),
                        Some(DEFAULT_FILE_OWNER),
                    )
                    .map_err(v)?;
                Ok(json!(true))
            }

            "files_largetocontainer" => {
                let user = p.str_arg(0, "user_container_name")?;
                let source = p.str_arg(1, "sourcefile")?;
                let target = p.str_arg(2, "targetfile")?;
                check_container_name(user, "user_container_name").map_err(v)?;
                check_transfer_name(source, "sourcefile").map_err(v)?;
                check_path(target, "targetfile").map_err(v)?;
                let container = data_container_name(user);
                self.bridge
                    .copy_with_host_mount(
                        &container,
                        &self.bridge.transfer_path(source),
                        &self.userpath(target),
                        Some(DEFAULT_FILE_OWNER),
                    )
                    .map_err(v)?;
                Ok(json!(true))
            }

            "files_exists" => {
                let (container, path) = self.user_file_args(p, "file", method)?;
                Ok(json!(self.bridge.exists(&container, &path).map_err(v)?))
            }

            "files_mkdir" => {
                let (container, path) = self.user_file_args(p, "dir", method)?;
                self.bridge
                    .mkdir(&container, &path, true, Some(DEFAULT_FILE_OWNER))
                    .map_err(v)?;
                Ok(json!(true))
            }

            "files_rm" => {
                let (container, path) = self.user_file_args(p, "file", method)?;
                self.bridge.remove(&container, &path, true).map_err(v)?;
                Ok(json!(true))
            }

            "files_tar" => {
                let (container, path) = self.user_file_args(p, "sourcefile", method)?;
                let mut data = Vec::new();
                self.bridge.tar(&container, &path, &mut data).map_err(v)?;
                Ok(json!(BASE64.encode(&data)))
            }

            "files_untar" => {
                let user = p.str_arg(0, "user_container_name")?;
                let source = p.str_arg(1, "source")?;
                let target_dir = p.str_arg(2, "targetdir")?;
                check_container_name(user, "user_container_name").map_err(v)?;
                check_path(target_dir, "targetdir").map_err(v)?;
                let bytes = BASE64.decode(source).map_err(|e| {
                    RpcError::new(INVALID_PARAMS, format!("source is not valid base64: {e}"))
                })?;
                let container = data_container_name(user);
                self.bridge
                    .untar(
                        &container,
                        &mut Cursor::new(bytes),
                        &self.userpath(target_dir),
                        Some(DEFAULT_FILE_OWNER),
                    )
                    .map_err(v)?;
                Ok(json!(true))
            }

            "files_ls" => {
                let (container, path) = self.user_file_args(p, "dir", method)?;
                let tree = self.bridge.list(&container, &path, true).map_err(v)?;
                serde_json::to_value(tree)
                    .map_err(|e| RpcError::new(OPERATION_FAILED, e.to_string()))
            }

            "files_readsecret" => {
                let user = p.str_arg(0, "user_container_name")?;
                check_container_name(user, "user_container_name").map_err(v)?;
                let container = data_container_name(user);
                let mut data = Vec::new();
                self.bridge
                    .read_file(&container, SECRET_PATH, &mut data)
                    .map_err(v)?;
                Ok(json!(String::from_utf8_lossy(&data).into_owned()))
            }

            "files_writesecret" => {
                let user = p.str_arg(0, "user_container_name")?;
                let secret = p.str_arg(1, "secret")?;
                check_container_name(user, "user_container_name").map_err(v)?;
                let container = data_container_name(user);
                self.bridge
                    .write_file(
                        &container,
                        SECRET_PATH,
                        &mut Cursor::new(secret.as_bytes().to_vec()),
                        None,
                    )
                    .map_err(v)?;
                Ok(json!(true))
            }

            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("unknown method {other}"),
            )),
        }
    }

    /// Common prologue of the single-path file methods: validate the user
    /// container name and path, derive the data container and the absolute
    /// in-container path.
    fn user_file_args(
        &self,
        p: &Params,
        path_param: &'static str,
        method: &str,
    ) -> Result<(String, String), RpcError> {
        let user = p.str_arg(0, "user_container_name")?;
        let path = p.str_arg(1, path_param)?;
        check_container_name(user, "user_container_name").map_err(|e| reject(method, e))?;
        check_path(path, path_param).map_err(|e| reject(method, e))?;
        Ok((data_container_name(user), self.userpath(path)))
    }

    fn userpath(&self, path: &str) -> String {
        absolute_userpath(&self.orchestrator.config().user_data_dir, path)
    }
}

fn result_envelope(id: Value, result: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({ "jsonrpc": "2.0", "id": id, "result": result }))
        .unwrap_or_else(|_| b"{}".to_vec())
}

fn error_envelope(id: Value, e: &RpcError) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": e.code, "message": e.message },
    }))
    .unwrap_or_else(|_| b"{}".to_vec())
}

/// Accept loop: non-blocking listener polled against the running flag, one
/// thread per connection.
pub fn serve(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(e) = listener.set_nonblocking(true) {
            error!(error = %e, "cannot switch listener to non-blocking mode");
            return;
        }
        while running.load(Ordering::SeqCst) {
            let (stream, peer) = match listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
            };
            debug!(peer = %peer, "connection accepted");
            let _ = stream.set_nonblocking(false);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
            let gateway = gateway.clone();
            std::thread::spawn(move || handle_connection(&gateway, stream));
        }
        info!("gateway accept loop stopped");
    })
}

fn handle_connection(gateway: &Gateway, mut stream: TcpStream) {
    match read_request(&mut stream) {
        Ok((method, body)) => {
            if method != "POST" {
                respond_plain(&mut stream, "405 Method Not Allowed", b"");
                return;
            }
            match gateway.handle_rpc(&body) {
                Some(reply) => respond_json(&mut stream, &reply),
                None => respond_plain(&mut stream, "204 No Content", b""),
            }
        }
        Err(e) => {
            debug!(error = %e, "malformed request");
            respond_plain(&mut stream, "400 Bad Request", b"");
        }
    }
}

/// Parse one HTTP request: method plus a Content-Length framed body.
fn read_request<R: Read>(r: &mut R) -> io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let mut header_end: Option<usize> = None;
    while header_end.is_none() && buf.len() < HDR_CAP {
        let n = r.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        header_end = find_header_end(&buf);
    }
    let end = header_end
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing header terminator"))?;

    let header_str = String::from_utf8_lossy(&buf[..end]).into_owned();
    let mut lines = header_str.lines();
    let request_line = lines.next().unwrap_or_default();
    let method = request_line
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if let Some((k, val)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), val.trim().to_string());
        }
    }
    let content_len: usize = headers
        .get("content-length")
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(0);
    if content_len > MAX_BODY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request body too large",
        ));
    }

    let mut body = buf[end..].to_vec();
    while body.len() < content_len {
        let n = r.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_len);
    Ok((method, body))
}

fn respond_json<W: Write>(w: &mut W, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(body);
    let _ = w.flush();
}

fn respond_plain<W: Write>(w: &mut W, status: &str, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(body);
    let _ = w.flush();
}
