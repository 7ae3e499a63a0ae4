/*!
Minimal HTTP/1.1 client plumbing for the Engine API socket.

Request writing and tolerant response parsing over any Read/Write stream:
CRLFCRLF and LFLF header termination, a 64 KiB header cap, and bodies framed
by Content-Length, chunked transfer coding, or connection close. Attach
upgrades keep whatever was read past the header boundary.
*/

use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::util::find_header_end;

const HDR_CAP: usize = 64 * 1024;

#[derive(Debug)]
pub(crate) struct Request<'a> {
    pub method: &'a str,
    /// Path plus query string, already percent-encoded.
    pub target: &'a str,
    pub body: Option<&'a [u8]>,
    pub content_type: Option<&'a str>,
    /// Ask the engine to hijack the connection into a raw duplex stream.
    pub upgrade: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: u16,
    /// Keys lowercased.
    pub headers: HashMap<String, String>,
}

impl ResponseHead {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub(crate) fn write_request<W: Write>(w: &mut W, req: &Request) -> io::Result<()> {
    let mut head = format!("{} {} HTTP/1.1\r\nHost: docker\r\n", req.method, req.target);
    if req.upgrade {
        head.push_str("Connection: Upgrade\r\nUpgrade: tcp\r\n");
    } else {
        head.push_str("Connection: close\r\n");
    }
    if let Some(body) = req.body {
        if let Some(ct) = req.content_type {
            head.push_str(&format!("Content-Type: {}\r\n", ct));
        }
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    w.write_all(head.as_bytes())?;
    if let Some(body) = req.body {
        w.write_all(body)?;
    }
    w.flush()
}

/// Read and parse a response head. Returns the head and any bytes already
/// consumed past the header terminator (the start of the body, or of the raw
/// stream after an upgrade).
pub(crate) fn read_response_head<R: Read>(r: &mut R) -> io::Result<(ResponseHead, Vec<u8>)> {
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
    let end = header_end.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "missing header terminator in engine response",
        )
    })?;

    let header_str = String::from_utf8_lossy(&buf[..end]);
    let mut lines = header_str.lines();
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed status line: {:?}", status_line),
            )
        })?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    Ok((ResponseHead { status, headers }, buf[end..].to_vec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Length(u64),
    Chunked,
    /// No framing header; body runs until the peer closes.
    Eof,
}

impl Framing {
    pub fn from_head(head: &ResponseHead) -> Framing {
        if head
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            return Framing::Chunked;
        }
        if let Some(len) = head.header("content-length").and_then(|v| v.parse().ok()) {
            return Framing::Length(len);
        }
        Framing::Eof
    }
}

/// Streaming body decoder. Hands out the payload bytes of a response,
/// de-chunking where necessary, and reports EOF at the body's end.
pub(crate) struct BodyReader<R: Read> {
    inner: R,
    pending: Vec<u8>,
    pos: usize,
    framing: Framing,
    /// Bytes left in the current chunk (chunked) or in the whole body (length).
    remaining: u64,
    started: bool,
    done: bool,
}

impl<R: Read> BodyReader<R> {
    pub fn new(inner: R, leftover: Vec<u8>, framing: Framing) -> Self {
        let remaining = match framing {
            Framing::Length(n) => n,
            _ => 0,
        };
        BodyReader {
            inner,
            pending: leftover,
            pos: 0,
            framing,
            remaining,
            started: false,
            done: false,
        }
    }

    fn pending_len(&self) -> usize {
        self.pending.len() - self.pos
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        if self.pending_len() == 0 {
            self.pending.clear();
            self.pos = 0;
            let mut tmp = [0u8; 4096];
            let n = self.inner.read(&mut tmp)?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&tmp[..n]);
        }
        let b = self.pending[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    /// Read one line (terminated by `\n`, `\r` stripped). None on EOF with
    /// nothing read.
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = Vec::new();
        loop {
            match self.next_byte()? {
                Some(b'\n') => break,
                Some(b) => line.push(b),
                None => {
                    if line.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Copy up to `limit` payload bytes into `buf`, from pending first.
    fn read_payload(&mut self, buf: &mut [u8], limit: usize) -> io::Result<usize> {
        let want = buf.len().min(limit);
        if want == 0 {
            return Ok(0);
        }
        if self.pending_len() > 0 {
            let take = want.min(self.pending_len());
            buf[..take].copy_from_slice(&self.pending[self.pos..self.pos + take]);
            self.pos += take;
            return Ok(take);
        }
        self.inner.read(&mut buf[..want])
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        // After a chunk's payload the coding requires a CRLF before the next
        // size line; tolerate its absence.
        if self.started {
            match self.read_line()? {
                Some(line) if !line.trim().is_empty() => {
                    // Size line arrived where the blank separator was expected.
                    return self.apply_size_line(&line);
                }
                Some(_) => {}
                None => {
                    self.done = true;
                    return Ok(());
                }
            }
        }
        self.started = true;
        match self.read_line()? {
            Some(line) => self.apply_size_line(&line),
            None => {
                self.done = true;
                Ok(())
            }
        }
    }

    fn apply_size_line(&mut self, line: &str) -> io::Result<()> {
        let size_hex = line.trim().split(';').next().unwrap_or("");
        let size = u64::from_str_radix(size_hex, 16).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed chunk size: {:?}", line),
            )
        })?;
        if size == 0 {
            // Consume trailers until a blank line, then we're finished.
            while let Some(tr) = self.read_line()? {
                if tr.trim().is_empty() {
                    break;
                }
            }
            self.done = true;
        } else {
            self.remaining = size;
        }
        Ok(())
    }
}

impl<R: Read> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        match self.framing {
            Framing::Eof => {
                let n = self.read_payload(buf, buf.len())?;
                if n == 0 {
                    self.done = true;
                }
                Ok(n)
            }
            Framing::Length(_) => {
                if self.remaining == 0 {
                    self.done = true;
                    return Ok(0);
                }
                let limit = self.remaining.min(buf.len() as u64) as usize;
                let n = self.read_payload(buf, limit)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body ended before Content-Length",
                    ));
                }
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.done = true;
                }
                Ok(n)
            }
            Framing::Chunked => {
                while self.remaining == 0 {
                    self.next_chunk()?;
                    if self.done {
                        return Ok(0);
                    }
                }
                let limit = self.remaining.min(buf.len() as u64) as usize;
                let n = self.read_payload(buf, limit)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body ended mid-chunk",
                    ));
                }
                self.remaining -= n as u64;
                Ok(n)
            }
        }
    }
}

/// Read a whole body, bounded by `cap`. Returns the bytes and whether the cap
/// truncated the body.
pub(crate) fn read_body_capped<R: Read>(
    mut body: BodyReader<R>,
    cap: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut tmp = [0u8; 8192];
    loop {
        let n = body.read(&mut tmp)?;
        if n == 0 {
            return Ok((out, false));
        }
        if out.len() + n >= cap {
            out.extend_from_slice(&tmp[..cap - out.len()]);
            return Ok((out, true));
        }
        out.extend_from_slice(&tmp[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(raw: &[u8]) -> (ResponseHead, Vec<u8>, Cursor<Vec<u8>>) {
        let mut cur = Cursor::new(raw.to_vec());
        let (head, leftover) = read_response_head(&mut cur).expect("head");
        (head, leftover, cur)
    }

    #[test]
    fn test_content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let (head, leftover, cur) = parse(raw);
        assert_eq!(head.status, 200);
        let body = BodyReader::new(cur, leftover, Framing::from_head(&head));
        let (bytes, truncated) = read_body_capped(body, 1024).unwrap();
        assert_eq!(bytes, b"hello");
        assert!(!truncated);
    }

    #[test]
    fn test_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (head, leftover, cur) = parse(raw);
        assert_eq!(Framing::from_head(&head), Framing::Chunked);
        let body = BodyReader::new(cur, leftover, Framing::Chunked);
        let (bytes, _) = read_body_capped(body, 1024).unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn test_eof_framed_body_and_lf_headers() {
        let raw = b"HTTP/1.1 404 Not Found\n\nno such container";
        let (head, leftover, cur) = parse(raw);
        assert_eq!(head.status, 404);
        let body = BodyReader::new(cur, leftover, Framing::from_head(&head));
        let (bytes, _) = read_body_capped(body, 1024).unwrap();
        assert_eq!(bytes, b"no such container");
    }

    #[test]
    fn test_body_cap_truncates() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";
        let (head, leftover, cur) = parse(raw);
        let body = BodyReader::new(cur, leftover, Framing::from_head(&head));
        let (bytes, truncated) = read_body_capped(body, 4).unwrap();
        assert_eq!(bytes, b"0123");
        assert!(truncated);
    }

    #[test]
    fn test_write_request_shape() {
        let mut out = Vec::new();
        write_request(
            &mut out,
            &Request {
                method: "POST",
                target: "/v1.24/containers/create?name=x",
                body: Some(b"{}"),
                content_type: Some("application/json"),
                upgrade: false,
            },
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /v1.24/containers/create?name=x HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn test_upgrade_request_headers() {
        let mut out = Vec::new();
        write_request(
            &mut out,
            &Request {
                method: "POST",
                target: "/v1.24/containers/x/attach?stream=1&stdout=1",
                body: None,
                content_type: None,
                upgrade: true,
            },
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Upgrade: tcp\r\n"));
    }
}
