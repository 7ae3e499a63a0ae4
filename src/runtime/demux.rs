/*!
Demultiplexer for the engine's attached/log stream format.

Without a TTY the engine interleaves stdout and stderr over one channel as
frames: an 8-byte header `[kind, 0, 0, 0, len_be32]` followed by `len` payload
bytes. Kind 0 is stdin-ack, 1 stdout, 2 stderr. A pump reads frames until
end-of-stream and forwards the payloads of the stream of interest; reads are
plain blocking reads bounded by the socket's read deadline.
*/

use std::io::{self, Read, Write};

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single frame; larger headers indicate a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(b: u8) -> Option<StreamKind> {
        match b {
            0 => Some(StreamKind::Stdin),
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Vec<u8>,
}

/// Result of a single-stream pump: bytes forwarded, plus whatever arrived on
/// stderr (capped) for diagnostics.
#[derive(Debug, Default)]
pub struct PumpOutcome {
    pub forwarded: u64,
    pub stderr: Vec<u8>,
}

const STDERR_CAP: usize = 8 * 1024;

pub struct Demuxer<R: Read> {
    inner: R,
}

impl<R: Read> Demuxer<R> {
    pub fn new(inner: R) -> Self {
        Demuxer { inner }
    }

    /// Next frame, or `None` on a clean end-of-stream at a frame boundary.
    /// EOF inside a header or payload is an error (truncated stream).
    pub fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut got = 0;
        while got < FRAME_HEADER_LEN {
            let n = self.inner.read(&mut header[got..])?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                ));
            }
            got += n;
        }
        let kind = StreamKind::from_byte(header[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown stream kind {}", header[0]),
            )
        })?;
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }
        let mut payload = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.inner.read(&mut payload[filled..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame payload",
                ));
            }
            filled += n;
        }
        Ok(Some(Frame { kind, payload }))
    }

    /// Forward payloads of `kind` into `sink` until end-of-stream. Stderr is
    /// captured (capped) on the side unless it is the stream of interest.
    pub fn pump_to(&mut self, sink: &mut dyn Write, kind: StreamKind) -> io::Result<PumpOutcome> {
        let mut outcome = PumpOutcome::default();
        while let Some(frame) = self.next_frame()? {
            if frame.kind == kind {
                sink.write_all(&frame.payload)?;
                outcome.forwarded += frame.payload.len() as u64;
            } else if frame.kind == StreamKind::Stderr && outcome.stderr.len() < STDERR_CAP {
                let room = STDERR_CAP - outcome.stderr.len();
                let take = room.min(frame.payload.len());
                outcome.stderr.extend_from_slice(&frame.payload[..take]);
            }
        }
        Ok(outcome)
    }

    /// Collect stdout and stderr payloads interleaved in emission order, up to
    /// `cap` bytes. Returns the bytes and whether the cap cut the stream off.
    pub fn collect_interleaved(&mut self, cap: usize) -> io::Result<(Vec<u8>, bool)> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame()? {
            if frame.kind == StreamKind::Stdin {
                continue;
            }
            let room = cap.saturating_sub(out.len());
            if room < frame.payload.len() {
                out.extend_from_slice(&frame.payload[..room]);
                return Ok((out, true));
            }
            out.extend_from_slice(&frame.payload);
        }
        Ok((out, false))
    }

    /// Drain to end-of-stream, discarding payloads but keeping capped stderr.
    pub fn drain(&mut self) -> io::Result<Vec<u8>> {
        let mut sink = io::sink();
        let outcome = self.pump_to(&mut sink, StreamKind::Stdout)?;
        Ok(outcome.stderr)
    }
}
