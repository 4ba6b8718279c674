//! Opening-handshake recognition, validation, and reply generation (§4.2).
//!
//! Grounded in the teacher's `src/protocol.rs` (`handle_handshake`,
//! `cal_accept_key`, the GUID constant, and its `httparse`-based header
//! scan), reshaped to validate every header RFC 6455 requires (the teacher
//! only checked `Upgrade` and the presence of a key) and to draw its scratch
//! buffer from a bounded [`HandshakePool`] instead of a fresh `BytesMut`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::errors::{HandshakeError, WsError};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Per-handshake scratch area (§3 "Handshake State"): a fixed request
/// buffer and a preallocated header-list capacity.
pub struct HandshakeState {
    buf: Vec<u8>,
    max_headers: usize,
}

impl HandshakeState {
    fn new(handshake_max_size: usize, max_headers: usize) -> Self {
        HandshakeState {
            buf: Vec::with_capacity(handshake_max_size),
            max_headers,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

/// A successfully parsed and validated opening-handshake request, handed to
/// `Handler::init` (§6).
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub path: String,
    pub key: String,
    pub headers: HashMap<String, String>,
}

/// Bounded pool of [`HandshakeState`] (§3 "Handshake Pool"), capacity
/// `handshake_pool_count`. Acquire blocks when the pool is exhausted rather
/// than failing fast — see DESIGN.md Open Question (ii).
pub struct HandshakePool {
    slots: Mutex<Vec<HandshakeState>>,
    not_empty: Condvar,
}

impl HandshakePool {
    pub fn new(capacity: usize, handshake_max_size: usize, max_headers: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(HandshakeState::new(handshake_max_size, max_headers));
        }
        HandshakePool {
            slots: Mutex::new(slots),
            not_empty: Condvar::new(),
        }
    }

    /// Blocking acquire: waits on a condition variable until a slot is
    /// released by another connection thread.
    pub fn acquire(&self) -> HandshakeLease<'_> {
        let mut guard = self.slots.lock().unwrap();
        loop {
            if let Some(mut state) = guard.pop() {
                state.reset();
                return HandshakeLease {
                    pool: self,
                    state: Some(state),
                };
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    fn release(&self, state: HandshakeState) {
        self.slots.lock().unwrap().push(state);
        self.not_empty.notify_one();
    }
}

/// RAII lease on a [`HandshakeState`]; returns it to the pool on drop,
/// satisfying "released before the read loop begins" (§3 "Lifecycles").
pub struct HandshakeLease<'a> {
    pool: &'a HandshakePool,
    state: Option<HandshakeState>,
}

impl<'a> std::ops::Deref for HandshakeLease<'a> {
    type Target = HandshakeState;
    fn deref(&self) -> &HandshakeState {
        self.state.as_ref().expect("lease state taken before drop")
    }
}

impl<'a> std::ops::DerefMut for HandshakeLease<'a> {
    fn deref_mut(&mut self) -> &mut HandshakeState {
        self.state.as_mut().expect("lease state taken before drop")
    }
}

impl<'a> Drop for HandshakeLease<'a> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.pool.release(state);
        }
    }
}

/// Accumulate bytes from `stream` into `state` until `\r\n\r\n` terminates
/// the request, then parse and validate it (§4.2).
///
/// The per-read socket timeout is the orchestrator's responsibility (set on
/// the concrete `TcpStream`/`UnixStream` before this is called, since it is
/// not expressible over a generic `Read`); this function enforces the
/// absolute `deadline` itself and maps a timed-out read into
/// [`HandshakeError::Timeout`].
pub fn read_request<S: Read + Write>(
    stream: &mut S,
    state: &mut HandshakeState,
    handshake_max_size: usize,
    deadline: Option<Instant>,
) -> Result<HandshakeRequest, WsError> {
    let mut byte = [0u8; 1];
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(WsError::Handshake(HandshakeError::Timeout));
            }
        }
        match stream.read(&mut byte) {
            Ok(0) => return Err(WsError::Handshake(HandshakeError::Invalid)),
            Ok(_) => {
                state.buf.push(byte[0]);
                if state.buf.len() > handshake_max_size {
                    return Err(WsError::Handshake(HandshakeError::TooLarge));
                }
                if state.buf.ends_with(TERMINATOR) {
                    break;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(WsError::Handshake(HandshakeError::Timeout));
            }
            Err(e) => return Err(WsError::Io(e)),
        }
    }
    parse_and_validate(&state.buf, state.max_headers)
}

fn parse_and_validate(buf: &[u8], max_headers: usize) -> Result<HandshakeRequest, WsError> {
    let mut raw_headers = vec![httparse::EMPTY_HEADER; max_headers];
    let mut req = httparse::Request::new(&mut raw_headers);
    let status = req
        .parse(buf)
        .map_err(|_| WsError::Handshake(HandshakeError::Invalid))?;
    if status.is_partial() {
        return Err(WsError::Handshake(HandshakeError::Invalid));
    }
    if req.method != Some("GET") {
        return Err(WsError::Handshake(HandshakeError::Invalid));
    }
    // httparse reports HTTP/1.1 as version 1.
    if req.version != Some(1) {
        return Err(WsError::Handshake(HandshakeError::Invalid));
    }

    let mut headers = HashMap::new();
    let mut has_upgrade = false;
    let mut has_connection_upgrade = false;
    let mut version_ok = false;
    let mut key: Option<String> = None;

    for h in req.headers.iter() {
        let value = std::str::from_utf8(h.value).unwrap_or("");
        let name_lower = h.name.to_ascii_lowercase();
        match name_lower.as_str() {
            "upgrade" => has_upgrade = value.eq_ignore_ascii_case("websocket"),
            "connection" => {
                has_connection_upgrade = value
                    .split(',')
                    .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"));
            }
            "sec-websocket-version" => version_ok = value.trim() == "13",
            "sec-websocket-key" => key = Some(value.trim().to_string()),
            _ => {}
        }
        headers.insert(name_lower, value.to_string());
    }

    if !has_upgrade {
        return Err(WsError::Handshake(HandshakeError::MissingHeader(
            "Upgrade",
        )));
    }
    if !has_connection_upgrade {
        return Err(WsError::Handshake(HandshakeError::MissingHeader(
            "Connection",
        )));
    }
    if !version_ok {
        return Err(WsError::Handshake(HandshakeError::MissingHeader(
            "Sec-WebSocket-Version",
        )));
    }
    let key = key.ok_or(WsError::Handshake(HandshakeError::MissingHeader(
        "Sec-WebSocket-Key",
    )))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&key)
        .map_err(|_| WsError::Handshake(HandshakeError::Invalid))?;
    if decoded.len() != 16 {
        return Err(WsError::Handshake(HandshakeError::Invalid));
    }

    Ok(HandshakeRequest {
        path: req.path.unwrap_or("/").to_string(),
        key,
        headers,
    })
}

/// `base64(SHA-1(key + GUID))` (§4.2 "Reply generation").
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Emit the `101 Switching Protocols` reply for `client_key`.
pub fn write_switching_protocols<W: Write>(stream: &mut W, client_key: &str) -> std::io::Result<()> {
    let accept = accept_key(client_key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    stream.write_all(response.as_bytes())
}

/// Best-effort single-line `400`-class reply for a failed handshake (§4.2
/// "Error replies"); write failures are ignored by the caller, matching the
/// "best-effort" policy in §7.
pub fn write_error_reply<W: Write>(stream: &mut W, error: &HandshakeError) -> std::io::Result<()> {
    let reason = match error {
        HandshakeError::TooLarge => "TooLarge",
        HandshakeError::Timeout => "Timeout",
        HandshakeError::Invalid | HandshakeError::MissingHeader(_) => "Invalid",
    };
    let response = format!("HTTP/1.1 400 {reason}\r\n\r\n");
    stream.write_all(response.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// a `Read + Write` test double wrapping an in-memory input buffer; the
    /// writes (handshake replies) are discarded and not asserted on here,
    /// connection-level tests cover those.
    struct MemStream {
        input: Cursor<Vec<u8>>,
    }

    impl MemStream {
        fn new(data: &[u8]) -> Self {
            MemStream {
                input: Cursor::new(data.to_vec()),
            }
        }
    }

    impl Read for MemStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MemStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn valid_request() -> Vec<u8> {
        b"GET /chat HTTP/1.1\r\n\
          Host: example.com\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\r\n"
            .to_vec()
    }

    #[test]
    fn accepts_valid_request() {
        let mut stream = MemStream::new(&valid_request());
        let mut state = HandshakeState::new(1024, 32);
        let req = read_request(&mut stream, &mut state, 1024, None).unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn computes_rfc6455_example_accept_key() {
        // the example key/accept pair from RFC 6455 §1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn rejects_missing_key() {
        let req = b"GET / HTTP/1.1\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Version: 13\r\n\r\n";
        let mut stream = MemStream::new(req);
        let mut state = HandshakeState::new(1024, 32);
        let err = read_request(&mut stream, &mut state, 1024, None).unwrap_err();
        assert!(matches!(
            err,
            WsError::Handshake(HandshakeError::MissingHeader("Sec-WebSocket-Key"))
        ));
    }

    #[test]
    fn rejects_wrong_method() {
        let req = b"POST / HTTP/1.1\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                    Sec-WebSocket-Version: 13\r\n\r\n";
        let mut stream = MemStream::new(req);
        let mut state = HandshakeState::new(1024, 32);
        let err = read_request(&mut stream, &mut state, 1024, None).unwrap_err();
        assert!(matches!(err, WsError::Handshake(HandshakeError::Invalid)));
    }

    #[test]
    fn too_large_request_fails() {
        let mut data = b"GET / HTTP/1.1\r\n".to_vec();
        data.extend(std::iter::repeat(b'x').take(100));
        let mut stream = MemStream::new(&data);
        let mut state = HandshakeState::new(32, 32);
        let err = read_request(&mut stream, &mut state, 32, None).unwrap_err();
        assert!(matches!(err, WsError::Handshake(HandshakeError::TooLarge)));
    }

    #[test]
    fn pool_round_trips_slots() {
        let pool = HandshakePool::new(1, 1024, 16);
        {
            let lease = pool.acquire();
            drop(lease);
        }
        // should not block: the single slot was returned
        let _lease = pool.acquire();
    }
}
