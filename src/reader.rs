//! The frame reader / message assembler (§4.3): turns a raw byte stream into
//! a sequence of complete, unmasked [`Message`]s, enforcing fragmentation
//! and control-interleaving rules as it goes.
//!
//! The fragmentation state machine's shape (the Idle/Fragmented match arms
//! over Continuation/Text-or-Binary/control) is ported directly from the
//! teacher's `FrameDecoder::decode` in `src/codec.rs` — that decoder pulled
//! frames out of a fully-buffered `BytesMut` fed by a `tokio_util` codec
//! loop; here the same state machine pulls frames out of a blocking stream
//! through the two-tier static/large buffer described in §3/§4.1, since the
//! teacher never needed bounded, poolable buffers for a client.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::buffer::{Buffer, BufferProvider};
use crate::errors::{ProtocolError, WsError};
use crate::frame::{apply_mask, FrameHeader, OpCode};

/// A fully reassembled application message (§3 "Message"). Control frames
/// are always delivered as a single message; `payload` is an owned,
/// reference-counted slice (mirrors the teacher's `BorrowedFrame`, whose
/// payload is likewise an owned `Bytes` even though its header is merely
/// viewed).
#[derive(Debug, Clone)]
pub struct Message {
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Message {
    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }
}

/// Bytes belonging to a single frame that didn't fit the remaining static
/// buffer capacity and so are being assembled in a pool/heap buffer instead.
struct Spill {
    buffer: Buffer,
    filled: usize,
    needed: usize,
}

/// State for an in-progress fragmented message (§3 "fragmented",
/// "fragmented_type", "fragmented_bytes"). Accumulated bytes are always
/// unmasked payload only, never header bytes.
struct Fragment {
    opcode: OpCode,
    buffer: Buffer,
    len: usize,
}

/// Owns the fixed-size static buffer and, when needed, a large buffer on
/// loan from the shared [`BufferProvider`] (§3 "Reader").
pub struct Reader {
    provider: Arc<BufferProvider>,
    max_size: usize,
    static_buf: Box<[u8]>,
    pos: usize,
    start: usize,
    spill: Option<Spill>,
    fragment: Option<Fragment>,
}

impl Reader {
    pub fn new(provider: Arc<BufferProvider>, buffer_size: usize, max_size: usize) -> Self {
        Reader {
            provider,
            max_size,
            static_buf: vec![0u8; buffer_size].into_boxed_slice(),
            pos: 0,
            start: 0,
            spill: None,
            fragment: None,
        }
    }

    /// Release any oversized-message buffer leased for the message just
    /// delivered and reset per-message bookkeeping so the next call to
    /// [`Self::read_message`] starts fresh (§4.3 "Public contract").
    ///
    /// Also performs the static-buffer compaction described in §4.3 "Buffer
    /// management invariants": residual bytes of the next message already
    /// sitting in the static buffer are moved to offset 0.
    pub fn handled(&mut self) {
        if let Some(spill) = self.spill.take() {
            self.provider.free(spill.buffer);
        }
        if self.start > 0 {
            self.static_buf.copy_within(self.start..self.pos, 0);
            self.pos -= self.start;
            self.start = 0;
        }
    }

    fn fill_more(&mut self, stream: &mut impl Read) -> Result<(), WsError> {
        if self.pos == self.static_buf.len() {
            // static buffer is full but the header/frame isn't complete yet;
            // the caller is responsible for spilling to a large buffer
            // before this can happen for a legitimate frame.
            return Err(WsError::Protocol(ProtocolError::TooLarge));
        }
        let n = stream.read(&mut self.static_buf[self.pos..])?;
        if n == 0 {
            return Err(WsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            )));
        }
        self.pos += n;
        Ok(())
    }

    fn fill_spill(&mut self, stream: &mut impl Read) -> Result<(), WsError> {
        let spill = self.spill.as_mut().expect("fill_spill without a spill");
        let n = stream.read(&mut spill.buffer.as_mut_slice()[spill.filled..spill.needed])?;
        if n == 0 {
            return Err(WsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            )));
        }
        spill.filled += n;
        Ok(())
    }

    /// Read the next header prefix (first 2 bytes), growing the static
    /// buffer's filled region as needed, without yet knowing the full
    /// header length.
    fn ensure_available(&mut self, stream: &mut impl Read, needed: usize) -> Result<(), WsError> {
        while self.pos - self.start < needed {
            if needed > self.static_buf.len() - self.start {
                // won't ever fit: caller must have already arranged a spill
                unreachable!("ensure_available called past static capacity without a spill");
            }
            self.fill_more(stream)?;
        }
        Ok(())
    }

    /// Pull the next complete frame's header and unmasked payload off
    /// `stream`, spilling into a large buffer if the frame doesn't fit the
    /// remaining static buffer capacity.
    fn read_frame(&mut self, stream: &mut impl Read) -> Result<(FrameHeader, Bytes), WsError> {
        if self.start == self.pos {
            self.start = 0;
            self.pos = 0;
        }

        // finish an in-progress spill from a previous partial read first.
        if let Some(spill) = &self.spill {
            if spill.filled < spill.needed {
                while self.spill.as_ref().unwrap().filled < self.spill.as_ref().unwrap().needed {
                    self.fill_spill(stream)?;
                }
            }
            let spill = self.spill.take().unwrap();
            let header = FrameHeader::parse(spill.buffer.as_slice());
            let header_len = header.header_len();
            header.validate()?;
            let mut payload = spill.buffer.as_slice()[header_len..spill.needed].to_vec();
            if let Some(key) = header.masking_key {
                apply_mask(&mut payload, key);
            }
            self.provider.free(spill.buffer);
            return Ok((header, Bytes::from(payload)));
        }

        if self.static_buf.len() - self.start < FrameHeader::PREFIX_LEN {
            return self.spill_from_static(stream, FrameHeader::PREFIX_LEN, None);
        }
        self.ensure_available(stream, FrameHeader::PREFIX_LEN)?;
        let prefix = [
            self.static_buf[self.start],
            self.static_buf[self.start + 1],
        ];
        let header_len = FrameHeader::peek_header_len(prefix);

        if header_len > self.static_buf.len() - self.start {
            return self.spill_from_static(stream, header_len, None);
        }
        self.ensure_available(stream, header_len)?;

        let header = FrameHeader::parse(&self.static_buf[self.start..self.start + header_len]);
        header.validate()?;
        let frame_total = header_len + header.payload_length as usize;
        if frame_total > self.max_size {
            return Err(WsError::Protocol(ProtocolError::TooLarge));
        }

        if frame_total > self.static_buf.len() - self.start {
            return self.spill_from_static(stream, frame_total, Some(header));
        }

        self.ensure_available(stream, frame_total)?;
        let frame_start = self.start;
        self.start += frame_total;
        let mut payload =
            self.static_buf[frame_start + header_len..frame_start + frame_total].to_vec();
        if let Some(key) = header.masking_key {
            apply_mask(&mut payload, key);
        }
        Ok((header, Bytes::from(payload)))
    }

    /// Move the not-yet-complete frame currently sitting at the tail of the
    /// static buffer into a freshly acquired large buffer, then keep
    /// reading directly into it until the frame (or just its header, if
    /// `header` is `None`) is complete.
    fn spill_from_static(
        &mut self,
        stream: &mut impl Read,
        needed: usize,
        header: Option<FrameHeader>,
    ) -> Result<(FrameHeader, Bytes), WsError> {
        let available = self.pos - self.start;
        let mut buffer = self.provider.alloc_pooled_or(needed)?;
        buffer.as_mut_slice()[..available]
            .copy_from_slice(&self.static_buf[self.start..self.pos]);
        self.start = 0;
        self.pos = 0;
        self.spill = Some(Spill {
            buffer,
            filled: available,
            needed,
        });

        while self.spill.as_ref().unwrap().filled < self.spill.as_ref().unwrap().needed {
            self.fill_spill(stream)?;
        }

        let header = match header {
            Some(h) => h,
            None => {
                let spill = self.spill.as_ref().unwrap();
                let prefix = [spill.buffer.as_slice()[0], spill.buffer.as_slice()[1]];
                let header_len = FrameHeader::peek_header_len(prefix);
                if header_len > needed {
                    // we only had the 2-byte prefix available; grow once more
                    // now that the real header length is known.
                    let spill = self.spill.take().unwrap();
                    let grown = self
                        .provider
                        .grow(spill.buffer, spill.filled, header_len)?;
                    self.spill = Some(Spill {
                        buffer: grown,
                        filled: spill.filled,
                        needed: header_len,
                    });
                    while self.spill.as_ref().unwrap().filled < self.spill.as_ref().unwrap().needed
                    {
                        self.fill_spill(stream)?;
                    }
                }
                let spill = self.spill.as_ref().unwrap();
                let header_len = FrameHeader::peek_header_len([
                    spill.buffer.as_slice()[0],
                    spill.buffer.as_slice()[1],
                ]);
                let parsed = FrameHeader::parse(&spill.buffer.as_slice()[..header_len]);
                parsed.validate()?;
                parsed
            }
        };

        let header_len = header.header_len();
        let frame_total = header_len + header.payload_length as usize;
        if frame_total > self.max_size {
            let spill = self.spill.take().unwrap();
            self.provider.free(spill.buffer);
            return Err(WsError::Protocol(ProtocolError::TooLarge));
        }
        if frame_total > self.spill.as_ref().unwrap().needed {
            let spill = self.spill.take().unwrap();
            let grown = self.provider.grow(spill.buffer, spill.filled, frame_total)?;
            self.spill = Some(Spill {
                buffer: grown,
                filled: spill.filled,
                needed: frame_total,
            });
            while self.spill.as_ref().unwrap().filled < self.spill.as_ref().unwrap().needed {
                self.fill_spill(stream)?;
            }
        }

        let spill = self.spill.take().unwrap();
        let mut payload = spill.buffer.as_slice()[header_len..frame_total].to_vec();
        if let Some(key) = header.masking_key {
            apply_mask(&mut payload, key);
        }
        self.provider.free(spill.buffer);
        Ok((header, Bytes::from(payload)))
    }

    fn append_fragment(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        let existing_len = self.fragment.as_ref().map(|f| f.len).unwrap_or(0);
        let new_len = existing_len + payload.len();
        if new_len > self.max_size {
            return Err(WsError::Protocol(ProtocolError::TooLarge));
        }
        match self.fragment.take() {
            Some(mut frag) => {
                if frag.buffer.len() < new_len {
                    let grown_capacity = new_len.max(frag.buffer.len() * 2 + 8);
                    frag.buffer = self.provider.grow(frag.buffer, existing_len, grown_capacity)?;
                }
                frag.buffer.as_mut_slice()[existing_len..new_len].copy_from_slice(payload);
                frag.len = new_len;
                self.fragment = Some(frag);
            }
            None => {
                let mut buffer = self.provider.alloc_pooled_or(payload.len().max(1))?;
                buffer.as_mut_slice()[..payload.len()].copy_from_slice(payload);
                self.fragment = Some(Fragment {
                    opcode,
                    buffer,
                    len: payload.len(),
                });
            }
        }
        Ok(())
    }

    fn take_fragment(&mut self) -> (OpCode, Bytes) {
        let frag = self.fragment.take().expect("take_fragment without fragment");
        let payload = Bytes::copy_from_slice(&frag.buffer.as_slice()[..frag.len]);
        self.provider.free(frag.buffer);
        (frag.opcode, payload)
    }

    /// Deliver the next logical [`Message`] (§4.3 "Public contract",
    /// fragmentation state machine table).
    pub fn read_message(&mut self, stream: &mut impl Read) -> Result<Message, WsError> {
        loop {
            if self.start == self.pos && self.spill.is_none() {
                self.start = 0;
                self.pos = 0;
            }
            let (header, payload) = self.read_frame(stream)?;
            let opcode = header.opcode()?;

            if opcode.is_control() {
                trace!(?opcode, len = payload.len(), "control frame received");
                return Ok(Message { opcode, payload });
            }

            match opcode {
                OpCode::Continuation => {
                    if self.fragment.is_none() {
                        return Err(WsError::Protocol(ProtocolError::UnexpectedContinuation));
                    }
                    self.append_fragment(opcode, &payload)?;
                    if header.fin {
                        let (opcode, payload) = self.take_fragment();
                        if opcode == OpCode::Text {
                            validate_text(&payload)?;
                        }
                        debug!(?opcode, len = payload.len(), "fragmented message complete");
                        return Ok(Message { opcode, payload });
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.is_some() {
                        return Err(WsError::Protocol(ProtocolError::NestedFragmentation));
                    }
                    if header.fin {
                        if opcode == OpCode::Text {
                            validate_text(&payload)?;
                        }
                        return Ok(Message { opcode, payload });
                    }
                    self.append_fragment(opcode, &payload)?;
                }
                OpCode::Close | OpCode::Ping | OpCode::Pong => unreachable!("handled above"),
            }
        }
    }
}

/// RFC 6455 requires text message payloads to be valid UTF-8 (§4.3).
fn validate_text(payload: &[u8]) -> Result<(), ProtocolError> {
    std::str::from_utf8(payload)
        .map(|_| ())
        .map_err(|_| ProtocolError::InvalidTextUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn provider() -> Arc<BufferProvider> {
        Arc::new(BufferProvider::new(256, 4))
    }

    fn masked_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let b0 = (if fin { 0x80 } else { 0 }) | opcode.as_u8();
        out.push(b0);
        let key = [0x12, 0x34, 0x56, 0x78];
        let len = payload.len();
        match len {
            0..=125 => out.push(0x80 | len as u8),
            126..=0xFFFF => {
                out.push(0x80 | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            _ => {
                out.push(0x80 | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(&key);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, key);
        out.extend_from_slice(&masked);
        out
    }

    #[test]
    fn single_text_message() {
        let mut reader = Reader::new(provider(), 128, 65536);
        let mut stream = Cursor::new(masked_frame(true, OpCode::Text, b"over 9000!"));
        let msg = reader.read_message(&mut stream).unwrap();
        assert_eq!(msg.opcode, OpCode::Text);
        assert_eq!(&msg.payload[..], b"over 9000!");
        reader.handled();
    }

    #[test]
    fn ping_pong_sized_125() {
        let payload = vec![b'z'; 125];
        let mut reader = Reader::new(provider(), 256, 65536);
        let mut stream = Cursor::new(masked_frame(true, OpCode::Ping, &payload));
        let msg = reader.read_message(&mut stream).unwrap();
        assert_eq!(msg.opcode, OpCode::Ping);
        assert_eq!(msg.payload.len(), 125);
        assert_eq!(&msg.payload[..], &payload[..]);
    }

    #[test]
    fn fragmented_message_with_interleaved_pings() {
        let mut bytes = Vec::new();
        bytes.extend(masked_frame(false, OpCode::Text, b"foo"));
        bytes.extend(masked_frame(true, OpCode::Ping, b"p1"));
        bytes.extend(masked_frame(false, OpCode::Continuation, b"bar"));
        bytes.extend(masked_frame(true, OpCode::Ping, b"p2"));
        bytes.extend(masked_frame(true, OpCode::Continuation, b"baz"));

        let mut reader = Reader::new(provider(), 256, 65536);
        let mut stream = Cursor::new(bytes);

        let m1 = reader.read_message(&mut stream).unwrap();
        assert_eq!(m1.opcode, OpCode::Ping);
        assert_eq!(&m1.payload[..], b"p1");

        let m2 = reader.read_message(&mut stream).unwrap();
        assert_eq!(m2.opcode, OpCode::Ping);
        assert_eq!(&m2.payload[..], b"p2");

        let m3 = reader.read_message(&mut stream).unwrap();
        assert_eq!(m3.opcode, OpCode::Text);
        assert_eq!(&m3.payload[..], b"foobarbaz");
    }

    #[test]
    fn empty_fragmented_message() {
        let mut bytes = Vec::new();
        bytes.extend(masked_frame(false, OpCode::Text, b""));
        bytes.extend(masked_frame(false, OpCode::Continuation, b""));
        bytes.extend(masked_frame(true, OpCode::Continuation, b""));
        let mut reader = Reader::new(provider(), 256, 65536);
        let mut stream = Cursor::new(bytes);
        let msg = reader.read_message(&mut stream).unwrap();
        assert_eq!(msg.opcode, OpCode::Text);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn nested_fragmentation_is_protocol_error() {
        let mut bytes = Vec::new();
        bytes.extend(masked_frame(false, OpCode::Text, b"a"));
        bytes.extend(masked_frame(true, OpCode::Binary, b"b"));
        let mut reader = Reader::new(provider(), 256, 65536);
        let mut stream = Cursor::new(bytes);
        let err = reader.read_message(&mut stream).unwrap_err();
        assert!(matches!(
            err,
            WsError::Protocol(ProtocolError::NestedFragmentation)
        ));
    }

    #[test]
    fn continuation_without_start_is_protocol_error() {
        let bytes = masked_frame(true, OpCode::Continuation, b"x");
        let mut reader = Reader::new(provider(), 256, 65536);
        let mut stream = Cursor::new(bytes);
        let err = reader.read_message(&mut stream).unwrap_err();
        assert!(matches!(
            err,
            WsError::Protocol(ProtocolError::UnexpectedContinuation)
        ));
    }

    #[test]
    fn message_straddling_static_buffer_uses_spill() {
        // buffer_size small enough that a single frame's payload overflows it
        let mut reader = Reader::new(provider(), 16, 65536);
        let payload = vec![b'a'; 40];
        let mut stream = Cursor::new(masked_frame(true, OpCode::Binary, &payload));
        let msg = reader.read_message(&mut stream).unwrap();
        assert_eq!(&msg.payload[..], &payload[..]);
    }

    #[test]
    fn two_back_to_back_messages_are_compacted() {
        let mut reader = Reader::new(provider(), 32, 65536);
        let mut bytes = masked_frame(true, OpCode::Text, b"12345678901234");
        bytes.extend(masked_frame(true, OpCode::Text, b"abcdefghij"));
        let mut stream = Cursor::new(bytes);

        let m1 = reader.read_message(&mut stream).unwrap();
        assert_eq!(&m1.payload[..], b"12345678901234");
        reader.handled();

        let m2 = reader.read_message(&mut stream).unwrap();
        assert_eq!(&m2.payload[..], b"abcdefghij");
    }

    #[test]
    fn text_frame_with_invalid_utf8_fails() {
        let mut reader = Reader::new(provider(), 256, 65536);
        let mut stream = Cursor::new(masked_frame(true, OpCode::Text, &[0xFF, 0xFE]));
        let err = reader.read_message(&mut stream).unwrap_err();
        assert!(matches!(
            err,
            WsError::Protocol(ProtocolError::InvalidTextUtf8)
        ));
    }

    #[test]
    fn too_large_message_fails() {
        let mut reader = Reader::new(provider(), 256, 8);
        let payload = vec![0u8; 32];
        let mut stream = Cursor::new(masked_frame(true, OpCode::Binary, &payload));
        let err = reader.read_message(&mut stream).unwrap_err();
        assert!(matches!(err, WsError::Protocol(ProtocolError::TooLarge)));
    }

    #[test]
    fn too_large_message_fails_when_spilled_from_static() {
        // buffer_size too small even for the 2-byte prefix, forcing the
        // header=None spill path; the frame's real size is only discovered
        // once the header is parsed out of the spill buffer.
        let prov = provider();
        let mut reader = Reader::new(prov.clone(), 1, 8);
        let payload = vec![0u8; 32];
        let mut stream = Cursor::new(masked_frame(true, OpCode::Binary, &payload));
        let err = reader.read_message(&mut stream).unwrap_err();
        assert!(matches!(err, WsError::Protocol(ProtocolError::TooLarge)));
        // the spill buffer must have been freed, not leaked, on rejection.
        assert_eq!(prov.leased_count(4), 0);
    }

    #[test]
    fn handled_releases_spill_and_compacts() {
        let prov = provider();
        let mut reader = Reader::new(prov.clone(), 16, 65536);
        let payload = vec![b'x'; 40];
        let mut stream = Cursor::new(masked_frame(true, OpCode::Binary, &payload));
        let _msg = reader.read_message(&mut stream).unwrap();
        reader.handled();
        assert_eq!(prov.leased_count(4), 0);
    }

    #[test]
    fn fragment_continuation_header_straddling_static_tail_spills() {
        // first frame consumes all but 1 byte of the static buffer, leaving
        // no room for even the next frame's 2-byte prefix.
        let mut bytes = masked_frame(false, OpCode::Text, b"abc"); // 6 + 3 = 9 bytes
        bytes.extend(masked_frame(true, OpCode::Continuation, b"de"));
        let mut reader = Reader::new(provider(), 10, 65536);
        let mut stream = Cursor::new(bytes);
        let msg = reader.read_message(&mut stream).unwrap();
        assert_eq!(msg.opcode, OpCode::Text);
        assert_eq!(&msg.payload[..], b"abcde");
    }
}
