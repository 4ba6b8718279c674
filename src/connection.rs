//! The per-connection write surface and read loop (§4.4). Grounded in the
//! teacher's blocking `stream.rs`/`codec.rs` write paths (a `Write` impl
//! wrapped in frame encoding) but reshaped around an explicit dispatch loop
//! instead of a `tokio_util::Encoder`/`Decoder` pair, since there is no
//! async runtime here.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::{Buffer, BufferProvider};
use crate::config::Config;
use crate::errors::{ProtocolError, WsError};
use crate::frame::{encode_header, OpCode};
use crate::handler::Handler;
use crate::reader::{Message, Reader};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

fn is_valid_close_code(code: u16) -> bool {
    if code < 1000 {
        return false;
    }
    if matches!(code, 1004 | 1005 | 1006) {
        return false;
    }
    if code > 1013 && code < 3000 {
        return false;
    }
    true
}

/// Wraps a bidirectional stream plus the reader and shared buffer provider
/// for one accepted connection (§3 "Connection"). `closed` is written only
/// from within a handler callback and read only by the owning thread on the
/// next loop iteration (§5 "Shared-resource discipline").
pub struct Connection<S> {
    stream: S,
    reader: Reader,
    provider: Arc<BufferProvider>,
    config: Config,
    closed: bool,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, reader: Reader, provider: Arc<BufferProvider>, config: Config) -> Self {
        Connection {
            stream,
            reader,
            provider,
            config,
            closed: false,
        }
    }

    /// Requested by a handler to end the read loop after the current
    /// dispatch returns.
    pub fn request_close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn write_text(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.write_frame(OpCode::Text, payload)
    }

    pub fn write_binary(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.write_frame(OpCode::Binary, payload)
    }

    pub fn write_ping(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.write_frame(OpCode::Ping, payload)
    }

    pub fn write_pong(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.write_frame(OpCode::Pong, payload)
    }

    pub fn write_close(&mut self) -> Result<(), WsError> {
        self.write_close_with_code(CLOSE_NORMAL)
    }

    pub fn write_close_with_code(&mut self, code: u16) -> Result<(), WsError> {
        self.write_frame(OpCode::Close, &code.to_be_bytes())
    }

    /// Emit a server frame: fin set, reserved bits clear, never masked
    /// (§4.4 "Write surface").
    pub fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        let mut out = Vec::with_capacity(payload.len() + 10);
        encode_header(&mut out, opcode, payload.len() as u64);
        out.extend_from_slice(payload);
        self.write_framed(&out)
    }

    /// Write already-framed bytes as-is (escape hatch, §4.4).
    pub fn write_framed(&mut self, bytes: &[u8]) -> Result<(), WsError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// A growing write-buffer starting at 512 bytes, reallocated per
    /// `new = new + new/2 + 8` (saturating) until the requested capacity
    /// fits (§4.4, §9 "Growing write buffer").
    pub fn write_buffer(&mut self, opcode: OpCode) -> Result<WriteBuffer<'_, S>, WsError> {
        let buffer = self.provider.alloc_pooled_or(512)?;
        Ok(WriteBuffer {
            conn: self,
            opcode,
            buffer,
            len: 0,
        })
    }

    /// Drive the read loop: pull messages from the reader, dispatch to
    /// `handler` per §4.4's table, and apply built-in ping/close policy.
    /// Returns once the loop ends (peer closed, I/O error, or the handler
    /// requested shutdown); `handler.close()` is always called before
    /// returning.
    pub fn run<H: Handler<S>>(&mut self, handler: &mut H) -> Result<(), WsError> {
        let result = self.run_inner(handler);
        handler.close();
        result
    }

    fn run_inner<H: Handler<S>>(&mut self, handler: &mut H) -> Result<(), WsError> {
        loop {
            let message = match self.read_next() {
                Ok(message) => message,
                Err(WsError::Protocol(err)) => {
                    if err.should_reply_close() {
                        warn!(error = %err, "protocol violation, closing");
                        let _ = self.write_close_with_code(CLOSE_PROTOCOL_ERROR);
                    } else {
                        debug!(error = %err, "resource limit hit, closing silently");
                    }
                    return Err(WsError::Protocol(err));
                }
                Err(err) => return Err(err),
            };

            self.dispatch(handler, message)?;
            self.reader.handled();
            if self.closed {
                return Ok(());
            }
        }
    }

    fn read_next(&mut self) -> Result<Message, WsError> {
        self.reader.read_message(&mut self.stream)
    }

    fn dispatch<H: Handler<S>>(&mut self, handler: &mut H, message: Message) -> Result<(), WsError> {
        match message.opcode {
            OpCode::Text | OpCode::Binary => {
                handler.handle(self, message)?;
            }
            OpCode::Pong => {
                if self.config.handle_pong {
                    handler.handle(self, message)?;
                }
            }
            OpCode::Ping => {
                if self.config.handle_ping {
                    handler.handle(self, message)?;
                } else {
                    let payload = message.payload.clone();
                    self.write_pong(&payload)?;
                }
            }
            OpCode::Close => {
                if self.config.handle_close {
                    handler.handle(self, message)?;
                } else {
                    self.reply_to_close(&message.payload)?;
                }
                self.closed = true;
            }
            OpCode::Continuation => {
                unreachable!("reader never dispatches a bare continuation frame")
            }
        }
        Ok(())
    }

    /// Close-frame validation (inbound), §4.4.
    fn reply_to_close(&mut self, payload: &[u8]) -> Result<(), WsError> {
        match payload.len() {
            0 => self.write_close_with_code(CLOSE_NORMAL),
            1 => {
                warn!(error = %ProtocolError::InvalidCloseFramePayload, "close frame payload of length 1");
                self.write_close_with_code(CLOSE_PROTOCOL_ERROR)
            }
            l => {
                let mut code_bytes = [0u8; 2];
                code_bytes.copy_from_slice(&payload[..2]);
                let code = u16::from_be_bytes(code_bytes);
                if !is_valid_close_code(code) {
                    warn!(error = %ProtocolError::InvalidCloseCode(code), "rejecting close code");
                    return self.write_close_with_code(CLOSE_PROTOCOL_ERROR);
                }
                if l > 2 && std::str::from_utf8(&payload[2..]).is_err() {
                    warn!(error = %ProtocolError::InvalidUtf8, "close reason is not valid utf-8");
                    return self.write_close_with_code(CLOSE_PROTOCOL_ERROR);
                }
                self.write_close_with_code(CLOSE_NORMAL)
            }
        }
    }
}

/// A growing scratch buffer for one outbound message, backed by a buffer
/// leased from the shared provider (§4.4 "write_buffer").
pub struct WriteBuffer<'a, S> {
    conn: &'a mut Connection<S>,
    opcode: OpCode,
    buffer: Buffer,
    len: usize,
}

impl<'a, S: Read + Write> WriteBuffer<'a, S> {
    pub fn write(&mut self, data: &[u8]) -> Result<(), WsError> {
        let needed = self.len + data.len();
        if needed > self.buffer.len() {
            let mut new_capacity = self.buffer.len().max(1);
            while new_capacity < needed {
                new_capacity = new_capacity + new_capacity / 2 + 8;
            }
            self.buffer = self.conn.provider.grow(
                std::mem::replace(&mut self.buffer, Buffer::Heap(bytes::BytesMut::new())),
                self.len,
                new_capacity,
            )?;
        }
        self.buffer.as_mut_slice()[self.len..needed].copy_from_slice(data);
        self.len = needed;
        Ok(())
    }

    /// Emit one frame with the accumulated bytes and release the scratch
    /// buffer back to the provider.
    pub fn flush(self) -> Result<(), WsError> {
        let WriteBuffer {
            conn,
            opcode,
            buffer,
            len,
        } = self;
        conn.write_frame(opcode, &buffer.as_slice()[..len])?;
        conn.provider.free(buffer);
        Ok(())
    }
}
