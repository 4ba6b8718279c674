//! The user-supplied connection handler contract (§6 "Handler contract",
//! §9 "Generic handler"). The teacher's client side expresses a comparable
//! role as a bare generic parameter with duck-typed inherent methods
//! (`ClientBuilder::connect::<Msg, _>`); here it's an explicit trait so
//! `after_init` can be a provided default method instead of something the
//! orchestrator discovers through reflection.

use std::io::{Read, Write};

use crate::connection::Connection;
use crate::errors::WsError;
use crate::handshake::HandshakeRequest;
use crate::reader::Message;

/// Implemented by the application type that owns per-connection state.
/// Parametrized over the connection's stream type `S` so the same trait
/// serves both real sockets and the in-memory test doubles used by §3a's
/// testing strategy.
///
/// `init` runs once, right after a successful handshake; returning `Err`
/// aborts the connection with a 400-class close (§6). `handle` runs for
/// every data message, and for ping/pong/close when the corresponding
/// `Config` policy flag is enabled. `close` always runs exactly once, on
/// loop exit, even if `init` or a `handle` call failed.
pub trait Handler<S: Read + Write>: Sized {
    type Context;

    fn init(
        request: &HandshakeRequest,
        conn: &mut Connection<S>,
        context: &Self::Context,
    ) -> Result<Self, WsError>;

    fn handle(&mut self, conn: &mut Connection<S>, message: Message) -> Result<(), WsError>;

    fn close(&mut self) {}

    /// Called once after `init` but before the read loop starts. Default
    /// is a no-op; override only when construction needs a second phase
    /// (e.g. sending a greeting frame) that should still abort the
    /// connection on failure.
    fn after_init(&mut self, _conn: &mut Connection<S>) -> Result<(), WsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferProvider;
    use crate::config::Config;
    use crate::reader::Reader;
    use std::io::Cursor;
    use std::sync::Arc;

    type TestStream = Cursor<Vec<u8>>;

    struct Echo {
        greeted: bool,
    }

    impl Handler<TestStream> for Echo {
        type Context = ();

        fn init(
            _request: &HandshakeRequest,
            _conn: &mut Connection<TestStream>,
            _context: &(),
        ) -> Result<Self, WsError> {
            Ok(Echo { greeted: false })
        }

        fn handle(
            &mut self,
            conn: &mut Connection<TestStream>,
            message: Message,
        ) -> Result<(), WsError> {
            if message.is_text() {
                conn.write_text(&message.payload)?;
            }
            Ok(())
        }

        fn after_init(&mut self, _conn: &mut Connection<TestStream>) -> Result<(), WsError> {
            self.greeted = true;
            Ok(())
        }
    }

    #[test]
    fn after_init_default_is_noop_when_not_overridden() {
        struct Bare;
        impl Handler<TestStream> for Bare {
            type Context = ();
            fn init(
                _request: &HandshakeRequest,
                _conn: &mut Connection<TestStream>,
                _context: &(),
            ) -> Result<Self, WsError> {
                Ok(Bare)
            }
            fn handle(
                &mut self,
                _conn: &mut Connection<TestStream>,
                _message: Message,
            ) -> Result<(), WsError> {
                Ok(())
            }
        }

        let provider = Arc::new(BufferProvider::new(256, 2));
        let reader = Reader::new(provider.clone(), 256, 65536);
        let stream = Cursor::new(Vec::<u8>::new());
        let mut conn = Connection::new(stream, reader, provider, Config::default());
        let mut bare = Bare;
        assert!(bare.after_init(&mut conn).is_ok());
    }

    #[test]
    fn after_init_override_runs() {
        let provider = Arc::new(BufferProvider::new(256, 2));
        let reader = Reader::new(provider.clone(), 256, 65536);
        let stream = Cursor::new(Vec::<u8>::new());
        let mut conn = Connection::new(stream, reader, provider, Config::default());
        let mut echo = Echo { greeted: false };
        echo.after_init(&mut conn).unwrap();
        assert!(echo.greeted);
    }
}
