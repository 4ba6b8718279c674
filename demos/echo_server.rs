use structopt::StructOpt;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;

use ws_server::{Config, Connection, Handler, HandshakeRequest, Message, Server, Stream, WsError};

/// minimal text/binary echo server built on the blocking core
#[derive(StructOpt)]
struct Args {
    /// server host
    #[structopt(long, default_value = "127.0.0.1")]
    host: String,
    /// server port
    #[structopt(short, long, default_value = "9223")]
    port: u16,
}

struct Echo;

impl Handler<Stream> for Echo {
    type Context = ();

    fn init(
        _request: &HandshakeRequest,
        _conn: &mut Connection<Stream>,
        _context: &(),
    ) -> Result<Self, WsError> {
        Ok(Echo)
    }

    fn handle(&mut self, conn: &mut Connection<Stream>, message: Message) -> Result<(), WsError> {
        match message.opcode {
            ws_server::OpCode::Text => conn.write_text(&message.payload)?,
            ws_server::OpCode::Binary => conn.write_binary(&message.payload)?,
            _ => {}
        }
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::INFO)
        .finish()
        .try_init()
        .expect("failed to init log");

    let args = Args::from_args();
    let config = Config::new().address(args.host).port(args.port);
    let server = Server::<Echo>::new(config, ());
    if let Err(err) = server.run() {
        tracing::error!(error = %err, "server exited");
    }
}
