use std::cell::RefCell;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use rustls::{ServerConfig, ServerSession, StreamOwned};
use thiserror::Error;
use crate::def::*;
use crate::handler::Handler;
use crate::message::{read_line, Request, SharedConnection};
use crate::response::{ConnectionWriter, Response};
use crate::tls::{server_config, Identity, TlsError};

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub address: String,
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            certificate: PathBuf::from("server.crt.pem"),
            key: PathBuf::from("server.key.pem"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to load certificates: {0}")]
    Tls(#[from] TlsError),
    #[error("failed to listen on {address}: {source}")]
    Bind { address: String, source: io::Error },
}

pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn bind(options: &ServerOptions) -> Result<Self, ServerError> {
        let identity = Identity::load(&options.certificate, &options.key)?;
        Self::with_identity(&options.address, identity)
    }

    pub fn with_identity(address: &str, identity: Identity) -> Result<Self, ServerError> {
        let address = if address.is_empty() { DEFAULT_ADDRESS } else { address };
        let config = Arc::new(server_config(identity)?);
        let listener = TcpListener::bind(address)
            .map_err(|source| ServerError::Bind { address: address.to_string(), source })?;

        tracing::info!(address = ?listener.local_addr().ok(), "listening");
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, one worker thread each.
    pub fn serve<H: Handler + 'static>(&self, handler: H) {
        let handler = Arc::new(handler);

        for socket in self.listener.incoming() {
            let socket = match socket {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            let config = self.config.clone();
            let handler = handler.clone();
            let spawned = thread::Builder::new()
                .name("gemini-worker".to_string())
                .spawn(move || handle_connection(socket, &config, &*handler));
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "failed to spawn connection worker");
            }
        }
    }

    pub fn listen<H: Handler + 'static>(self, handler: H) -> thread::JoinHandle<()> {
        thread::spawn(move || self.serve(handler))
    }
}

pub fn listen_and_serve<H: Handler + 'static>(options: &ServerOptions, handler: H) -> Result<(), ServerError> {
    Server::bind(options)?.serve(handler);
    Ok(())
}

fn handle_connection(socket: TcpStream, config: &Arc<ServerConfig>, handler: &dyn Handler) {
    let span = tracing::info_span!("connection", peer = ?socket.peer_addr().ok());
    let _enter = span.enter();

    let stream = StreamOwned::new(ServerSession::new(config), socket);
    serve_connection(Rc::new(RefCell::new(stream)), handler);
}

// closes the connection however the worker exits, unwinding included
struct CloseGuard(SharedConnection);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Ok(mut connection) = self.0.try_borrow_mut() {
            if let Err(e) = connection.close() {
                tracing::debug!(error = %e, "failed to close connection");
            }
        }
    }
}

/// Runs one request/response exchange. Anything that fails before a request
/// is decoded just closes the connection.
pub fn serve_connection(connection: SharedConnection, handler: &dyn Handler) {
    let _guard = CloseGuard(connection.clone());

    let line = match read_line(&mut *connection.borrow_mut()) {
        Ok(line) => line,
        Err(e) => {
            tracing::debug!(error = %e, "failed to read request");
            return;
        }
    };
    tracing::debug!(raw = %String::from_utf8_lossy(&line), "raw request");

    let request = match Request::decode(&connection, &line) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "failed to decode request");
            return;
        }
    };

    let mut response = Response::new(ConnectionWriter::new(Rc::downgrade(&connection)));
    handler.serve_gemini(&mut response, &request);
    if let Err(e) = response.flush() {
        tracing::debug!(uri = %request.target, error = %e, "failed to flush response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use crate::handler::trap_panic;
    use crate::response::ResponseWriter;
    use crate::testing::MemoryConnection;

    fn exchange<H: Handler>(input: &[u8], handler: H) -> MemoryConnection {
        let memory = Rc::new(RefCell::new(MemoryConnection::new(input)));
        serve_connection(memory.clone(), &handler);
        Rc::try_unwrap(memory).ok().unwrap().into_inner()
    }

    fn hello(w: &mut dyn ResponseWriter, _: &Request) {
        w.write_status(Status::Success, "text/gemini").unwrap();
        w.write_body(b"hi").unwrap();
    }

    #[test]
    fn serves_one_exchange_then_closes() {
        let connection = exchange(b"gemini://x/\r\n", hello);
        assert_eq!(connection.output, b"20 text/gemini\r\nhi");
        assert!(connection.closed);
    }

    #[test]
    fn malformed_requests_get_no_response() {
        let inputs: [&[u8]; 4] = [b"no scheme here\r\n", b"titan://x/upload\r\n", b"gemini://x/%zz\r\n", b"gemini://x/"];
        for input in inputs.iter() {
            let connection = exchange(input, hello);
            assert!(connection.output.is_empty());
            assert!(connection.closed);
        }

        let mut long = vec![b'a'; MAX_LINE_LENGTH + 10];
        long.extend_from_slice(b"\r\n");
        let connection = exchange(&long, hello);
        assert!(connection.output.is_empty());
        assert!(connection.closed);
    }

    #[test]
    fn handler_reads_titan_payload() {
        let handler = |w: &mut dyn ResponseWriter, r: &Request| {
            let payload = r.read_titan_payload().unwrap();
            let titan = r.titan.as_ref().unwrap();
            w.write_status(Status::Success, &titan.mime).unwrap();
            w.write_body(&payload).unwrap();
        };
        let connection = exchange(b"titan://x/post;mime=text/plain;size=5\r\nhello trailing", handler);
        assert_eq!(connection.output, b"20 text/plain\r\nhello");

        let mut rest = String::new();
        let mut input = connection.input;
        input.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, " trailing");
    }

    #[test]
    fn trapped_panic_still_answers_and_closes() {
        let handler = trap_panic(|_: &mut dyn ResponseWriter, _: &Request| panic!("must die"));
        let connection = exchange(b"gemini://x/die\r\n", handler);
        assert_eq!(connection.output, b"40 Internal Server Error\r\n");
        assert!(connection.closed);
    }

    #[test]
    fn untrapped_panic_still_closes() {
        let memory = Rc::new(RefCell::new(MemoryConnection::new(b"gemini://x/\r\n")));
        let shared: SharedConnection = memory.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            serve_connection(shared, &|_: &mut dyn ResponseWriter, _: &Request| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(memory.borrow().closed);
        assert!(memory.borrow().output.is_empty());
    }

    #[test]
    fn default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.address, "127.0.0.1:1965");
        assert_eq!(options.certificate, PathBuf::from("server.crt.pem"));
    }
}
