use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::rc::Weak;
use std::sync::Arc;
use rustls::Session;
use crate::def::*;
use crate::message::{read_line, Headline};
use crate::tls::{ClientStream, Connection};

/// What a handler writes its answer through. Exactly one status line must be
/// written before any body bytes.
pub trait ResponseWriter: Write {
    fn write_status(&mut self, status: Status, message: &str) -> Result<(), ResponseError>;
    fn write_body(&mut self, body: &[u8]) -> Result<usize, ResponseError>;
}

/// Server side response over a single connection.
///
/// Starts out awaiting the status line and moves to an open body once it has
/// been written; there is no way back. The first transport failure is kept
/// and returned by every later write.
pub struct Response<W: Write> {
    writer: W,
    header_written: bool,
    error: Option<ResponseError>,
}

impl<W: Write> Response<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, header_written: false, error: None }
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub fn error(&self) -> Option<&ResponseError> {
        self.error.as_ref()
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn fail(&mut self, context: &'static str, source: io::Error) -> ResponseError {
        let error = ResponseError::Transport { context, source: Arc::new(source) };
        self.error = Some(error.clone());
        error
    }
}

impl<W: Write> ResponseWriter for Response<W> {
    fn write_status(&mut self, status: Status, message: &str) -> Result<(), ResponseError> {
        if self.header_written {
            return Err(ResponseError::StatusAlreadySent);
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        if let Err(e) = self.writer.write_all(&Headline::construct(status, message)) {
            return Err(self.fail("status message", e));
        }
        self.header_written = true;
        Ok(())
    }

    fn write_body(&mut self, body: &[u8]) -> Result<usize, ResponseError> {
        if !self.header_written {
            return Err(ResponseError::StatusNotWritten);
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        match self.writer.write_all(body) {
            Ok(()) => Ok(body.len()),
            Err(e) => Err(self.fail("body", e)),
        }
    }
}

impl<W: Write> Write for Response<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_body(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(error) = &self.error {
            return Err(error.clone().into());
        }
        self.writer.flush()
    }
}

/// Writes into a connection owned elsewhere.
pub struct ConnectionWriter {
    connection: Weak<RefCell<dyn Connection>>,
}

impl ConnectionWriter {
    pub fn new(connection: Weak<RefCell<dyn Connection>>) -> Self {
        Self { connection }
    }

    fn with<T>(&self, f: impl FnOnce(&mut dyn Connection) -> io::Result<T>) -> io::Result<T> {
        let connection = self.connection.upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        let mut connection = connection.borrow_mut();
        f(&mut *connection)
    }
}

impl Write for ConnectionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(|connection| connection.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with(|connection| connection.flush())
    }
}

/// A response as received by a client. The body is the rest of the
/// connection and is read on demand.
pub struct ClientResponse<S: Read = ClientStream> {
    pub code: u8,
    pub status: Status,
    pub message: String,
    body: S,
}

impl<S: Read> ClientResponse<S> {
    pub fn read_from(mut stream: S) -> Result<Self, ParsingError> {
        let Headline { code, status, message } = Headline::parse(&read_line(&mut stream)?)?;
        Ok(Self { code, status, message, body: stream })
    }

    pub fn body(&mut self) -> &mut S {
        &mut self.body
    }

    pub fn text(&mut self) -> io::Result<String> {
        let mut body = Vec::new();
        self.read_to_end(&mut body)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub fn into_inner(self) -> S {
        self.body
    }
}

impl<S: Read> Read for ClientResponse<S> {
    // rustls reports the server's close_notify as ConnectionAborted; that is
    // the regular end of a body
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.body.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => Ok(0),
            result => result,
        }
    }
}

impl ClientResponse<ClientStream> {
    pub fn close(mut self) -> io::Result<()> {
        self.body.sess.send_close_notify();
        while self.body.sess.wants_write() {
            if let Err(e) = self.body.sess.write_tls(&mut self.body.sock) {
                tracing::debug!(error = %e, "close notify not delivered");
                break;
            }
        }
        match self.body.sock.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}
