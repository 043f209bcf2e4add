use std::io::{self, Cursor, Read, Write};
use rustls::Certificate;
use crate::tls::Connection;

/// In-memory stand-in for an accepted TLS connection.
pub struct MemoryConnection {
    pub input: Cursor<Vec<u8>>,
    pub output: Vec<u8>,
    pub certificates: Vec<Certificate>,
    pub closed: bool,
}

impl MemoryConnection {
    pub fn new(input: &[u8]) -> Self {
        Self { input: Cursor::new(input.to_vec()), output: Vec::new(), certificates: Vec::new(), closed: false }
    }
}

impl Read for MemoryConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for MemoryConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn peer_certificates(&self) -> Option<Vec<Certificate>> {
        if self.certificates.is_empty() { None } else { Some(self.certificates.clone()) }
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A writer that fails every write after `budget` bytes.
pub struct FailingWriter {
    pub written: Vec<u8>,
    pub budget: usize,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written.len() + buf.len() > self.budget {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
