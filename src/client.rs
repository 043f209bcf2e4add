use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream};
use std::sync::Arc;
use rustls::{ClientSession, StreamOwned};
use thiserror::Error;
use crate::def::*;
use crate::message::{Request, RequestError, Uri};
use crate::response::ClientResponse;
use crate::tls::{client_config, ClientStream, Identity, TlsError};

// server name sent for hosts that cannot be carried in SNI
const PLACEHOLDER_SERVER_NAME: &'static str = "invalid";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Parsing(#[from] ParsingError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("invalid host name: {0}")]
    InvalidHost(String),
    #[error("failed to connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("request was cancelled")]
    Cancelled,
    #[error("failed to send request: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Default)]
pub struct Client {
    /// Accept any server certificate. Without this the server must chain to
    /// a webpki root.
    pub insecure_skip_verify: bool,
    /// Certificate presented to servers that ask for one.
    pub identity: Option<Identity>,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn fetch(&self, url: &str) -> Result<ClientResponse, ClientError> {
        self.send(Request::new(url, None)?)
    }

    /// Sends the request line, then the titan payload if there is one, and
    /// reads back the status line. The connection stays open as the body.
    pub fn send(&self, mut request: Request) -> Result<ClientResponse, ClientError> {
        if request.context().is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let line = request.to_wire();
        if line.len() > MAX_LINE_LENGTH {
            return Err(ParsingError::LineTooLong.into());
        }

        let mut stream = self.connect(&request.target)?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(NEWLINE.as_bytes())?;

        if let (Some(titan), Some(mut payload)) = (request.titan.clone(), request.take_payload()) {
            let expected = titan.size as u64;
            let sent = io::copy(&mut payload.reader().take(expected), &mut stream)?;
            if sent < expected {
                return Err(RequestError::IncompletePayload { expected, read: sent }.into());
            }
        }
        stream.flush()?;

        let response = ClientResponse::read_from(stream)?;
        tracing::debug!(uri = %request.target, code = response.code, message = %response.message, "response");
        Ok(response)
    }

    fn connect(&self, target: &Uri) -> Result<ClientStream, ClientError> {
        let config = Arc::new(client_config(self.insecure_skip_verify, self.identity.as_ref())?);
        let dns_name = self.server_name(target)?;
        let address = target.address();
        let socket = TcpStream::connect(&address)
            .map_err(|source| ClientError::Connect { address, source })?;

        Ok(StreamOwned::new(ClientSession::new(&config, dns_name), socket))
    }

    /// IP literals, and any host when verification is skipped, fall back to a
    /// placeholder name that no trusted certificate can match.
    fn server_name<'a>(&self, target: &'a Uri) -> Result<webpki::DNSNameRef<'a>, ClientError> {
        let domain = target.domain();
        match webpki::DNSNameRef::try_from_ascii_str(domain) {
            Ok(name) => Ok(name),
            Err(_) if self.insecure_skip_verify || domain.parse::<IpAddr>().is_ok() => {
                webpki::DNSNameRef::try_from_ascii_str(PLACEHOLDER_SERVER_NAME)
                    .or(Err(ClientError::InvalidHost(target.host.clone())))
            }
            Err(_) => Err(ClientError::InvalidHost(target.host.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Context, Payload};

    #[test]
    fn cancelled_requests_are_not_sent() {
        let (context, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let request = Request::new("gemini://localhost:1/", None).unwrap().with_context(context);
        assert!(matches!(Client::new().send(request), Err(ClientError::Cancelled)));
    }

    #[test]
    fn oversized_requests_are_refused_locally() {
        let url = format!("gemini://localhost:1/{}", "a".repeat(MAX_LINE_LENGTH));
        assert!(matches!(
            Client::new().fetch(&url),
            Err(ClientError::Parsing(ParsingError::LineTooLong))
        ));
    }

    #[test]
    fn malformed_hosts_need_insecure_mode() {
        let request = Request::new("gemini://bad!host:1/", None).unwrap();
        assert!(matches!(Client::new().send(request), Err(ClientError::InvalidHost(_))));

        let target = Uri::parse("gemini://bad!host:1/").unwrap();
        let name = Client::new().insecure_skip_verify(true).server_name(&target).unwrap();
        assert_eq!(<&str>::from(name), "invalid");
    }

    #[test]
    fn ip_hosts_use_placeholder_name() {
        for url in &["gemini://127.0.0.1:1/", "gemini://[::1]:1/"] {
            let target = Uri::parse(url).unwrap();
            let name = Client::new().server_name(&target).unwrap();
            assert_eq!(<&str>::from(name), "invalid");
        }

        let target = Uri::parse("gemini://localhost/").unwrap();
        let name = Client::new().server_name(&target).unwrap();
        assert_eq!(<&str>::from(name), "localhost");
    }

    #[test]
    fn unknown_upload_size_fails_before_connecting() {
        let body = Payload::new(io::empty(), None);
        match Request::new("titan://localhost:1/file", Some(body)) {
            Err(RequestError::UnknownPayloadSize) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_scheme_fails_fetch() {
        assert!(matches!(
            Client::new().fetch("localhost/index.gmi"),
            Err(ClientError::Request(RequestError::Parsing(ParsingError::MissingScheme(_))))
        ));
    }
}
