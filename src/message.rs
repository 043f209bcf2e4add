use std::cell::RefCell;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{self, Cursor, Read};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use lazy_static::lazy_static;
use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use rustls::Certificate;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::parse_x509_certificate;
use crate::def::*;
use crate::tls::Connection;

lazy_static! {
    static ref URI_REGEX: Regex = Regex::new(r"(?x)
        ^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://
        (?P<host>\[[^\]\x00-\x20\x7f]*\]|[^/:?\#\[\]@\x00-\x20\x7f]*)
        (?::(?P<port>[0-9]*))?
        (?P<path>/[^?\#\x00-\x1f\x7f]*)?
        (?:\?(?P<query>[^\#\x00-\x1f\x7f]*))?
        (?:\#(?P<fragment>[^\x00-\x1f\x7f]*))?$").unwrap();

    static ref SCHEME_REGEX: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").unwrap();

    // a '%' not followed by two hex digits
    static ref BAD_ESCAPE_REGEX: regex::bytes::Regex = regex::bytes::Regex::new(
        r"(?-u)%(?:$|[^0-9A-Fa-f]|[0-9A-Fa-f](?:$|[^0-9A-Fa-f]))").unwrap();
}

// everything the server side unescaping would otherwise rewrite
const WIRE_ESCAPE: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b'+').add(b'"').add(b'<').add(b'>').add(b'`');

/// Reads up to and excluding the next CRLF. Bytes are pulled one at a time so
/// nothing past the delimiter is consumed from `reader`.
pub fn read_line<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, ParsingError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match reader.read(&mut byte) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before end of line"))?,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e)?,
        }

        if byte[0] == b'\n' && line.last() == Some(&b'\r') {
            line.pop();
            return Ok(line);
        }
        line.push(byte[0]);

        // a trailing '\r' may still turn out to be half of the delimiter
        let length = if line.ends_with(b"\r") { line.len() - 1 } else { line.len() };
        if length > MAX_LINE_LENGTH {
            return Err(ParsingError::LineTooLong);
        }
    }
}

/// Query-string style unescaping: `+` becomes a space and `%XX` sequences are decoded.
pub fn unescape(raw: &[u8]) -> Result<String, ParsingError> {
    let lossy = || String::from_utf8_lossy(raw).into_owned();
    if BAD_ESCAPE_REGEX.is_match(raw) {
        return Err(ParsingError::Unescape(lossy()));
    }

    let plus_decoded: Vec<u8> = raw.iter().map(|&b| if b == b'+' { b' ' } else { b }).collect();
    let decoded: Vec<u8> = percent_decode(&plus_decoded).collect();
    String::from_utf8(decoded).or(Err(ParsingError::Unescape(lossy())))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl Uri {
    /// Parses an absolute URI. The scheme is mandatory and lowercased.
    pub fn parse(uri: &str) -> Result<Self, ParsingError> {
        let capture = match URI_REGEX.captures(uri) {
            Some(capture) => capture,
            None if !SCHEME_REGEX.is_match(uri) => return Err(ParsingError::MissingScheme(uri.to_string())),
            None => return Err(ParsingError::Uri(uri.to_string())),
        };

        let port = match capture.name("port").map(|p| p.as_str()) {
            Some(port) if !port.is_empty() => Some(port.parse::<u16>().or(Err(ParsingError::Uri(uri.to_string())))?),
            _ => None,
        };

        Ok(Self {
            scheme: capture["scheme"].to_ascii_lowercase(),
            host: capture["host"].to_string(),
            port,
            path: capture.name("path").map(|p| p.as_str().to_string()).unwrap_or_default(),
            query: capture.name("query").map(|q| q.as_str().to_string()),
            fragment: capture.name("fragment").map(|f| f.as_str().to_string()),
        })
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::parse(&self.scheme)
    }

    /// Host without IPv6 brackets, as used for server name indication.
    pub fn domain(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(DEFAULT_PORT))
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{}", fragment)?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TitanParameters {
    pub token: String,
    pub mime: String,
    pub size: i64,
}

impl TitanParameters {
    /// Splits `path;key=value;...` into the bare path and its parameters.
    /// Segments that are not a single `key=value` pair and unknown keys are skipped.
    pub fn parse(path: &str) -> Result<(String, Self), ParsingError> {
        let (path, segments) = path.split_once(';').ok_or(ParsingError::ParametersExpected)?;
        let mut parameters = Self::default();

        for segment in segments.split(';') {
            let pair: Vec<_> = segment.split('=').collect();
            if pair.len() != 2 { continue }
            match pair[0] {
                "token" => parameters.token = pair[1].to_string(),
                "mime" => parameters.mime = pair[1].to_string(),
                "size" => parameters.size = match pair[1].parse::<i64>() {
                    Ok(size) if size >= 0 => size,
                    _ => return Err(ParsingError::Size(pair[1].to_string())),
                },
                _ => {}
            }
        }

        Ok((path.to_string(), parameters))
    }

    pub fn construct(&self) -> String {
        let mut parameters = String::new();
        if !self.token.is_empty() {
            parameters.push_str(&format!(";token={}", self.token));
        }
        if !self.mime.is_empty() {
            parameters.push_str(&format!(";mime={}", self.mime));
        }
        parameters.push_str(&format!(";size={}", self.size));
        parameters
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Parsing(#[from] ParsingError),
    #[error("can't handle unknown size titan payloads")]
    UnknownPayloadSize,
    #[error("request has no titan parameters")]
    NotUpload,
    #[error("incomplete titan payload: expected {expected} bytes, read {read}")]
    IncompletePayload { expected: u64, read: u64 },
    #[error("request connection is closed")]
    Disconnected,
    #[error("failed to read titan payload: {0}")]
    Io(#[from] io::Error),
}

/// A cancellation and deadline scope carried by a request. Transport
/// operations never consult it; handlers check it to stop early.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancelled: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

#[derive(Clone, Debug)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut context = self.clone();
        context.cancelled.push(flag.clone());
        (context, CancelHandle(flag))
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut context = self.clone();
        context.deadline = Some(self.deadline.map_or(deadline, |current| current.min(deadline)));
        context
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.iter().any(|flag| flag.load(Ordering::SeqCst))
            || self.deadline.map_or(false, |deadline| Instant::now() >= deadline)
    }
}

/// Outgoing titan body. Only payloads of known size can be sent.
pub struct Payload {
    reader: Box<dyn Read + Send>,
    size: Option<u64>,
}

impl Payload {
    pub fn new<R: Read + Send + 'static>(reader: R, size: Option<u64>) -> Self {
        Self { reader: Box::new(reader), size }
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn reader(&mut self) -> &mut (dyn Read + Send) {
        &mut *self.reader
    }
}

impl From<Vec<u8>> for Payload {
    fn from(content: Vec<u8>) -> Self {
        let size = content.len() as u64;
        Self::new(Cursor::new(content), Some(size))
    }
}

impl From<&[u8]> for Payload {
    fn from(content: &[u8]) -> Self {
        Self::from(content.to_vec())
    }
}

impl From<String> for Payload {
    fn from(content: String) -> Self {
        Self::from(content.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(content: &str) -> Self {
        Self::from(content.as_bytes())
    }
}

pub type SharedConnection = Rc<RefCell<dyn Connection>>;

pub struct Request {
    pub target: Uri,
    pub titan: Option<TitanParameters>,
    connection: Option<Weak<RefCell<dyn Connection>>>,
    context: Option<Context>,
    payload: Option<Payload>,
}

impl Request {
    /// Decodes a raw request line received on `connection`.
    pub fn decode(connection: &SharedConnection, raw: &[u8]) -> Result<Self, ParsingError> {
        let mut request = Self::parse(&unescape(raw)?)?;
        request.connection = Some(Rc::downgrade(connection));
        Ok(request)
    }

    /// Parses an already unescaped request line.
    pub fn parse(line: &str) -> Result<Self, ParsingError> {
        let mut target = Uri::parse(line)?;
        let mut titan = None;

        if target.protocol() == Some(Protocol::Titan) {
            let (path, parameters) = TitanParameters::parse(&target.path)?;
            target.path = path;
            titan = Some(parameters);
        } else if target.path.is_empty() {
            target.path = "/".to_string();
        }

        Ok(Self { target, titan, connection: None, context: None, payload: None })
    }

    /// Builds an outgoing request. A titan request takes its size from `body`,
    /// which must know its length; other schemes ignore the body.
    pub fn new(url: &str, body: Option<Payload>) -> Result<Self, RequestError> {
        let mut target = Uri::parse(url)?;
        if target.protocol() != Some(Protocol::Titan) {
            if target.path.is_empty() {
                target.path = "/".to_string();
            }
            return Ok(Self { target, titan: None, connection: None, context: None, payload: None });
        }

        let mut titan = TitanParameters::default();
        if target.path.contains(';') {
            let (path, parameters) = TitanParameters::parse(&target.path)?;
            target.path = path;
            titan = parameters;
        }
        if let Some(body) = &body {
            titan.size = body.size().ok_or(RequestError::UnknownPayloadSize)? as i64;
        }

        Ok(Self { target, titan: Some(titan), connection: None, context: None, payload: body })
    }

    pub fn with_mime<S: Into<String>>(mut self, mime: S) -> Self {
        if let Some(titan) = self.titan.as_mut() {
            titan.mime = mime.into();
        }
        self
    }

    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        if let Some(titan) = self.titan.as_mut() {
            titan.token = token.into();
        }
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn context(&self) -> Context {
        self.context.clone().unwrap_or_else(Context::background)
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.target.protocol()
    }

    pub(crate) fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    fn connection(&self) -> Option<SharedConnection> {
        self.connection.as_ref().and_then(Weak::upgrade)
    }

    /// Reads exactly `titan.size` bytes following the request line.
    pub fn read_titan_payload(&self) -> Result<Vec<u8>, RequestError> {
        let titan = self.titan.as_ref().ok_or(RequestError::NotUpload)?;
        let connection = self.connection().ok_or(RequestError::Disconnected)?;
        let expected = titan.size.max(0) as u64;

        let mut payload = Vec::with_capacity(expected.min(64 * 1024) as usize);
        let mut connection = connection.borrow_mut();
        (&mut *connection).take(expected).read_to_end(&mut payload)?;
        if (payload.len() as u64) < expected {
            return Err(RequestError::IncompletePayload { expected, read: payload.len() as u64 });
        }

        Ok(payload)
    }

    /// The first certificate the client presented, if any.
    pub fn certificate(&self) -> Option<Certificate> {
        let connection = self.connection()?;
        let certificates = connection.borrow().peer_certificates()?;
        certificates.into_iter().next()
    }

    /// Lowercase hex SHA-256 of the client certificate.
    pub fn fingerprint(&self) -> Option<String> {
        let certificate = self.certificate()?;
        Some(Sha256::digest(&certificate.0).iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Common name, serial number and validity bounds (base 36 Unix seconds)
    /// of the client certificate. Anonymous clients get a single empty name.
    pub fn user_name(&self) -> Vec<String> {
        let certificate = match self.certificate() {
            Some(certificate) => certificate,
            None => return vec![String::new()],
        };
        let parsed = match parse_x509_certificate(&certificate.0) {
            Ok((_, parsed)) => parsed,
            Err(e) => {
                tracing::debug!(uri = %self.target, error = %e, "unparseable client certificate");
                return vec![String::new()];
            }
        };

        let common_name = parsed.subject().iter_common_name().next().and_then(|cn| cn.as_str().ok());
        vec![
            common_name.unwrap_or_default().to_string(),
            parsed.tbs_certificate.serial.to_string(),
            base36(parsed.validity().not_before.timestamp()),
            base36(parsed.validity().not_after.timestamp()),
        ]
    }

    /// The request line as sent on the wire, without the trailing CRLF.
    pub fn to_wire(&self) -> String {
        let mut target = format!("{}://{}", self.target.scheme, self.target.host);
        if let Some(port) = self.target.port {
            target.push_str(&format!(":{}", port));
        }
        target.push_str(&self.target.path);
        if let Some(titan) = &self.titan {
            target.push_str(&titan.construct());
        }
        if let Some(query) = &self.target.query {
            target.push('?');
            target.push_str(query);
        }

        utf8_percent_encode(&target, WIRE_ESCAPE).to_string()
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("target", &self.target)
            .field("titan", &self.titan)
            .field("context", &self.context)
            .finish()
    }
}

fn base36(value: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut magnitude = value.unsigned_abs();
    let mut digits = Vec::new();
    loop {
        digits.push(DIGITS[(magnitude % 36) as usize]);
        magnitude /= 36;
        if magnitude == 0 { break }
    }
    if value < 0 {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// A status line: `<code> <message>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Headline {
    pub code: u8,
    pub status: Status,
    pub message: String,
}

impl Headline {
    pub fn parse(line: &[u8]) -> Result<Self, ParsingError> {
        let line = String::from_utf8(line.to_vec())
            .or(Err(ParsingError::Status(String::from_utf8_lossy(line).into_owned())))?;
        let (code, message) = match line.split_once(' ') {
            Some((code, message)) => (code, message),
            None => (line.as_str(), ""),
        };
        let status = Status::parse(code).ok_or(ParsingError::Status(line.clone()))?;
        let code = code.parse::<u8>().or(Err(ParsingError::Status(line.clone())))?;

        Ok(Self { code, status, message: message.to_string() })
    }

    pub fn construct(status: impl Display, message: impl Display) -> Vec<u8> {
        format!("{} {}{}", status, message, NEWLINE).into_bytes()
    }
}
