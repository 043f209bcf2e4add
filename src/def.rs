use std::fmt::{self, Display, Formatter};
use std::io;
use std::sync::Arc;
use thiserror::Error;

pub const NEWLINE: &'static str = "\r\n";
pub const MAX_LINE_LENGTH: usize = 1024;
pub const DEFAULT_PORT: u16 = 1965;
pub const DEFAULT_ADDRESS: &'static str = "127.0.0.1:1965";

const PROTOCOL_GEMINI: &'static str = "gemini";
const PROTOCOL_TITAN: &'static str = "titan";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Gemini,
    Titan,
}

impl Protocol {
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            PROTOCOL_GEMINI => Some(Self::Gemini),
            PROTOCOL_TITAN => Some(Self::Titan),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => PROTOCOL_GEMINI,
            Self::Titan => PROTOCOL_TITAN,
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    PlainInput,
    SensitiveInput,
    Success,
    TemporaryRedirect,
    PermanentRedirect,
    TemporaryFailure,
    ServerUnavailable,
    CgiError,
    ProxyError,
    SlowDown,
    PermanentFailure,
    NotFound,
    Gone,
    ProxyRequestRefused,
    BadRequest,
    CertificateRequired,
    CertificateNotAuthorized,
    CertificateNotValid,
}

impl Status {
    /// Maps a raw code to its status. Codes that are not defined but belong to
    /// a known family collapse onto the family's base status.
    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            10 => Self::PlainInput,
            11 => Self::SensitiveInput,
            20 => Self::Success,
            30 => Self::TemporaryRedirect,
            31 => Self::PermanentRedirect,
            40 => Self::TemporaryFailure,
            41 => Self::ServerUnavailable,
            42 => Self::CgiError,
            43 => Self::ProxyError,
            44 => Self::SlowDown,
            50 => Self::PermanentFailure,
            51 => Self::NotFound,
            52 => Self::Gone,
            53 => Self::ProxyRequestRefused,
            59 => Self::BadRequest,
            60 => Self::CertificateRequired,
            61 => Self::CertificateNotAuthorized,
            62 => Self::CertificateNotValid,
            10..=69 => return Self::from_code(code / 10 * 10),
            _ => return None,
        };

        Some(status)
    }

    pub fn parse(status: &str) -> Option<Self> {
        if status.len() != 2 || !status.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        status.parse::<u8>().ok().and_then(Self::from_code)
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::PlainInput => 10,
            Self::SensitiveInput => 11,
            Self::Success => 20,
            Self::TemporaryRedirect => 30,
            Self::PermanentRedirect => 31,
            Self::TemporaryFailure => 40,
            Self::ServerUnavailable => 41,
            Self::CgiError => 42,
            Self::ProxyError => 43,
            Self::SlowDown => 44,
            Self::PermanentFailure => 50,
            Self::NotFound => 51,
            Self::Gone => 52,
            Self::ProxyRequestRefused => 53,
            Self::BadRequest => 59,
            Self::CertificateRequired => 60,
            Self::CertificateNotAuthorized => 61,
            Self::CertificateNotValid => 62,
        }
    }

    /// The base status of this status' family, e.g. `NotFound` -> `PermanentFailure`.
    pub fn family(&self) -> Self {
        match self.code() / 10 {
            1 => Self::PlainInput,
            2 => Self::Success,
            3 => Self::TemporaryRedirect,
            4 => Self::TemporaryFailure,
            5 => Self::PermanentFailure,
            _ => Self::CertificateRequired,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::PlainInput => "Input",
            Self::SensitiveInput => "Sensitive Input",
            Self::Success => "Success",
            Self::TemporaryRedirect => "Temporary Redirect",
            Self::PermanentRedirect => "Permanent Redirect",
            Self::TemporaryFailure => "Temporary Failure",
            Self::ServerUnavailable => "Server Unavailable",
            Self::CgiError => "CGI Error",
            Self::ProxyError => "Proxy Error",
            Self::SlowDown => "Slow Down",
            Self::PermanentFailure => "Permanent Failure",
            Self::NotFound => "Not Found",
            Self::Gone => "Gone",
            Self::ProxyRequestRefused => "Proxy Request Refused",
            Self::BadRequest => "Bad Request",
            Self::CertificateRequired => "Certificate Required",
            Self::CertificateNotAuthorized => "Certificate Not Authorized",
            Self::CertificateNotValid => "Certificate Not Valid",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failures while reading or decoding protocol lines. Any of these on the
/// server side closes the connection without a response.
#[derive(Debug, Error)]
pub enum ParsingError {
    #[error("failed to read line: {0}")]
    Io(#[from] io::Error),
    #[error("request exceeds {} length", MAX_LINE_LENGTH)]
    LineTooLong,
    #[error("failed to unescape request: {0}")]
    Unescape(String),
    #[error("failed to parse request: {0}")]
    Uri(String),
    #[error("request is missing scheme: {0}")]
    MissingScheme(String),
    #[error("titan parameters expected")]
    ParametersExpected,
    #[error("failed to parse titan size parameter: {0}")]
    Size(String),
    #[error("malformed status line: {0}")]
    Status(String),
}

#[derive(Clone, Debug, Error)]
pub enum ResponseError {
    #[error("status has been sent already")]
    StatusAlreadySent,
    #[error("status message is not written")]
    StatusNotWritten,
    #[error("failed to write response {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: Arc<io::Error>,
    },
}

impl From<ResponseError> for io::Error {
    fn from(error: ResponseError) -> Self {
        let kind = match &error {
            ResponseError::Transport { source, .. } => source.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}
