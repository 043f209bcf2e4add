//! Gemini and Titan over TLS: request line decoding, the status-then-body
//! response discipline, a thread per connection acceptor and a fetching client.

pub mod def;
pub mod message;
pub mod response;
pub mod handler;
pub mod tls;
pub mod server;
pub mod client;

#[cfg(test)]
mod testing;

pub use crate::client::{Client, ClientError};
pub use crate::def::{ParsingError, Protocol, ResponseError, Status};
pub use crate::handler::{not_found, simplify_status, trap_panic, Handler, TrapPanic};
pub use crate::message::{Context, Payload, Request, RequestError, TitanParameters, Uri};
pub use crate::response::{ClientResponse, Response, ResponseWriter};
pub use crate::server::{listen_and_serve, Server, ServerError, ServerOptions};
pub use crate::tls::{Connection, Identity, TlsError};
