use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use crate::def::Status;
use crate::message::Request;
use crate::response::ResponseWriter;

/// Produces the response for one decoded request.
pub trait Handler: Send + Sync {
    fn serve_gemini(&self, w: &mut dyn ResponseWriter, r: &Request);
}

impl<F> Handler for F
where
    F: Fn(&mut dyn ResponseWriter, &Request) + Send + Sync,
{
    fn serve_gemini(&self, w: &mut dyn ResponseWriter, r: &Request) {
        self(w, r)
    }
}

/// Turns a panicking handler into a `40 Internal Server Error` response.
pub struct TrapPanic<H>(pub H);

pub fn trap_panic<H: Handler>(handler: H) -> TrapPanic<H> {
    TrapPanic(handler)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

impl<H: Handler> Handler for TrapPanic<H> {
    fn serve_gemini(&self, w: &mut dyn ResponseWriter, r: &Request) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.0.serve_gemini(&mut *w, r)));
        if let Err(payload) = result {
            tracing::error!(uri = %r.target, panic = panic_message(&*payload), "trapped handler panic");
            if let Err(e) = w.write_status(Status::TemporaryFailure, "Internal Server Error") {
                tracing::debug!(error = %e, "could not report trapped panic");
            }
        }
    }
}

pub fn not_found(w: &mut dyn ResponseWriter, r: &Request) {
    if let Err(e) = w.write_status(Status::NotFound, Status::NotFound.message()) {
        tracing::debug!(uri = %r.target, error = %e, "failed to write not found");
    }
}

/// Drops the detail digit: 51 -> 50.
pub fn simplify_status(code: u8) -> u8 {
    code / 10 * 10
}
