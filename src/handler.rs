use crate::{request::Request, response::Response};

/// What the server runs once a request has fully arrived.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(Request) -> Response + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Response {
        self(request)
    }
}

/// Where handler code runs relative to the dispatcher loop.
///
/// `Inline` keeps everything on the dispatcher: simplest, but a slow handler
/// holds up every other stream on the connection. `Worker` moves the call to
/// the blocking pool and posts the response back, trading a task hop for
/// per-stream isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    #[default]
    Inline,
    Worker,
}
