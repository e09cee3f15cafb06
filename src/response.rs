use crate::{enums::ErrorType, hpack::HeaderField, types::Headers};
use bytes::Bytes;
use std::borrow::Cow;
use tokio::sync::mpsc;

/// Chunks a streaming body producer may have in flight before it blocks.
const BODY_CHANNEL_CAPACITY: usize = 2;

/// A response body: fully buffered, or fed chunk-by-chunk by the handler.
/// Client-side responses are always `Full`; streaming exists for server
/// handlers that produce large bodies under flow control.
#[derive(Debug)]
pub enum Body {
    Full(Bytes),
    Streaming(mpsc::Receiver<Bytes>),
}

impl Default for Body {
    fn default() -> Self {
        Self::Full(Bytes::new())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Full(bytes.into())
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::Full(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Full(text.into_bytes().into())
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::default(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Streaming response. DATA frames go out as chunks arrive on the
    /// returned sender, paced by flow control; dropping the sender ends the
    /// stream.
    #[must_use]
    pub fn streaming(status: u16) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            Self {
                status,
                headers: Headers::new(),
                body: Body::Streaming(rx),
            },
            tx,
        )
    }

    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// The buffered body as text; empty for a streaming body.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        match &self.body {
            Body::Full(bytes) => String::from_utf8_lossy(bytes),
            Body::Streaming(_) => Cow::Borrowed(""),
        }
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        match &self.body {
            Body::Full(bytes) => serde_json::from_slice(bytes),
            Body::Streaming(_) => serde_json::from_slice(b""),
        }
    }

    /// Rebuilds a response from a decoded header list (client side).
    pub(crate) fn from_fields(fields: &[HeaderField], body: Bytes) -> Result<Self, ErrorType> {
        let mut status = None;
        let mut headers = Headers::new();
        let mut pseudo_done = false;
        for field in fields {
            let name =
                std::str::from_utf8(&field.name).map_err(|_| ErrorType::ProtocolError)?;
            let value = String::from_utf8_lossy(&field.value).into_owned();
            if let Some(pseudo) = name.strip_prefix(':') {
                if pseudo_done || pseudo != "status" || status.is_some() {
                    return Err(ErrorType::ProtocolError);
                }
                status = Some(value.parse::<u16>().map_err(|_| ErrorType::ProtocolError)?);
            } else {
                pseudo_done = true;
                headers.push((name.to_owned(), value));
            }
        }
        Ok(Self {
            status: status.ok_or(ErrorType::ProtocolError)?,
            headers,
            body: Body::Full(body),
        })
    }

    /// Header list for the wire (server side): `:status` first, names
    /// lowercased, connection-specific headers stripped.
    pub(crate) fn to_field_list(&self) -> Vec<(Bytes, Bytes)> {
        let mut fields = vec![(
            Bytes::from_static(b":status"),
            Bytes::from(self.status.to_string()),
        )];
        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            if matches!(
                name.as_str(),
                "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
            ) {
                continue;
            }
            fields.push((Bytes::from(name), Bytes::from(value.clone().into_bytes())));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str) -> HeaderField {
        HeaderField {
            name: Bytes::copy_from_slice(name.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
            sensitive: false,
        }
    }

    #[test]
    fn status_is_parsed() {
        let response = Response::from_fields(
            &[field(":status", "301"), field("location", "/next")],
            Bytes::new(),
        )
        .unwrap();
        assert_eq!(response.status, 301);
        assert_eq!(response.header("Location"), Some("/next"));
    }

    #[test]
    fn missing_status_is_malformed() {
        assert!(Response::from_fields(&[field("server", "h2kit")], Bytes::new()).is_err());
    }

    #[test]
    fn status_after_regular_header_is_malformed() {
        assert!(Response::from_fields(
            &[field("server", "h2kit"), field(":status", "200")],
            Bytes::new(),
        )
        .is_err());
    }

    #[test]
    fn field_list_strips_connection_headers() {
        let response = Response::new(200)
            .with_header("Content-Type", "text/html")
            .with_header("Connection", "keep-alive")
            .with_header("Transfer-Encoding", "chunked");
        let fields = response.to_field_list();
        assert_eq!(fields[0].0.as_ref(), b":status");
        assert_eq!(fields[0].1.as_ref(), b"200");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].0.as_ref(), b"content-type");
    }

    #[test]
    fn text_reads_full_bodies() {
        let response = Response::new(200).with_body("Hello");
        assert_eq!(response.text(), "Hello");
    }
}
