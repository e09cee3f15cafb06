use crate::{enums::ErrorType, hpack::HeaderField, types::Headers};
use bytes::Bytes;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

impl From<&str> for Method {
    fn from(method: &str) -> Self {
        match method {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "PATCH" => Self::Patch,
            "OPTIONS" => Self::Options,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// An HTTP request, the same shape on both sides of the wire: the client
/// builds one from a URL, the server hands one (reassembled from
/// pseudo-headers and DATA frames) to its handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw `:path` including the query string; URI parsing is the caller's
    /// business.
    pub path: String,
    pub scheme: String,
    pub authority: String,
    pub headers: Headers,
    pub user_agent: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: &Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        let host = url.host_str().expect("URL cannot be a base");
        let mut path = url.path().to_owned();
        if let Some(query) = url.query() {
            path = format!("{path}?{query}");
        }
        Self {
            method,
            path,
            scheme: url.scheme().to_owned(),
            authority: if let Some(port) = url.port() {
                format!("{host}:{port}")
            } else {
                host.to_owned()
            },
            headers: headers.unwrap_or_default(),
            user_agent: None,
            content_type: None,
            body: body.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn get(url: &Url) -> Self {
        Self::new(Method::Get, url, None, Bytes::new())
    }

    #[inline]
    pub fn post(url: &Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url, headers, body)
    }

    #[cfg(feature = "json")]
    pub fn post_json<T: serde::Serialize>(url: &Url, body: &T) -> serde_json::Result<Self> {
        let mut request = Self::new(Method::Post, url, None, serde_json::to_vec(body)?);
        request.content_type = Some("application/json".to_owned());
        Ok(request)
    }

    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Follow-up request for a 3xx response, if it carries a `location`.
    #[must_use]
    pub fn redirect(&self, response: &crate::response::Response) -> Option<Self> {
        let location = response.header("location")?;
        let base = Url::parse(&format!("{}://{}{}", self.scheme, self.authority, self.path)).ok()?;
        let target = base.join(location).ok()?;
        Some(Self::new(
            self.method.clone(),
            &target,
            Some(self.headers.clone()),
            self.body.clone(),
        ))
    }

    /// Rebuilds a request from a decoded header list (server side).
    /// Malformed requests are stream-level PROTOCOL_ERRORs (RFC 7540 §8.1.2).
    pub(crate) fn from_fields(fields: &[HeaderField], body: Bytes) -> Result<Self, ErrorType> {
        let mut method = None;
        let mut path = None;
        let mut scheme = None;
        let mut authority: Option<String> = None;
        let mut user_agent = None;
        let mut content_type = None;
        let mut headers = Headers::new();
        let mut pseudo_done = false;

        for field in fields {
            let name =
                std::str::from_utf8(&field.name).map_err(|_| ErrorType::ProtocolError)?;
            let value = String::from_utf8_lossy(&field.value).into_owned();
            if let Some(pseudo) = name.strip_prefix(':') {
                // pseudo-headers come first, each at most once
                if pseudo_done {
                    return Err(ErrorType::ProtocolError);
                }
                let slot = match pseudo {
                    "method" => &mut method,
                    "path" => &mut path,
                    "scheme" => &mut scheme,
                    "authority" => &mut authority,
                    _ => return Err(ErrorType::ProtocolError),
                };
                if slot.replace(value).is_some() {
                    return Err(ErrorType::ProtocolError);
                }
            } else {
                pseudo_done = true;
                if name.bytes().any(|b| b.is_ascii_uppercase()) {
                    return Err(ErrorType::ProtocolError);
                }
                match name {
                    // connection-specific headers do not survive into HTTP/2
                    "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
                    | "upgrade" => return Err(ErrorType::ProtocolError),
                    "te" if value != "trailers" => return Err(ErrorType::ProtocolError),
                    "user-agent" => user_agent = Some(value),
                    "content-type" => content_type = Some(value),
                    "host" => {
                        if authority.is_none() {
                            authority = Some(value.clone());
                        }
                        headers.push((name.to_owned(), value));
                    }
                    _ => headers.push((name.to_owned(), value)),
                }
            }
        }

        let method = Method::from(method.ok_or(ErrorType::ProtocolError)?.as_str());
        let path = path.ok_or(ErrorType::ProtocolError)?;
        let scheme = scheme.ok_or(ErrorType::ProtocolError)?;
        if path.is_empty() {
            return Err(ErrorType::ProtocolError);
        }
        let authority = authority.unwrap_or_default();
        if !authority.is_empty() && !headers.iter().any(|(name, _)| name == "host") {
            headers.push(("host".to_owned(), authority.clone()));
        }

        Ok(Self {
            method,
            path,
            scheme,
            authority,
            headers,
            user_agent,
            content_type,
            body,
        })
    }

    /// Header list for the wire (client side): pseudo-headers first, then
    /// regular names lowercased, connection-specific ones dropped.
    pub(crate) fn to_field_list(&self) -> Vec<(Bytes, Bytes)> {
        let mut fields = vec![
            (
                Bytes::from_static(b":method"),
                Bytes::from(self.method.to_string()),
            ),
            (
                Bytes::from_static(b":scheme"),
                Bytes::from(self.scheme.clone()),
            ),
            (Bytes::from_static(b":path"), Bytes::from(self.path.clone())),
            (
                Bytes::from_static(b":authority"),
                Bytes::from(self.authority.clone()),
            ),
        ];
        if let Some(user_agent) = &self.user_agent {
            fields.push((
                Bytes::from_static(b"user-agent"),
                Bytes::from(user_agent.clone()),
            ));
        }
        if let Some(content_type) = &self.content_type {
            fields.push((
                Bytes::from_static(b"content-type"),
                Bytes::from(content_type.clone()),
            ));
        }
        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            if matches!(
                name.as_str(),
                "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "host"
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
    fn pseudo_headers_map_to_fields() {
        let request = Request::from_fields(
            &[
                field(":method", "POST"),
                field(":scheme", "https"),
                field(":path", "/submit?draft=1"),
                field(":authority", "example.com:8443"),
                field("user-agent", "curl/7.79"),
                field("content-type", "text/plain"),
                field("x-trace", "abc"),
            ],
            Bytes::from_static(b"{}"),
        )
        .unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "/submit?draft=1");
        assert_eq!(request.authority, "example.com:8443");
        assert_eq!(request.user_agent.as_deref(), Some("curl/7.79"));
        assert_eq!(request.content_type.as_deref(), Some("text/plain"));
        assert_eq!(request.header("x-trace"), Some("abc"));
        // host is synthesized from :authority
        assert_eq!(request.header("host"), Some("example.com:8443"));
    }

    #[test]
    fn pseudo_after_regular_is_malformed() {
        let err = Request::from_fields(
            &[
                field(":method", "GET"),
                field(":scheme", "https"),
                field("x-early", "1"),
                field(":path", "/"),
            ],
            Bytes::new(),
        )
        .unwrap_err();
        assert_eq!(err, ErrorType::ProtocolError);
    }

    #[test]
    fn duplicate_pseudo_is_malformed() {
        assert!(Request::from_fields(
            &[
                field(":method", "GET"),
                field(":method", "POST"),
                field(":scheme", "https"),
                field(":path", "/"),
            ],
            Bytes::new(),
        )
        .is_err());
    }

    #[test]
    fn uppercase_header_name_is_malformed() {
        assert!(Request::from_fields(
            &[
                field(":method", "GET"),
                field(":scheme", "https"),
                field(":path", "/"),
                field("X-Bad", "1"),
            ],
            Bytes::new(),
        )
        .is_err());
    }

    #[test]
    fn connection_header_is_malformed() {
        assert!(Request::from_fields(
            &[
                field(":method", "GET"),
                field(":scheme", "https"),
                field(":path", "/"),
                field("connection", "close"),
            ],
            Bytes::new(),
        )
        .is_err());
    }

    #[test]
    fn field_list_puts_pseudo_headers_first() {
        let url = Url::parse("https://example.com/a?b=c").unwrap();
        let mut request = Request::get(&url);
        request.headers.push(("X-Mixed-Case".to_owned(), "v".to_owned()));
        let fields = request.to_field_list();
        assert_eq!(fields[0].0.as_ref(), b":method");
        assert_eq!(fields[0].1.as_ref(), b"GET");
        assert_eq!(fields[2].1.as_ref(), b"/a?b=c");
        assert_eq!(fields[3].1.as_ref(), b"example.com");
        assert!(fields.iter().any(|(name, _)| name.as_ref() == b"x-mixed-case"));
    }

    #[test]
    fn redirect_resolves_relative_location() {
        let url = Url::parse("https://example.com/old").unwrap();
        let request = Request::get(&url);
        let response = crate::response::Response::new(301)
            .with_header("location", "/new");
        let follow = request.redirect(&response).unwrap();
        assert_eq!(follow.path, "/new");
        assert_eq!(follow.authority, "example.com");
    }
}
