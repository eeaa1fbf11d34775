//! Request-head parsing and route classification.
//!
//! A freshly accepted connection is classified from its request head alone.
//! Only `GET` is understood and only a fixed set of paths is served, so the
//! parser extracts just what routing needs: the method, the path with its
//! query string split off, and the header lines.

use lota_core::Asset;
use thiserror::Error;

/// Errors that can occur while parsing a request head.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// No request line was received.
    #[error("Empty request")]
    Empty,

    /// The head is not valid UTF-8.
    #[error("Request head is not valid UTF-8")]
    Encoding,

    /// The request line does not have the `METHOD TARGET [VERSION]` shape.
    #[error("Malformed request line: {0}")]
    RequestLine(String),
}

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Other(String),
}

impl Method {
    fn parse(token: &str) -> Self {
        if token == "GET" {
            Method::Get
        } else {
            Method::Other(token.to_string())
        }
    }
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Raw request target, query included.
    pub target: String,
    /// Target with the query string removed.
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a request head from the start of `buf`.
    ///
    /// Bytes after the blank line ending the head are ignored, as is a
    /// trailing incomplete header line when the head was cut short.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let end = head_end(buf).unwrap_or(buf.len());
        let text = std::str::from_utf8(&buf[..end]).map_err(|_| ParseError::Encoding)?;

        let mut lines = text.lines();
        let request_line = lines.next().map(str::trim).unwrap_or_default();
        if request_line.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(method), Some(target)) if target.starts_with('/') => (method, target),
            _ => return Err(ParseError::RequestLine(request_line.to_string())),
        };
        let version = parts.next().unwrap_or("HTTP/1.0").to_string();

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };

        let headers = lines
            .take_while(|line| !line.trim().is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        Ok(Self {
            method: Method::parse(method),
            target: target.to_string(),
            path,
            query,
            version,
            headers,
        })
    }

    /// Value of the first header named `name`, compared case-insensitively.
    /// An empty value counts as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    }

    /// Whether the request asks to switch to the WebSocket protocol.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("Upgrade").is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        })
    }

    /// Value of query parameter `key`. An empty value counts as absent.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value)
            .filter(|value| !value.is_empty())
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Whether `buf` holds a complete request head.
pub fn is_head_complete(buf: &[u8]) -> bool {
    head_end(buf).is_some()
}

/// Where a request is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Root document.
    StaticRoot,
    /// WebSocket handshake on the root path.
    Upgrade,
    /// One of the other dashboard files.
    StaticAsset(Asset),
    /// Any other `GET`.
    NotFound,
    /// Not a request the relay answers; close without a response.
    Unknown,
}

impl Route {
    /// Whether the connection outlives the response.
    pub fn keeps_connection(self) -> bool {
        matches!(self, Route::Upgrade)
    }
}

/// Route for a request. First match wins:
///
/// 1. non-`GET` is [`Route::Unknown`]
/// 2. `/` with an upgrade header is [`Route::Upgrade`]
/// 3. `/` is [`Route::StaticRoot`]
/// 4. a dashboard file path is [`Route::StaticAsset`]
/// 5. anything else is [`Route::NotFound`]
pub fn route_for(method: &Method, path: &str, upgrade: bool) -> Route {
    if *method != Method::Get {
        return Route::Unknown;
    }
    match Asset::from_request_path(path) {
        Some(Asset::Index) if upgrade => Route::Upgrade,
        Some(Asset::Index) => Route::StaticRoot,
        Some(asset) => Route::StaticAsset(asset),
        None => Route::NotFound,
    }
}

/// Route for a parsed request head.
pub fn classify(head: &RequestHead) -> Route {
    route_for(&head.method, &head.path, head.is_websocket_upgrade())
}

/// Route for raw bytes. Anything unparseable is [`Route::Unknown`].
pub fn classify_bytes(buf: &[u8]) -> Route {
    RequestHead::parse(buf)
        .map(|head| classify(&head))
        .unwrap_or(Route::Unknown)
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    ServiceUnavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotFound => 404,
            Status::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "Not Found",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// Status line and headers of a response whose body is `content_length`
/// bytes. The connection is always closed after the body.
pub fn response_head(status: Status, content_type: &str, content_length: usize) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.code(),
        status.reason(),
        content_type,
        content_length
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const UPGRADE: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: 192.168.4.1\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_parse_request_line() {
        let head = RequestHead::parse(b"GET /script.js?v=2 HTTP/1.1\r\nHost: lota\r\n\r\n").unwrap();

        assert_eq!(head.method, Method::Get);
        assert_eq!(head.target, "/script.js?v=2");
        assert_eq!(head.path, "/script.js");
        assert_eq!(head.query.as_deref(), Some("v=2"));
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("lota"));
    }

    #[test]
    fn test_parse_bare_lf_and_missing_version() {
        let head = RequestHead::parse(b"GET /\nUpgrade: WebSocket\n\n").unwrap();

        assert_eq!(head.version, "HTTP/1.0");
        assert!(head.is_websocket_upgrade());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(RequestHead::parse(b""), Err(ParseError::Empty));
        assert_eq!(RequestHead::parse(b"\r\n\r\n"), Err(ParseError::Empty));
        assert_eq!(RequestHead::parse(&[0xff, 0xfe, b' ']), Err(ParseError::Encoding));
        assert!(matches!(
            RequestHead::parse(b"GET\r\n\r\n"),
            Err(ParseError::RequestLine(_))
        ));
        assert!(matches!(
            RequestHead::parse(b"GET index.html HTTP/1.1\r\n\r\n"),
            Err(ParseError::RequestLine(_))
        ));
    }

    #[test]
    fn test_empty_header_is_absent() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nUpgrade:\r\nHost:  \r\n\r\n").unwrap();

        assert_eq!(head.header("Upgrade"), None);
        assert_eq!(head.header("Host"), None);
        assert!(!head.is_websocket_upgrade());
    }

    #[test]
    fn test_query_params() {
        let head = RequestHead::parse(b"GET /?query1=a&query2=&query3 HTTP/1.1\r\n\r\n").unwrap();

        assert_eq!(head.query_param("query1"), Some("a"));
        assert_eq!(head.query_param("query2"), None);
        assert_eq!(head.query_param("query3"), None);
        assert_eq!(head.query_param("missing"), None);
        assert_eq!(classify(&head), Route::StaticRoot);
    }

    #[test]
    fn test_head_completion() {
        assert!(!is_head_complete(b"GET / HTTP/1.1\r\nHost: x\r\n"));
        assert!(is_head_complete(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(is_head_complete(b"GET /\n\n"));
    }

    #[test]
    fn test_routing_table() {
        let get = Method::Get;
        assert_eq!(route_for(&get, "/", false), Route::StaticRoot);
        assert_eq!(route_for(&get, "/", true), Route::Upgrade);
        assert_eq!(
            route_for(&get, "/script.js", false),
            Route::StaticAsset(Asset::Script)
        );
        assert_eq!(
            route_for(&get, "/style.css", true),
            Route::StaticAsset(Asset::Style)
        );
        assert_eq!(
            route_for(&get, "/favicon.ico", false),
            Route::StaticAsset(Asset::Favicon)
        );
        assert_eq!(route_for(&get, "/unknown", false), Route::NotFound);
        assert_eq!(route_for(&get, "/SCRIPT.JS", false), Route::NotFound);

        let post = Method::Other("POST".to_string());
        assert_eq!(route_for(&post, "/", false), Route::Unknown);
        assert_eq!(route_for(&post, "/", true), Route::Unknown);
    }

    #[test]
    fn test_classify_bytes() {
        assert_eq!(classify_bytes(UPGRADE), Route::Upgrade);
        assert_eq!(classify_bytes(b"GET / HTTP/1.1\r\n\r\n"), Route::StaticRoot);
        assert_eq!(classify_bytes(b"GET /unknown HTTP/1.1\r\n\r\n"), Route::NotFound);
        assert_eq!(classify_bytes(b""), Route::Unknown);
        assert_eq!(classify_bytes(b"garbage"), Route::Unknown);
        assert!(Route::Upgrade.keeps_connection());
        assert!(!Route::NotFound.keeps_connection());
    }

    #[test]
    fn test_response_head() {
        let head = response_head(Status::NotFound, "text/html", 12);

        assert_eq!(
            head,
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\nContent-Length: 12\r\nConnection: close\r\n\r\n"
        );
    }
}
