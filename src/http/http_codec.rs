use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::http::http_error::ProtocolError;
use crate::util::parse::parse_leading_int;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    /// path including the query string, e.g. `/wait?peer_id=3`
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: &str, path: impl Into<String>) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> HttpRequest {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>, content_type: &str, body: impl Into<Bytes>) -> HttpRequest {
        Self::new("POST", path)
            .with_body(content_type, body)
    }

    pub fn put(path: impl Into<String>) -> HttpRequest {
        Self::new("PUT", path)
            .with_header("Content-Length", "0")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> HttpRequest {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> HttpRequest {
        self.body = body.into();
        let content_length = self.body.len();
        self
            .with_header("Content-Length", content_length.to_string())
            .with_header("Content-Type", content_type)
    }

    pub fn body_text(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Turns requests into HTTP/1.0 wire format for one specific server.
#[derive(Clone, Debug)]
pub struct RequestEncoder {
    host_header: String,
    authorization: Option<String>,
    /// set when talking to the server through a plain HTTP proxy: request targets must then be in
    ///  absolute form (`http://host:port/path`)
    absolute_uri_prefix: Option<String>,
}

impl RequestEncoder {
    pub fn new(host_header: impl Into<String>) -> RequestEncoder {
        RequestEncoder {
            host_header: host_header.into(),
            authorization: None,
            absolute_uri_prefix: None,
        }
    }

    pub fn with_authorization(mut self, authorization: Option<String>) -> RequestEncoder {
        self.authorization = authorization;
        self
    }

    pub fn with_absolute_uri_prefix(mut self, prefix: Option<String>) -> RequestEncoder {
        self.absolute_uri_prefix = prefix;
        self
    }

    pub fn encode(&self, request: &HttpRequest, buf: &mut BytesMut) {
        let request_target = match &self.absolute_uri_prefix {
            Some(prefix) => Cow::Owned(format!("{}{}", prefix, request.path)),
            None => Cow::Borrowed(request.path.as_str()),
        };

        buf.put_slice(request.method.to_ascii_uppercase().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(request_target.as_bytes());
        buf.put_slice(b" HTTP/1.0\r\n");

        put_header(buf, "Host", &self.host_header);
        for (name, value) in &request.headers {
            put_header(buf, name, value);
        }
        if let Some(authorization) = &self.authorization {
            put_header(buf, "Authorization", authorization);
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&request.body);
    }
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// case-insensitive header lookup, returning the first match
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The signaling server puts peer ids into the `Pragma` header: the assigned id in the sign-in
    ///  response, the sender's id in long-poll responses.
    pub fn pragma_id(&self) -> Option<i32> {
        self.header("Pragma")
            .and_then(parse_leading_int)
    }

    pub fn body_text(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Attempts to parse one complete response from the start of `buf`.
///
/// Returns `Ok(None)` if more bytes are needed, and the response together with the number of
///  consumed bytes otherwise. Since this is HTTP/1.0, a response without `Content-Length` extends
///  to the end of the connection, so `eof` must be passed as `true` once the peer closed the
///  connection.
pub fn try_parse_response(buf: &[u8], eof: bool, max_size: usize) -> Result<Option<(HttpResponse, usize)>, ProtocolError> {
    let header_end = match find_header_terminator(buf) {
        Some(pos) => pos,
        None => {
            if eof {
                return Err(ProtocolError::Truncated);
            }
            if buf.len() > max_size {
                return Err(ProtocolError::ResponseTooLarge(max_size));
            }
            return Ok(None);
        }
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| ProtocolError::MalformedHeader(String::from_utf8_lossy(&buf[..header_end]).to_string()))?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let (status, reason) = parse_status_line(status_line)?;

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line.split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let content_length = match headers.iter().find(|(n, _)| n.eq_ignore_ascii_case("Content-Length")) {
        Some((_, v)) => Some(v.parse::<usize>()
            .map_err(|_| ProtocolError::InvalidContentLength(v.clone()))?),
        None => None,
    };

    let body_start = header_end + HEADER_TERMINATOR.len();
    let body_end = match content_length {
        Some(len) => {
            if body_start.saturating_add(len) > max_size {
                return Err(ProtocolError::ResponseTooLarge(max_size));
            }
            if buf.len() < body_start + len {
                if eof {
                    return Err(ProtocolError::Truncated);
                }
                return Ok(None);
            }
            body_start + len
        }
        None if has_no_body(status) => body_start,
        None => {
            if buf.len() > max_size {
                return Err(ProtocolError::ResponseTooLarge(max_size));
            }
            if !eof {
                return Ok(None);
            }
            buf.len()
        }
    };

    trace!("parsed response with status {} and {} body bytes", status, body_end - body_start);

    Ok(Some((
        HttpResponse {
            status,
            reason,
            headers,
            body: Bytes::copy_from_slice(&buf[body_start..body_end]),
        },
        body_end,
    )))
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

fn parse_status_line(line: &str) -> Result<(u16, String), ProtocolError> {
    let malformed = || ProtocolError::MalformedStatusLine(line.to_string());

    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with("HTTP/") {
        return Err(malformed());
    }

    let status = parts.next().ok_or_else(malformed)?;
    if status.len() != 3 {
        return Err(malformed());
    }
    let status = status.parse::<u16>().map_err(|_| malformed())?;

    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((status, reason))
}

/// statuses that never carry a body, regardless of headers
fn has_no_body(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    const MAX: usize = 1024 * 1024;

    fn encode(encoder: &RequestEncoder, request: &HttpRequest) -> String {
        let mut buf = BytesMut::new();
        encoder.encode(request, &mut buf);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_encode_get() {
        let encoder = RequestEncoder::new("localhost:8888");
        assert_eq!(
            encode(&encoder, &HttpRequest::get("/sign_in?peer_name=alice")),
            "GET /sign_in?peer_name=alice HTTP/1.0\r\nHost: localhost:8888\r\n\r\n",
        );
    }

    #[test]
    fn test_encode_post_with_authorization() {
        let encoder = RequestEncoder::new("example.com")
            .with_authorization(Some("Bearer abc".to_string()));
        let request = HttpRequest::post("/message?peer_id=3&to=2", "text/plain", "hello");
        assert_eq!(
            encode(&encoder, &request),
            "POST /message?peer_id=3&to=2 HTTP/1.0\r\nHost: example.com\r\nContent-Length: 5\r\nContent-Type: text/plain\r\nAuthorization: Bearer abc\r\n\r\nhello",
        );
    }

    #[test]
    fn test_encode_upper_cases_method_and_uses_proxy_form() {
        let encoder = RequestEncoder::new("example.com:80")
            .with_absolute_uri_prefix(Some("http://example.com:80".to_string()));
        let request = HttpRequest::new("put", "/capacity?peer_id=1&value=4");
        assert_eq!(
            encode(&encoder, &request),
            "PUT http://example.com:80/capacity?peer_id=1&value=4 HTTP/1.0\r\nHost: example.com:80\r\n\r\n",
        );
    }

    #[test]
    fn test_put_has_empty_body() {
        let request = HttpRequest::put("/capacity?peer_id=1&value=4");
        assert_eq!(request.method, "PUT");
        assert!(request.body.is_empty());
        assert_eq!(request.headers, vec![("Content-Length".to_string(), "0".to_string())]);
    }

    #[test]
    fn test_parse_complete_response() {
        let raw = b"HTTP/1.0 200 OK\r\nPragma: 3\r\ncontent-length: 17\r\n\r\nalice,1,1\nbob,2,1";
        let (response, consumed) = try_parse_response(raw, false, MAX).unwrap().unwrap();

        assert_eq!(consumed, raw.len());
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.header("Content-Length"), Some("17"));
        assert_eq!(response.header("PRAGMA"), Some("3"));
        assert_eq!(response.pragma_id(), Some(3));
        assert_eq!(response.body_text(), "alice,1,1\nbob,2,1");
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhiHTTP/1.1";
        let (response, consumed) = try_parse_response(raw, false, MAX).unwrap().unwrap();
        assert_eq!(response.body_text(), "hi");
        assert_eq!(consumed, raw.len() - "HTTP/1.1".len());
    }

    #[rstest]
    #[case::empty(b"", false)]
    #[case::partial_status(b"HTTP/1.0 20", false)]
    #[case::partial_headers(b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n", false)]
    #[case::partial_body(b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nabc", false)]
    #[case::body_until_close(b"HTTP/1.0 200 OK\r\n\r\nabc", false)]
    fn test_parse_incomplete(#[case] raw: &[u8], #[case] eof: bool) {
        assert_eq!(try_parse_response(raw, eof, MAX), Ok(None));
    }

    #[test]
    fn test_parse_body_until_close() {
        let raw = b"HTTP/1.0 200 OK\r\nPragma: 2\r\n\r\nBYE";
        let (response, consumed) = try_parse_response(raw, true, MAX).unwrap().unwrap();
        assert_eq!(response.body_text(), "BYE");
        assert_eq!(consumed, raw.len());
    }

    #[rstest]
    #[case::no_content(b"HTTP/1.0 204 No Content\r\n\r\n", 204)]
    #[case::not_modified(b"HTTP/1.0 304 Not Modified\r\n\r\n", 304)]
    fn test_parse_bodyless_status(#[case] raw: &[u8], #[case] expected_status: u16) {
        let (response, consumed) = try_parse_response(raw, false, MAX).unwrap().unwrap();
        assert_eq!(response.status, expected_status);
        assert!(response.body.is_empty());
        assert_eq!(consumed, raw.len());
    }

    #[rstest]
    #[case::closed_before_headers(b"HTTP/1.0 200 OK\r\n", ProtocolError::Truncated)]
    #[case::closed_without_response(b"", ProtocolError::Truncated)]
    #[case::closed_before_body(b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nab", ProtocolError::Truncated)]
    #[case::bad_version(b"FTP/1.0 200 OK\r\n\r\n", ProtocolError::MalformedStatusLine("FTP/1.0 200 OK".to_string()))]
    #[case::bad_status(b"HTTP/1.0 2x0 OK\r\n\r\n", ProtocolError::MalformedStatusLine("HTTP/1.0 2x0 OK".to_string()))]
    #[case::bad_header(b"HTTP/1.0 200 OK\r\nPragma 3\r\n\r\n", ProtocolError::MalformedHeader("Pragma 3".to_string()))]
    #[case::bad_content_length(b"HTTP/1.0 200 OK\r\nContent-Length: abc\r\n\r\n", ProtocolError::InvalidContentLength("abc".to_string()))]
    fn test_parse_errors(#[case] raw: &[u8], #[case] expected: ProtocolError) {
        assert_eq!(try_parse_response(raw, true, MAX), Err(expected));
    }

    #[test]
    fn test_parse_too_large() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 100\r\n\r\n";
        assert_eq!(try_parse_response(raw, false, 64), Err(ProtocolError::ResponseTooLarge(64)));
    }

    #[rstest]
    #[case::missing(None, None)]
    #[case::number(Some("12"), Some(12))]
    #[case::garbage(Some("no-cache"), None)]
    fn test_pragma_id(#[case] pragma: Option<&str>, #[case] expected: Option<i32>) {
        let response = HttpResponse {
            status: 200,
            reason: "OK".to_string(),
            headers: pragma.into_iter().map(|p| ("Pragma".to_string(), p.to_string())).collect(),
            body: Bytes::new(),
        };
        assert_eq!(response.pragma_id(), expected);
    }
}
