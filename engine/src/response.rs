use std::time::Duration;

use bytes::Bytes;

/// Six non-negative phase durations. Zero means "not applicable or not
/// measured" rather than an actual zero-length phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    pub dns_lookup: Duration,
    pub proxy_connect: Duration,
    pub tcp_connect: Duration,
    pub tls_handshake: Duration,
    pub ttfb: Duration,
    pub total: Duration,
}

/// Insertion-ordered, case-insensitive-lookup multimap of header names to
/// values. Original casing is preserved as stored; a lowercase index is kept
/// only for lookup.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every existing value for `name` (case-insensitive) with a
    /// single new value, preserving the position of the first match.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let lower = name.to_ascii_lowercase();
        let mut replaced = false;
        self.entries.retain_mut(|(n, v)| {
            if n.to_ascii_lowercase() == lower {
                if !replaced {
                    *v = value.clone();
                    replaced = true;
                    true
                } else {
                    false
                }
            } else {
                true
            }
        });
        if !replaced {
            self.entries.push((name, value));
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| n.to_ascii_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_headers(&self, name: &str) -> Vec<&str> {
        let lower = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(n, _)| n.to_ascii_lowercase() == lower)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Owned result of a single exchange. `raw` is the exact bytes received from
/// the wire and is never mutated after capture; the remaining fields are
/// best-effort projections over `raw` — a projection failure leaves `raw`
/// intact and the corresponding field empty/default.
#[derive(Debug, Clone)]
pub struct Response {
    pub raw: Bytes,
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timing: Timing,
    pub connected_ip: std::net::IpAddr,
    pub connected_port: u16,
    pub protocol: String,
}

impl Response {
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code)
    }
}

/// Parses `status_code`, `headers`, and `body` out of a raw response buffer.
/// Never fails: malformed input simply yields zero/empty projections, since
/// `raw` remains the source of truth regardless.
pub fn project(raw: &[u8]) -> (u16, HeaderMap, Bytes) {
    let status_code = parse_status_code(raw);
    let headers = parse_headers(raw);
    let body = extract_body(raw);
    (status_code, headers, body)
}

fn parse_status_code(raw: &[u8]) -> u16 {
    let first_line_end = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
    let first_line = &raw[..first_line_end];
    let Ok(line) = std::str::from_utf8(first_line) else {
        return 0;
    };
    line.split_whitespace()
        .nth(1)
        .and_then(|tok| tok.parse::<u16>().ok())
        .unwrap_or(0)
}

fn parse_headers(raw: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut lines = raw.split(|&b| b == b'\n');
    // Skip the status line.
    lines.next();
    for line in lines {
        let trimmed = trim_crlf(line);
        if trimmed.is_empty() {
            break;
        }
        let Ok(text) = std::str::from_utf8(trimmed) else {
            continue;
        };
        if let Some((name, value)) = text.split_once(':') {
            headers.add_header(name.trim(), value.trim());
        }
    }
    headers
}

fn extract_body(raw: &[u8]) -> Bytes {
    if let Some(pos) = find_subslice(raw, b"\r\n\r\n") {
        return Bytes::copy_from_slice(&raw[pos + 4..]);
    }
    if let Some(pos) = find_subslice(raw, b"\n\n") {
        return Bytes::copy_from_slice(&raw[pos + 2..]);
    }
    Bytes::new()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_status_headers_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\nHello, World!";
        let (status, headers, body) = project(raw);
        assert_eq!(status, 200);
        assert_eq!(headers.get_header("content-type"), Some("text/plain"));
        assert_eq!(headers.get_header("Content-Length"), Some("13"));
        assert_eq!(&body[..], b"Hello, World!");
    }

    #[test]
    fn header_lookup_is_case_insensitive_but_preserves_original_casing() {
        let mut headers = HeaderMap::new();
        headers.add_header("X-Custom-Header", "one");
        headers.add_header("x-custom-header", "two");
        assert_eq!(headers.get_header("X-CUSTOM-HEADER"), Some("one"));
        assert_eq!(headers.get_headers("x-custom-header"), vec!["one", "two"]);
        let stored: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(stored, vec!["X-Custom-Header", "x-custom-header"]);
    }

    #[test]
    fn set_header_replaces_all_prior_values() {
        let mut headers = HeaderMap::new();
        headers.add_header("A", "1");
        headers.add_header("a", "2");
        headers.set_header("a", "3");
        assert_eq!(headers.get_headers("a"), vec!["3"]);
    }

    #[test]
    fn malformed_status_line_yields_zero_not_error() {
        let (status, _, _) = project(b"not a status line\r\n\r\nbody");
        assert_eq!(status, 0);
    }

    #[test]
    fn status_predicates() {
        let mut resp = make_response(200);
        assert!(resp.is_successful());
        resp.status_code = 301;
        assert!(resp.is_redirect());
        resp.status_code = 404;
        assert!(resp.is_client_error());
        resp.status_code = 503;
        assert!(resp.is_server_error());
    }

    fn make_response(status_code: u16) -> Response {
        Response {
            raw: Bytes::new(),
            status_code,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timing: Timing::default(),
            connected_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            connected_port: 0,
            protocol: "HTTP/1.1".into(),
        }
    }
}
