use hashbrown::HashMap;

/// An outgoing response under construction. `Content-Length` follows the
/// body automatically; `serialize` produces the full wire form.
#[derive(Debug)]
pub struct HttpResponse {
    status: u16,
    reason: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse {
            status: 200,
            reason: "OK".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Sets the status code; an empty reason picks the default phrase.
    pub fn set_status(&mut self, code: u16, reason: &str) -> &mut HttpResponse {
        self.status = code;
        self.reason = if reason.is_empty() {
            status_text(code).to_string()
        } else {
            reason.to_string()
        };
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> &mut HttpResponse {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn set_body(&mut self, body: Vec<u8>) -> &mut HttpResponse {
        if !body.is_empty() {
            self.headers
                .insert("Content-Length".to_string(), body.len().to_string());
        }
        self.body = body;
        self
    }

    pub fn set_content_type(&mut self, content_type: &str) -> &mut HttpResponse {
        self.set_header("Content-Type", content_type)
    }

    pub fn json(&mut self, body: String) -> &mut HttpResponse {
        self.set_content_type("application/json");
        self.set_body(body.into_bytes())
    }

    pub fn text(&mut self, body: &str) -> &mut HttpResponse {
        self.set_content_type("text/plain");
        self.set_body(body.as_bytes().to_vec())
    }

    pub fn html(&mut self, body: &str) -> &mut HttpResponse {
        self.set_content_type("text/html");
        self.set_body(body.as_bytes().to_vec())
    }

    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn clear(&mut self) {
        self.status = 200;
        self.reason = "OK".to_string();
        self.headers.clear();
        self.body.clear();
    }

    /// `HTTP/1.1 <code> <reason>CRLF (<k>: <v>CRLF)* CRLF <body>`
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() && !self.headers.contains_key("Content-Length") {
            out.extend_from_slice(b"Content-Length: ");
            out.extend_from_slice(self.body.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Default reason phrase for a status code.
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal response parser for the round-trip property.
    fn parse_response(raw: &[u8]) -> (u16, String, HashMap<String, String>, Vec<u8>) {
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator");
        let head = std::str::from_utf8(&raw[..split]).unwrap();
        let body = raw[split + 4..].to_vec();

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        let mut words = status_line.splitn(3, ' ');
        assert_eq!(words.next(), Some("HTTP/1.1"));
        let code: u16 = words.next().unwrap().parse().unwrap();
        let reason = words.next().unwrap_or("").to_string();

        let mut headers = HashMap::new();
        for line in lines {
            let colon = line.find(':').unwrap();
            headers.insert(
                line[..colon].to_string(),
                line[colon + 1..].trim_start().to_string(),
            );
        }
        (code, reason, headers, body)
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut response = HttpResponse::new();
        response.set_status(201, "");
        response.set_header("X-Request-Id", "42");
        response.json("{\"ok\":true}".to_string());

        let (code, reason, headers, body) = parse_response(&response.serialize());

        assert_eq!(code, 201);
        assert_eq!(reason, "Created");
        assert_eq!(headers.get("X-Request-Id").unwrap(), "42");
        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
        assert_eq!(headers.get("Content-Length").unwrap(), "11");
        assert_eq!(body, b"{\"ok\":true}");
    }

    #[test]
    fn test_content_length_matches_body_exactly() {
        let mut response = HttpResponse::new();
        response.text("hello world");

        let (_, _, headers, body) = parse_response(&response.serialize());

        assert_eq!(
            headers.get("Content-Length").unwrap().parse::<usize>().unwrap(),
            body.len()
        );
    }

    #[test]
    fn test_empty_body_has_no_content_length() {
        let mut response = HttpResponse::new();
        response.set_status(204, "");

        let (code, _, headers, body) = parse_response(&response.serialize());

        assert_eq!(code, 204);
        assert!(body.is_empty());
        assert!(!headers.contains_key("Content-Length"));
    }

    #[test]
    fn test_default_reason_phrases() {
        assert_eq!(status_text(404), "Not Found");
        assert_eq!(status_text(408), "Request Timeout");
        assert_eq!(status_text(500), "Internal Server Error");
        assert_eq!(status_text(999), "Unknown");
    }

    #[test]
    fn test_clear_restores_defaults() {
        let mut response = HttpResponse::new();
        response.set_status(500, "").text("boom");

        response.clear();

        assert_eq!(response.status(), 200);
        assert_eq!(response.reason(), "OK");
        assert!(response.body().is_empty());
        assert!(response.header("Content-Type").is_none());
    }
}
