use hashbrown::HashMap;
use serde_json::Value;

/// The six request methods the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn parse(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn parse(token: &str) -> Option<Version> {
        match token {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// One parsed request. Header keys are stored lower-cased; the attribute
/// bag carries values from middleware to handlers (an authenticated
/// principal, a request id, ...).
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub raw_uri: String,
    pub version: Version,
    headers: HashMap<String, String>,
    query_params: HashMap<String, String>,
    pub body: Vec<u8>,
    attributes: HashMap<String, Value>,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            path: "/".to_string(),
            raw_uri: "/".to_string(),
            version: Version::Http11,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        method: Method,
        path: String,
        raw_uri: String,
        version: Version,
        headers: HashMap<String, String>,
        query_params: HashMap<String, String>,
        body: Vec<u8>,
    ) -> HttpRequest {
        HttpRequest {
            method,
            path,
            raw_uri,
            version,
            headers,
            query_params,
            body,
            attributes: HashMap::new(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|v| v.as_str())
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    pub fn set_attribute<K: Into<String>>(&mut self, key: K, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Keep-alive negotiation: an explicit Connection header wins,
    /// otherwise the protocol default applies.
    pub fn wants_keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == Version::Http11,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with_header(version: Version, header: Option<(&str, &str)>) -> HttpRequest {
        let mut headers = HashMap::new();
        if let Some((name, value)) = header {
            headers.insert(name.to_string(), value.to_string());
        }
        HttpRequest::from_parts(
            Method::Get,
            "/".into(),
            "/".into(),
            version,
            headers,
            HashMap::new(),
            Vec::new(),
        )
    }

    #[test]
    fn test_method_tokens() {
        assert_eq!(Method::parse("GET"), Some(Method::Get));
        assert_eq!(Method::parse("OPTIONS"), Some(Method::Options));
        assert_eq!(Method::parse("get"), None);
        assert_eq!(Method::parse("PATCH"), None);
        assert_eq!(Method::Delete.as_str(), "DELETE");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = request_with_header(Version::Http11, Some(("host", "example.com")));

        assert_eq!(request.header("Host"), Some("example.com"));
        assert_eq!(request.header("HOST"), Some("example.com"));
        assert_eq!(request.header("missing"), None);
    }

    #[test]
    fn test_keep_alive_matrix() {
        assert!(request_with_header(Version::Http11, None).wants_keep_alive());
        assert!(!request_with_header(Version::Http10, None).wants_keep_alive());
        assert!(!request_with_header(Version::Http11, Some(("connection", "close"))).wants_keep_alive());
        assert!(request_with_header(Version::Http10, Some(("connection", "keep-alive"))).wants_keep_alive());
        assert!(!request_with_header(Version::Http10, Some(("connection", "Close"))).wants_keep_alive());
    }

    #[test]
    fn test_attribute_bag() {
        let mut request = request_with_header(Version::Http11, None);

        request.set_attribute("principal", json!({"subject": "alice"}));

        let principal = request.attribute("principal").unwrap();
        assert_eq!(principal["subject"], "alice");
        assert!(request.attribute("absent").is_none());
    }
}
