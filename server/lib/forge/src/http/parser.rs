use crate::http::request::{HttpRequest, Method, Version};
use hashbrown::HashMap;

/// Result of feeding bytes to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are required; the caller keeps the unconsumed tail and
    /// presents it again on the next call.
    NeedMore,
    /// One full request has been parsed.
    Complete,
    /// The request is malformed; `last_error` describes why.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    FixedBody,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    ChunkTrailer,
    Complete,
    Error,
}

/// Incremental parser for a single HTTP/1.0 or HTTP/1.1 request. Bytes may
/// arrive in arbitrary fragments; parsing picks up exactly where the last
/// call stopped.
pub struct HttpParser {
    state: ParseState,
    method: Method,
    raw_uri: String,
    path: String,
    version: Version,
    headers: HashMap<String, String>,
    query_params: HashMap<String, String>,
    body: Vec<u8>,
    content_length: usize,
    has_content_length: bool,
    chunked: bool,
    chunk_remaining: usize,
    last_error: String,
}

impl HttpParser {
    pub fn new() -> HttpParser {
        HttpParser {
            state: ParseState::RequestLine,
            method: Method::Get,
            raw_uri: String::new(),
            path: String::new(),
            version: Version::Http11,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: Vec::new(),
            content_length: 0,
            has_content_length: false,
            chunked: false,
            chunk_remaining: 0,
            last_error: String::new(),
        }
    }

    /// Returns the parser to its initial state. Buffers owned by the caller
    /// are untouched and the backing allocations are kept.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = Method::Get;
        self.raw_uri.clear();
        self.path.clear();
        self.version = Version::Http11;
        self.headers.clear();
        self.query_params.clear();
        self.body.clear();
        self.content_length = 0;
        self.has_content_length = false;
        self.chunked = false;
        self.chunk_remaining = 0;
        self.last_error.clear();
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    #[inline]
    pub fn has_error(&self) -> bool {
        self.state == ParseState::Error
    }

    #[inline]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Keep-alive negotiation for the parsed request: an explicit
    /// Connection header wins, otherwise HTTP/1.1 defaults to keep-alive
    /// and HTTP/1.0 to close.
    pub fn wants_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == Version::Http11,
        }
    }

    /// Moves the parsed fields out into a request record. Only meaningful
    /// once `is_complete` holds; the parser is left to be `reset`.
    pub fn take_request(&mut self) -> HttpRequest {
        HttpRequest::from_parts(
            self.method,
            std::mem::take(&mut self.path),
            std::mem::take(&mut self.raw_uri),
            self.version,
            std::mem::take(&mut self.headers),
            std::mem::take(&mut self.query_params),
            std::mem::take(&mut self.body),
        )
    }

    /// Feeds a fragment to the parser. Returns how many bytes were consumed
    /// and the resulting status.
    pub fn parse(&mut self, data: &[u8]) -> (usize, ParseStatus) {
        let mut consumed = 0;

        loop {
            match self.state {
                ParseState::RequestLine => match find_crlf(&data[consumed..]) {
                    Some(line_len) => {
                        let line = &data[consumed..consumed + line_len];
                        consumed += line_len + 2;
                        if let Err(reason) = self.parse_request_line(line) {
                            return (consumed, self.fail(reason));
                        }
                        self.state = ParseState::Headers;
                    }
                    None => return (consumed, ParseStatus::NeedMore),
                },

                ParseState::Headers => match find_crlf(&data[consumed..]) {
                    Some(0) => {
                        consumed += 2;
                        if let Err(reason) = self.finish_headers() {
                            return (consumed, self.fail(reason));
                        }
                        if self.state == ParseState::Complete {
                            return (consumed, ParseStatus::Complete);
                        }
                    }
                    Some(line_len) => {
                        let line = &data[consumed..consumed + line_len];
                        consumed += line_len + 2;
                        if let Err(reason) = self.parse_header_line(line) {
                            return (consumed, self.fail(reason));
                        }
                    }
                    None => return (consumed, ParseStatus::NeedMore),
                },

                ParseState::FixedBody => {
                    let needed = self.content_length - self.body.len();
                    let available = data.len() - consumed;
                    let take = needed.min(available);
                    self.body.extend_from_slice(&data[consumed..consumed + take]);
                    consumed += take;
                    if self.body.len() == self.content_length {
                        self.state = ParseState::Complete;
                        return (consumed, ParseStatus::Complete);
                    }
                    return (consumed, ParseStatus::NeedMore);
                }

                ParseState::ChunkSize => match find_crlf(&data[consumed..]) {
                    Some(line_len) => {
                        let line = &data[consumed..consumed + line_len];
                        consumed += line_len + 2;
                        match parse_chunk_size(line) {
                            Ok(0) => self.state = ParseState::ChunkTrailer,
                            Ok(size) => {
                                self.chunk_remaining = size;
                                self.state = ParseState::ChunkData;
                            }
                            Err(reason) => return (consumed, self.fail(reason)),
                        }
                    }
                    None => return (consumed, ParseStatus::NeedMore),
                },

                ParseState::ChunkData => {
                    let available = data.len() - consumed;
                    let take = self.chunk_remaining.min(available);
                    self.body.extend_from_slice(&data[consumed..consumed + take]);
                    consumed += take;
                    self.chunk_remaining -= take;
                    if self.chunk_remaining == 0 {
                        self.state = ParseState::ChunkDataEnd;
                    } else {
                        return (consumed, ParseStatus::NeedMore);
                    }
                }

                ParseState::ChunkDataEnd => {
                    if data.len() - consumed < 2 {
                        return (consumed, ParseStatus::NeedMore);
                    }
                    if &data[consumed..consumed + 2] != b"\r\n" {
                        consumed += 2;
                        return (consumed, self.fail("chunk data not terminated by CRLF"));
                    }
                    consumed += 2;
                    self.state = ParseState::ChunkSize;
                }

                // Trailer headers are ignored; an empty line ends the request.
                ParseState::ChunkTrailer => match find_crlf(&data[consumed..]) {
                    Some(0) => {
                        consumed += 2;
                        self.state = ParseState::Complete;
                        return (consumed, ParseStatus::Complete);
                    }
                    Some(line_len) => {
                        consumed += line_len + 2;
                    }
                    None => return (consumed, ParseStatus::NeedMore),
                },

                ParseState::Complete => return (consumed, ParseStatus::Complete),
                ParseState::Error => return (consumed, ParseStatus::Error),
            }
        }
    }

    fn fail(&mut self, reason: &str) -> ParseStatus {
        self.state = ParseState::Error;
        self.last_error = reason.to_string();
        ParseStatus::Error
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), &'static str> {
        let line = std::str::from_utf8(line).map_err(|_| "request line is not valid ascii")?;
        let mut words = line.split(' ');

        let method = words.next().unwrap_or("");
        let uri = words.next().unwrap_or("");
        let version = words.next().unwrap_or("");
        if words.next().is_some() {
            return Err("malformed request line");
        }

        self.method = Method::parse(method).ok_or("unrecognised method")?;
        self.version = Version::parse(version).ok_or("unsupported HTTP version")?;

        if uri.is_empty() {
            return Err("empty request URI");
        }
        self.raw_uri = uri.to_string();

        let (path, query) = match uri.find('?') {
            Some(pos) => (&uri[..pos], Some(&uri[pos + 1..])),
            None => (uri, None),
        };
        self.path = percent_decode(path);
        if self.path.is_empty() {
            return Err("empty request path");
        }
        if let Some(query) = query {
            parse_query_string(query, &mut self.query_params);
        }
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), &'static str> {
        let line = std::str::from_utf8(line).map_err(|_| "header line is not valid ascii")?;
        let colon = line.find(':').ok_or("header line without a colon")?;

        let name = line[..colon].trim_end().to_ascii_lowercase();
        if name.is_empty() {
            return Err("empty header name");
        }
        let value = line[colon + 1..]
            .trim_start_matches(|c| c == ' ' || c == '\t')
            .to_string();

        if name == "content-length" {
            self.content_length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| "invalid Content-Length value")?;
            self.has_content_length = true;
        }

        // Duplicate names overwrite.
        self.headers.insert(name, value);
        Ok(())
    }

    fn finish_headers(&mut self) -> Result<(), &'static str> {
        if let Some(te) = self.headers.get("transfer-encoding") {
            if te.eq_ignore_ascii_case("chunked") {
                self.chunked = true;
            }
        }
        if self.chunked && self.has_content_length {
            return Err("both Transfer-Encoding and Content-Length present");
        }
        if self.version == Version::Http11 && !self.headers.contains_key("host") {
            return Err("missing Host header in HTTP/1.1 request");
        }

        self.state = if self.chunked {
            ParseState::ChunkSize
        } else if self.has_content_length && self.content_length > 0 {
            ParseState::FixedBody
        } else {
            ParseState::Complete
        };
        Ok(())
    }
}

/// Index of the first CRLF, as the length of the line before it.
#[inline]
fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, &'static str> {
    let line = std::str::from_utf8(line).map_err(|_| "invalid chunk size line")?;
    // Chunk extensions after ';' are ignored.
    let size = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size, 16).map_err(|_| "invalid chunk size")
}

/// Decodes %HH escapes; malformed escapes pass through verbatim.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let high = hex_value(bytes[index + 1]);
            let low = hex_value(bytes[index + 2]);
            if let (Some(high), Some(low)) = (high, low) {
                out.push(high * 16 + low);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[inline]
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn parse_query_string(query: &str, params: &mut HashMap<String, String>) {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.find('=') {
            Some(pos) => (&pair[..pos], &pair[pos + 1..]),
            None => (pair, ""),
        };
        if key.is_empty() {
            continue;
        }
        params.insert(percent_decode(key), percent_decode(value));
    }
}
