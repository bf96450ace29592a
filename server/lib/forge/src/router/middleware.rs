use crate::http::request::{HttpRequest, Method};
use crate::http::response::HttpResponse;
use serde_json::json;

/// A link in the dispatch chain. Returning false short-circuits: the
/// response as left by the middleware is sent and the handler never runs.
/// Middleware may stash values for the handler in the request's attribute
/// bag.
pub trait Middleware: Send + Sync {
    fn handle(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> bool;
}

/// Cross-origin headers for the `/api/` surface, answering OPTIONS
/// preflight directly with 204.
pub struct CorsMiddleware {
    allow_origin: String,
    allow_methods: String,
    allow_headers: String,
}

impl CorsMiddleware {
    pub fn new() -> CorsMiddleware {
        CorsMiddleware::with_origin("*")
    }

    pub fn with_origin(allow_origin: &str) -> CorsMiddleware {
        CorsMiddleware {
            allow_origin: allow_origin.to_string(),
            allow_methods: "GET, POST, PUT, DELETE, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization".to_string(),
        }
    }

    fn needs_cors(path: &str) -> bool {
        path.starts_with("/api/")
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> bool {
        if !Self::needs_cors(&request.path) {
            return true;
        }

        response.set_header("Access-Control-Allow-Origin", &self.allow_origin);
        response.set_header("Access-Control-Allow-Methods", &self.allow_methods);
        response.set_header("Access-Control-Allow-Headers", &self.allow_headers);
        response.set_header("Access-Control-Allow-Credentials", "true");

        if request.method == Method::Options {
            // Preflight: cache for a day and stop the chain.
            response.set_header("Access-Control-Max-Age", "86400");
            response.set_status(204, "");
            return false;
        }

        true
    }
}

/// Bearer-token check: the extension point for real authentication.
/// Validates a shared secret and records the principal in the request's
/// attribute bag; paths on the allowlist pass through untouched.
pub struct AuthMiddleware {
    header_name: String,
    token: String,
    public_paths: Vec<String>,
}

impl AuthMiddleware {
    pub fn new(token: &str) -> AuthMiddleware {
        AuthMiddleware {
            header_name: "Authorization".to_string(),
            token: token.to_string(),
            public_paths: Vec::new(),
        }
    }

    pub fn allow_path(mut self, path: &str) -> AuthMiddleware {
        self.public_paths.push(path.to_string());
        self
    }

    fn is_public(&self, path: &str) -> bool {
        self.public_paths
            .iter()
            .any(|public| path.starts_with(public.as_str()))
    }

    fn unauthorized(response: &mut HttpResponse, message: &str) {
        response.set_status(401, "");
        response.json(
            json!({
                "success": false,
                "code": 401,
                "message": message,
                "data": null
            })
            .to_string(),
        );
    }
}

impl Middleware for AuthMiddleware {
    fn handle(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> bool {
        if self.is_public(&request.path) {
            return true;
        }

        let header = match request.header(&self.header_name) {
            Some(value) => value.to_string(),
            None => {
                Self::unauthorized(response, "Authentication required");
                return false;
            }
        };

        let token = match header.strip_prefix("Bearer ") {
            Some(token) => token,
            None => {
                Self::unauthorized(response, "Invalid token format");
                return false;
            }
        };

        if token != self.token {
            Self::unauthorized(response, "Invalid token");
            return false;
        }

        request.set_attribute("principal", json!({ "subject": "token-bearer" }));
        true
    }
}
