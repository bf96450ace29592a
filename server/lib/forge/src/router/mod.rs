pub mod middleware;

use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::router::middleware::Middleware;
use ember::logging::{self, Logger};
use hashbrown::HashMap;
use regex::Regex;
use serde_json::json;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

/// Parameters captured from `:name` pattern segments, assigned verbatim.
pub type RouteParams = HashMap<String, String>;

/// A registered handler: request, response under construction, captured
/// path parameters.
pub type Handler = dyn Fn(&HttpRequest, &mut HttpResponse, &RouteParams) + Send + Sync;

struct Route {
    method: String,
    pattern: String,
    regex: Regex,
    param_names: Vec<String>,
    middlewares: Vec<Arc<dyn Middleware>>,
    handler: Arc<Handler>,
}

struct RouterInner {
    routes: Vec<Route>,
    global_middlewares: Vec<Arc<dyn Middleware>>,
}

/// Method+path dispatch over an ordered route table. The table sits behind
/// an RwLock so routes can be hot-replaced while requests are in flight.
pub struct Router {
    inner: RwLock<RouterInner>,
    log: Logger,
}

impl Router {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Router {
        let router_log = match log.into() {
            Some(log) => log.new(logging::o!("subsystem" => "router")),
            None => logging::discard(),
        };

        Router {
            inner: RwLock::new(RouterInner {
                routes: Vec::new(),
                global_middlewares: Vec::new(),
            }),
            log: router_log,
        }
    }

    /// Registers a route. `:name` segments capture one path segment each.
    pub fn add_route<F>(&self, method: &str, pattern: &str, handler: F)
    where
        F: Fn(&HttpRequest, &mut HttpResponse, &RouteParams) + Send + Sync + 'static,
    {
        self.add_route_shared(method, pattern, Vec::new(), Arc::new(handler));
    }

    /// Registers a route with its own middleware chain, run after the
    /// global chain.
    pub fn add_route_with_middleware<F>(
        &self,
        method: &str,
        pattern: &str,
        middlewares: Vec<Arc<dyn Middleware>>,
        handler: F,
    ) where
        F: Fn(&HttpRequest, &mut HttpResponse, &RouteParams) + Send + Sync + 'static,
    {
        self.add_route_shared(method, pattern, middlewares, Arc::new(handler));
    }

    fn add_route_shared(
        &self,
        method: &str,
        pattern: &str,
        middlewares: Vec<Arc<dyn Middleware>>,
        handler: Arc<Handler>,
    ) {
        let (regex, param_names) = match compile_pattern(pattern) {
            Ok(compiled) => compiled,
            Err(err) => {
                logging::error!(self.log, "route pattern rejected";
                                "pattern" => pattern, "error" => %err);
                return;
            }
        };

        let route = Route {
            method: method.to_ascii_uppercase(),
            pattern: pattern.to_string(),
            regex,
            param_names,
            middlewares,
            handler,
        };

        let mut inner = self.inner.write().unwrap();
        inner.routes.push(route);
        logging::info!(self.log, "route registered"; "method" => method, "pattern" => pattern);
    }

    /// Appends a global middleware, applied to every dispatch in
    /// registration order before any per-route middleware.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        let mut inner = self.inner.write().unwrap();
        inner.global_middlewares.push(middleware);
    }

    /// Starts a route group sharing a path prefix and a middleware list.
    pub fn group(&self, prefix: &str) -> RouteGroup<'_> {
        RouteGroup {
            router: self,
            prefix: prefix.trim_end_matches('/').to_string(),
            middlewares: Vec::new(),
        }
    }

    pub fn route_count(&self) -> usize {
        self.inner.read().unwrap().routes.len()
    }

    /// Resolves and runs the handler for `request`. Returns false only when
    /// the handler panicked; the response then carries the 500 envelope and
    /// the caller must not keep the connection alive.
    pub fn dispatch(&self, request: &mut HttpRequest, response: &mut HttpResponse) -> bool {
        let matched = {
            let inner = self.inner.read().unwrap();
            let method = request.method.as_str();

            inner.routes.iter().find_map(|route| {
                if route.method != method {
                    return None;
                }
                route.regex.captures(&request.path).map(|captures| {
                    let mut params = RouteParams::new();
                    for (index, name) in route.param_names.iter().enumerate() {
                        if let Some(capture) = captures.get(index + 1) {
                            params.insert(name.clone(), capture.as_str().to_string());
                        }
                    }
                    (
                        route.pattern.clone(),
                        route.middlewares.clone(),
                        route.handler.clone(),
                        inner.global_middlewares.clone(),
                        params,
                    )
                })
            })
        };

        let (pattern, middlewares, handler, global, params) = match matched {
            Some(found) => found,
            None => {
                logging::warn!(self.log, "no route matched";
                               "method" => request.method.as_str(), "path" => &request.path);
                error_envelope(response, 404, "Route not found");
                return true;
            }
        };

        for middleware in &global {
            if !middleware.handle(request, response) {
                logging::debug!(self.log, "request stopped by global middleware";
                                "path" => &request.path);
                return true;
            }
        }
        for middleware in &middlewares {
            if !middleware.handle(request, response) {
                logging::debug!(self.log, "request stopped by route middleware";
                                "path" => &request.path);
                return true;
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler(request, response, &params);
        }));

        match outcome {
            Ok(()) => true,
            Err(_) => {
                logging::error!(self.log, "handler panicked";
                                "pattern" => pattern, "path" => &request.path);
                response.clear();
                error_envelope(response, 500, "Internal Server Error");
                false
            }
        }
    }
}

/// Route group: composes a prefix and a middleware list into wrapped
/// handlers, so group middleware runs right before the handler.
pub struct RouteGroup<'a> {
    router: &'a Router,
    prefix: String,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl<'a> RouteGroup<'a> {
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn add_route<F>(&self, method: &str, path: &str, handler: F)
    where
        F: Fn(&HttpRequest, &mut HttpResponse, &RouteParams) + Send + Sync + 'static,
    {
        let full_path = if path.starts_with('/') {
            format!("{}{}", self.prefix, path)
        } else {
            format!("{}/{}", self.prefix, path)
        };

        // Group middleware lands on the route's own chain, after the
        // global chain and before the handler.
        self.router
            .add_route_with_middleware(method, &full_path, self.middlewares.clone(), handler);
    }
}

fn error_envelope(response: &mut HttpResponse, code: u16, message: &str) {
    response.set_status(code, "");
    response.json(
        json!({
            "success": false,
            "code": code,
            "message": message,
            "data": null
        })
        .to_string(),
    );
}

/// `/users/:id/books` → `^/users/([^/]+)/books$`, params `["id"]`.
fn compile_pattern(pattern: &str) -> Result<(Regex, Vec<String>), regex::Error> {
    let mut param_names = Vec::new();
    let mut compiled = String::from("^");

    for (index, segment) in pattern.split('/').enumerate() {
        if index > 0 {
            compiled.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            if !name.is_empty() {
                param_names.push(name.to_string());
                compiled.push_str("([^/]+)");
                continue;
            }
        }
        compiled.push_str(&regex::escape(segment));
    }
    compiled.push('$');

    Ok((Regex::new(&compiled)?, param_names))
}
