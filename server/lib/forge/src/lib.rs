//! The per-worker HTTP/1.1 engine: readiness-driven event loop, connection
//! pool with deferred reclamation, incremental request parser, router with
//! middleware chains, handler thread pool, timer wheel and flood defense.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod engine;
pub mod http;
pub mod net;
pub mod router;
pub mod workers;

pub use crate::engine::{Engine, EngineError, EngineStats, StatsSnapshot};
pub use crate::http::request::{HttpRequest, Method, Version};
pub use crate::http::response::HttpResponse;
pub use crate::router::middleware::{AuthMiddleware, CorsMiddleware, Middleware};
pub use crate::router::{RouteParams, Router};
