//! The demo REST surface mounted under `/api`: an in-memory users
//! resource exercising param capture, groups, middleware and the request
//! attribute bag.

use ember::logging::{self, Logger};
use forge::{HttpRequest, HttpResponse, RouteParams, Router};
use serde_derive::{Deserialize, Serialize};
use hashbrown::HashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: u64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub created_at: u64,
}

/// In-memory user store behind `/api/users`.
pub struct UserController {
    users: Mutex<HashMap<u64, User>>,
    next_id: AtomicU64,
    log: Logger,
}

impl UserController {
    pub fn new(log: &Logger) -> Arc<UserController> {
        Arc::new(UserController {
            users: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            log: log.new(logging::o!("controller" => "users")),
        })
    }

    /// Mounts the resource routes onto the given group.
    pub fn register(self: &Arc<Self>, group: &forge::router::RouteGroup<'_>) {
        let controller = self.clone();
        group.add_route("POST", "/users", move |req, res, _params| {
            controller.create(req, res);
        });

        let controller = self.clone();
        group.add_route("GET", "/users/:id", move |req, res, params| {
            controller.show(req, res, params);
        });

        let controller = self.clone();
        group.add_route("DELETE", "/users/:id", move |req, res, params| {
            controller.remove(req, res, params);
        });
    }

    fn create(&self, req: &HttpRequest, res: &mut HttpResponse) {
        let mut user: User = match serde_json::from_slice(&req.body) {
            Ok(user) => user,
            Err(err) => {
                logging::debug!(self.log, "rejected user payload"; "error" => %err);
                fail(res, 400, "Invalid user payload");
                return;
            }
        };
        if user.username.is_empty() || user.email.is_empty() {
            fail(res, 400, "Missing required fields");
            return;
        }

        let mut users = self.users.lock().unwrap();
        if users.values().any(|existing| existing.email == user.email) {
            fail(res, 409, "Email already exists");
            return;
        }

        user.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        user.created_at = ember::time::unix_now();
        users.insert(user.id, user.clone());
        drop(users);

        logging::info!(self.log, "user created"; "id" => user.id);
        res.set_status(201, "");
        ok(res, json!(user));
    }

    fn show(&self, _req: &HttpRequest, res: &mut HttpResponse, params: &RouteParams) {
        let id = match parse_id(params) {
            Some(id) => id,
            None => {
                fail(res, 400, "Invalid user id");
                return;
            }
        };

        let users = self.users.lock().unwrap();
        match users.get(&id) {
            Some(user) => ok(res, json!(user)),
            None => fail(res, 404, "User not found"),
        }
    }

    fn remove(&self, _req: &HttpRequest, res: &mut HttpResponse, params: &RouteParams) {
        let id = match parse_id(params) {
            Some(id) => id,
            None => {
                fail(res, 400, "Invalid user id");
                return;
            }
        };

        let mut users = self.users.lock().unwrap();
        if users.remove(&id).is_some() {
            logging::info!(self.log, "user deleted"; "id" => id);
            ok(res, serde_json::Value::Null);
        } else {
            fail(res, 404, "User not found");
        }
    }
}

fn parse_id(params: &RouteParams) -> Option<u64> {
    params.get("id").and_then(|raw| raw.parse::<u64>().ok())
}

fn ok(res: &mut HttpResponse, data: serde_json::Value) {
    let code = res.status();
    res.json(
        json!({
            "success": true,
            "code": code,
            "message": "OK",
            "data": data
        })
        .to_string(),
    );
}

fn fail(res: &mut HttpResponse, code: u16, message: &str) {
    res.set_status(code, "");
    res.json(
        json!({
            "success": false,
            "code": code,
            "message": message,
            "data": null
        })
        .to_string(),
    );
}

/// The engine handle is only available once the engine is up, after the
/// router has been built; the `/status` route reads through this cell.
pub type StatusCell = Arc<Mutex<Option<forge::engine::EngineHandle>>>;

/// Builds the full route table for the worker.
pub fn build_router(log: &Logger, status: StatusCell, admin_token: &str) -> Router {
    let router = Router::new(log);

    router.add_route("GET", "/", |_req, res, _params| {
        res.html("<html><body><h1>Welcome to the stoker worker</h1></body></html>");
    });

    router.add_route("GET", "/health", |_req, res, _params| {
        res.json(format!(
            "{{\"status\":\"OK\",\"timestamp\":{}}}",
            ember::time::unix_now()
        ));
    });

    router.add_route("GET", "/status", move |_req, res, _params| {
        let snapshot = status.lock().unwrap().as_ref().map(|handle| handle.snapshot());
        match snapshot {
            Some(snapshot) => {
                res.json(
                    json!({
                        "connections": snapshot.total_connections,
                        "free_connections": snapshot.free_connections,
                        "reclaim_pending": snapshot.reclaim_pending,
                        "online_users": snapshot.online_users,
                        "accepted": snapshot.accepted,
                        "refused": snapshot.refused,
                        "uptime": snapshot.uptime_secs,
                        "started": snapshot.started_unix
                    })
                    .to_string(),
                );
            }
            None => {
                res.set_status(503, "");
                res.json(json!({ "error": "statistics not available yet" }).to_string());
            }
        }
    });

    router.use_middleware(Arc::new(forge::CorsMiddleware::new()));

    let users = UserController::new(log);
    {
        let group = router.group("/api");
        users.register(&group);
    }

    // The admin surface sits behind the bearer-token extension point.
    {
        let mut group = router.group("/api/admin");
        group.use_middleware(Arc::new(
            forge::AuthMiddleware::new(admin_token).allow_path("/api/admin/ping"),
        ));

        group.add_route("GET", "/ping", |_req, res, _params| {
            res.text("pong");
        });

        group.add_route("GET", "/whoami", move |req, res, _params| {
            let principal = req
                .attribute("principal")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            res.json(json!({ "principal": principal }).to_string());
        });
    }

    router
}
