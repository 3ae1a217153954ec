//! HTTP admission front for `ClusterExtension` resources.
//!
//! Routes:
//! - `GET    /healthz`
//! - `GET    /apis/clusterextensions`         list
//! - `POST   /apis/clusterextensions`         create (201)
//! - `GET    /apis/clusterextensions/{name}`  read
//! - `PUT    /apis/clusterextensions/{name}`  update
//! - `DELETE /apis/clusterextensions/{name}`  delete
//!
//! Every write goes through the [`Arbiter`]; failures come back as a JSON
//! [`Status`] whose `message` is the guard's error text.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

pub mod client;

pub use client::{ClientError, HttpClient};

use extguard_core::{Arbiter, Arbitration, GuardConfig, GuardError};
use extguard_schema::{ClusterExtension, ResourceName, ResourceVersion, API_VERSION, LIST_KIND};
use extguard_store::{ExtensionStore, MemoryStore};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

const COLLECTION: &str = "/apis/clusterextensions";
const ACCEPT_POLL: Duration = Duration::from_millis(100);
/// Largest request body accepted on writes.
pub const MAX_BODY: usize = 1 << 20;

/// The guard as served: an arbiter over any store.
pub type Guard = Arbiter<dyn ExtensionStore>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Store(#[from] extguard_store::StoreError),
}

/// Error body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Status {
    pub kind: String,
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl Status {
    pub fn new(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind: "Status".to_owned(),
            code,
            reason: reason.to_owned(),
            message: message.into(),
        }
    }

    pub fn from_error(e: &GuardError) -> Self {
        let (code, reason) = match e {
            GuardError::PackageAlreadyClaimed { .. } => (403, "Forbidden"),
            GuardError::AlreadyExists(_) => (409, "AlreadyExists"),
            GuardError::VersionConflict { .. } | GuardError::StaleView { .. } => (409, "Conflict"),
            GuardError::NotFound(_) => (404, "NotFound"),
            GuardError::Invalid(_) => (422, "Invalid"),
            GuardError::StoreUnavailable(_) => (503, "ServiceUnavailable"),
            GuardError::Timeout { .. } => (504, "Timeout"),
            GuardError::Config(_) | GuardError::Io(_) | GuardError::Store(_) => {
                (500, "InternalError")
            }
        };
        Self::new(code, reason, e.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<ResourceVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionList {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ListMeta,
    pub items: Vec<ClusterExtension>,
}

fn default_api_version() -> String {
    API_VERSION.to_owned()
}

/// A parsed request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Health,
    Collection,
    Item(&'a str),
}

/// Parse a URL into a [`Route`], ignoring any query string.
pub fn parse_route(url: &str) -> Option<Route<'_>> {
    let path = url.split('?').next().unwrap_or(url);
    if path == "/healthz" {
        return Some(Route::Health);
    }
    let rest = path.strip_prefix(COLLECTION)?;
    match rest {
        "" | "/" => Some(Route::Collection),
        _ => {
            let name = rest.strip_prefix('/')?;
            if name.is_empty() || name.contains('/') {
                None
            } else {
                Some(Route::Item(name))
            }
        }
    }
}

fn with_json_header<R: Read>(resp: Response<R>) -> Response<R> {
    match Header::from_bytes("Content-Type", "application/json") {
        Ok(header) => resp.with_header(header),
        Err(()) => resp,
    }
}

fn respond_json(req: Request, code: u16, body: &impl Serialize) {
    match serde_json::to_vec(body) {
        Ok(json) => {
            let resp = Response::from_data(json).with_status_code(StatusCode(code));
            if let Err(e) = req.respond(with_json_header(resp)) {
                debug!("client went away: {e}");
            }
        }
        Err(e) => {
            error!("failed to encode response: {e}");
            let _ = req.respond(Response::empty(500));
        }
    }
}

fn respond_status(req: Request, status: &Status) {
    respond_json(req, status.code, status);
}

fn respond_error(req: Request, e: &GuardError) {
    respond_status(req, &Status::from_error(e));
}

fn too_large(limit: usize) -> Status {
    let msg = format!("request body exceeds {limit} bytes");
    Status::new(413, "RequestEntityTooLarge", msg)
}

/// Read at most `limit` bytes; a longer body is rejected with 413.
fn read_limited(reader: impl Read, limit: usize) -> Result<Vec<u8>, Status> {
    let mut body = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| Status::new(400, "BadRequest", format!("failed to read body: {e}")))?;
    if body.len() > limit {
        return Err(too_large(limit));
    }
    Ok(body)
}

fn read_object(req: &mut Request) -> Result<ClusterExtension, Status> {
    if req.body_length().is_some_and(|len| len > MAX_BODY) {
        return Err(too_large(MAX_BODY));
    }
    let body = read_limited(req.as_reader(), MAX_BODY)?;
    serde_json::from_slice(&body)
        .map_err(|e| Status::new(400, "BadRequest", format!("malformed ClusterExtension: {e}")))
}

/// Health as served on `/healthz`.
///
/// `degraded` (503) once the index reflector has stopped, `syncing` while
/// the index is behind the store, `ok` otherwise.
fn health_status(guard: &Guard) -> (u16, &'static str) {
    if !guard.is_syncing() {
        (503, "degraded")
    } else if guard.index().is_stale() {
        (200, "syncing")
    } else {
        (200, "ok")
    }
}

fn handle_collection(guard: &Guard, mut req: Request, method: &Method) {
    match *method {
        Method::Get => match guard.list() {
            Ok(snapshot) => {
                let list = ClusterExtensionList {
                    api_version: API_VERSION.to_owned(),
                    kind: LIST_KIND.to_owned(),
                    metadata: ListMeta {
                        resource_version: Some(ResourceVersion::new(snapshot.revision)),
                    },
                    items: snapshot.items,
                };
                respond_json(req, 200, &list);
            }
            Err(e) => respond_error(req, &e),
        },
        Method::Post => {
            let intent = match read_object(&mut req) {
                Ok(obj) => obj,
                Err(status) => return respond_status(req, &status),
            };
            match guard.create(&intent) {
                Ok(committed) => {
                    info!("POST {COLLECTION}: created {}", committed.name());
                    respond_json(req, 201, &committed);
                }
                Err(e) => {
                    info!("POST {COLLECTION}: {e}");
                    respond_error(req, &e);
                }
            }
        }
        _ => respond_status(req, &Status::new(405, "MethodNotAllowed", "method not allowed")),
    }
}

fn handle_item(guard: &Guard, mut req: Request, method: &Method, name: &str) {
    let name = ResourceName::new(name);
    match *method {
        Method::Get => match guard.get(&name) {
            Ok(obj) => respond_json(req, 200, &obj),
            Err(e) => respond_error(req, &e),
        },
        Method::Put => {
            let mut intent = match read_object(&mut req) {
                Ok(obj) => obj,
                Err(status) => return respond_status(req, &status),
            };
            if intent.name().is_empty() {
                intent.metadata.name = name.clone();
            } else if *intent.name() != name {
                let msg = format!(
                    "metadata.name \"{}\" does not match path name \"{name}\"",
                    intent.name()
                );
                return respond_status(req, &Status::new(400, "BadRequest", msg));
            }
            match guard.update(&intent) {
                Ok(committed) => {
                    info!("PUT {COLLECTION}/{name}: package {}", committed.package());
                    respond_json(req, 200, &committed);
                }
                Err(e) => {
                    info!("PUT {COLLECTION}/{name}: {e}");
                    respond_error(req, &e);
                }
            }
        }
        Method::Delete => match guard.delete(&name) {
            Ok(removed) => respond_json(req, 200, &removed),
            Err(e) => respond_error(req, &e),
        },
        _ => respond_status(req, &Status::new(405, "MethodNotAllowed", "method not allowed")),
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(guard: &Guard, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    match parse_route(&url) {
        Some(Route::Health) if method == Method::Get => {
            let (code, status) = health_status(guard);
            respond_json(req, code, &serde_json::json!({ "status": status }));
        }
        Some(Route::Collection) => handle_collection(guard, req, &method),
        Some(Route::Item(name)) => handle_item(guard, req, &method, name),
        Some(Route::Health) => {
            respond_status(req, &Status::new(405, "MethodNotAllowed", "method not allowed"));
        }
        None => respond_status(req, &Status::new(404, "NotFound", format!("no route for {url}"))),
    }
}

/// Build the store the server fronts: durable in `data_dir` when given.
///
/// Native package enforcement is switched on when the config asks the store
/// to arbitrate.
pub fn open_store(
    data_dir: Option<&std::path::Path>,
    config: &GuardConfig,
) -> Result<Arc<dyn ExtensionStore>, ServerError> {
    let store = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            MemoryStore::open(dir)?
        }
        None => MemoryStore::new(),
    };
    let native = config.arbitration == Arbitration::Store;
    Ok(Arc::new(store.with_unique_packages(native)))
}

/// Accept requests on `workers` threads until `shutdown` is set.
pub fn serve(
    server: &Arc<Server>,
    guard: &Arc<Guard>,
    workers: usize,
    shutdown: &Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>, ServerError> {
    (0..workers.max(1))
        .map(|i| {
            let server = Arc::clone(server);
            let guard = Arc::clone(guard);
            let shutdown = Arc::clone(shutdown);
            thread::Builder::new()
                .name(format!("extguard-http-{i}"))
                .spawn(move || accept_loop(&server, &guard, &shutdown))
                .map_err(ServerError::from)
        })
        .collect()
}

fn accept_loop(server: &Server, guard: &Guard, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(request)) => handle_request(guard, request),
            Ok(None) => {}
            Err(e) => {
                warn!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Start the server, blocking the current thread until `shutdown` is set.
pub fn run_server(
    guard: &Arc<Guard>,
    addr: &str,
    workers: usize,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), ServerError> {
    let server = Arc::new(Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })?);
    info!("listening on {addr} with {workers} workers");
    for handle in serve(&server, guard, workers, shutdown)? {
        if handle.join().is_err() {
            error!("HTTP worker panicked");
        }
    }
    info!("server stopped");
    Ok(())
}

/// A test helper that starts an extguard server on a random port in background threads.
///
/// The server listens on `127.0.0.1:{port}`. Drop the `TestServer` to stop it.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub guard: Arc<Guard>,
    server: Arc<Server>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl TestServer {
    /// Start a test server over a durable store in `data_dir`.
    /// Binds to `127.0.0.1:0` (random port).
    pub fn start(data_dir: PathBuf) -> Self {
        let config = GuardConfig {
            resync_backoff_ms: 10,
            watch_poll_ms: 5,
            ..GuardConfig::default()
        };
        let store = open_store(Some(&data_dir), &config).expect("failed to open test store");
        Self::with_store(store, config)
    }

    /// Start a test server over an existing store.
    pub fn with_store(store: Arc<dyn ExtensionStore>, config: GuardConfig) -> Self {
        let guard = Arc::new(Arbiter::start(store, config).expect("failed to start arbiter"));
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles =
            serve(&server, &guard, 8, &shutdown).expect("failed to spawn test HTTP workers");

        Self {
            url,
            port,
            guard,
            server,
            shutdown,
            handles,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.server.unblock();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
