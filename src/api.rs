//! HTTP route table (§4.7): binds the raw TCP server, dispatches every
//! request through the auth gate, and wires the session manager, stream
//! watcher, buffer aggregator, and HQ remote registry together.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::auth::{self, AuthContext};
use crate::browse;
use crate::buffer_aggregator;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::hq::RemoteRegistry;
use crate::http_server::{HttpRequest, HttpServer, Method, Response, StatusCode};
use crate::sessions::{CreateOptions, SessionManager};
use crate::stream_watcher::{SseEvent, StreamWatcherRegistry};

/// Everything a request handler needs, threaded explicitly rather than
/// reached for through a global (§9 "Global mutable state").
pub struct ApiState {
    pub config: Config,
    pub sessions: Arc<SessionManager>,
    pub stream_watcher: Arc<StreamWatcherRegistry>,
    pub remotes: Arc<RemoteRegistry>,
}

impl ApiState {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let sessions = SessionManager::new(config.control_dir.clone());
        let stream_watcher = StreamWatcherRegistry::new(config.control_dir.clone());
        Arc::new(Self {
            config,
            sessions,
            stream_watcher,
            remotes: Arc::new(RemoteRegistry::new()),
        })
    }
}

/// Binds `config.bind_address` and serves requests, one thread per
/// connection, until the process is terminated. If `config.hq` names this
/// node as an HQ, also starts the remote health-check loop; if it names a
/// `remote_of`, registers with the HQ before serving and unregisters when
/// this function returns (§4.8 "remote mode").
pub fn start_server(config: Config) -> Result<()> {
    let state = ApiState::new(config);

    if state.config.hq.hq_bearer_token.is_some() {
        Arc::clone(&state.remotes).spawn_health_loop();
    }

    let remote_of = state.config.hq.remote_of.clone();
    let registered_remote_id = match &remote_of {
        Some(cfg) => crate::hq::register_with_hq(cfg).map(Some).unwrap_or_else(|err| {
            warn!(error = %err, "failed to register with hq at startup");
            None
        }),
        None => None,
    };

    let server = HttpServer::bind(&state.config.bind_address).map_err(|e| CoreError::Io(
        std::io::Error::other(e.to_string()),
    ))?;
    info!(address = %state.config.bind_address, "listening");

    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("received interrupt, draining");
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        })
        .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
    }

    let incoming = server
        .incoming_until(Arc::clone(&shutdown))
        .map_err(CoreError::Io)?;
    for incoming in incoming {
        let Ok(request) = incoming else {
            continue;
        };
        let state = Arc::clone(&state);
        std::thread::spawn(move || {
            if let Err(err) = handle_connection(request, &state) {
                error!(error = %err, "connection handling failed");
            }
        });
    }

    // Drain order per §5: stop accepting (already done, the loop above just
    // exited), close client streams, kill owned sessions with escalation.
    state.stream_watcher.close_all();
    state.sessions.shutdown_all();

    if let (Some(cfg), Some(remote_id)) = (remote_of, registered_remote_id) {
        crate::hq::unregister_from_hq(&cfg, &remote_id);
    }

    Ok(())
}

fn handle_connection(
    mut request: HttpRequest,
    state: &Arc<ApiState>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();

    if path == "/buffers" {
        let socket = request.upgrade_to_websocket()?;
        buffer_aggregator::serve_connection(socket, Arc::clone(&state.sessions));
        return Ok(());
    }

    let auth_header = header_str(&request, "authorization");
    let hq_bearer = state.config.hq.hq_bearer_token.as_deref();
    let query_token = query_param(&query, "token");
    let is_event_source = path.ends_with("/stream");

    let ctx = if auth::is_exempt_path(&path) {
        AuthContext::default()
    } else {
        match auth::authenticate(&state.config.auth, hq_bearer, auth_header.as_deref(), query_token.as_deref(), is_event_source) {
            Ok(ctx) => ctx,
            Err(err) => {
                request.respond(render_error(err))?;
                return Ok(());
            }
        }
    };

    // HQ proxying (§4.7): any `/api/sessions/:id/*` call for an id this node
    // doesn't own locally is transparently forwarded to the remote that
    // registered it, preserving method/body/SSE/binary semantics. Locally
    // owned sessions always take precedence over a same-id remote entry.
    if let Some(id) = session_id_in_path(&path) {
        if state.sessions.get(id).is_err() {
            if let Some(remote) = state.remotes.route_for_session(id) {
                return proxy_to_remote(request, state, &remote, &method, &path, &query);
            }
        }
    }

    if path.ends_with("/stream") && method == Method::GET {
        return serve_stream(request, state, &path);
    }

    if path.ends_with("/buffer") && method == Method::GET {
        return serve_buffer(request, state, &path);
    }

    if method == Method::GET && !path.starts_with("/api/") {
        if let Some(static_root) = state.config.static_path.as_deref() {
            if static_root.is_dir() {
                if let Some(bytes) = serve_static_file(static_root, &path) {
                    request.respond(bytes)?;
                    return Ok(());
                }
            }
        }
    }

    let outcome = route(&method, &path, &query, &request, state, &ctx);
    match outcome {
        RouteOutcome::Response(response) => {
            request.respond(render_response(response))?;
        }
        RouteOutcome::NotFound => {
            request.respond(render_error(CoreError::NotFound(path)))?;
        }
    }
    Ok(())
}

enum RouteOutcome {
    Response(Response<String>),
    NotFound,
}

#[allow(clippy::too_many_lines)]
fn route(
    method: &Method,
    path: &str,
    query: &str,
    request: &HttpRequest,
    state: &Arc<ApiState>,
    ctx: &AuthContext,
) -> RouteOutcome {
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    let result: Result<serde_json::Value> = match (method, segments.as_slice()) {
        (&Method::GET, ["api", "health"]) => Ok(serde_json::json!({"status": "ok"})),

        (&Method::GET, ["api", "sessions"]) => list_sessions(state),

        (&Method::POST, ["api", "sessions"]) => create_session(request, state),

        (&Method::GET, ["api", "sessions", id]) => state
            .sessions
            .get(id)
            .map(|info| serde_json::to_value(info).unwrap_or_default()),

        (&Method::DELETE, ["api", "sessions", id]) => state.sessions.kill(id).map(|()| serde_json::json!({"success": true})),

        (&Method::DELETE, ["api", "sessions", id, "cleanup"]) => {
            state.sessions.cleanup(id).map(|()| serde_json::json!({"success": true}))
        }

        (&Method::POST, ["api", "cleanup-exited"]) => {
            let local = state.sessions.cleanup_exited().unwrap_or(0);
            let remote = state.remotes.cleanup_exited_all();
            let remote_total: u64 = remote.values().filter_map(|r| r.as_ref().ok()).sum();
            Ok(serde_json::json!({"count": local + remote_total}))
        }

        (&Method::POST, ["api", "sessions", id, "input"]) => input(request, state, id),

        (&Method::POST, ["api", "sessions", id, "resize"]) => resize(request, state, id),

        (&Method::GET, ["api", "fs", "browse"]) => {
            let p = query_param(query, "path").unwrap_or_else(|| "~".to_string());
            browse::browse(&p).map(|r| serde_json::to_value(r).unwrap_or_default())
        }

        (&Method::POST, ["api", "mkdir"]) => {
            #[derive(Deserialize)]
            struct Body {
                path: String,
            }
            parse_body::<Body>(request).and_then(|b| browse::mkdir(&b.path)).map(|()| serde_json::json!({"success": true}))
        }

        (&Method::POST, ["api", "remotes", "register"]) => register_remote(request, state, ctx),

        (&Method::DELETE, ["api", "remotes", remote_id]) => {
            state.remotes.unregister(remote_id);
            Ok(serde_json::json!({"success": true}))
        }

        (&Method::GET, ["api", "remotes"]) => Ok(serde_json::to_value(state.remotes.list()).unwrap_or_default()),

        _ => return RouteOutcome::NotFound,
    };

    RouteOutcome::Response(match result {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(err) => err.into_response(),
    })
}

fn list_sessions(state: &Arc<ApiState>) -> Result<serde_json::Value> {
    let local = state.sessions.list()?;
    let mut all: serde_json::Map<String, serde_json::Value> = local
        .into_iter()
        .map(|(id, info)| (id, serde_json::to_value(info).unwrap_or_default()))
        .collect();
    // HQ merge (§4.7): remote sessions are tagged with their origin so
    // clients can tell a federated session apart from a locally owned one;
    // a locally owned id always wins a collision.
    for remote in state.remotes.list() {
        for mut session in remote.sessions {
            let Some(id) = session.get("id").and_then(|v| v.as_str()).map(str::to_string) else {
                continue;
            };
            if all.contains_key(&id) {
                continue;
            }
            if let Some(obj) = session.as_object_mut() {
                obj.insert("source".to_string(), serde_json::json!("remote"));
                obj.insert("remoteId".to_string(), serde_json::json!(remote.id));
                obj.insert("remoteName".to_string(), serde_json::json!(remote.name));
                obj.insert("remoteUrl".to_string(), serde_json::json!(remote.url));
            }
            all.insert(id, session);
        }
    }
    Ok(serde_json::Value::Object(all))
}

fn create_session(request: &HttpRequest, state: &Arc<ApiState>) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    struct Body {
        command: Vec<String>,
        #[serde(rename = "workingDir", default = "default_cwd")]
        working_dir: String,
        name: Option<String>,
        #[serde(default = "default_term")]
        term: String,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(rename = "remoteId", default)]
        remote_id: Option<String>,
    }
    fn default_cwd() -> String {
        "~".to_string()
    }
    fn default_term() -> String {
        crate::protocol::DEFAULT_TERM.to_string()
    }
    fn default_cols() -> u16 {
        80
    }
    fn default_rows() -> u16 {
        24
    }

    let body: Body = parse_body(request)?;

    // §4.7: a `remoteId` on this node when it's acting as HQ forwards
    // creation to that remote instead of spawning locally.
    if let Some(remote_id) = &body.remote_id {
        let remote = state
            .remotes
            .get(remote_id)
            .ok_or_else(|| CoreError::NotFound(remote_id.clone()))?;
        let response = state
            .remotes
            .http_client()
            .post(format!("{}/api/sessions", remote.url.trim_end_matches('/')))
            .bearer_auth(&remote.bearer_token)
            .json(&serde_json::json!({
                "command": body.command,
                "workingDir": body.working_dir,
                "name": body.name,
                "term": body.term,
                "cols": body.cols,
                "rows": body.rows,
            }))
            .send()
            .map_err(|e| CoreError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!("status {}", response.status())));
        }
        return response.json().map_err(|e| CoreError::Upstream(e.to_string()));
    }

    let id = state.sessions.create(CreateOptions {
        command: body.command,
        working_dir: body.working_dir,
        name: body.name,
        term: body.term,
        cols: body.cols,
        rows: body.rows,
    })?;
    Ok(serde_json::json!({"sessionId": id}))
}

/// `GET /api/sessions/:id/buffer` (§4.7, testable property 4): responds with
/// the raw `0xBF`-framed binary snapshot directly, not a JSON envelope — the
/// magic byte must be the first byte on the wire.
fn serve_buffer(
    mut request: HttpRequest,
    state: &Arc<ApiState>,
    path: &str,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(id) = path
        .trim_matches('/')
        .split('/')
        .collect::<Vec<_>>()
        .get(2)
        .copied()
    else {
        request.respond(render_error(CoreError::NotFound(path.to_string())))?;
        return Ok(());
    };

    let Ok(info) = state.sessions.get(id) else {
        request.respond(render_error(CoreError::NotFound(id.to_string())))?;
        return Ok(());
    };

    let snapshot = state.sessions.emulators.snapshot_or_init(id, info.cols, info.rows);
    let encoded = crate::protocol::encode_buffer_frame(id, &snapshot.encode());
    let response = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .header("Access-Control-Allow-Origin", "*")
        .body(encoded)
        .expect("well-formed response");
    request.respond(render_raw_bytes_response(&response))?;
    Ok(())
}

fn input(request: &HttpRequest, state: &Arc<ApiState>, id: &str) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Body {
        Text { text: String },
        Key { key: String },
    }
    let body: Body = parse_body(request)?;
    match body {
        Body::Text { text } => state.sessions.send_input(id, &text)?,
        Body::Key { key } => state.sessions.send_key(id, &key)?,
    }
    Ok(serde_json::json!({"success": true}))
}

fn resize(request: &HttpRequest, state: &Arc<ApiState>, id: &str) -> Result<serde_json::Value> {
    #[derive(Deserialize)]
    struct Body {
        cols: u16,
        rows: u16,
    }
    let body: Body = parse_body(request)?;
    state.sessions.resize(id, body.cols, body.rows)?;
    Ok(serde_json::json!({"success": true}))
}

fn register_remote(request: &HttpRequest, state: &Arc<ApiState>, ctx: &AuthContext) -> Result<serde_json::Value> {
    if state.config.hq.hq_bearer_token.is_none() {
        return Err(CoreError::InvalidArgument("this node is not configured as an hq".to_string()));
    }
    let _ = ctx;
    #[derive(Deserialize)]
    struct Body {
        name: String,
        url: String,
    }
    let body: Body = parse_body(request)?;
    let bearer = state.config.hq.hq_bearer_token.clone().unwrap_or_default();
    let remote = state.remotes.register(body.name, body.url, bearer)?;
    Ok(serde_json::json!({"id": remote.id}))
}

/// `GET /api/sessions/:id/stream` (§4.5): upgrades the connection into an
/// SSE stream by hand, since the hand-rolled HTTP server has no framework
/// abstraction for long-lived responses.
fn serve_stream(
    mut request: HttpRequest,
    state: &Arc<ApiState>,
    path: &str,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(id) = path
        .trim_matches('/')
        .split('/')
        .collect::<Vec<_>>()
        .get(2)
        .copied()
    else {
        request.respond(render_error(CoreError::NotFound(path.to_string())))?;
        return Ok(());
    };

    if state.sessions.get(id).is_err() {
        request.respond(render_error(CoreError::NotFound(id.to_string())))?;
        return Ok(());
    }

    request.respond_sse_headers()?;
    let (client_id, rx) = state.stream_watcher.attach(id);

    loop {
        match rx.recv_timeout(std::time::Duration::from_secs(60)) {
            Ok(SseEvent::Header(json) | SseEvent::Output(json) | SseEvent::Exit(json)) => {
                if request.write_sse_event(Some(&json)).is_err() {
                    break;
                }
            }
            Ok(SseEvent::Heartbeat) => {
                if request.write_sse_event(None).is_err() {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if request.write_sse_event(None).is_err() {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    state.stream_watcher.detach(id, client_id);
    Ok(())
}

/// Extracts `:id` from a `/api/sessions/:id` or `/api/sessions/:id/*` path.
fn session_id_in_path(path: &str) -> Option<&str> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["api", "sessions", id, ..] => Some(id),
        _ => None,
    }
}

/// Forwards one request to the remote node that owns `:id`, preserving
/// method, body, and response framing (SSE/binary/JSON alike), per §4.7
/// "Routing in HQ mode". The remote's bearer token is substituted for
/// whatever credentials the original caller presented to this node.
fn proxy_to_remote(
    mut request: HttpRequest,
    state: &Arc<ApiState>,
    remote: &crate::hq::Remote,
    method: &Method,
    path: &str,
    query: &str,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut url = format!("{}{}", remote.url.trim_end_matches('/'), path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = state
        .remotes
        .http_client()
        .request(reqwest_method, url)
        .bearer_auth(&remote.bearer_token)
        .body(request.body().clone());
    if let Some(content_type) = header_str(&request, "content-type") {
        builder = builder.header("content-type", content_type);
    }
    if path.ends_with("/stream") {
        builder = builder.timeout(Duration::from_secs(3600));
    }

    let response = match builder.send() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(remote = %remote.name, error = %err, "hq proxy call failed");
            request.respond(render_error(CoreError::Upstream(err.to_string())))?;
            return Ok(());
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let headers = vec![
        ("Content-Type".to_string(), content_type),
        ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
    ];
    let mut reader = response;
    request.respond_streaming(status, &headers, &mut reader)?;
    Ok(())
}

/// Serves `path` out of `static_root` for the web frontend bundle (§2.5),
/// resolving it through [`browse::resolve_static_file`]'s traversal guard.
/// Returns `None` when the path escapes the root or does not exist, letting
/// the caller fall through to the API route table.
fn serve_static_file(static_root: &std::path::Path, request_path: &str) -> Option<Vec<u8>> {
    let target = browse::resolve_static_file(static_root, request_path)?;
    let content = std::fs::read(&target).ok()?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", mime_type_for(&target))
        .header("Access-Control-Allow-Origin", "*")
        .body(content)
        .ok()?;
    Some(render_raw_bytes_response(&response))
}

fn mime_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js" | "mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        _ => "application/octet-stream",
    }
}

fn render_raw_bytes_response(response: &Response<Vec<u8>>) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        out.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or("")));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", response.body().len()));
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(response.body());
    bytes
}

fn parse_body<T: for<'de> Deserialize<'de>>(request: &HttpRequest) -> Result<T> {
    serde_json::from_slice(request.body())
        .map_err(|e| CoreError::InvalidArgument(format!("invalid request body: {e}")))
}

fn header_str(request: &HttpRequest, name: &str) -> Option<String> {
    request.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn query_param(query: &str, name: &str) -> Option<String> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<String> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string()))
        .expect("well-formed response")
}

fn render_response(response: Response<String>) -> Vec<u8> {
    render_raw_response(&response)
}

fn render_error(err: CoreError) -> Vec<u8> {
    render_raw_response(&err.into_response())
}

fn render_raw_response(response: &Response<String>) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        out.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or("")));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", response.body().len()));
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(response.body().as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_reads_known_key() {
        assert_eq!(query_param("a=1&token=abc", "token"), Some("abc".to_string()));
        assert_eq!(query_param("", "token"), None);
    }

    #[test]
    fn json_response_sets_content_type() {
        let response = json_response(StatusCode::OK, &serde_json::json!({"ok": true}));
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
    }

    #[test]
    fn session_id_in_path_extracts_id_from_nested_routes() {
        assert_eq!(session_id_in_path("/api/sessions/abc"), Some("abc"));
        assert_eq!(session_id_in_path("/api/sessions/abc/input"), Some("abc"));
        assert_eq!(session_id_in_path("/api/sessions"), None);
        assert_eq!(session_id_in_path("/api/remotes/abc"), None);
    }

    #[test]
    fn serve_static_file_rejects_traversal() {
        let root = tempfile::TempDir::new().unwrap();
        assert!(serve_static_file(root.path(), "../etc/passwd").is_none());
        assert!(serve_static_file(root.path(), "..\\windows\\system32").is_none());
    }

    #[test]
    fn serve_static_file_serves_known_file_and_index() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::write(root.path().join("test.css"), "body{}").unwrap();
        let response = serve_static_file(root.path(), "/test.css").unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("Content-Type: text/css"));

        std::fs::create_dir(root.path().join("subdir")).unwrap();
        std::fs::write(root.path().join("subdir/index.html"), "<html></html>").unwrap();
        let response = serve_static_file(root.path(), "/subdir/").unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.contains("Content-Type: text/html"));

        assert!(serve_static_file(root.path(), "/nonexistent.txt").is_none());
    }
}
