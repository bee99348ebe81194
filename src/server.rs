//! Thin HTTP surface over the registry and history store.
//!
//! Routing is a pure function of (method, path, query, body) so it can be
//! exercised without a socket; `run_server` only moves bytes.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Request, Response, Server};
use url::form_urlencoded;

use crate::error::{Result, SlotwatchError};
use crate::history::{DEFAULT_HISTORY_LIMIT, HistoryQuery, HistoryStore};
use crate::observation::TaskObservation;
use crate::rank::{DEFAULT_WINDOW_SECONDS, effective_window};
use crate::registry::{OwnerId, SlotRegistry};

const DEFAULT_RANK_LIMIT: usize = 50;
const MAX_RANK_LIMIT: usize = 200;
const MAX_HISTORY_LIMIT: i64 = 500;

/// Requests larger than this are answered with 413 and never parsed.
const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;

/// How long the accept loop blocks before re-checking the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) registry: Arc<SlotRegistry>,
    pub(crate) history: Arc<dyn HistoryStore>,
}

#[derive(Debug, Deserialize)]
struct RecordBody {
    user_id: OwnerId,
    #[serde(default)]
    username: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug)]
pub(crate) struct ApiResponse {
    pub(crate) status: u16,
    pub(crate) body: Value,
}

impl ApiResponse {
    fn success(data: Value) -> Self {
        Self {
            status: 200,
            body: json!({ "success": true, "data": data }),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "success": false, "message": message.into() }),
        }
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Missing or unparsable numbers read as zero, which every handler treats as "use the default".
fn query_i64(params: &HashMap<String, String>, key: &str) -> i64 {
    params
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn rank_limit(raw: i64) -> usize {
    if raw <= 0 {
        DEFAULT_RANK_LIMIT
    } else {
        (raw as usize).min(MAX_RANK_LIMIT)
    }
}

fn history_limit(raw: i64) -> i64 {
    if raw <= 0 {
        DEFAULT_HISTORY_LIMIT
    } else {
        raw.min(MAX_HISTORY_LIMIT)
    }
}

fn handle_rank(state: &ServerState, params: &HashMap<String, String>) -> ApiResponse {
    let window = effective_window(query_i64(params, "window"));
    let limit = rank_limit(query_i64(params, "limit"));
    let rank = state.registry.active_task_rank(window, Some(limit));
    ApiResponse::success(json!({ "rank": rank, "window_seconds": window }))
}

fn handle_stats(state: &ServerState) -> ApiResponse {
    match serde_json::to_value(state.registry.stats()) {
        Ok(stats) => ApiResponse::success(stats),
        Err(err) => ApiResponse::error(500, format!("stats: {err}")),
    }
}

fn handle_history(state: &ServerState, params: &HashMap<String, String>) -> ApiResponse {
    let query = HistoryQuery {
        start_time: query_i64(params, "start_time"),
        end_time: query_i64(params, "end_time"),
        owner_id: query_i64(params, "user_id"),
        limit: history_limit(query_i64(params, "limit")),
    };
    match state.history.query(&query) {
        Ok(records) => {
            let total = records.len();
            ApiResponse::success(json!({ "records": records, "total": total }))
        }
        Err(err) => {
            tracing::warn!(error = %err, "history query failed");
            ApiResponse::error(500, format!("failed to load history: {err}"))
        }
    }
}

fn handle_record(state: &ServerState, body: &str) -> ApiResponse {
    let body: RecordBody = match serde_json::from_str(body) {
        Ok(body) => body,
        Err(err) => return ApiResponse::error(400, format!("invalid body: {err}")),
    };
    let observation = match body.payload {
        Some(payload) => TaskObservation::new(body.user_id, body.username, payload.into_bytes()),
        None => TaskObservation::from_request(
            body.user_id,
            body.username,
            body.model.as_deref().unwrap_or_default(),
            body.request_id.as_deref(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        ),
    };
    let Some(observation) = observation else {
        tracing::debug!(user_id = body.user_id, "rejected observation with invalid owner id");
        return ApiResponse::error(400, "invalid user id");
    };
    state.registry.observe(&observation);
    ApiResponse::success(Value::Null)
}

/// Dispatch one request. `target` is the raw request target (path plus optional query).
pub(crate) fn route(state: &ServerState, method: &Method, target: &str, body: &str) -> ApiResponse {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let params = parse_query(query);

    match (method, path.trim_end_matches('/')) {
        (Method::Get, "/api/active_task/rank") => handle_rank(state, &params),
        (Method::Get, "/api/active_task/stats") => handle_stats(state),
        (Method::Get, "/api/active_task/history") => handle_history(state, &params),
        (Method::Post, "/api/active_task/record") => handle_record(state, body),
        (
            _,
            "/api/active_task/rank"
            | "/api/active_task/stats"
            | "/api/active_task/history"
            | "/api/active_task/record",
        ) => ApiResponse::error(405, "method not allowed"),
        _ => ApiResponse::error(404, "not found"),
    }
}

fn too_large() -> ApiResponse {
    ApiResponse::error(413, format!("request body exceeds {MAX_BODY_BYTES} bytes"))
}

/// Reads at most one byte past the limit so an oversized body is detected
/// instead of silently truncated.
fn read_body(reader: impl Read) -> std::result::Result<String, ApiResponse> {
    let mut raw = Vec::new();
    reader
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut raw)
        .map_err(|e| ApiResponse::error(400, format!("read body: {e}")))?;
    if raw.len() as u64 > MAX_BODY_BYTES {
        return Err(too_large());
    }
    String::from_utf8(raw).map_err(|_| ApiResponse::error(400, "body is not valid UTF-8"))
}

fn handle_request(state: &ServerState, mut request: Request) {
    let declared_too_large = request
        .body_length()
        .is_some_and(|len| len as u64 > MAX_BODY_BYTES);
    let response = if declared_too_large {
        too_large()
    } else {
        match read_body(request.as_reader()) {
            Ok(body) => route(state, request.method(), request.url(), &body),
            Err(response) => response,
        }
    };
    respond(request, response);
}

fn respond(request: Request, response: ApiResponse) {
    let payload = response.body.to_string();
    let mut http = Response::from_string(payload).with_status_code(response.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        http = http.with_header(header);
    }
    if let Err(err) = request.respond(http) {
        tracing::debug!(error = %err, "failed to write response");
    }
}

/// Bind and serve until `shutdown` is set or the listener fails. Blocks the calling thread.
pub(crate) fn run_server(
    bind: &str,
    port: u16,
    state: ServerState,
    shutdown: &AtomicBool,
) -> Result<()> {
    let addr = format!("{bind}:{port}");
    let server = Server::http(&addr).map_err(|e| SlotwatchError::Server(format!("{addr}: {e}")))?;
    tracing::info!(
        %addr,
        default_window = DEFAULT_WINDOW_SECONDS,
        "active task API listening"
    );
    serve_until(&server, &state, shutdown)
}

fn serve_until(server: &Server, state: &ServerState, shutdown: &AtomicBool) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(request)) => handle_request(state, request),
            Ok(None) => {}
            Err(err) => return Err(SlotwatchError::Server(format!("accept: {err}"))),
        }
    }
    tracing::info!("active task API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HighActiveRecord, MemoryHistoryStore};
    use std::io::{Cursor, Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Instant;

    fn state() -> ServerState {
        ServerState {
            registry: Arc::new(SlotRegistry::default()),
            history: Arc::new(MemoryHistoryStore::new()),
        }
    }

    #[test]
    fn test_record_then_rank() {
        let state = state();
        for id in ["a", "b", "c"] {
            let body = format!(r#"{{"user_id": 12, "username": "zed", "model": "m", "request_id": "req-{id}"}}"#);
            let resp = route(&state, &Method::Post, "/api/active_task/record", &body);
            assert_eq!(resp.status, 200, "{:?}", resp.body);
        }
        let resp = route(&state, &Method::Get, "/api/active_task/rank?window=60", "");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["data"]["window_seconds"], 60);
        let rank = resp.body["data"]["rank"].as_array().unwrap();
        assert_eq!(rank.len(), 1);
        assert_eq!(rank[0]["user_id"], 12);
        assert_eq!(rank[0]["username"], "zed");
        assert_eq!(rank[0]["active_slots"], 3);
    }

    #[test]
    fn test_record_rejects_bad_owner_and_body() {
        let state = state();
        let resp = route(
            &state,
            &Method::Post,
            "/api/active_task/record",
            r#"{"user_id": 0, "payload": "x"}"#,
        );
        assert_eq!(resp.status, 400);
        let resp = route(&state, &Method::Post, "/api/active_task/record", "nope");
        assert_eq!(resp.status, 400);
        assert_eq!(state.registry.stats().total_slots, 0);
    }

    #[test]
    fn test_record_raw_payload_dedups() {
        let state = state();
        let body = r#"{"user_id": 3, "username": "p", "payload": "same conversation text"}"#;
        route(&state, &Method::Post, "/api/active_task/record", body);
        route(&state, &Method::Post, "/api/active_task/record", body);
        assert_eq!(state.registry.stats().total_slots, 1);
    }

    #[test]
    fn test_rank_window_and_limit_clamped() {
        let state = state();
        for owner in 1..=3 {
            state.registry.record_task(owner, "u", format!("payload-{owner}").as_bytes());
        }
        let resp = route(
            &state,
            &Method::Get,
            "/api/active_task/rank?window=99999&limit=2",
            "",
        );
        assert_eq!(resp.body["data"]["window_seconds"], 3600);
        assert_eq!(resp.body["data"]["rank"].as_array().unwrap().len(), 2);

        let resp = route(&state, &Method::Get, "/api/active_task/rank?window=abc", "");
        assert_eq!(resp.body["data"]["window_seconds"], 30);
        assert_eq!(rank_limit(0), 50);
        assert_eq!(rank_limit(1_000), 200);
    }

    #[test]
    fn test_stats_shape() {
        let state = state();
        state.registry.record_task(1, "u", b"stats payload");
        let resp = route(&state, &Method::Get, "/api/active_task/stats", "");
        let data = &resp.body["data"];
        assert_eq!(data["total_slots"], 1);
        assert_eq!(data["active_slots"], 1);
        assert_eq!(data["max_global_slots"], 1000);
        assert_eq!(data["max_user_slots"], 50);
        assert_eq!(data["active_users"], 1);
        assert_eq!(data["window_seconds"], 30);
    }

    #[test]
    fn test_history_filters() {
        let state = state();
        for (owner, ts) in [(1, 100), (2, 200), (1, 300)] {
            state
                .history
                .append(&HighActiveRecord {
                    id: 0,
                    owner_id: owner,
                    owner_name: format!("u{owner}"),
                    active_slots: 6,
                    window_secs: 600,
                    created_at: ts,
                })
                .unwrap();
        }
        let resp = route(
            &state,
            &Method::Get,
            "/api/active_task/history?user_id=1&limit=9999",
            "",
        );
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["data"]["total"], 2);
        assert_eq!(resp.body["data"]["records"][0]["created_at"], 300);
        assert_eq!(history_limit(9_999), 500);
        assert_eq!(history_limit(-1), 100);
    }

    #[test]
    fn test_read_body_limit() {
        let body = read_body(Cursor::new(b"{\"user_id\": 1}".to_vec())).unwrap();
        assert_eq!(body, "{\"user_id\": 1}");

        let exact = vec![b'a'; MAX_BODY_BYTES as usize];
        assert_eq!(read_body(Cursor::new(exact)).unwrap().len(), MAX_BODY_BYTES as usize);

        let oversized = vec![b'a'; MAX_BODY_BYTES as usize + 1];
        let err = read_body(Cursor::new(oversized)).unwrap_err();
        assert_eq!(err.status, 413);

        let err = read_body(Cursor::new(vec![0xff, 0xfe])).unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[test]
    fn test_serve_until_answers_then_stops_on_flag() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let state = state();
        state.registry.record_task(5, "live", b"served payload");
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let join = thread::spawn(move || serve_until(&server, &state, &flag));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
            .write_all(b"GET /api/active_task/stats HTTP/1.0\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut raw = Vec::new();
        // The server closes after one HTTP/1.0 response; a timeout still leaves what was read.
        let _ = stream.read_to_end(&mut raw);
        let reply = String::from_utf8_lossy(&raw);
        assert!(reply.contains(" 200 "), "{reply}");
        assert!(reply.contains("\"total_slots\":1"), "{reply}");

        let stopped_at = Instant::now();
        shutdown.store(true, Ordering::SeqCst);
        join.join().unwrap().unwrap();
        assert!(stopped_at.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_routes() {
        let state = state();
        assert_eq!(route(&state, &Method::Get, "/nope", "").status, 404);
        assert_eq!(
            route(&state, &Method::Delete, "/api/active_task/stats", "").status,
            405
        );
        assert_eq!(
            route(&state, &Method::Get, "/api/active_task/stats/", "").status,
            200
        );
    }
}
