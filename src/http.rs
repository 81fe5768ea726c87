//! The CDE (callback/data/end) HTTP session engine.
//!
//! Simulates a persistent session against a long-lived backing process on
//! top of stateless HTTP. A request without a session id is answered with a
//! redirect carrying a freshly minted id (no process is spawned). The first
//! request carrying an unknown id spawns the process and binds it to that id
//! in the session table; later requests with the same id reach the same
//! process. Adding `e`/`end` closes the session once the in-flight response
//! completes.
//!
//! ## Request protocol
//!
//! `GET|POST /{route}[:{sessionID}]?[c=|callback=<name>]&[d=|data=<payload>]&[e|end]`
//!
//! The payload (POST body wins over the `d`/`data` query parameter) goes to
//! process stdin; process stdout lines are batched into the response body,
//! each JSONP-wrapped when a callback name was supplied.
//!
//! ## Output batching
//!
//! Each session is one actor task owning three named timers:
//! - *debounce* (20 ms): reset on every stdout line; firing with no further
//!   output flushes the response, coalescing rapid successive writes.
//! - *ceiling* (200 ms): armed when a request attaches; guarantees a
//!   response even from a silent process.
//! - *idle* (10 min): re-armed on every request unless `end` was asked for;
//!   firing closes the session.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::logsink::tight_json;
use crate::process::ProcessManager;
use crate::service::ServiceDefinition;

/// Quiet period after the last stdout line before the response is flushed.
pub const DEBOUNCE: Duration = Duration::from_millis(20);
/// Hard deadline for a response once a request has attached.
pub const FLUSH_CEILING: Duration = Duration::from_millis(200);
/// A session with no request activity for this long is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// The CDE parameters of one request.
#[derive(Debug, Default)]
pub struct CdeRequest {
    pub payload: Option<String>,
    pub callback: Option<String>,
    pub end: bool,
}

/// What the gateway turns into an HTTP response.
#[derive(Debug)]
pub struct CdeResponse {
    pub status: u16,
    pub body: String,
}

struct SessionRequest {
    req: CdeRequest,
    reply: oneshot::Sender<CdeResponse>,
}

#[derive(Clone)]
struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionRequest>,
}

/// Maps session ids to live session actors.
pub struct HttpEngine {
    manager: Arc<ProcessManager>,
    sessions: Arc<DashMap<String, SessionHandle>>,
}

impl HttpEngine {
    pub fn new(manager: Arc<ProcessManager>) -> Self {
        Self {
            manager,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Serve one CDE request against a route.
    pub async fn handle(
        &self,
        def: &Arc<ServiceDefinition>,
        session_id: Option<&str>,
        req: CdeRequest,
        host: &str,
        original_query: &str,
        client_ip: &str,
    ) -> CdeResponse {
        let session_id = match session_id {
            Some(id) => id,
            None => {
                // NO-SESSION: mint an id and redirect; no process yet.
                let sid = self.mint_session_id();
                let url = format!("http://{}/{}:{}{}", host, def.route, sid, original_query);
                let body = match &req.callback {
                    Some(cb) => jsonp(cb, &url),
                    None => format!(
                        "<meta http-equiv=\"refresh\" content=\"0;URL='{}'\" />",
                        url
                    ),
                };
                tracing::info!(route = %def.route, session = %sid, ip = %client_ip, status = 302, "new session");
                return CdeResponse { status: 302, body };
            }
        };

        let handle = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // SPAWNING: unknown id, bind a new actor (and its process).
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = SessionHandle { tx };
                entry.insert(handle.clone());
                tokio::spawn(run_session(
                    self.manager.clone(),
                    self.sessions.clone(),
                    handle.clone(),
                    def.clone(),
                    session_id.to_string(),
                    client_ip.to_string(),
                    rx,
                ));
                handle
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = SessionRequest {
            req,
            reply: reply_tx,
        };
        if handle.tx.send(request).is_err() {
            // Raced a closing actor; its table entry is gone or going.
            return CdeResponse {
                status: 500,
                body: String::new(),
            };
        }
        reply_rx.await.unwrap_or(CdeResponse {
            status: 500,
            body: String::new(),
        })
    }

    /// Mint a session id absent from the table: epoch milliseconds,
    /// incremented until free.
    pub fn mint_session_id(&self) -> String {
        let mut candidate = chrono::Utc::now().timestamp_millis();
        while self.sessions.contains_key(&candidate.to_string()) {
            candidate += 1;
        }
        candidate.to_string()
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Response being accumulated for one in-flight request.
struct Pending {
    reply: oneshot::Sender<CdeResponse>,
    callback: Option<String>,
    buf: String,
    debounce_at: Option<Instant>,
    ceiling_at: Instant,
}

fn complete(p: Pending, error: bool, closing: bool) {
    let status = if error {
        500
    } else if p.buf.is_empty() && closing {
        204
    } else {
        200
    };
    let _ = p.reply.send(CdeResponse {
        status,
        body: p.buf,
    });
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(t) => sleep_until(t).await,
        None => std::future::pending().await,
    }
}

fn remove_self(sessions: &DashMap<String, SessionHandle>, session_id: &str, me: &SessionHandle) {
    // Only remove our own entry; the id may have been respawned already.
    sessions.remove_if(session_id, |_, h| h.tx.same_channel(&me.tx));
}

/// Per-session actor: owns the backing process, the pending response, and
/// the debounce/ceiling/idle timers. All session state mutation happens
/// here, serialized by the actor's mailbox.
async fn run_session(
    manager: Arc<ProcessManager>,
    sessions: Arc<DashMap<String, SessionHandle>>,
    me: SessionHandle,
    def: Arc<ServiceDefinition>,
    session_id: String,
    client_ip: String,
    mut rx: mpsc::UnboundedReceiver<SessionRequest>,
) {
    let spawned = match manager.spawn(&def, &client_ip) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(route = %def.route, session = %session_id, "{}", e);
            remove_self(&sessions, &session_id, &me);
            if let Some(SessionRequest { reply, .. }) = rx.recv().await {
                let _ = reply.send(CdeResponse {
                    status: 500,
                    body: String::new(),
                });
            }
            return;
        }
    };

    let proc = spawned.proc;
    let mut stdout = LinesStream::new(BufReader::new(spawned.stdout).lines());
    let mut stderr = spawned.stderr;
    let mut stderr_open = true;
    let mut errbuf = [0u8; 4096];
    let mut exit_rx = proc.exit_rx();

    let mut pending: Option<Pending> = None;
    let mut close_when_done = false;
    let mut idle_at: Option<Instant> = Some(Instant::now() + IDLE_TIMEOUT);

    loop {
        let debounce_at = pending.as_ref().and_then(|p| p.debounce_at);
        let ceiling_at = pending.as_ref().map(|p| p.ceiling_at);

        tokio::select! {
            request = rx.recv() => match request {
                Some(SessionRequest { req, reply }) => {
                    // A new request flushes any response still in flight.
                    if let Some(old) = pending.take() {
                        complete(old, false, false);
                    }
                    pending = Some(Pending {
                        reply,
                        callback: req.callback,
                        buf: String::new(),
                        debounce_at: None,
                        ceiling_at: Instant::now() + FLUSH_CEILING,
                    });
                    // Payload first, then `end`: the CDE order is fixed.
                    if let Some(data) = req.payload.as_deref().filter(|d| !d.is_empty()) {
                        if let Err(e) = proc.write_line(data).await {
                            if let Some(p) = pending.take() {
                                complete(p, true, close_when_done);
                            }
                            manager.kill(&proc, Some(&e));
                            remove_self(&sessions, &session_id, &me);
                            break;
                        }
                    }
                    if req.end {
                        close_when_done = true;
                        idle_at = None;
                    } else {
                        idle_at = Some(Instant::now() + IDLE_TIMEOUT);
                    }
                }
                None => {
                    // Engine dropped: server is shutting down.
                    manager.kill(&proc, None);
                    remove_self(&sessions, &session_id, &me);
                    break;
                }
            },
            line = stdout.next() => match line {
                Some(Ok(line)) => {
                    proc.log_server(&line);
                    if let Some(p) = pending.as_mut() {
                        match &p.callback {
                            Some(cb) => p.buf.push_str(&jsonp(cb, &line)),
                            None => {
                                p.buf.push_str(&line);
                                p.buf.push('\n');
                            }
                        }
                        p.debounce_at = Some(Instant::now() + DEBOUNCE);
                    } else {
                        tracing::debug!(session = %session_id, "output line with no pending response");
                    }
                }
                Some(Err(e)) => {
                    if let Some(p) = pending.take() {
                        complete(p, true, close_when_done);
                    }
                    manager.kill(&proc, Some(&e.to_string()));
                    remove_self(&sessions, &session_id, &me);
                    break;
                }
                None => {
                    // stdout closed: the process is gone.
                    if let Some(p) = pending.take() {
                        complete(p, false, close_when_done);
                    }
                    manager.teardown(&proc, None);
                    remove_self(&sessions, &session_id, &me);
                    break;
                }
            },
            n = stderr.read(&mut errbuf), if stderr_open => match n {
                Ok(0) | Err(_) => stderr_open = false,
                Ok(n) => {
                    let msg = String::from_utf8_lossy(&errbuf[..n]).to_string();
                    if let Some(p) = pending.take() {
                        complete(p, true, close_when_done);
                    }
                    manager.kill(&proc, Some(&msg));
                    remove_self(&sessions, &session_id, &me);
                    break;
                }
            },
            _ = exit_rx.changed() => {
                if let Some(p) = pending.take() {
                    complete(p, false, close_when_done);
                }
                manager.teardown(&proc, None);
                remove_self(&sessions, &session_id, &me);
                break;
            },
            _ = maybe_sleep(debounce_at) => {
                if let Some(p) = pending.take() {
                    complete(p, false, close_when_done);
                }
                if close_when_done {
                    manager.kill(&proc, None);
                    remove_self(&sessions, &session_id, &me);
                    break;
                }
            },
            _ = maybe_sleep(ceiling_at) => {
                if let Some(p) = pending.take() {
                    complete(p, false, close_when_done);
                }
                if close_when_done {
                    manager.kill(&proc, None);
                    remove_self(&sessions, &session_id, &me);
                    break;
                }
            },
            _ = maybe_sleep(idle_at), if pending.is_none() => {
                tracing::info!(session = %session_id, route = %def.route, "closing idle session");
                manager.kill(&proc, None);
                remove_self(&sessions, &session_id, &me);
                break;
            },
        }
    }
}

/// Wrap one batch for a JSONP consumer: `name(JSON)\n`, tight JSON.
pub fn jsonp(callback: &str, data: &str) -> String {
    format!("{}({})\n", callback, tight_json(data))
}

/// Parse a raw query string into decoded key/value pairs. Bare keys (such
/// as the `e` end flag) get an empty value.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.find('=') {
            Some(i) => (decode(&pair[..i]), decode(&pair[i + 1..])),
            None => (decode(pair), String::new()),
        })
        .collect()
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    urlencoding::decode(&s)
        .map(|c| c.into_owned())
        .unwrap_or(s)
}

/// Assemble the CDE parameters of a request. The POST body takes precedence
/// over the `data`/`d` query parameter as the payload.
pub fn cde_request(params: &[(String, String)], body: Option<String>) -> CdeRequest {
    let get = |long: &str, short: &str| {
        params
            .iter()
            .find(|(k, _)| k == long || k == short)
            .map(|(_, v)| v.clone())
    };
    let callback = get("callback", "c");
    let data = get("data", "d");
    let end = params.iter().any(|(k, _)| k == "e" || k == "end");
    let payload = body.filter(|b| !b.is_empty()).or(data);
    CdeRequest {
        payload,
        callback,
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{parse_service, Protocol};
    use std::time::Duration;

    fn engine() -> HttpEngine {
        HttpEngine::new(ProcessManager::new(None))
    }

    fn cat_def() -> Arc<ServiceDefinition> {
        Arc::new(parse_service("greet:cat", Protocol::Http, 8000).unwrap())
    }

    fn sh_def(route: &str, script: &str) -> Arc<ServiceDefinition> {
        Arc::new(ServiceDefinition {
            route: route.to_string(),
            command: format!("sh -c '{}'", script),
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            protocol: Protocol::Http,
            port: 8000,
        })
    }

    fn data(payload: &str) -> CdeRequest {
        CdeRequest {
            payload: Some(payload.to_string()),
            ..Default::default()
        }
    }

    fn end() -> CdeRequest {
        CdeRequest {
            end: true,
            ..Default::default()
        }
    }

    async fn wait_for_live_count(engine: &HttpEngine, expected: usize) {
        for _ in 0..40 {
            if engine.manager.live_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(engine.manager.live_count(), expected);
    }

    #[tokio::test]
    async fn test_sessionless_request_redirects_without_spawning() {
        let engine = engine();
        let def = cat_def();
        let resp = engine
            .handle(&def, None, data("hello"), "localhost:8000", "?d=hello", "127.0.0.1")
            .await;
        assert_eq!(resp.status, 302);
        assert!(resp.body.contains("http://localhost:8000/greet:"));
        assert!(resp.body.contains("?d=hello"));
        assert_eq!(engine.manager.live_count(), 0);
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn test_sessionless_jsonp_redirect() {
        let engine = engine();
        let def = cat_def();
        let req = CdeRequest {
            callback: Some("cb".to_string()),
            ..Default::default()
        };
        let resp = engine
            .handle(&def, None, req, "localhost:8000", "?c=cb", "127.0.0.1")
            .await;
        assert_eq!(resp.status, 302);
        assert!(resp.body.starts_with("cb(\"http://localhost:8000/greet:"));
        assert!(resp.body.ends_with(")\n"));
    }

    #[tokio::test]
    async fn test_mint_retries_until_absent() {
        let engine = engine();
        let id1 = engine.mint_session_id();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.sessions.insert(id1.clone(), SessionHandle { tx });
        let id2 = engine.mint_session_id();
        assert_ne!(id1, id2);
        assert!(!engine.sessions.contains_key(&id2));
    }

    #[tokio::test]
    async fn test_data_roundtrip_end_and_respawn() {
        let engine = engine();
        let def = cat_def();

        // First contact with an unknown id spawns the process.
        let resp = engine
            .handle(&def, Some("sid1"), data("hello"), "h", "", "127.0.0.1")
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "hello\n");
        assert_eq!(engine.manager.live_count(), 1);

        // `end` closes the session after the response.
        let resp = engine.handle(&def, Some("sid1"), end(), "h", "?e", "127.0.0.1").await;
        assert_eq!(resp.status, 204);
        assert_eq!(resp.body, "");
        wait_for_live_count(&engine, 0).await;
        assert_eq!(engine.session_count(), 0);

        // The same id is treated as first contact again.
        let resp = engine
            .handle(&def, Some("sid1"), data("again"), "h", "", "127.0.0.1")
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "again\n");
        let _ = engine.handle(&def, Some("sid1"), end(), "h", "?e", "127.0.0.1").await;
        wait_for_live_count(&engine, 0).await;
    }

    #[tokio::test]
    async fn test_debounce_batches_output_in_order() {
        let engine = engine();
        let def = sh_def("multi", "read line; printf 'a\\nb\\nc\\n'; sleep 5");
        let resp = engine
            .handle(&def, Some("sid2"), data("go"), "h", "", "127.0.0.1")
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "a\nb\nc\n");
        let _ = engine.handle(&def, Some("sid2"), end(), "h", "?e", "127.0.0.1").await;
        wait_for_live_count(&engine, 0).await;
    }

    #[tokio::test]
    async fn test_ceiling_flushes_silent_process() {
        let engine = engine();
        let def = sh_def("quiet", "sleep 5");
        let start = std::time::Instant::now();
        let resp = engine
            .handle(&def, Some("sid3"), CdeRequest::default(), "h", "", "127.0.0.1")
            .await;
        let elapsed = start.elapsed();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "");
        assert!(elapsed >= FLUSH_CEILING);
        assert!(elapsed < Duration::from_secs(2));
        let _ = engine.handle(&def, Some("sid3"), end(), "h", "?e", "127.0.0.1").await;
        wait_for_live_count(&engine, 0).await;
    }

    #[tokio::test]
    async fn test_stderr_gives_500_and_removes_session() {
        let engine = engine();
        let def = sh_def("bad", "echo oops >&2; sleep 5");
        let resp = engine
            .handle(&def, Some("sid4"), CdeRequest::default(), "h", "", "127.0.0.1")
            .await;
        assert_eq!(resp.status, 500);
        wait_for_live_count(&engine, 0).await;
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn test_jsonp_wraps_each_line() {
        let engine = engine();
        let def = cat_def();
        let req = CdeRequest {
            payload: Some("hello".to_string()),
            callback: Some("cb".to_string()),
            end: false,
        };
        let resp = engine.handle(&def, Some("sid5"), req, "h", "", "127.0.0.1").await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "cb(\"hello\")\n");
        let _ = engine.handle(&def, Some("sid5"), end(), "h", "?e", "127.0.0.1").await;
        wait_for_live_count(&engine, 0).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_500() {
        let engine = engine();
        let def = Arc::new(ServiceDefinition {
            route: "nope".to_string(),
            command: "definitely-not-a-command-xyz".to_string(),
            args: vec!["definitely-not-a-command-xyz".to_string()],
            protocol: Protocol::Http,
            port: 8000,
        });
        let resp = engine
            .handle(&def, Some("sid6"), data("x"), "h", "", "127.0.0.1")
            .await;
        assert_eq!(resp.status, 500);
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn test_parse_query_flags_and_decoding() {
        let params = parse_query("c=cb&d=hello%20world&e");
        assert_eq!(params[0], ("c".to_string(), "cb".to_string()));
        assert_eq!(params[1], ("d".to_string(), "hello world".to_string()));
        assert_eq!(params[2], ("e".to_string(), String::new()));
    }

    #[test]
    fn test_cde_request_payload_precedence() {
        let params = parse_query("data=from-query&end");
        let req = cde_request(&params, Some("from-body".to_string()));
        assert_eq!(req.payload.as_deref(), Some("from-body"));
        assert!(req.end);

        let req = cde_request(&params, None);
        assert_eq!(req.payload.as_deref(), Some("from-query"));

        let req = cde_request(&params, Some(String::new()));
        assert_eq!(req.payload.as_deref(), Some("from-query"));
    }

    #[test]
    fn test_jsonp_format() {
        assert_eq!(jsonp("cb", "hi"), "cb(\"hi\")\n");
        assert_eq!(jsonp("cb", "{\"x\": 1}"), "cb({\"x\":1})\n");
    }
}
