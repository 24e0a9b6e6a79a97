//! Request dispatcher: the per-request pipeline.
//!
//! Every connection task funnels its requests through [`handle`]: timing
//! marks, the plaintext-upgrade policy, site resolution, method policy,
//! upload admission, cache lookup, hook-chain invocation, manual-mode
//! delegation, rendering, and cache insertion.
//!
//! The dispatcher never blocks a worker on a hook — chains run under the
//! executor and results arrive through a completion channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::config::{PlaintextPolicy, ServerConfig, SiteConfig};
use crate::hooks::executor::{Executor, RespondHandle};
use crate::hooks::registry::HookRegistry;
use crate::redirect::{self, UPGRADE_INSECURE_REQUESTS};
use crate::render::{self, error_response, Timing};
use crate::types::{BoxError, Response};

/// Shared daemon state: configuration, registry, executor, cache, and the
/// process-wide upload admission counter.
pub struct Server {
    config: ServerConfig,
    executor: Executor,
    cache: ResponseCache,
    pending_uploads: AtomicU64,
    tls_active: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, registry: Arc<HookRegistry>) -> Self {
        let executor = Executor::new(registry, config.safe_hooks);
        let cache = ResponseCache::new(config.cache_size);
        Self {
            config,
            executor,
            cache,
            pending_uploads: AtomicU64::new(0),
            tls_active: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Flags that HTTPS endpoints actually started; enables the plaintext
    /// policy.
    pub fn set_tls_active(&self, active: bool) {
        self.tls_active.store(active, Ordering::Relaxed);
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active.load(Ordering::Relaxed)
    }

    /// Admits `chunk` bytes into the process-wide upload budget. Rejects
    /// when the buffered total would cross `upload_max_storage`.
    fn admit_upload(&self, chunk: u64) -> bool {
        let previous = self.pending_uploads.fetch_add(chunk, Ordering::SeqCst);
        if previous + chunk > self.config.upload_max_storage {
            self.pending_uploads.fetch_sub(chunk, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn release_upload(&self, total: u64) {
        if total > 0 {
            self.pending_uploads.fetch_sub(total, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    fn pending_uploads(&self) -> u64 {
        self.pending_uploads.load(Ordering::SeqCst)
    }
}

/// Per-connection kill switch. Firing it makes the connection task drop
/// the transport without writing a response.
#[derive(Clone)]
pub struct ConnectionKill(pub Arc<tokio::sync::Notify>);

/// Dispatches one request. `secure` marks requests that arrived over TLS.
pub async fn handle<B>(
    server: Arc<Server>,
    req: http::Request<B>,
    secure: bool,
) -> Response
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let mut timing = Timing::start();

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    // Plaintext-upgrade policy, only meaningful while TLS endpoints run.
    if !secure && server.tls_active() && !host.is_empty() {
        let wants_upgrade = req
            .headers()
            .get(UPGRADE_INSECURE_REQUESTS)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim() == "1")
            .unwrap_or(false);
        let redirect = match server.config.plaintext_policy {
            PlaintextPolicy::Reject => true,
            PlaintextPolicy::Upgrade => wants_upgrade,
            PlaintextPolicy::None => false,
        };
        if redirect {
            return redirect::upgrade(req.method(), &host, &target);
        }
    }

    let Some(site) = server.config.resolve_site(&host) else {
        debug!(host = %host, "no site for host; destroying connection");
        return destroy_connection(req).await;
    };
    let site = site.clone();

    let method = req.method().clone();
    let request_headers = req.headers().clone();
    let (collected, body_params) = match method {
        Method::GET | Method::HEAD => (Bytes::new(), None),
        Method::POST => match collect_body(&server, req).await {
            Ok(body) => body,
            Err(status) => return error_response(status, Some(&timing)),
        },
        Method::OPTIONS => {
            // reserved, not implemented
            return error_response(StatusCode::NOT_IMPLEMENTED, Some(&timing));
        }
        _ => return error_response(StatusCode::METHOD_NOT_ALLOWED, Some(&timing)),
    };
    timing.mark_hook_entry();
    serve_hooks(
        server,
        site,
        method,
        request_headers,
        target,
        collected,
        body_params,
        timing,
    )
    .await
}

/// Site-resolution failure path: drain whatever body remains, then signal
/// the connection task to drop the transport. The returned future never
/// resolves; the select in the connection loop wins.
async fn destroy_connection<B>(req: http::Request<B>) -> Response
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let kill = req.extensions().get::<ConnectionKill>().cloned();
    let mut body = req.into_body();
    while let Some(frame) = body.frame().await {
        if frame.is_err() {
            break;
        }
    }
    match kill {
        Some(kill) => {
            kill.0.notify_one();
            std::future::pending().await
        }
        // no kill switch wired (tests): fall back to closing politely
        None => error_response(StatusCode::BAD_REQUEST, None),
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_hooks(
    server: Arc<Server>,
    site: SiteConfig,
    method: Method,
    request_headers: HeaderMap,
    target: String,
    body: Bytes,
    body_params: Option<HashMap<String, String>>,
    timing: Timing,
) -> Response {
    let canonical = site.canonical_host().to_owned();
    let mask = site.category_mask();

    let (path, query) = split_target(&target);
    let mut params = parse_query(query);
    // body parameters override query parameters on name collisions
    if let Some(body_params) = body_params {
        params.extend(body_params);
    }

    let cache_key = format!("{canonical}${target}");
    if let Some(descriptor) = server.cache.get(&cache_key) {
        debug!(key = %cache_key, "cache hit");
        if let Some(clone) = descriptor.clone_sized() {
            return render::render(clone, &timing).response;
        }
    }

    let uri_hook = format!("{}${}", canonical, path.strip_prefix('/').unwrap_or(path));
    let default_hook = format!("{canonical}$");

    use crate::hooks::{HookArgs, MatchMode, RequestArgs};
    let (hook_name, args) = if server
        .executor
        .check_target(&uri_hook, mask, MatchMode::Inclusive)
    {
        (
            uri_hook,
            HookArgs::Request(RequestArgs {
                path: None,
                params,
                headers: request_headers.clone(),
                body,
            }),
        )
    } else if server
        .executor
        .check_target(&default_hook, mask, MatchMode::Inclusive)
    {
        (
            default_hook,
            HookArgs::Request(RequestArgs {
                path: Some(path.to_owned()),
                params,
                headers: request_headers.clone(),
                body,
            }),
        )
    } else {
        return error_response(StatusCode::NOT_FOUND, Some(&timing));
    };

    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));
    server.executor.call(
        &hook_name,
        mask,
        MatchMode::Inclusive,
        args,
        move |outcome| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(outcome);
            }
        },
    );
    let outcome = match rx.await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(hook = %hook_name, "hook chain vanished without completing");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, Some(&timing));
        }
    };

    let descriptor = match outcome {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            warn!(hook = %hook_name, "hook chain produced no descriptor");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, Some(&timing));
        }
        Err(error) => {
            warn!(hook = %hook_name, %error, "hook chain raised an error");
            return error_response(StatusCode::BAD_GATEWAY, Some(&timing));
        }
    };

    if descriptor.error {
        warn!(hook = %hook_name, "hook signalled a fatal error");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, Some(&timing));
    }

    if let Some(manual) = descriptor.manual.clone() {
        return delegate_manual(
            &server,
            method,
            request_headers,
            target,
            manual,
            descriptor,
            &timing,
        )
        .await;
    }

    let rendered = render::render(descriptor, &timing);
    if let Some(insert) = rendered.cacheable {
        let expires_at =
            std::time::Instant::now() + std::time::Duration::from_secs(insert.max_age);
        server
            .cache
            .put(&cache_key, insert.descriptor, insert.size, expires_at);
    }
    rendered.response
}

/// Manual mode: the descriptor names another hook that takes over response
/// writing. The delegate runs in DISPATCH mode with the raw exchange and
/// returns the final descriptor through a once-only respond handle.
async fn delegate_manual(
    server: &Server,
    method: Method,
    request_headers: HeaderMap,
    target: String,
    manual: String,
    descriptor: crate::descriptor::ResponseDescriptor,
    timing: &Timing,
) -> Response {
    use crate::hooks::{HookArgs, ManualArgs, MatchMode, RequestSummary, ALL_CATEGORIES};

    if !server
        .executor
        .check_target(&manual, ALL_CATEGORIES, MatchMode::Inclusive)
    {
        warn!(target = %manual, "manual delegation target does not exist");
        return error_response(StatusCode::BAD_GATEWAY, Some(timing));
    }

    let (respond, rx) = RespondHandle::channel();
    server.executor.dispatch(
        &manual,
        ALL_CATEGORIES,
        MatchMode::Inclusive,
        HookArgs::Manual(ManualArgs {
            request: RequestSummary {
                method: method.to_string(),
                target,
                headers: request_headers,
            },
            respond,
            descriptor: Arc::new(descriptor),
        }),
    );

    match rx.await {
        Ok(mut delegated) => {
            if delegated.manual.take().is_some() {
                warn!("ignoring nested manual delegation");
            }
            if delegated.error {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, Some(timing));
            }
            render::render(delegated, timing).response
        }
        Err(_) => {
            warn!(target = %manual, "manual delegate never responded");
            return error_response(StatusCode::BAD_GATEWAY, Some(timing));
        }
    }
}

/// Buffers a POST body under the admission limits.
///
/// A declared `Content-Length` over the per-request unit size is rejected
/// with 406 before any body byte is read; streamed bodies are admitted
/// chunk by chunk against the process-wide storage budget and the same
/// unit bound. Form-encoded bodies additionally parse into a parameter
/// map.
async fn collect_body<B>(
    server: &Server,
    req: http::Request<B>,
) -> Result<(Bytes, Option<HashMap<String, String>>), StatusCode>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let unit_limit = server.config.upload_max_unit_size;

    if let Some(declared) = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        if declared > unit_limit {
            return Err(StatusCode::NOT_ACCEPTABLE);
        }
    }

    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            ct.split(';')
                .next()
                .map(str::trim)
                .map(|t| t.eq_ignore_ascii_case("application/x-www-form-urlencoded"))
                .unwrap_or(false)
        })
        .unwrap_or(false);

    let mut body = req.into_body();
    let mut buffer = BytesMut::new();
    let mut admitted: u64 = 0;

    loop {
        match body.frame().await {
            None => break,
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                let len = data.len() as u64;
                if !server.admit_upload(len) {
                    server.release_upload(admitted);
                    warn!("upload storage budget exceeded; destroying request");
                    return Err(StatusCode::NOT_ACCEPTABLE);
                }
                admitted += len;
                if admitted > unit_limit {
                    server.release_upload(admitted);
                    return Err(StatusCode::NOT_ACCEPTABLE);
                }
                buffer.extend_from_slice(&data);
            }
            Some(Err(error)) => {
                server.release_upload(admitted);
                return Err(classify_body_error(error.into()));
            }
        }
    }

    server.release_upload(admitted);
    let bytes = buffer.freeze();

    if is_form {
        let text = String::from_utf8_lossy(&bytes);
        let params: HashMap<String, String> = url::form_urlencoded::parse(text.as_bytes())
            .into_owned()
            .collect();
        Ok((bytes, Some(params)))
    } else {
        Ok((bytes, None))
    }
}

/// Maps a body read failure: a client abort mid-body answers 500, anything
/// else 406.
fn classify_body_error(error: BoxError) -> StatusCode {
    if let Some(hyper) = error.downcast_ref::<hyper::Error>() {
        if hyper.is_incomplete_message() || hyper.is_canceled() {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    StatusCode::NOT_ACCEPTABLE
}

/// Splits a request-target into path and raw query string.
fn split_target(target: &str) -> (&str, &str) {
    match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    serde_urlencoded::from_str(query).unwrap_or_else(|_| {
        url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect()
    })
}
