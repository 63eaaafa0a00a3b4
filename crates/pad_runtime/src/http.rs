//! HTTP surface of a pad.
//!
//! Every path is handled by the pipeline:
//! - GET, POST - run the pipeline
//! - OPTIONS - CORS preflight
//! - anything else - 405
//!
//! A pad that failed to load answers every request, whatever its method, with the load fault.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::assemble::headers_from_map;
use crate::error::{BoxError, ErrorCode, PadError, PadResult, RequestFault};
use crate::pipeline::{Invocation, PadResponse, PadRuntime};

/// Methods the pipeline answers.
pub const ALLOWED_METHODS: &str = "GET, POST";

fn render(response: PadResponse) -> Response<Full<Bytes>> {
    let mut http = Response::new(Full::new(response.to_bytes()));
    *http.status_mut() = response.status;

    let headers = http.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %name, "skipping invalid response header"),
        }
    }
    http
}

fn preflight<B>(request: &Request<B>) -> Response<Full<Bytes>> {
    let mut http = Response::new(Full::new(Bytes::new()));
    *http.status_mut() = StatusCode::NO_CONTENT;

    let allow_headers = request
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("Content-Type, Authorization"));

    let headers = http.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    http
}

/// Handles one HTTP request against the pad.
pub async fn handle_request<B>(runtime: &PadRuntime, request: Request<B>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    if let Some(fault) = runtime.state().fault() {
        debug!(code = %fault.code(), "answering with load fault");
        return render(PadResponse::fault(&fault.to_error()));
    }

    let method = request.method().clone();
    match method {
        Method::GET | Method::POST => {}
        Method::OPTIONS => return preflight(&request),
        other => {
            debug!(method = %other, "method not allowed");
            let err = PadError::new(
                ErrorCode::MethodNotAllowed,
                format!("Method {} not allowed", other),
            );
            return render(PadResponse::fault(&err).with_header("allow", ALLOWED_METHODS));
        }
    }

    let (parts, body) = request.into_parts();
    let limit = runtime.max_body_bytes();
    let body = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            debug!(limit, "request body too large");
            let err = RequestFault::PayloadTooLarge(limit)
                .to_error()
                .with_extension("limit", limit);
            return render(PadResponse::fault(&err));
        }
        Err(e) => {
            let fault = RequestFault::MalformedBody(format!("Failed to read body: {}", e));
            return render(PadResponse::fault(&fault.to_error()));
        }
    };

    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let invocation = Invocation {
        method: parts.method,
        url,
        headers: headers_from_map(&parts.headers),
        body: (!body.is_empty()).then_some(body),
        content_type,
        secrets: runtime.secrets().clone(),
    };

    render(runtime.handle(invocation).await)
}

/// Binds `addr` and serves the pad until the process exits.
pub async fn serve(runtime: Arc<PadRuntime>, addr: &str) -> PadResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| PadError::internal(format!("Failed to bind {}: {}", addr, e)))?;
    serve_with_shutdown(runtime, listener, std::future::pending()).await
}

/// Serves connections from `listener` until `shutdown` resolves.
pub async fn serve_with_shutdown<S>(
    runtime: Arc<PadRuntime>,
    listener: TcpListener,
    shutdown: S,
) -> PadResult<()>
where
    S: Future<Output = ()>,
{
    let addr = listener
        .local_addr()
        .map_err(|e| PadError::internal(format!("Invalid listener: {}", e)))?;
    info!("Listening on http://{}", addr);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept: {}", e);
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let runtime = runtime.clone();
                        async move { Ok::<_, Infallible>(handle_request(&runtime, req).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        error!(%peer, "Connection error: {}", e);
                    }
                });
            }
        }
    }
}
