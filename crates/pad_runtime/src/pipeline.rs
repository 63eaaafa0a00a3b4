//! The per-request pipeline.
//!
//! Stages of a request against a loaded pad:
//!
//! 1. decode the tenant context from the invocation secrets
//! 2. resolve the schema (memoized)
//! 3. start or reuse the proxy agent
//! 4. parse the GraphQL request
//! 5. start the trace collector
//! 6. assemble context and root, then execute
//! 7. end the trace and merge it into `extensions`
//! 8. record the request on the proxy agent and return the response

use crate::assemble::{Headers, PadContext, RootValue};
use crate::config::RuntimeConfig;
use crate::error::{panic_message, BoxError, PadError, RequestFault};
use crate::guard::{LoadState, ReadyState};
use crate::module::UserModule;
use crate::proxy::{ProxyAgentManager, ReportSink, TraceReport};
use crate::tenant::{InvocationSecrets, TenantContext};
use crate::trace::TraceCollector;
use async_graphql::dynamic::Schema;
use async_graphql::{ServerError, Variables};
use bytes::Bytes;
use futures::FutureExt;
use hyper::{Method, StatusCode};
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// One HTTP call as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub method: Method,
    /// Path and query of the request URL.
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub content_type: Option<String>,
    pub secrets: InvocationSecrets,
}

impl Invocation {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: None,
            content_type: None,
            secrets: InvocationSecrets::new("[]"),
        }
    }

    /// A GET request carrying the query in its URL.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// A POST request with a JSON body.
    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self::new(Method::POST, url).body("application/json", body.to_string())
    }

    /// A POST request with a JSON body holding `query`.
    pub fn query(query: &str) -> Self {
        Self::post_json("/", &serde_json::json!({ "query": query }))
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = Some(body.into());
        self
    }

    /// Adds a header. Names are lowercased.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn secrets(mut self, secrets: InvocationSecrets) -> Self {
        self.secrets = secrets;
        self
    }

    /// Sets the `userContext` secrets payload.
    pub fn user_context(mut self, payload: impl Into<String>) -> Self {
        self.secrets.user_context = payload.into();
        self
    }

    /// Absolute URL of the request, rebuilt from the `host` header when `url` is a path.
    ///
    /// The scheme comes from `x-forwarded-proto`, else `http`.
    pub fn request_url(&self) -> Option<String> {
        if let Ok(url) = url::Url::parse(&self.url) {
            return Some(url.into());
        }
        let host = self.headers.get("host").filter(|host| !host.is_empty())?;
        let scheme = self
            .headers
            .get("x-forwarded-proto")
            .and_then(|proto| proto.split(',').next())
            .map(str::trim)
            .filter(|proto| !proto.is_empty())
            .unwrap_or("http");
        url::Url::parse(&format!("{}://{}", scheme, host))
            .and_then(|base| base.join(&self.url))
            .ok()
            .map(Into::into)
    }
}

/// What the pipeline answers with.
#[derive(Debug, Clone, PartialEq)]
pub struct PadResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
    /// Extra response headers.
    pub headers: Vec<(String, String)>,
}

impl PadResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            headers: Vec::new(),
        }
    }

    /// A fault response: `{"errors": [...]}` with no `data`.
    pub fn fault(error: &PadError) -> Self {
        Self {
            status: error.status(),
            body: error.to_body(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_fault(&self) -> bool {
        self.body.get("data").is_none() && self.body.get("errors").is_some()
    }

    /// Code of the first error, when it carries one.
    pub fn error_code(&self) -> Option<&str> {
        self.body
            .get("errors")?
            .get(0)?
            .get("extensions")?
            .get("code")?
            .as_str()
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.body.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct GraphQLBody {
    query: String,
    #[serde(default)]
    variables: Option<serde_json::Value>,
    #[serde(default, rename = "operationName")]
    operation_name: Option<String>,
}

/// A parsed GraphQL request.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: serde_json::Value,
}

impl ParsedRequest {
    fn new(
        query: String,
        operation_name: Option<String>,
        variables: Option<serde_json::Value>,
    ) -> Result<Self, RequestFault> {
        if query.trim().is_empty() {
            return Err(RequestFault::MalformedBody("missing query".to_string()));
        }
        let variables = match variables {
            None | Some(serde_json::Value::Null) => serde_json::Value::Object(Default::default()),
            Some(v @ serde_json::Value::Object(_)) => v,
            Some(_) => {
                return Err(RequestFault::MalformedBody(
                    "variables must be an object".to_string(),
                ))
            }
        };
        Ok(Self {
            query,
            operation_name: operation_name.filter(|name| !name.is_empty()),
            variables,
        })
    }

    fn into_request(self) -> async_graphql::Request {
        let mut request = async_graphql::Request::new(self.query)
            .variables(Variables::from_json(self.variables));
        if let Some(name) = self.operation_name {
            request = request.operation_name(name);
        }
        request
    }
}

/// Parses the GraphQL request of an invocation.
///
/// GET reads `query`, `variables` and `operationName` from the URL. Other methods read the
/// body: `application/graphql` bodies are the query text, anything else is JSON.
pub fn parse_request(invocation: &Invocation) -> Result<ParsedRequest, RequestFault> {
    if invocation.method == Method::GET {
        return parse_query_string(&invocation.url);
    }

    let body = invocation
        .body
        .as_ref()
        .filter(|body| !body.is_empty())
        .ok_or_else(|| RequestFault::MalformedBody("empty body".to_string()))?;

    let is_graphql = invocation
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("application/graphql"));

    if is_graphql {
        let query = std::str::from_utf8(body)
            .map_err(|e| RequestFault::MalformedBody(e.to_string()))?;
        return ParsedRequest::new(query.to_string(), None, None);
    }

    let parsed: GraphQLBody = serde_json::from_slice(body)
        .map_err(|e| RequestFault::MalformedBody(format!("Invalid JSON: {}", e)))?;
    ParsedRequest::new(parsed.query, parsed.operation_name, parsed.variables)
}

fn parse_query_string(url: &str) -> Result<ParsedRequest, RequestFault> {
    let url = url::Url::parse("http://pad.local")
        .and_then(|base| base.join(url))
        .map_err(|e| RequestFault::MalformedBody(e.to_string()))?;

    let mut query = None;
    let mut operation_name = None;
    let mut variables = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "query" => query = Some(value.into_owned()),
            "operationName" => operation_name = Some(value.into_owned()),
            "variables" if !value.is_empty() => {
                let parsed = serde_json::from_str(&value).map_err(|e| {
                    RequestFault::MalformedBody(format!("Invalid variables: {}", e))
                })?;
                variables = Some(parsed);
            }
            _ => {}
        }
    }

    let query = query.ok_or_else(|| RequestFault::MalformedBody("missing query".to_string()))?;
    ParsedRequest::new(query, operation_name, variables)
}

/// A loaded pad, ready to answer invocations.
pub struct PadRuntime {
    state: LoadState,
    secrets: InvocationSecrets,
    max_body_bytes: usize,
}

impl PadRuntime {
    /// Evaluates the pad module and prepares the pipeline.
    pub fn load<F>(evaluate: F, config: &RuntimeConfig) -> Self
    where
        F: FnOnce() -> Result<UserModule, BoxError>,
    {
        Self::from_parts(evaluate, config, ProxyAgentManager::new(config.proxy.clone()))
    }

    /// Like [`load`](Self::load), shipping proxy reports to `sink`.
    pub fn load_with_sink<F>(evaluate: F, config: &RuntimeConfig, sink: Arc<dyn ReportSink>) -> Self
    where
        F: FnOnce() -> Result<UserModule, BoxError>,
    {
        let proxy = ProxyAgentManager::new(config.proxy.clone()).with_sink(sink);
        Self::from_parts(evaluate, config, proxy)
    }

    fn from_parts<F>(evaluate: F, config: &RuntimeConfig, proxy: ProxyAgentManager) -> Self
    where
        F: FnOnce() -> Result<UserModule, BoxError>,
    {
        Self {
            state: LoadState::load(evaluate, proxy),
            secrets: config.secrets.clone(),
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    /// Secrets attached to invocations arriving over HTTP.
    pub fn secrets(&self) -> &InvocationSecrets {
        &self.secrets
    }

    /// Largest request body accepted over HTTP.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Answers one invocation.
    pub async fn handle(&self, invocation: Invocation) -> PadResponse {
        let ready = match &self.state {
            LoadState::Loaded(ready) => ready,
            LoadState::Faulted(fault) => {
                debug!(code = %fault.code(), "answering with load fault");
                return PadResponse::fault(&fault.to_error());
            }
        };

        match run(ready, invocation).await {
            Ok(response) => response,
            Err(err) => {
                debug!(code = %err.code, "request fault: {}", err.message);
                PadResponse::fault(&err)
            }
        }
    }
}

impl std::fmt::Debug for PadRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PadRuntime")
            .field("state", &self.state)
            .finish()
    }
}

async fn run(ready: &ReadyState, invocation: Invocation) -> Result<PadResponse, PadError> {
    let tenant = TenantContext::from_payload(&invocation.secrets.user_context)?;
    debug!(entries = tenant.len(), "tenant context decoded");

    let schema = ready.schema().resolve(&tenant).await?;

    let fallback_origin = invocation
        .secrets
        .url
        .clone()
        .or_else(|| invocation.request_url());
    let agent = ready
        .proxy()
        .ensure_started(&tenant, fallback_origin.as_deref());

    let parsed = parse_request(&invocation);
    let (query, operation_name) = match &parsed {
        Ok(request) => (request.query.clone(), request.operation_name.clone()),
        Err(_) => (String::new(), None),
    };

    let collector = TraceCollector::new();
    collector.start();

    let (response, tracing) = match parsed {
        Ok(request) => execute(ready, &schema, &invocation.headers, &tenant, request, &collector)
            .await
            .unwrap_or_else(|err| (PadResponse::fault(&err), None)),
        Err(fault) => (PadResponse::fault(&fault.to_error()), None),
    };
    collector.end();

    if let Some(agent) = agent {
        agent.record(TraceReport {
            operation_name,
            query,
            status: response.status.as_u16(),
            has_errors: response.body.get("errors").is_some(),
            start_time: collector.started_at(),
            duration: u64::try_from(collector.elapsed().as_nanos()).unwrap_or(u64::MAX),
            tracing,
        });
    }

    Ok(response)
}

async fn execute(
    ready: &ReadyState,
    schema: &Schema,
    headers: &Headers,
    tenant: &TenantContext,
    request: ParsedRequest,
    collector: &TraceCollector,
) -> Result<(PadResponse, Option<serde_json::Value>), PadError> {
    let (context, root): (PadContext, RootValue) = ready.assembler().assemble(headers, tenant).await?;

    let request = request
        .into_request()
        .data(context)
        .data(root)
        .data(collector.clone());
    let response = match AssertUnwindSafe(schema.execute(request)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "resolver panicked");
            async_graphql::Response::from_errors(vec![ServerError::new(
                format!("Resolver panicked: {}", message),
                None,
            )])
        }
    };
    debug!(errors = response.errors.len(), "executed");

    collector.end();
    let (key, payload) = collector.format();

    let mut body = serde_json::to_value(&response)
        .map_err(|e| PadError::internal(format!("Failed to serialize response: {}", e)))?;
    if let serde_json::Value::Object(map) = &mut body {
        let extensions = map
            .entry("extensions")
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        if let serde_json::Value::Object(extensions) = extensions {
            extensions.insert(key, payload.clone());
        }
    }

    Ok((PadResponse::ok(body), Some(payload)))
}
