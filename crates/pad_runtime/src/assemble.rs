//! Per-request context and root value assembly.
//!
//! Resolvers read the assembled values as request data:
//!
//! ```ignore
//! Field::new("me", TypeRef::named(TypeRef::STRING), |ctx| {
//!     FieldFuture::new(async move {
//!         let pad = ctx.data::<PadContext>()?;
//!         Ok(pad.header("authorization").map(Value::from))
//!     })
//! })
//! ```

use crate::error::{panic_message, BoxError, RequestFault};
use crate::module::ValueFn;
use crate::tenant::TenantContext;
use futures::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use std::panic::AssertUnwindSafe;

/// Request headers with lowercased names.
pub type Headers = IndexMap<String, String>;

/// Key under which the default context nests the request headers.
pub const HEADERS_KEY: &str = "headers";

/// Builds [`Headers`] from a hyper header map. Repeated headers are joined with `", "`.
pub fn headers_from_map(map: &hyper::HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}

/// The GraphQL execution context of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PadContext(pub serde_json::Value);

impl PadContext {
    /// Returns a top-level entry of the context.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Returns a request header, when the context carries the default `headers` entry.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.0
            .get(HEADERS_KEY)
            .and_then(|headers| headers.get(name.to_ascii_lowercase()))
            .and_then(|v| v.as_str())
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

/// The root value of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RootValue(pub serde_json::Value);

impl RootValue {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

/// `{headers, ...tenant}`. A tenant entry named `headers` does not replace the request headers.
pub fn default_context(headers: &Headers, tenant: &TenantContext) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    object.insert(
        HEADERS_KEY.to_string(),
        serde_json::to_value(headers).unwrap_or_default(),
    );
    for (key, value) in tenant.iter() {
        if key == HEADERS_KEY {
            tracing::debug!("tenant entry `headers` shadowed by request headers");
            continue;
        }
        object.insert(key.clone(), value.clone());
    }
    serde_json::Value::Object(object)
}

/// Builds context and root values from the pad's optional hooks.
#[derive(Clone)]
pub struct Assembler {
    context: Option<ValueFn>,
    root_value: Option<serde_json::Value>,
    root_function: Option<ValueFn>,
}

impl Assembler {
    pub fn new(
        context: Option<ValueFn>,
        root_value: Option<serde_json::Value>,
        root_function: Option<ValueFn>,
    ) -> Self {
        Self {
            context,
            root_value,
            root_function,
        }
    }

    /// Runs the `context` export, or builds the default context.
    pub async fn assemble_context(
        &self,
        headers: &Headers,
        tenant: &TenantContext,
    ) -> Result<PadContext, RequestFault> {
        match &self.context {
            Some(func) => call_hook(func, headers, tenant)
                .await
                .map(PadContext)
                .map_err(RequestFault::ContextAssembly),
            None => Ok(PadContext(default_context(headers, tenant))),
        }
    }

    /// Runs `rootFunction`, falling back to `rootValue`, then to an empty object.
    pub async fn assemble_root(
        &self,
        headers: &Headers,
        tenant: &TenantContext,
    ) -> Result<RootValue, RequestFault> {
        if let Some(func) = &self.root_function {
            return call_hook(func, headers, tenant)
                .await
                .map(RootValue)
                .map_err(RequestFault::RootAssembly);
        }
        Ok(RootValue(
            self.root_value
                .clone()
                .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
        ))
    }

    /// Assembles context and root concurrently.
    pub async fn assemble(
        &self,
        headers: &Headers,
        tenant: &TenantContext,
    ) -> Result<(PadContext, RootValue), RequestFault> {
        futures::try_join!(
            self.assemble_context(headers, tenant),
            self.assemble_root(headers, tenant)
        )
    }
}

/// Calls a user hook, turning errors and panics into messages.
async fn call_hook(
    func: &ValueFn,
    headers: &Headers,
    tenant: &TenantContext,
) -> Result<serde_json::Value, String> {
    let call = AssertUnwindSafe(async { func(headers.clone(), tenant.clone()).await });
    match call.catch_unwind().await {
        Ok(result) => result.map_err(|e: BoxError| e.to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}
