//! Schema resolution with process-wide memoization.
//!
//! A static `schema` export is finished when the pad loads. A `schemaFunction` export is
//! called on the first request and its result is cached for the life of the process: later
//! requests reuse it even when they carry a different tenant context.

use crate::error::{panic_message, LoadFault, RequestFault};
use crate::module::SchemaFn;
use crate::tenant::TenantContext;
use crate::trace::TracingExtension;
use async_graphql::dynamic::{Schema, SchemaBuilder};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Attaches the tracing extension and finishes the schema.
pub fn finish_schema(builder: SchemaBuilder) -> Result<Schema, String> {
    builder
        .extension(TracingExtension)
        .finish()
        .map_err(|e| e.to_string())
}

enum Source {
    Static,
    Lazy(SchemaFn),
}

/// Produces the pad schema, at most once per process.
pub struct SchemaResolver {
    source: Source,
    cell: OnceCell<Schema>,
    resolve_count: AtomicUsize,
}

impl SchemaResolver {
    /// Finishes a static schema now. Failing to finish it is a load fault.
    pub fn from_static(builder: SchemaBuilder) -> Result<Self, LoadFault> {
        let schema = finish_schema(builder).map_err(LoadFault::InvalidSchema)?;
        Ok(Self {
            source: Source::Static,
            cell: OnceCell::new_with(Some(schema)),
            resolve_count: AtomicUsize::new(0),
        })
    }

    /// Defers to `schemaFunction` on first use.
    pub fn lazy(func: SchemaFn) -> Self {
        Self {
            source: Source::Lazy(func),
            cell: OnceCell::new(),
            resolve_count: AtomicUsize::new(0),
        }
    }

    /// Returns the cached schema, resolving it first if needed.
    ///
    /// Concurrent first callers wait for a single resolution. A failed resolution leaves the
    /// cache empty so the next request tries again.
    pub async fn resolve(&self, tenant: &TenantContext) -> Result<Schema, RequestFault> {
        let schema = self
            .cell
            .get_or_try_init(|| self.invoke(tenant))
            .await?;
        Ok(schema.clone())
    }

    async fn invoke(&self, tenant: &TenantContext) -> Result<Schema, RequestFault> {
        let Source::Lazy(func) = &self.source else {
            return Err(RequestFault::SchemaResolution(
                "static schema missing from cache".to_string(),
            ));
        };

        let attempt = self.resolve_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, "invoking schemaFunction");

        let call = AssertUnwindSafe(async { func(tenant.clone()).await });
        let builder = match call.catch_unwind().await {
            Ok(Ok(builder)) => builder,
            Ok(Err(e)) => return Err(RequestFault::SchemaResolution(e.to_string())),
            Err(payload) => {
                return Err(RequestFault::SchemaResolution(format!(
                    "schemaFunction panicked: {}",
                    panic_message(payload.as_ref())
                )))
            }
        };

        let schema = finish_schema(builder).map_err(RequestFault::SchemaResolution)?;
        info!(attempt, "schema resolved");
        Ok(schema)
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.initialized()
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.source, Source::Lazy(_))
    }

    /// Number of times `schemaFunction` has been invoked.
    pub fn resolve_count(&self) -> usize {
        self.resolve_count.load(Ordering::SeqCst)
    }
}
