//! Pad runtime
//!
//! Hosts a user-authored GraphQL service (a "pad") as a stateless HTTP function. The runtime
//! evaluates the pad once, validates its exports, and answers every request through a fixed
//! pipeline: tenant secrets, memoized schema, reporting proxy, context assembly, traced
//! execution.
//!
//! # Serving a pad
//!
//! ```ignore
//! use pad_runtime::{PadRuntime, RuntimeConfig, UserModule};
//! use std::sync::Arc;
//!
//! let config = RuntimeConfig::new().port(4000);
//! let runtime = config.build_runtime()?;
//! runtime.block_on(async {
//!     let pad = PadRuntime::load(|| Ok(UserModule::new().schema(my_schema())), &config);
//!     pad_runtime::http::serve(Arc::new(pad), &config.addr()).await
//! })?;
//! ```
//!
//! # Lazy schemas
//!
//! ```ignore
//! let module = UserModule::new().schema_function(|tenant| async move {
//!     let db = tenant.get_str("DATABASE_URL").unwrap_or_default().to_string();
//!     Ok(build_schema(db))
//! });
//! ```
//!
//! The first request's tenant context decides the schema for the life of the process.

pub mod assemble;
pub mod config;
pub mod error;
pub mod guard;
pub mod http;
pub mod module;
pub mod pipeline;
pub mod proxy;
pub mod schema;
pub mod tenant;
pub mod trace;

// Re-exports for convenience
pub use assemble::{Assembler, Headers, PadContext, RootValue};
pub use config::RuntimeConfig;
pub use error::{BoxError, ErrorCode, LoadFault, PadError, PadResult, RequestFault};
pub use guard::{LoadState, ReadyState};
pub use module::{UserModule, ALLOWED_EXPORTS};
pub use pipeline::{Invocation, PadResponse, PadRuntime};
pub use proxy::{ProxyAgent, ProxyAgentManager, ProxyConfig, ReportSink, TraceReport};
pub use schema::SchemaResolver;
pub use tenant::{InvocationSecrets, TenantContext};
pub use trace::{TraceCollector, TracingExtension};
