//! Load-failure guard.
//!
//! The pad module is evaluated exactly once, before the listener is bound. Whatever happens
//! during evaluation, the host process survives: an error or panic becomes a [`LoadFault`] that
//! every later request is answered with.

use crate::assemble::Assembler;
use crate::error::{panic_message, BoxError, LoadFault};
use crate::module::UserModule;
use crate::proxy::ProxyAgentManager;
use crate::schema::SchemaResolver;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info};

/// Process-wide state of a successfully loaded pad.
pub struct ReadyState {
    schema: SchemaResolver,
    assembler: Assembler,
    proxy: ProxyAgentManager,
}

impl ReadyState {
    /// Validates the module and prepares its schema resolver.
    pub fn new(module: UserModule, proxy: ProxyAgentManager) -> Result<Self, LoadFault> {
        module.validate()?;

        let UserModule {
            schema,
            schema_function,
            context,
            root_value,
            root_function,
            ..
        } = module;

        let schema = match (schema, schema_function) {
            (Some(builder), _) => SchemaResolver::from_static(builder)?,
            (None, Some(func)) => SchemaResolver::lazy(func),
            (None, None) => return Err(LoadFault::MissingSchema),
        };

        Ok(Self {
            schema,
            assembler: Assembler::new(context, root_value, root_function),
            proxy,
        })
    }

    pub fn schema(&self) -> &SchemaResolver {
        &self.schema
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    pub fn proxy(&self) -> &ProxyAgentManager {
        &self.proxy
    }
}

/// Outcome of loading a pad. Never changes after load.
#[derive(Clone)]
pub enum LoadState {
    Loaded(Arc<ReadyState>),
    Faulted(Arc<LoadFault>),
}

impl LoadState {
    /// Evaluates the pad module and captures any failure.
    pub fn load<F>(evaluate: F, proxy: ProxyAgentManager) -> Self
    where
        F: FnOnce() -> Result<UserModule, BoxError>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let module = evaluate().map_err(|e| LoadFault::Evaluation(e.to_string()))?;
            ReadyState::new(module, proxy)
        }));

        let state = match outcome {
            Ok(Ok(ready)) => Self::Loaded(Arc::new(ready)),
            Ok(Err(fault)) => Self::Faulted(Arc::new(fault)),
            Err(payload) => Self::Faulted(Arc::new(LoadFault::Panicked(panic_message(
                payload.as_ref(),
            )))),
        };

        match &state {
            Self::Loaded(ready) => info!(lazy = ready.schema.is_lazy(), "pad loaded"),
            Self::Faulted(fault) => error!(code = %fault.code(), "pad failed to load: {}", fault),
        }
        state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn ready(&self) -> Option<&Arc<ReadyState>> {
        match self {
            Self::Loaded(ready) => Some(ready),
            Self::Faulted(_) => None,
        }
    }

    pub fn fault(&self) -> Option<&LoadFault> {
        match self {
            Self::Loaded(_) => None,
            Self::Faulted(fault) => Some(fault),
        }
    }
}

impl std::fmt::Debug for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loaded(_) => f.write_str("Loaded"),
            Self::Faulted(fault) => f.debug_tuple("Faulted").field(fault).finish(),
        }
    }
}
