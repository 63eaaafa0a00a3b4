//! The export surface of a pad and its validation.
//!
//! A pad exports a schema (or a function producing one) plus optional hooks for building the
//! per-request context and root value. Any export outside [`ALLOWED_EXPORTS`] is rejected when
//! the pad is loaded.
//!
//! # Example
//!
//! ```
//! use async_graphql::dynamic::{Field, FieldFuture, Object, Schema, TypeRef};
//! use async_graphql::Value;
//! use pad_runtime::UserModule;
//!
//! let query = Object::new("Query").field(Field::new(
//!     "hello",
//!     TypeRef::named(TypeRef::STRING),
//!     |_| FieldFuture::new(async { Ok(Some(Value::from("Hello world!"))) }),
//! ));
//!
//! let module = UserModule::new().schema(Schema::build("Query", None, None).register(query));
//! assert!(module.validate().is_ok());
//! ```

use crate::assemble::Headers;
use crate::error::{BoxError, LoadFault};
use crate::tenant::TenantContext;
use async_graphql::dynamic::SchemaBuilder;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Export names a pad may define.
pub const ALLOWED_EXPORTS: [&str; 6] = [
    "default",
    "schema",
    "schemaFunction",
    "context",
    "rootValue",
    "rootFunction",
];

/// Lazily produces the schema from the tenant context.
pub type SchemaFn =
    Arc<dyn Fn(TenantContext) -> BoxFuture<'static, Result<SchemaBuilder, BoxError>> + Send + Sync>;

/// Produces a JSON value from request headers and the tenant context.
pub type ValueFn = Arc<
    dyn Fn(Headers, TenantContext) -> BoxFuture<'static, Result<serde_json::Value, BoxError>>
        + Send
        + Sync,
>;

/// Wraps an async closure as a [`SchemaFn`].
pub fn schema_fn<F, Fut>(func: F) -> SchemaFn
where
    F: Fn(TenantContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SchemaBuilder, BoxError>> + Send + 'static,
{
    Arc::new(
        move |tenant| -> BoxFuture<'static, Result<SchemaBuilder, BoxError>> {
            Box::pin(func(tenant))
        },
    )
}

/// Wraps an async closure as a [`ValueFn`].
pub fn value_fn<F, Fut>(func: F) -> ValueFn
where
    F: Fn(Headers, TenantContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
{
    Arc::new(
        move |headers, tenant| -> BoxFuture<'static, Result<serde_json::Value, BoxError>> {
            Box::pin(func(headers, tenant))
        },
    )
}

/// The exports of a pad.
#[derive(Default)]
pub struct UserModule {
    pub(crate) schema: Option<SchemaBuilder>,
    pub(crate) schema_function: Option<SchemaFn>,
    pub(crate) context: Option<ValueFn>,
    pub(crate) root_value: Option<serde_json::Value>,
    pub(crate) root_function: Option<ValueFn>,
    pub(crate) default: Option<serde_json::Value>,
    pub(crate) extra: IndexMap<String, serde_json::Value>,
}

impl UserModule {
    /// Creates a module with no exports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports a static schema.
    pub fn schema(mut self, schema: SchemaBuilder) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Exports a function that builds the schema from the tenant context.
    pub fn schema_function<F, Fut>(mut self, func: F) -> Self
    where
        F: Fn(TenantContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SchemaBuilder, BoxError>> + Send + 'static,
    {
        self.schema_function = Some(schema_fn(func));
        self
    }

    /// Exports a function that builds the GraphQL context.
    pub fn context<F, Fut>(mut self, func: F) -> Self
    where
        F: Fn(Headers, TenantContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
    {
        self.context = Some(value_fn(func));
        self
    }

    /// Exports a static root value.
    pub fn root_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.root_value = Some(value.into());
        self
    }

    /// Exports a function that builds the root value. Takes precedence over `rootValue`.
    pub fn root_function<F, Fut>(mut self, func: F) -> Self
    where
        F: Fn(Headers, TenantContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
    {
        self.root_function = Some(value_fn(func));
        self
    }

    /// Exports a plain value by name.
    ///
    /// `rootValue` and `default` land in their own slots. Every other name is kept as an
    /// opaque export, which validation rejects: unknown names as unknown exports, and the
    /// schema or function slots as invalid exports.
    pub fn export(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match name.as_str() {
            "rootValue" => self.root_value = Some(value),
            "default" => self.default = Some(value),
            _ => {
                self.extra.insert(name, value);
            }
        }
        self
    }

    /// Names of every present export, declared slots first.
    pub fn export_names(&self) -> Vec<&str> {
        let declared = [
            ("schema", self.schema.is_some()),
            ("schemaFunction", self.schema_function.is_some()),
            ("context", self.context.is_some()),
            ("rootValue", self.root_value.is_some()),
            ("rootFunction", self.root_function.is_some()),
            ("default", self.default.is_some()),
        ];

        declared
            .into_iter()
            .filter_map(|(name, present)| present.then_some(name))
            .chain(self.extra.keys().map(String::as_str))
            .collect()
    }

    /// Returns true if the module can produce a schema.
    pub fn has_schema(&self) -> bool {
        self.schema.is_some() || self.schema_function.is_some()
    }

    /// Checks the export surface.
    ///
    /// Unknown exports are reported first, then plain values in schema or function slots,
    /// then a missing schema.
    pub fn validate(&self) -> Result<(), LoadFault> {
        validate_exports(self.export_names())?;
        if let Some(name) = self
            .extra
            .keys()
            .find(|name| ALLOWED_EXPORTS.contains(&name.as_str()))
        {
            return Err(LoadFault::InvalidExport(name.clone()));
        }
        if !self.has_schema() {
            return Err(LoadFault::MissingSchema);
        }
        Ok(())
    }
}

impl fmt::Debug for UserModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserModule")
            .field("exports", &self.export_names())
            .finish()
    }
}

/// Fails with the first export name outside [`ALLOWED_EXPORTS`].
pub fn validate_exports<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<(), LoadFault> {
    match names
        .into_iter()
        .find(|name| !ALLOWED_EXPORTS.contains(name))
    {
        Some(unknown) => Err(LoadFault::UnknownExport(unknown.to_string())),
        None => Ok(()),
    }
}
