//! The starter pad every new pad begins from.

use async_graphql::dynamic::{Field, FieldFuture, Object, Schema, SchemaBuilder, TypeRef};
use async_graphql::Value;
use pad_runtime::{BoxError, UserModule};

/// Greeting returned by the `hello` field.
pub const GREETING: &str = "Hello world!";

fn schema() -> SchemaBuilder {
    let query = Object::new("Query").field(Field::new(
        "hello",
        TypeRef::named(TypeRef::STRING),
        |_| FieldFuture::new(async { Ok(Some(Value::from(GREETING))) }),
    ));
    Schema::build("Query", None, None).register(query)
}

/// Evaluates the starter pad: a `hello` schema plus a context of `{headers, secrets}`.
pub fn starter_module() -> Result<UserModule, BoxError> {
    Ok(UserModule::new()
        .schema(schema())
        .context(|headers, secrets| async move {
            Ok(serde_json::json!({
                "headers": headers,
                "secrets": secrets,
            }))
        }))
}
