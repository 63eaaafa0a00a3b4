//! End-to-end tests of the pad pipeline.

use async_graphql::dynamic::{Field, FieldFuture, Object, Schema, SchemaBuilder, TypeRef};
use async_graphql::Value;
use async_trait::async_trait;
use hyper::StatusCode;
use pad_runtime::proxy::ReportBatch;
use pad_runtime::{
    BoxError, Invocation, PadContext, PadResult, PadRuntime, ReportSink, RootValue,
    RuntimeConfig, TenantContext, UserModule,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn hello_schema() -> SchemaBuilder {
    let query = Object::new("Query").field(Field::new(
        "hello",
        TypeRef::named(TypeRef::STRING),
        |_| FieldFuture::new(async { Ok(Some(Value::from("Hello world!"))) }),
    ));
    Schema::build("Query", None, None).register(query)
}

async fn explode() -> async_graphql::Result<Option<Value>> {
    panic!("resolver threw")
}

/// Schema exposing the request context, the root value and failing fields.
fn inspect_schema() -> SchemaBuilder {
    let query = Object::new("Query")
        .field(Field::new("context", TypeRef::named(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let pad = ctx.data::<PadContext>()?;
                Ok(Some(Value::from(pad.0.to_string())))
            })
        }))
        .field(Field::new("root", TypeRef::named(TypeRef::STRING), |ctx| {
            FieldFuture::new(async move {
                let root = ctx.data::<RootValue>()?;
                Ok(Some(Value::from(root.0.to_string())))
            })
        }))
        .field(Field::new("broken", TypeRef::named(TypeRef::STRING), |_| {
            FieldFuture::new(async { Err::<Option<Value>, _>("resolver failed".into()) })
        }))
        .field(Field::new("boom", TypeRef::named(TypeRef::STRING), |_| {
            FieldFuture::new(explode())
        }));
    Schema::build("Query", None, None).register(query)
}

fn load(module: UserModule) -> PadRuntime {
    PadRuntime::load(move || Ok(module), &RuntimeConfig::new())
}

fn user_context(entries: &[(&str, &str)]) -> String {
    let entries: Vec<_> = entries
        .iter()
        .map(|(key, value)| json!({ "key": key, "value": value }))
        .collect();
    serde_json::Value::Array(entries).to_string()
}

fn decode(response: &pad_runtime::PadResponse, field: &str) -> serde_json::Value {
    let text = response.body["data"][field].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}

#[derive(Default)]
struct MemorySink {
    batches: Mutex<Vec<ReportBatch>>,
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn ship(&self, batch: &ReportBatch) -> PadResult<()> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_hello_world() {
    let runtime = load(UserModule::new().schema(hello_schema()));

    let response = runtime.handle(Invocation::query("{ hello }")).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"], json!({ "hello": "Hello world!" }));

    let tracing = &response.body["extensions"]["tracing"];
    assert_eq!(tracing["version"], 1);
    let resolvers = tracing["execution"]["resolvers"].as_array().unwrap();
    assert_eq!(resolvers.len(), 1);
    assert_eq!(resolvers[0]["fieldName"], "hello");
    assert_eq!(resolvers[0]["path"], json!(["hello"]));
}

#[tokio::test]
async fn test_unknown_export_fault_is_stable() {
    let runtime = load(UserModule::new().schema(hello_schema()).export("extra", 1));

    let first = runtime.handle(Invocation::query("{ hello }")).await;
    let second = runtime.handle(Invocation::get("/?query=%7Bhello%7D")).await;

    assert_eq!(first.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(first.body.get("data").is_none());
    assert_eq!(first.body["errors"][0]["message"], "Unknown export: extra");
    assert_eq!(first.error_code(), Some("UNKNOWN_EXPORT"));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_missing_schema_never_executes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let module = UserModule::new().context(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(json!({})) }
    });
    let runtime = load(module);

    let response = runtime.handle(Invocation::query("{ hello }")).await;

    assert!(response.is_fault());
    assert_eq!(response.error_code(), Some("MISSING_SCHEMA"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_first_tenant_decides_lazy_schema() {
    let module = UserModule::new().schema_function(|tenant: TenantContext| async move {
        let owner = tenant.get_str("owner").unwrap_or("nobody").to_string();
        let query = Object::new("Query").field(Field::new(
            "owner",
            TypeRef::named(TypeRef::STRING),
            move |_| {
                let owner = owner.clone();
                FieldFuture::new(async move { Ok(Some(Value::from(owner))) })
            },
        ));
        Ok::<_, BoxError>(Schema::build("Query", None, None).register(query))
    });
    let runtime = load(module);

    let first = runtime
        .handle(Invocation::query("{ owner }").user_context(user_context(&[("owner", "acme")])))
        .await;
    let second = runtime
        .handle(Invocation::query("{ owner }").user_context(user_context(&[("owner", "globex")])))
        .await;

    assert_eq!(first.body["data"]["owner"], "acme");
    assert_eq!(second.body["data"]["owner"], "acme");

    let ready = runtime.state().ready().unwrap();
    assert_eq!(ready.schema().resolve_count(), 1);
}

#[tokio::test]
async fn test_default_context_is_headers_plus_tenant() {
    let runtime = load(UserModule::new().schema(inspect_schema()));

    let response = runtime
        .handle(
            Invocation::query("{ context }")
                .header("Authorization", "Bearer abc")
                .user_context(user_context(&[("db", "pg://x"), ("region", "eu")])),
        )
        .await;

    let context = decode(&response, "context");
    assert_eq!(context["headers"]["authorization"], "Bearer abc");
    assert_eq!(context["headers"]["content-type"], json!(null));
    assert_eq!(context["db"], "pg://x");
    assert_eq!(context["region"], "eu");
    assert_eq!(context.as_object().unwrap().len(), 3);
}

#[tokio::test]
async fn test_root_function_wins() {
    let module = UserModule::new()
        .schema(inspect_schema())
        .root_value(json!({ "source": "value" }))
        .root_function(|headers, _| async move {
            Ok(json!({ "source": "function", "agent": headers.get("user-agent") }))
        });
    let runtime = load(module);

    let response = runtime
        .handle(Invocation::query("{ root }").header("User-Agent", "curl"))
        .await;

    assert_eq!(
        decode(&response, "root"),
        json!({ "source": "function", "agent": "curl" })
    );
}

#[tokio::test]
async fn test_default_root_is_empty_object() {
    let runtime = load(UserModule::new().schema(inspect_schema()));
    let response = runtime.handle(Invocation::query("{ root }")).await;
    assert_eq!(decode(&response, "root"), json!({}));
}

#[tokio::test]
async fn test_proxy_agent_starts_once() {
    let sink = Arc::new(MemorySink::default());
    let runtime = PadRuntime::load_with_sink(
        || Ok(UserModule::new().schema(hello_schema())),
        &RuntimeConfig::new(),
        sink,
    );
    let keyed = user_context(&[
        ("APOLLO_ENGINE_KEY", "service:pad:123"),
        ("url", "https://pad.example/fn"),
    ]);

    let first = runtime
        .handle(Invocation::query("{ hello }").user_context(keyed.clone()))
        .await;
    let second = runtime
        .handle(Invocation::query("{ hello }").user_context(keyed))
        .await;
    let unkeyed = runtime.handle(Invocation::query("{ hello }")).await;

    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(unkeyed.status, StatusCode::OK);

    let proxy = runtime.state().ready().unwrap().proxy();
    assert_eq!(proxy.start_count(), 1);

    let agent = proxy.agent().unwrap();
    assert_eq!(agent.origin(), "https://pad.example/fn");
    assert_eq!(agent.recorded(), 3);
}

#[tokio::test]
async fn test_no_key_no_agent() {
    let runtime = load(UserModule::new().schema(hello_schema()));
    runtime
        .handle(Invocation::query("{ hello }").user_context(user_context(&[("db", "x")])))
        .await;

    let proxy = runtime.state().ready().unwrap().proxy();
    assert_eq!(proxy.start_count(), 0);
    assert!(proxy.agent().is_none());
}

#[tokio::test]
async fn test_panicking_evaluation_faults() {
    let runtime = PadRuntime::load(
        || -> Result<UserModule, BoxError> { panic!("pad threw at import") },
        &RuntimeConfig::new(),
    );

    let response = runtime.handle(Invocation::query("{ hello }")).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.error_code(), Some("EVALUATION_PANICKED"));
    assert!(response.body["errors"][0]["message"]
        .as_str()
        .unwrap()
        .contains("pad threw at import"));
}

#[tokio::test]
async fn test_malformed_secrets_fail_one_request() {
    let runtime = load(UserModule::new().schema(hello_schema()));

    let bad = runtime
        .handle(Invocation::query("{ hello }").user_context("{definitely not a list"))
        .await;
    assert_eq!(bad.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(bad.error_code(), Some("MALFORMED_SECRETS"));

    let good = runtime.handle(Invocation::query("{ hello }")).await;
    assert_eq!(good.status, StatusCode::OK);
    assert_eq!(good.body["data"]["hello"], "Hello world!");
}

#[tokio::test]
async fn test_failed_schema_function_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let module = UserModule::new().schema_function(move |_| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                return Err::<SchemaBuilder, BoxError>("warming up".into());
            }
            Ok(hello_schema())
        }
    });
    let runtime = load(module);

    let first = runtime.handle(Invocation::query("{ hello }")).await;
    assert_eq!(first.error_code(), Some("SCHEMA_RESOLUTION"));
    assert!(first.is_fault());

    let second = runtime.handle(Invocation::query("{ hello }")).await;
    assert_eq!(second.body["data"]["hello"], "Hello world!");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_execution_errors_stay_in_envelope() {
    let runtime = load(UserModule::new().schema(inspect_schema()));
    let response = runtime.handle(Invocation::query("{ broken }")).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["data"]["broken"], json!(null));
    assert_eq!(response.body["errors"][0]["message"], "resolver failed");
    assert!(response.body["extensions"]["tracing"].is_object());
}

#[tokio::test]
async fn test_resolver_panic_becomes_graphql_error() {
    let runtime = load(UserModule::new().schema(inspect_schema()));

    let response = runtime.handle(Invocation::query("{ boom }")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(!response.is_fault());
    assert_eq!(response.body["data"], json!(null));
    assert!(response.body["errors"][0]["message"]
        .as_str()
        .unwrap()
        .contains("resolver threw"));
    assert!(response.body["extensions"]["tracing"].is_object());

    let next = runtime.handle(Invocation::query("{ root }")).await;
    assert_eq!(next.status, StatusCode::OK);
    assert_eq!(decode(&next, "root"), json!({}));
}

#[tokio::test]
async fn test_proxy_origin_from_host_header() {
    let sink = Arc::new(MemorySink::default());
    let runtime = PadRuntime::load_with_sink(
        || Ok(UserModule::new().schema(hello_schema())),
        &RuntimeConfig::new(),
        sink,
    );
    let keyed = user_context(&[("APOLLO_ENGINE_KEY", "service:pad:123")]);
    let proxy = runtime.state().ready().unwrap().proxy();

    let pathless = runtime
        .handle(Invocation::query("{ hello }").user_context(keyed.clone()))
        .await;
    assert_eq!(pathless.status, StatusCode::OK);
    assert!(proxy.agent().is_none());
    assert_eq!(proxy.start_count(), 0);

    let hosted = runtime
        .handle(
            Invocation::new(hyper::Method::POST, "/fn")
                .body("application/json", r#"{"query":"{ hello }"}"#)
                .header("Host", "pad.example")
                .user_context(keyed),
        )
        .await;
    assert_eq!(hosted.status, StatusCode::OK);

    let agent = proxy.agent().unwrap();
    assert_eq!(agent.origin(), "http://pad.example/fn");
    for _ in 0..100 {
        if agent.state() != pad_runtime::proxy::AgentState::Starting {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(agent.state(), pad_runtime::proxy::AgentState::Running);
    assert_eq!(proxy.start_count(), 1);
}

#[tokio::test]
async fn test_context_hook_failure() {
    let module = UserModule::new()
        .schema(hello_schema())
        .context(|_, _| async { Err::<serde_json::Value, BoxError>("no session store".into()) });
    let runtime = load(module);

    let response = runtime.handle(Invocation::query("{ hello }")).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.error_code(), Some("CONTEXT_ASSEMBLY"));
    assert!(response.body.get("data").is_none());
}

#[tokio::test]
async fn test_graphql_body_and_variables() {
    let runtime = load(UserModule::new().schema(hello_schema()));

    let response = runtime
        .handle(
            Invocation::new(hyper::Method::POST, "/").body("application/graphql", "{ hello }"),
        )
        .await;
    assert_eq!(response.body["data"]["hello"], "Hello world!");

    let response = runtime
        .handle(Invocation::post_json(
            "/",
            &json!({ "query": "query Greet { hello }", "operationName": "Greet", "variables": null }),
        ))
        .await;
    assert_eq!(response.body["data"]["hello"], "Hello world!");
}

#[tokio::test]
async fn test_concurrent_requests_share_schema() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let module = UserModule::new().schema_function(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::task::yield_now().await;
            Ok::<_, BoxError>(hello_schema())
        }
    });
    let runtime = Arc::new(load(module));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.handle(Invocation::query("{ hello }")).await })
        })
        .collect();
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.body["data"]["hello"], "Hello world!");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
