//! Per-request execution tracing in the Apollo tracing format (version 1).
//!
//! A [`TraceCollector`] is created for every request and attached to the request data. The
//! schema-level [`TracingExtension`] looks it up while fields resolve and records one entry per
//! resolver. After execution the pipeline ends the collector and merges [`TraceCollector::format`]
//! into the response `extensions`.

use async_graphql::extensions::{
    Extension, ExtensionContext, ExtensionFactory, NextResolve, ResolveInfo,
};
use async_graphql::{ServerResult, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Key of the tracing entry in the response `extensions`.
pub const TRACING_KEY: &str = "tracing";

/// Version of the tracing format.
pub const TRACING_VERSION: u32 = 1;

/// Timing of a single resolver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverTrace {
    pub path: Vec<serde_json::Value>,
    pub parent_type: String,
    pub field_name: String,
    pub return_type: String,
    /// Nanoseconds since the request started.
    pub start_offset: u64,
    /// Nanoseconds.
    pub duration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Finished,
}

#[derive(Debug)]
struct TraceRecord {
    phase: Phase,
    start_wall: DateTime<Utc>,
    start: Instant,
    end_wall: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    resolvers: Vec<ResolverTrace>,
}

impl TraceRecord {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            start_wall: Utc::now(),
            start: Instant::now(),
            end_wall: None,
            duration: None,
            resolvers: Vec::new(),
        }
    }
}

/// Collects the trace of one request.
#[derive(Debug, Clone)]
pub struct TraceCollector {
    inner: Arc<Mutex<TraceRecord>>,
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TraceRecord::new())),
        }
    }

    fn record(&self) -> MutexGuard<'_, TraceRecord> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Begins collection. Restarting a running collector resets its clock.
    pub fn start(&self) {
        let mut record = self.record();
        record.phase = Phase::Running;
        record.start_wall = Utc::now();
        record.start = Instant::now();
        record.end_wall = None;
        record.duration = None;
        record.resolvers.clear();
    }

    /// Finalizes the record. Later calls keep the first end time.
    pub fn end(&self) {
        let mut record = self.record();
        if record.phase == Phase::Finished {
            return;
        }
        record.phase = Phase::Finished;
        record.end_wall = Some(Utc::now());
        record.duration = Some(record.start.elapsed());
    }

    /// Time elapsed since [`start`](Self::start).
    pub fn elapsed(&self) -> Duration {
        let record = self.record();
        record.duration.unwrap_or_else(|| record.start.elapsed())
    }

    /// Wall-clock start of the request.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.record().start_wall
    }

    /// Nanoseconds between the request start and `at`.
    fn offset_of(&self, at: Instant) -> u64 {
        nanos(at.saturating_duration_since(self.record().start))
    }

    fn push(&self, trace: ResolverTrace) {
        let mut record = self.record();
        if record.phase == Phase::Running {
            record.resolvers.push(trace);
        }
    }

    /// Returns the extension key and its payload.
    pub fn format(&self) -> (String, serde_json::Value) {
        let record = self.record();
        let duration = record.duration.unwrap_or_else(|| record.start.elapsed());
        let end_wall = record.end_wall.unwrap_or_else(Utc::now);

        let payload = serde_json::json!({
            "version": TRACING_VERSION,
            "startTime": record.start_wall.to_rfc3339_opts(SecondsFormat::Millis, true),
            "endTime": end_wall.to_rfc3339_opts(SecondsFormat::Millis, true),
            "duration": nanos(duration),
            "execution": {
                "resolvers": record.resolvers,
            },
        });

        (TRACING_KEY.to_string(), payload)
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Path segments as JSON: list indices become numbers.
fn path_segments(info: &ResolveInfo<'_>) -> Vec<serde_json::Value> {
    info.path_node
        .to_string_vec()
        .into_iter()
        .map(|segment| match segment.parse::<u64>() {
            Ok(index) => serde_json::Value::from(index),
            Err(_) => serde_json::Value::String(segment),
        })
        .collect()
}

/// Schema extension that feeds resolver timings into the request's [`TraceCollector`].
///
/// Requests without a collector in their data are not traced.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingExtension;

impl ExtensionFactory for TracingExtension {
    fn create(&self) -> Arc<dyn Extension> {
        Arc::new(TracingExtensionImpl)
    }
}

struct TracingExtensionImpl;

#[async_trait::async_trait]
impl Extension for TracingExtensionImpl {
    async fn resolve(
        &self,
        ctx: &ExtensionContext<'_>,
        info: ResolveInfo<'_>,
        next: NextResolve<'_>,
    ) -> ServerResult<Option<Value>> {
        let Some(collector) = ctx.data_opt::<TraceCollector>() else {
            return next.run(ctx, info).await;
        };
        if info.is_for_introspection {
            return next.run(ctx, info).await;
        }

        let path = path_segments(&info);
        let parent_type = info.parent_type.to_string();
        let field_name = info.name.to_string();
        let return_type = info.return_type.to_string();

        let started = Instant::now();
        let result = next.run(ctx, info).await;

        collector.push(ResolverTrace {
            path,
            parent_type,
            field_name,
            return_type,
            start_offset: collector.offset_of(started),
            duration: nanos(started.elapsed()),
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_graphql::dynamic::{Field, FieldFuture, Object, Schema, TypeRef};

    fn traced_schema() -> Schema {
        let query = Object::new("Query")
            .field(Field::new(
                "hello",
                TypeRef::named(TypeRef::STRING),
                |_| FieldFuture::new(async { Ok(Some(Value::from("Hello world!"))) }),
            ))
            .field(Field::new(
                "numbers",
                TypeRef::named_list(TypeRef::INT),
                |_| {
                    FieldFuture::new(async {
                        Ok(Some(Value::List(vec![Value::from(1), Value::from(2)])))
                    })
                },
            ));
        Schema::build("Query", None, None)
            .register(query)
            .extension(TracingExtension)
            .finish()
            .unwrap()
    }

    #[test]
    fn test_format_shape() {
        let collector = TraceCollector::new();
        collector.start();
        collector.end();

        let (key, payload) = collector.format();
        assert_eq!(key, TRACING_KEY);
        assert_eq!(payload["version"], 1);
        assert!(payload["startTime"].is_string());
        assert!(payload["endTime"].is_string());
        assert!(payload["duration"].is_u64());
        assert_eq!(payload["execution"]["resolvers"], serde_json::json!([]));
    }

    #[test]
    fn test_end_is_idempotent() {
        let collector = TraceCollector::new();
        collector.start();
        assert_eq!(collector.record().phase, Phase::Running);
        collector.end();
        let first = collector.format().1["endTime"].clone();
        let elapsed = collector.elapsed();
        collector.end();
        assert_eq!(collector.format().1["endTime"], first);
        assert_eq!(collector.elapsed(), elapsed);
        assert!(collector.started_at() <= Utc::now());
        assert_eq!(collector.record().phase, Phase::Finished);
    }

    #[test]
    fn test_idle_collector_ignores_resolvers() {
        let collector = TraceCollector::new();
        collector.push(ResolverTrace {
            path: vec![],
            parent_type: "Query".into(),
            field_name: "hello".into(),
            return_type: "String".into(),
            start_offset: 0,
            duration: 0,
        });
        assert!(collector.record().resolvers.is_empty());
    }

    #[tokio::test]
    async fn test_extension_records_resolvers() {
        let schema = traced_schema();
        let collector = TraceCollector::new();
        collector.start();

        let request = async_graphql::Request::new("{ hello numbers }").data(collector.clone());
        let response = schema.execute(request).await;
        assert!(response.errors.is_empty());
        collector.end();

        let (_, payload) = collector.format();
        let resolvers = payload["execution"]["resolvers"].as_array().unwrap();
        let hello = resolvers
            .iter()
            .find(|r| r["fieldName"] == "hello")
            .expect("hello resolver traced");
        assert_eq!(hello["parentType"], "Query");
        assert_eq!(hello["returnType"], "String");
        assert_eq!(hello["path"], serde_json::json!(["hello"]));
        assert!(resolvers.iter().any(|r| r["fieldName"] == "numbers"));
    }

    #[tokio::test]
    async fn test_requests_without_collector_run_untraced() {
        let schema = traced_schema();
        let response = schema.execute("{ hello }").await;
        assert!(response.errors.is_empty());
        assert!(response.extensions.is_empty());
    }
}
