//! Hook Pipeline (C5): before/after interceptors around every command, with
//! three built-ins (`LoggingHook`, `MetricsHook`, `TracingHook`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error as log_error, info, info_span};

use crate::error::{DriverError, Result};

/// The kind of operation a command belongs to, used for hook bookkeeping
/// and built-in metric buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Query,
    Mutation,
    Ping,
    Other,
}

/// Monotonic counter backing `HookContext::trace_id`, the same idiom the
/// Connection uses for its own sequence numbers.
static TRACE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_trace_id() -> String {
    format!("trc-{}", TRACE_COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// Shared, mutable-by-convention state threaded through one command's
/// before/after pair (§4.5 Data Model). Hooks communicate with each other
/// (and with themselves across the two calls) via `metadata`.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub command: String,
    pub command_type: CommandKind,
    /// Unique per command, independent of registration order.
    pub trace_id: String,
    pub started_at: Instant,
    /// Opaque positional parameters the command was issued with, if any.
    pub params: Vec<String>,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
    /// Populated after the backend responds; empty during `before`.
    pub result: Option<serde_json::Value>,
    /// Populated after the backend responds (or a short-circuit); empty
    /// during `before`.
    pub error: Option<DriverError>,
    /// Populated after the backend responds; empty during `before`.
    pub duration: Option<Duration>,
}

impl HookContext {
    pub fn new(command: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            command: command.into(),
            command_type: kind,
            trace_id: next_trace_id(),
            started_at: Instant::now(),
            params: Vec::new(),
            metadata: std::collections::HashMap::new(),
            result: None,
            error: None,
            duration: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// One interceptor in the pipeline (§4.5). `before` may short-circuit the
/// command by returning `Err`; when it does, `after` still runs for every
/// hook that already ran its `before`, in reverse order, preserving
/// before/after symmetry (invariant I4).
#[async_trait]
pub trait Hook: Send + Sync {
    /// A stable name, used in logs and for `unregister_hook` lookups.
    fn name(&self) -> &str;

    /// Runs before the command is sent. Returning `Err` aborts the command.
    async fn before(&self, _ctx: &mut HookContext) -> Result<()> {
        Ok(())
    }

    /// Runs after the command completes (or after a short-circuit), with
    /// `ctx.result`/`ctx.error`/`ctx.duration` populated by the pipeline.
    /// Hooks run in LIFO order relative to `before` registration and may
    /// mutate `ctx.metadata` to pass data forward (e.g. to a metrics sink).
    async fn after(&self, _ctx: &mut HookContext) {}
}

/// The ordered collection of hooks a [`crate::client::Client`] runs every
/// command through.
#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Appends a hook, run after every previously registered hook's
    /// `before` and before every previously registered hook's `after`.
    /// Rejects a name already registered with `DUPLICATE_HOOK`.
    pub fn register(&mut self, hook: Arc<dyn Hook>) -> Result<()> {
        if self.hooks.iter().any(|h| h.name() == hook.name()) {
            return Err(DriverError::DuplicateHook(hook.name().to_string()));
        }
        self.hooks.push(hook);
        Ok(())
    }

    /// Removes the hook with the given name, if registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.name() != name);
        self.hooks.len() != before
    }

    /// Runs every `before` in registration order, stopping at the first
    /// error. Returns the count of hooks whose `before` was invoked
    /// (including the one that errored), so the caller can run `after` on
    /// exactly that prefix (invariant I4) — a hook whose `before` ran still
    /// gets a matching `after`, even when it's the one that failed.
    pub async fn run_before(&self, ctx: &mut HookContext) -> (usize, Result<()>) {
        for (i, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.before(ctx).await {
                return (i + 1, Err(e));
            }
        }
        (self.hooks.len(), Ok(()))
    }

    /// Runs `after` on the first `ran` hooks, in reverse order.
    pub async fn run_after(&self, ran: usize, ctx: &mut HookContext) {
        for hook in self.hooks[..ran].iter().rev() {
            hook.after(ctx).await;
        }
    }

    /// Runs `before`, then the command `body`, then `after`, preserving
    /// before/after symmetry regardless of where a short-circuit occurs.
    /// `body`'s own errors don't replace the command's outcome for the
    /// caller, but are recorded on `ctx.error` before `after` hooks run.
    pub async fn run<F, Fut>(&self, mut ctx: HookContext, body: F) -> Result<serde_json::Value>
    where
        F: FnOnce(HookContext) -> Fut,
        Fut: std::future::Future<Output = Result<(HookContext, serde_json::Value)>>,
    {
        let (ran, before_result) = self.run_before(&mut ctx).await;
        if let Err(e) = before_result {
            ctx.error = Some(e.clone());
            ctx.duration = Some(ctx.elapsed());
            self.run_after(ran, &mut ctx).await;
            return Err(e);
        }

        // `body` takes `ctx` by value, so a clone is kept on hand to report
        // through on its error path.
        let ctx_for_error = ctx.clone();
        match body(ctx).await {
            Ok((mut ctx, value)) => {
                ctx.result = Some(value.clone());
                ctx.duration = Some(ctx.elapsed());
                self.run_after(ran, &mut ctx).await;
                Ok(value)
            }
            Err(e) => {
                let mut ctx = ctx_for_error;
                ctx.error = Some(e.clone());
                ctx.duration = Some(ctx.elapsed());
                self.run_after(ran, &mut ctx).await;
                Err(e)
            }
        }
    }
}

/// Field names redacted before a command or its metadata is logged.
const REDACTED_FIELDS: &[&str] = &["password", "token", "secret", "authorization", "api_key"];

/// Logs every command at `before` and its outcome at `after`, redacting
/// sensitive substrings from the logged command text. Each of the three
/// log statements can be toggled off independently.
pub struct LoggingHook {
    pub log_commands: bool,
    pub log_results: bool,
    pub log_durations: bool,
}

impl LoggingHook {
    /// All three toggles on, matching the hook's historical behavior.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for LoggingHook {
    fn default() -> Self {
        Self { log_commands: true, log_results: true, log_durations: true }
    }
}

fn redact(command: &str) -> String {
    let mut redacted = command.to_string();
    for field in REDACTED_FIELDS {
        if let Some(pos) = redacted.to_ascii_lowercase().find(field) {
            let tail_start = pos + field.len();
            redacted.replace_range(tail_start.min(redacted.len()).., " [REDACTED]");
        }
    }
    redacted
}

#[async_trait]
impl Hook for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before(&self, ctx: &mut HookContext) -> Result<()> {
        if self.log_commands {
            info!(command = %redact(&ctx.command), kind = ?ctx.command_type, trace_id = %ctx.trace_id, "command starting");
        }
        Ok(())
    }

    async fn after(&self, ctx: &mut HookContext) {
        let command = redact(&ctx.command);
        let elapsed_ms = ctx.duration.unwrap_or_default().as_millis() as u64;
        match &ctx.error {
            None => match (self.log_results, self.log_durations) {
                (true, true) => info!(command = %command, elapsed_ms, "command completed"),
                (true, false) => info!(command = %command, "command completed"),
                (false, true) => info!(command = %command, elapsed_ms, "command duration"),
                (false, false) => {}
            },
            Some(e) => {
                if !self.log_results {
                    return;
                }
                if self.log_durations {
                    log_error!(command = %command, error = %e, elapsed_ms, "command failed");
                } else {
                    log_error!(command = %command, error = %e, "command failed");
                }
            }
        }
    }
}

/// Plain running totals (§4.5): no percentile tracking, just counts and a
/// cumulative duration, matching what the spec's metrics surface actually
/// asks for.
#[derive(Default)]
pub struct MetricsHook {
    total_commands: AtomicU64,
    total_queries: AtomicU64,
    total_mutations: AtomicU64,
    total_errors: AtomicU64,
    total_duration_ns: AtomicU64,
}

/// A snapshot of [`MetricsHook`]'s counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub total_commands: u64,
    pub total_queries: u64,
    pub total_mutations: u64,
    pub total_errors: u64,
    pub avg_duration_ms: f64,
}

impl MetricsHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_commands.load(Ordering::SeqCst);
        let total_ns = self.total_duration_ns.load(Ordering::SeqCst);
        MetricsSnapshot {
            total_commands: total,
            total_queries: self.total_queries.load(Ordering::SeqCst),
            total_mutations: self.total_mutations.load(Ordering::SeqCst),
            total_errors: self.total_errors.load(Ordering::SeqCst),
            avg_duration_ms: if total == 0 {
                0.0
            } else {
                (total_ns as f64 / total as f64) / 1_000_000.0
            },
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.total_commands.store(0, Ordering::SeqCst);
        self.total_queries.store(0, Ordering::SeqCst);
        self.total_mutations.store(0, Ordering::SeqCst);
        self.total_errors.store(0, Ordering::SeqCst);
        self.total_duration_ns.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Hook for MetricsHook {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn before(&self, ctx: &mut HookContext) -> Result<()> {
        self.total_commands.fetch_add(1, Ordering::SeqCst);
        match ctx.command_type {
            CommandKind::Query => {
                self.total_queries.fetch_add(1, Ordering::SeqCst);
            }
            CommandKind::Mutation => {
                self.total_mutations.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        Ok(())
    }

    async fn after(&self, ctx: &mut HookContext) {
        let elapsed = ctx.duration.unwrap_or_else(|| ctx.elapsed());
        self.total_duration_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::SeqCst);
        if ctx.error.is_some() {
            self.total_errors.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Opens a `tracing` span for every command, with `trace_service` as a
/// fixed field and the command's elapsed time recorded at `after`.
pub struct TracingHook {
    service: String,
}

impl TracingHook {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }
}

#[async_trait]
impl Hook for TracingHook {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn before(&self, ctx: &mut HookContext) -> Result<()> {
        let span = info_span!("command", service = %self.service, kind = ?ctx.command_type, trace_id = %ctx.trace_id);
        let _entered = span.enter();
        ctx.metadata.insert("trace_start".to_string(), serde_json::json!(true));
        Ok(())
    }

    async fn after(&self, ctx: &mut HookContext) {
        let duration_ms = ctx.duration.unwrap_or_default().as_millis() as u64;
        ctx.metadata.insert("trace_duration".to_string(), serde_json::json!(duration_ms));
        ctx.metadata.insert("trace_service".to_string(), serde_json::json!(self.service));
        info!(service = %self.service, duration_ms, "trace_duration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingHook {
        name: String,
        log: Arc<AsyncMutex<Vec<String>>>,
        fail_before: bool,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        fn name(&self) -> &str {
            &self.name
        }

        async fn before(&self, _ctx: &mut HookContext) -> Result<()> {
            self.log.lock().await.push(format!("{}:before", self.name));
            if self.fail_before {
                return Err(DriverError::ProtocolViolation("forced failure".to_string()));
            }
            Ok(())
        }

        async fn after(&self, _ctx: &mut HookContext) {
            self.log.lock().await.push(format!("{}:after", self.name));
        }
    }

    #[tokio::test]
    async fn after_runs_in_lifo_order_relative_to_before() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let mut pipeline = HookPipeline::new();
        pipeline.register(Arc::new(RecordingHook { name: "a".into(), log: Arc::clone(&log), fail_before: false })).unwrap();
        pipeline.register(Arc::new(RecordingHook { name: "b".into(), log: Arc::clone(&log), fail_before: false })).unwrap();

        let mut ctx = HookContext::new("STATUS", CommandKind::Ping);
        let (ran, result) = pipeline.run_before(&mut ctx).await;
        assert!(result.is_ok());
        pipeline.run_after(ran, &mut ctx).await;

        assert_eq!(*log.lock().await, vec!["a:before", "b:before", "b:after", "a:after"]);
    }

    #[tokio::test]
    async fn short_circuit_still_runs_after_for_hooks_that_ran_before() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let mut pipeline = HookPipeline::new();
        pipeline.register(Arc::new(RecordingHook { name: "a".into(), log: Arc::clone(&log), fail_before: false })).unwrap();
        pipeline.register(Arc::new(RecordingHook { name: "b".into(), log: Arc::clone(&log), fail_before: true })).unwrap();
        pipeline.register(Arc::new(RecordingHook { name: "c".into(), log: Arc::clone(&log), fail_before: false })).unwrap();

        let mut ctx = HookContext::new("STATUS", CommandKind::Ping);
        let (ran, result) = pipeline.run_before(&mut ctx).await;
        assert!(result.is_err());
        ctx.error = result.err();
        pipeline.run_after(ran, &mut ctx).await;

        // "c" never ran its before, so it must never run after either.
        assert_eq!(*log.lock().await, vec!["a:before", "b:before", "b:after", "a:after"]);
    }

    #[test]
    fn unregister_removes_by_name() {
        let mut pipeline = HookPipeline::new();
        pipeline.register(Arc::new(LoggingHook::new())).unwrap();
        assert!(pipeline.unregister("logging"));
        assert!(!pipeline.unregister("logging"));
    }

    #[test]
    fn redact_masks_password_value() {
        let redacted = redact(r#"{"user":"bob","password":"hunter2"}"#);
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn metrics_hook_tracks_counts_and_errors() {
        let hook = MetricsHook::new();
        let mut ctx = HookContext::new("GET x", CommandKind::Query);
        hook.before(&mut ctx).await.unwrap();
        hook.after(&mut ctx).await;

        let mut ctx2 = HookContext::new("SET x 1", CommandKind::Mutation);
        hook.before(&mut ctx2).await.unwrap();
        ctx2.error = Some(DriverError::ConnectionDead);
        hook.after(&mut ctx2).await;

        let snap = hook.snapshot();
        assert_eq!(snap.total_commands, 2);
        assert_eq!(snap.total_queries, 1);
        assert_eq!(snap.total_mutations, 1);
        assert_eq!(snap.total_errors, 1);
    }

    #[test]
    fn metrics_hook_reset_zeroes_everything() {
        let hook = MetricsHook::new();
        hook.total_commands.fetch_add(5, Ordering::SeqCst);
        hook.reset();
        assert_eq!(hook.snapshot().total_commands, 0);
    }
}
