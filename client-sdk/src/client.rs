//! Client Facade (C7): the thin coordinator wiring Options, the State
//! Machine, the Pool-or-Connection backend, the Hook Pipeline, and the
//! Supervisor into the public API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::connection::{dial, CommandResponse};
use crate::error::{DriverError, Result};
use crate::hooks::{CommandKind, Hook, HookContext, HookPipeline};
use crate::options::{ConnectionOptions, DebugInfo, LifecycleCallback};
use crate::pool::Pool;
use crate::state::{ClientState, StateMachine};
use crate::statement::Statement;
use crate::supervisor::{self, Backend, Supervised, SupervisorHandle};
use crate::transaction::Transaction;
use crate::url::ParsedUrl;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide `tracing` subscriber exactly once, even across
/// multiple independent `Client`s in the same process (§7.1).
fn initialize_logging(options: &ConnectionOptions) {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(options.log_level.as_filter_directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Builds a [`Client`] from static configuration, before any URL is known.
pub struct ClientBuilder {
    options: ConnectionOptions,
    hooks: Vec<Arc<dyn Hook>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            options: ConnectionOptions::default(),
            hooks: Vec::new(),
        }
    }

    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers a hook, run in the order added (§4.5).
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> Client {
        Client {
            options: Mutex::new(self.options),
            state: Arc::new(StateMachine::new()),
            hooks: Mutex::new({
                let mut pipeline = HookPipeline::new();
                for hook in self.hooks {
                    // First registration of a given name wins; later
                    // duplicates are dropped rather than panicking the
                    // builder.
                    let _ = pipeline.register(hook);
                }
                pipeline
            }),
            supervised: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The public entry point (§4.7). Every method takes `&self` and
/// internally serializes through the state machine and backend mutexes, so
/// a `Client` is typically held behind an `Arc` and shared across tasks.
pub struct Client {
    options: Mutex<ConnectionOptions>,
    state: Arc<StateMachine>,
    hooks: Mutex<HookPipeline>,
    supervised: Mutex<Option<Arc<Supervised>>>,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Parses `url`, builds TLS options from its query parameters,
    /// initializes the backend (single Connection or Pool), drives
    /// `DISCONNECTED -> CONNECTING -> CONNECTED`, and starts the Supervisor
    /// when `healthCheckInterval > 0`.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let parsed = ParsedUrl::parse(url)?;

        let mut options = self.options.lock().await.clone();
        options = options.merge_url_tls(&parsed.params);
        initialize_logging(&options);

        self.state.transition(ClientState::Connecting, None, None).await?;

        let address = parsed.address();
        let backend_result = if options.pool.is_pooled() {
            Pool::new(&address, url, options.tls.clone(), options.pool.clone(), options.default_timeout)
                .await
                .map(Backend::Pooled)
        } else {
            dial(&address, &options.tls, url, options.default_timeout)
                .await
                .map(|conn| Backend::Single(Arc::new(conn)))
        };

        let backend = match backend_result {
            Ok(backend) => backend,
            Err(e) => {
                self.state
                    .transition(ClientState::Disconnected, Some(e.to_string()), None)
                    .await?;
                return Err(e);
            }
        };

        let supervised = Arc::new(Supervised {
            address,
            handshake_url: url.to_string(),
            tls: options.tls.clone(),
            pool_options: options.pool.clone(),
            default_timeout: options.default_timeout,
            backend: Mutex::new(backend),
            state: Arc::clone(&self.state),
        });

        *self.supervised.lock().await = Some(Arc::clone(&supervised));
        *self.options.lock().await = options.clone();

        self.state.transition(ClientState::Connected, None, None).await?;
        if let Some(cb) = &options.on_connected {
            cb(&self.state.last_transition().await.unwrap());
        }

        if options.health_check_interval > Duration::ZERO {
            let handle = supervisor::spawn(
                supervised,
                options.health_check_interval,
                options.max_reconnect_attempts,
                options.on_connected.clone(),
                options.on_reconnecting.clone(),
            );
            *self.supervisor.lock().await = Some(handle);
        }

        Ok(())
    }

    /// Tears down the Supervisor (if running), transitions through
    /// `DISCONNECTING`, and closes the backend. A second call while already
    /// `Disconnected` is a tolerated no-op rather than an `IllegalTransition`.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state.current().await == ClientState::Disconnected {
            return Ok(());
        }
        self.state.transition(ClientState::Disconnecting, None, None).await?;

        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.stop().await;
        }

        if let Some(supervised) = self.supervised.lock().await.take() {
            let backend = supervised.backend.lock().await;
            match &*backend {
                Backend::Single(conn) => conn.close().await,
                Backend::Pooled(pool) => pool.close(Duration::from_secs(5)).await,
            }
        }

        let options = self.options.lock().await.clone();
        self.state.transition(ClientState::Disconnected, None, None).await?;
        if let Some(cb) = &options.on_disconnected {
            cb(&self.state.last_transition().await.unwrap());
        }
        Ok(())
    }

    /// Runs `command` through the Hook Pipeline and the backend, resolving
    /// the effective deadline as `timeout_ms == 0` meaning `defaultTimeoutMs`.
    async fn run_command(&self, command: &str, kind: CommandKind, timeout_ms: u64) -> Result<serde_json::Value> {
        self.state.require_io_allowed().await?;
        let deadline = self.options.lock().await.effective_timeout(timeout_ms);

        let hooks = self.hooks.lock().await.clone();
        let ctx = HookContext::new(command, kind);

        hooks
            .run(ctx, move |ctx| {
                let command = ctx.command.clone();
                async move {
                    let response = self.send_and_receive(&command, deadline).await?;
                    Ok((ctx, response))
                }
            })
            .await
    }

    async fn current_backend_connection(&self, deadline: Duration) -> Result<BackendConnection> {
        let supervised = match self.supervised.lock().await.clone() {
            Some(supervised) => supervised,
            None => {
                return Err(DriverError::NotConnected {
                    state: self.state.current().await.to_string(),
                })
            }
        };
        let backend = supervised.backend.lock().await;
        match &*backend {
            Backend::Single(conn) => Ok(BackendConnection::Single(Arc::clone(conn))),
            Backend::Pooled(pool) => {
                let pool = pool.clone();
                drop(backend);
                let conn = pool.acquire(deadline).await?;
                Ok(BackendConnection::Pooled(conn))
            }
        }
    }

    async fn send_and_receive(&self, command: &str, deadline: Duration) -> Result<serde_json::Value> {
        let conn = self.current_backend_connection(deadline).await?;
        conn.send(command, deadline).await?;
        to_value(conn.receive(deadline).await?)
    }

    /// Read-style command (§4.7). Goes through the full Hook Pipeline.
    pub async fn query(&self, command: &str, timeout_ms: u64) -> Result<serde_json::Value> {
        self.run_command(command, CommandKind::Query, timeout_ms).await
    }

    /// Write-style command (§4.7). Goes through the full Hook Pipeline.
    pub async fn mutate(&self, command: &str, timeout_ms: u64) -> Result<serde_json::Value> {
        self.run_command(command, CommandKind::Mutation, timeout_ms).await
    }

    /// Bypasses user-registered hooks per §4.7, running only through the
    /// backend directly (built-in metrics/tracing hooks are registered like
    /// any other hook in this design, so a host that wants `Ping` excluded
    /// from its own audit hook should check `ctx.command_type` inside that hook).
    pub async fn ping(&self) -> Result<()> {
        self.state.require_io_allowed().await?;
        let deadline = self.options.lock().await.default_timeout;
        let conn = self.current_backend_connection(deadline).await?;
        conn.ping(deadline).await
    }

    /// Returns an opaque handle bound to the command text and its fixed
    /// parameter count (§9). Execution still goes through the Hook Pipeline.
    pub fn prepare(&self, command: &str, param_count: usize) -> Statement {
        Statement::new(command, param_count)
    }

    /// Pins one Connection for the transaction's lifetime (§9): a checked-out
    /// pooled Connection in pooled mode, or the sole Connection in
    /// single-connection mode.
    pub async fn begin(&self) -> Result<Transaction> {
        self.state.require_io_allowed().await?;
        let deadline = self.options.lock().await.default_timeout;
        match self.current_backend_connection(deadline).await? {
            BackendConnection::Pooled(conn) => Ok(Transaction::new_pooled(conn)),
            BackendConnection::Single(conn) => Ok(Transaction::new_single(conn)),
        }
    }

    /// Registers a hook, rejecting a name already registered with
    /// `DUPLICATE_HOOK`.
    pub async fn register_hook(&self, hook: Arc<dyn Hook>) -> Result<()> {
        self.hooks.lock().await.register(hook)
    }

    pub async fn unregister_hook(&self, name: &str) -> bool {
        self.hooks.lock().await.unregister(name)
    }

    /// Atomically snapshots state, pool/connection stats, the last
    /// transition, and effective options (§4.7).
    pub async fn get_debug_info(&self) -> DebugInfo {
        let state = self.state.current().await;
        let last_transition = self.state.last_transition().await;
        let supervised = self.supervised.lock().await.clone();
        let options = self.options.lock().await.clone();

        let (pool_stats, connection_alive, pooled) = match &supervised {
            Some(s) => {
                let backend = s.backend.lock().await;
                match &*backend {
                    Backend::Pooled(pool) => (Some(pool.stats()), None, true),
                    Backend::Single(conn) => (None, Some(conn.is_alive()), false),
                }
            }
            None => (None, None, false),
        };

        DebugInfo {
            state,
            pool_stats,
            connection_alive,
            last_transition,
            pooled,
            options,
        }
    }

    pub async fn get_state(&self) -> ClientState {
        self.state.current().await
    }

    /// Subscribes to every future transition, in addition to whatever
    /// `on_connected`/`on_disconnected`/`on_reconnecting` callbacks were set
    /// on `ConnectionOptions`.
    pub async fn on_state_change(&self, callback: LifecycleCallback) {
        self.state.subscribe(callback).await;
    }
}

/// Either side of the backend, erased behind a common send/receive/ping
/// surface so the command-execution paths don't need to match twice.
enum BackendConnection {
    Single(Arc<crate::connection::Connection>),
    Pooled(crate::pool::PooledConnection),
}

impl std::ops::Deref for BackendConnection {
    type Target = crate::connection::Connection;
    fn deref(&self) -> &crate::connection::Connection {
        match self {
            BackendConnection::Single(conn) => conn,
            BackendConnection::Pooled(conn) => conn,
        }
    }
}

fn to_value(response: CommandResponse) -> Result<serde_json::Value> {
    match response {
        CommandResponse::Structured(v) => {
            // `success` is checked before anything else is unwrapped, so a
            // response carrying both `success: false` and a `data` field
            // still surfaces as a SERVER_ERROR instead of silently handing
            // back `data` as if the command had succeeded.
            if let Some(success) = v.get("success").and_then(|s| s.as_bool()) {
                if !success {
                    return Err(DriverError::ServerError {
                        message: v.get("error").and_then(|e| e.as_str()).unwrap_or("server error").to_string(),
                        details: v,
                    });
                }
            }
            match v.get("data") {
                Some(data) => Ok(data.clone()),
                None => Ok(v),
            }
        }
        CommandResponse::Raw(line) => Ok(serde_json::json!(line)),
        CommandResponse::Greeting(line) => Ok(serde_json::json!(line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_client_starts_disconnected() {
        let client = Client::builder().build();
        assert_eq!(client.get_state().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn commands_before_connect_fail_not_connected() {
        let client = Client::builder().build();
        let err = client.query("GET x", 0).await.unwrap_err();
        assert!(matches!(err, DriverError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn connect_rejects_malformed_url() {
        let client = Client::builder().build();
        let err = client.connect("not-a-url").await.unwrap_err();
        assert!(matches!(err, DriverError::ProtocolViolation(_)));
        assert_eq!(client.get_state().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn hook_registration_round_trips() {
        let client = Client::builder().build();
        client.register_hook(Arc::new(crate::hooks::LoggingHook::new())).await.unwrap();
        assert!(client.unregister_hook("logging").await);
        assert!(!client.unregister_hook("logging").await);
    }

    #[tokio::test]
    async fn registering_a_duplicate_hook_name_fails() {
        let client = Client::builder().build();
        client.register_hook(Arc::new(crate::hooks::LoggingHook::new())).await.unwrap();
        let err = client.register_hook(Arc::new(crate::hooks::LoggingHook::new())).await.unwrap_err();
        assert!(matches!(err, DriverError::DuplicateHook(name) if name == "logging"));
    }

    #[tokio::test]
    async fn debug_info_before_connect_has_no_backend() {
        let client = Client::builder().build();
        let info = client.get_debug_info().await;
        assert_eq!(info.state, ClientState::Disconnected);
        assert!(info.pool_stats.is_none());
        assert!(info.connection_alive.is_none());
    }
}
