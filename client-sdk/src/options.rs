//! Client configuration: `ConnectionOptions`, `PoolOptions`, `TlsOptions`,
//! and the lifecycle callback slots, per §3.

use std::sync::Arc;
use std::time::Duration;

use crate::state::{ClientState, TransitionEvent};

/// Verbosity of the crate's own `tracing` stream (independent of the
/// per-command Logging hook, see §7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Most verbose.
    Debug,
    /// Routine operational events.
    Info,
    /// Recoverable but noteworthy conditions.
    Warn,
    /// Failures.
    Error,
}

impl LogLevel {
    /// The `tracing`/`EnvFilter` directive this level maps to.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// TLS knobs, normally derived from a connection URL's query parameters but
/// constructible directly for callers that build `ConnectionOptions` by hand.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Enables the TLS upgrade after the TCP dial succeeds.
    pub enabled: bool,
    /// PEM-encoded CA bundle path; when absent, the platform trust store is used.
    pub ca_file: Option<String>,
    /// PEM-encoded client certificate path, for mutual TLS.
    pub cert_file: Option<String>,
    /// PEM-encoded private key path matching `cert_file`.
    pub key_file: Option<String>,
    /// Disables certificate verification. Dangerous; development use only.
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    /// Sets `enabled`.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets `ca_file`.
    pub fn with_ca_file(mut self, path: impl Into<String>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Sets `cert_file`/`key_file`.
    pub fn with_client_cert(mut self, cert_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    /// Sets `insecure_skip_verify`.
    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }
}

/// Pool sizing and eviction policy (§3, §4.3).
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Minimum connections kept warm.
    pub min_size: u32,
    /// Hard cap on total connections. `1` selects single-connection mode.
    pub max_size: u32,
    /// How long an idle connection may sit before it is eligible for eviction.
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 1,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl PoolOptions {
    /// Sets `min_size`/`max_size` together.
    pub fn with_size(mut self, min: u32, max: u32) -> Self {
        self.min_size = min;
        self.max_size = max;
        self
    }

    /// Sets `idle_timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Pooling is active only when `max_size > 1`; otherwise the Facade
    /// drives a single Connection directly (§4.3).
    pub fn is_pooled(&self) -> bool {
        self.max_size > 1
    }
}

/// A subscribable lifecycle callback. Cloneable so it can be handed to both
/// the Facade and the Supervisor.
pub type LifecycleCallback = Arc<dyn Fn(&TransitionEvent) + Send + Sync>;

/// Top-level client configuration (§3).
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Per-I/O deadline applied to dial, handshake, send, and receive.
    pub default_timeout: Duration,
    /// Retries attempted on the initial `Connect` before surfacing
    /// `CONNECTION_FAILED`.
    pub max_retries: u32,
    /// Pool sizing/eviction policy.
    pub pool: PoolOptions,
    /// Interval between Supervisor health probes. Zero disables the Supervisor.
    pub health_check_interval: Duration,
    /// Cap on Supervisor reconnect attempts before a terminal disconnect.
    pub max_reconnect_attempts: u32,
    /// TLS configuration.
    pub tls: TlsOptions,
    /// Crate-internal `tracing` verbosity.
    pub log_level: LogLevel,
    /// Enables stack-trace capture on errors and verbose hook tracing.
    pub debug_mode: bool,
    /// Invoked after a successful `CONNECTING -> CONNECTED` transition.
    pub on_connected: Option<LifecycleCallback>,
    /// Invoked after a `DISCONNECTING -> DISCONNECTED` transition.
    pub on_disconnected: Option<LifecycleCallback>,
    /// Invoked when the Supervisor begins a reconnect attempt.
    pub on_reconnecting: Option<LifecycleCallback>,
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("default_timeout", &self.default_timeout)
            .field("max_retries", &self.max_retries)
            .field("pool", &self.pool)
            .field("health_check_interval", &self.health_check_interval)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("log_level", &self.log_level)
            .field("debug_mode", &self.debug_mode)
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(10_000),
            max_retries: 3,
            pool: PoolOptions::default(),
            health_check_interval: Duration::ZERO,
            max_reconnect_attempts: 5,
            tls: TlsOptions::default(),
            log_level: LogLevel::default(),
            debug_mode: false,
            on_connected: None,
            on_disconnected: None,
            on_reconnecting: None,
        }
    }
}

impl ConnectionOptions {
    /// Sets `default_timeout`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets `max_retries`.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets `pool`.
    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    /// Sets `health_check_interval`.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets `max_reconnect_attempts`.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets `tls`.
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Sets `log_level`.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets `debug_mode`.
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Registers `on_connected`.
    pub fn on_connected(mut self, cb: impl Fn(&TransitionEvent) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(cb));
        self
    }

    /// Registers `on_disconnected`.
    pub fn on_disconnected(mut self, cb: impl Fn(&TransitionEvent) + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(cb));
        self
    }

    /// Registers `on_reconnecting`.
    pub fn on_reconnecting(mut self, cb: impl Fn(&TransitionEvent) + Send + Sync + 'static) -> Self {
        self.on_reconnecting = Some(Arc::new(cb));
        self
    }

    /// Applies TLS query parameters parsed from a connection URL, as
    /// `Connect(url)` does internally (§4.7).
    pub fn merge_url_tls(mut self, params: &crate::url::UrlParams) -> Self {
        self.tls.enabled = params.tls;
        self.tls.ca_file = params.tls_ca_file.clone();
        self.tls.cert_file = params.tls_cert_file.clone();
        self.tls.key_file = params.tls_key_file.clone();
        self.tls.insecure_skip_verify = params.tls_insecure_skip_verify;
        self
    }

    /// Resolves an effective per-call deadline: `timeout_ms == 0` means
    /// "use `default_timeout`" (§4.7).
    pub fn effective_timeout(&self, timeout_ms: u64) -> Duration {
        if timeout_ms == 0 {
            self.default_timeout
        } else {
            Duration::from_millis(timeout_ms)
        }
    }
}

/// Snapshot returned by `GetDebugInfo()` (§4.7).
#[derive(Debug, Clone, serde::Serialize)]
pub struct DebugInfo {
    /// Current client state.
    pub state: ClientState,
    /// Pool counters, when pooled.
    pub pool_stats: Option<crate::pool::PoolStats>,
    /// Single-connection liveness, when not pooled.
    pub connection_alive: Option<bool>,
    /// The most recent transition event, if any has occurred.
    pub last_transition: Option<TransitionEvent>,
    /// `true` when `max_size > 1`.
    pub pooled: bool,
    /// The options the client is currently running with. Not serialized:
    /// it carries lifecycle callbacks, which aren't representable as JSON.
    #[serde(skip)]
    pub options: ConnectionOptions,
}
