//! Health & Reconnection Supervisor (C6): periodic liveness probes and
//! exponential-backoff reconnect, running only while the client is
//! `CONNECTED` and `healthCheckInterval > 0`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::connection::{dial, Connection};
use crate::options::{LifecycleCallback, PoolOptions, TlsOptions};
use crate::pool::Pool;
use crate::state::{ClientState, StateMachine};

/// Whichever transport backend a [`crate::client::Client`] is currently
/// driving. The Supervisor swaps this out wholesale on reconnect.
pub enum Backend {
    Single(Arc<Connection>),
    Pooled(Pool),
}

/// Everything the Supervisor needs to probe and rebuild the backend,
/// shared with the owning [`crate::client::Client`].
pub struct Supervised {
    pub address: String,
    pub handshake_url: String,
    pub tls: TlsOptions,
    pub pool_options: PoolOptions,
    pub default_timeout: Duration,
    pub backend: Mutex<Backend>,
    pub state: Arc<StateMachine>,
}

/// A handle to a running Supervisor task. Dropping or calling
/// [`SupervisorHandle::stop`] cancels both the probe loop and any in-flight
/// reconnect backoff sleep.
pub struct SupervisorHandle {
    join: tokio::task::JoinHandle<()>,
    cancel: Arc<Notify>,
}

impl SupervisorHandle {
    /// Cancels the Supervisor. Safe to call from the `Disconnect` path even
    /// mid-backoff (§4.6 Cancellation).
    pub async fn stop(self) {
        self.cancel.notify_waiters();
        let _ = self.join.await;
    }
}

/// Starts the background probe/reconnect loop described in §4.6.
pub fn spawn(
    supervised: Arc<Supervised>,
    health_check_interval: Duration,
    max_reconnect_attempts: u32,
    on_connected: Option<LifecycleCallback>,
    on_reconnecting: Option<LifecycleCallback>,
) -> SupervisorHandle {
    let cancel = Arc::new(Notify::new());
    let cancel_for_task = Arc::clone(&cancel);

    let join = tokio::spawn(async move {
        run(
            supervised,
            health_check_interval,
            max_reconnect_attempts,
            on_connected,
            on_reconnecting,
            cancel_for_task,
        )
        .await;
    });

    SupervisorHandle { join, cancel }
}

async fn run(
    supervised: Arc<Supervised>,
    health_check_interval: Duration,
    max_reconnect_attempts: u32,
    on_connected: Option<LifecycleCallback>,
    on_reconnecting: Option<LifecycleCallback>,
    cancel: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(health_check_interval);
    loop {
        tokio::select! {
            _ = cancel.notified() => return,
            _ = ticker.tick() => {}
        }

        if supervised.state.current().await != ClientState::Connected {
            continue;
        }

        match probe(&supervised).await {
            Ok(()) => continue,
            Err(e) if !e.is_fatal_to_connection() => {
                warn!(error = %e, "supervisor probe reported a server error, not reconnecting");
                continue;
            }
            Err(e) => {
                info!(error = %e, "supervisor probe failed, starting reconnect");
                let terminal = reconnect(
                    &supervised,
                    max_reconnect_attempts,
                    &on_connected,
                    &on_reconnecting,
                    &cancel,
                )
                .await;
                if terminal {
                    return;
                }
            }
        }
    }
}

/// Issues one ping through the normal Connection path. `Ok(None)` from a
/// pool with no idle connection counts as a healthy skip.
async fn probe(supervised: &Supervised) -> crate::error::Result<()> {
    let backend = supervised.backend.lock().await;
    match &*backend {
        Backend::Single(conn) => conn.ping(supervised.default_timeout).await,
        Backend::Pooled(pool) => match pool.probe_idle(supervised.default_timeout).await {
            Some(result) => result,
            None => Ok(()),
        },
    }
}

/// Runs the backoff-and-reopen loop. Returns `true` when the Supervisor
/// gave up permanently (`DISCONNECTED` with a terminal error) and should
/// stop running entirely.
async fn reconnect(
    supervised: &Supervised,
    max_reconnect_attempts: u32,
    on_connected: &Option<LifecycleCallback>,
    on_reconnecting: &Option<LifecycleCallback>,
    cancel: &Arc<Notify>,
) -> bool {
    let transition = match supervised
        .state
        .transition(ClientState::Connecting, None, Some(serde_json::json!({"reason": "health_check_failed"})))
        .await
    {
        Ok(event) => event,
        Err(_) => return false,
    };
    if let Some(cb) = on_reconnecting {
        cb(&transition);
    }

    close_backend(supervised).await;

    let mut attempt = 0u32;
    loop {
        let backoff = Duration::from_millis((100u64 << attempt.min(20)).min(60_000));
        tokio::select! {
            _ = cancel.notified() => {
                let _ = supervised.state.transition(ClientState::Disconnecting, None, None).await;
                let _ = supervised.state.transition(ClientState::Disconnected, None, None).await;
                return true;
            }
            _ = sleep(backoff) => {}
        }

        match reopen(supervised).await {
            Ok(new_backend) => {
                *supervised.backend.lock().await = new_backend;
                let reconnected_metadata = serde_json::json!({"reason": "reconnected", "attempt": attempt + 1});
                if let Ok(event) = supervised
                    .state
                    .transition(ClientState::Connected, None, Some(reconnected_metadata))
                    .await
                {
                    if let Some(cb) = on_connected {
                        cb(&event);
                    }
                }
                info!(attempt, "supervisor reconnected");
                return false;
            }
            Err(e) => {
                attempt += 1;
                warn!(attempt, error = %e, "reconnect attempt failed");
                if attempt >= max_reconnect_attempts {
                    let _ = supervised
                        .state
                        .transition(ClientState::Disconnected, Some(format!("reconnect exhausted: {e}")), None)
                        .await;
                    return true;
                }
            }
        }
    }
}

async fn close_backend(supervised: &Supervised) {
    let backend = supervised.backend.lock().await;
    match &*backend {
        Backend::Single(conn) => conn.close().await,
        Backend::Pooled(pool) => pool.close(Duration::from_secs(5)).await,
    }
}

async fn reopen(supervised: &Supervised) -> crate::error::Result<Backend> {
    if supervised.pool_options.is_pooled() {
        let pool = Pool::new(
            &supervised.address,
            &supervised.handshake_url,
            supervised.tls.clone(),
            supervised.pool_options.clone(),
            supervised.default_timeout,
        )
        .await?;
        Ok(Backend::Pooled(pool))
    } else {
        let conn = dial(&supervised.address, &supervised.tls, &supervised.handshake_url, supervised.default_timeout).await?;
        Ok(Backend::Single(Arc::new(conn)))
    }
}
