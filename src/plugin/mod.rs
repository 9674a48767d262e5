//! Client handle for one registered plugin
//!
//! A [`Plugin`] owns:
//! - a lazily dialed connection shared by all callers ([`connection`](Plugin::connection))
//! - the negotiated contract version, probed once and cached
//! - a lifecycle token that stops in-flight work when the plugin is removed
//!
//! ```text
//! caller ─▶ registry.get(name) ─▶ Plugin::prepare_resources
//!                                   ├─ connection()      dial once, reuse
//!                                   ├─ negotiated version  cached or probe
//!                                   └─ interceptor ─▶ channel.invoke
//! ```

mod connection;
pub mod context;
mod dispatch;
pub mod metrics;
pub mod negotiator;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::{PluginError, Result};
use crate::transport::{Channel, Dialer, UnixDialer};
use metrics::{MetricsInterceptor, NoopObserver, OperationObserver};
use negotiator::NegotiatedVersion;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use context::CallContext;

/// Bound on every call unless configured otherwise
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Bound on waiting for a fresh channel to start connecting
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Mutable state, guarded by the plugin lock
#[derive(Default)]
struct PluginState {
    conn: Option<Arc<dyn Channel>>,
    version: NegotiatedVersion,
}

pub struct Plugin {
    name: String,
    endpoint: PathBuf,
    call_timeout: Duration,
    connect_timeout: Duration,
    dialer: Arc<dyn Dialer>,
    interceptor: MetricsInterceptor,
    lifecycle: CancellationToken,
    cancel_cause: OnceLock<String>,
    state: Mutex<PluginState>,
}

impl Plugin {
    pub fn builder(name: impl Into<String>, endpoint: impl Into<PathBuf>) -> PluginBuilder {
        PluginBuilder::new(name, endpoint)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Cancelled once the plugin is decommissioned
    pub fn lifecycle_token(&self) -> &CancellationToken {
        &self.lifecycle
    }

    pub fn is_decommissioned(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    /// Stop all work scoped to this plugin.
    ///
    /// Callers waiting on the connection or on a call are released with
    /// [`PluginError::Cancelled`] carrying `cause`. The first cause wins.
    pub fn decommission(&self, cause: impl Into<String>) {
        let cause = cause.into();
        info!(plugin = %self.name, cause = %cause, "Decommissioning plugin");
        let _ = self.cancel_cause.set(cause);
        self.lifecycle.cancel();

        // A caller still in the connect wait holds the lock and will close
        // its own channel when it sees the cancellation.
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(conn) = state.conn.take() {
                conn.close();
            }
        }
    }

    fn decommissioned_error(&self) -> PluginError {
        PluginError::Cancelled {
            plugin: self.name.clone(),
            cause: self
                .cancel_cause
                .get()
                .cloned()
                .unwrap_or_else(|| "plugin decommissioned".to_string()),
        }
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.lifecycle.cancel();
        if let Some(conn) = self.state.get_mut().conn.take() {
            conn.close();
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("call_timeout", &self.call_timeout)
            .field("decommissioned", &self.is_decommissioned())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Plugin`]
pub struct PluginBuilder {
    name: String,
    endpoint: PathBuf,
    call_timeout: Duration,
    connect_timeout: Duration,
    dialer: Arc<dyn Dialer>,
    observer: Arc<dyn OperationObserver>,
}

impl PluginBuilder {
    pub fn new(name: impl Into<String>, endpoint: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dialer: Arc::new(UnixDialer::new()),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Set the per-call timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the bound on the connecting-state wait
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Set the metrics backend that sees every call attempt
    pub fn observer(mut self, observer: Arc<dyn OperationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Result<Plugin> {
        if self.name.is_empty() {
            return Err(PluginError::EmptyName);
        }

        Ok(Plugin {
            interceptor: MetricsInterceptor::new(self.name.clone(), self.observer),
            name: self.name,
            endpoint: self.endpoint,
            call_timeout: self.call_timeout,
            connect_timeout: self.connect_timeout,
            dialer: self.dialer,
            lifecycle: CancellationToken::new(),
            cancel_cause: OnceLock::new(),
            state: Mutex::new(PluginState::default()),
        })
    }
}
