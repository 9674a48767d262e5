use super::context::CallContext;
use super::Plugin;
use crate::error::{PluginError, Result};
use crate::transport::{Channel, ConnectivityState};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Resolves once `deadline` passes; never without one.
async fn deadline_passed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Plugin {
    /// Return the plugin's shared connection, dialing it on first use.
    ///
    /// The plugin lock is held across the check, the dial and the bounded
    /// wait for the channel to start connecting, so concurrent first
    /// callers produce a single dial. It is never held during a call.
    /// Queuing for the lock and the connect wait both stop on the caller's
    /// token, the caller's deadline and decommission.
    pub async fn connection(&self, ctx: &CallContext) -> Result<Arc<dyn Channel>> {
        // A free lock wins so a decommissioned plugin still gets to drop
        // its stored connection below.
        let mut state = tokio::select! {
            biased;
            state = self.state.lock() => state,
            _ = self.lifecycle.cancelled() => return Err(self.decommissioned_error()),
            _ = ctx.cancellation_token().cancelled() => return Err(self.caller_cancelled()),
            _ = deadline_passed(ctx.deadline()) => {
                return Err(self.connection_error(
                    "caller deadline passed while waiting for the plugin lock".to_string(),
                ));
            }
        };

        if self.lifecycle.is_cancelled() {
            if let Some(conn) = state.conn.take() {
                conn.close();
            }
            return Err(self.decommissioned_error());
        }

        if let Some(conn) = &state.conn {
            let conn_state = conn.state();
            if conn_state.is_live() {
                return Ok(Arc::clone(conn));
            }
            debug!(
                plugin = %self.name,
                state = conn_state.as_str(),
                "Discarding dead plugin connection"
            );
            conn.close();
            state.conn = None;
        }

        debug!(
            plugin = %self.name,
            protocol = "unix",
            endpoint = %self.endpoint.display(),
            "Creating new plugin connection"
        );
        let conn = self
            .dialer
            .dial(&self.endpoint)
            .await
            .map_err(|e| self.connection_error(e.to_string()))?;

        let waited = tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => Err(self.decommissioned_error()),
            _ = ctx.cancellation_token().cancelled() => Err(self.caller_cancelled()),
            _ = deadline_passed(ctx.deadline()) => Err(self.connection_error(
                "caller deadline passed while waiting for connection to start connecting"
                    .to_string(),
            )),
            changed = tokio::time::timeout(
                self.connect_timeout,
                conn.wait_for_state_change(ConnectivityState::Idle),
            ) => match changed {
                Ok(new_state) => {
                    trace!(
                        plugin = %self.name,
                        state = new_state.as_str(),
                        "Plugin connection left idle state"
                    );
                    Ok(())
                }
                Err(_) => Err(self.connection_error(
                    "timed out waiting for connection to start connecting".to_string(),
                )),
            },
        };

        if let Err(e) = waited {
            conn.close();
            return Err(e);
        }

        state.conn = Some(Arc::clone(&conn));
        Ok(conn)
    }

    fn connection_error(&self, reason: String) -> PluginError {
        PluginError::Connection {
            plugin: self.name.clone(),
            endpoint: self.endpoint.clone(),
            reason,
        }
    }

    fn caller_cancelled(&self) -> PluginError {
        PluginError::Cancelled {
            plugin: self.name.clone(),
            cause: "call cancelled by caller".to_string(),
        }
    }
}
