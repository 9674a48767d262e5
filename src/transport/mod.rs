//! Local transport between the node agent and plugin processes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames over one Unix socket   ┌──────────────────┐
//! │ Plugin handle│ ──────────────────────────────▶ │  PluginServer     │
//! │  (Channel)   │ ◀────────────────────────────── │  v1alpha4/v1beta1 │
//! └──────────────┘   responses matched by id       └──────────────────┘
//! ```
//!
//! The client side is split into a [`Dialer`], which produces a
//! [`Channel`], and the channel itself, which multiplexes calls and
//! reports a connectivity state.

pub mod protocol;
pub mod server;
pub mod unix;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;

pub use protocol::{Code, MessageFrame, Payload, RequestFrame, ResponseFrame, Status};
pub use server::{NodeService, PluginServer};
pub use unix::{UnixChannel, UnixDialer};

/// Connectivity of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Created, no connect attempt started yet
    Idle,
    /// Connect attempt in progress
    Connecting,
    /// Connected and able to carry calls
    Ready,
    /// Last connect attempt or the live connection failed
    TransientFailure,
    /// Closed locally
    Shutdown,
}

impl ConnectivityState {
    /// Whether a stored channel in this state may be handed to callers.
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient-failure",
            ConnectivityState::Shutdown => "shutdown",
        }
    }
}

/// A connection to one plugin that can carry many concurrent calls.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Issue one unary call. `deadline` is forwarded to the plugin; the
    /// caller is responsible for enforcing it locally.
    async fn invoke(
        &self,
        method: &str,
        payload: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, Status>;

    fn state(&self) -> ConnectivityState;

    /// Resolve once the state differs from `source`, returning the new state.
    async fn wait_for_state_change(&self, source: ConnectivityState) -> ConnectivityState;

    /// Tear the channel down and fail outstanding calls.
    fn close(&self);
}

/// Opens channels to plugin endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Start connecting to `endpoint`. Returning `Ok` does not mean the
    /// plugin is reachable; watch the channel's state for that.
    async fn dial(&self, endpoint: &Path) -> std::io::Result<Arc<dyn Channel>>;
}
