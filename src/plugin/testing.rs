//! In-process transport fakes for plugin tests

use crate::api::ApiVersion;
use crate::transport::{Channel, ConnectivityState, Dialer, Status};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

type Handler = Arc<dyn Fn(&str) -> Result<Vec<u8>, Status> + Send + Sync>;

pub(crate) struct FakeChannel {
    state: watch::Sender<ConnectivityState>,
    handler: Handler,
    latency: Duration,
    calls: Mutex<Vec<String>>,
}

impl FakeChannel {
    /// Method paths invoked on this channel, in order
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Simulate the plugin process dying
    pub(crate) fn fail(&self) {
        self.state.send_replace(ConnectivityState::TransientFailure);
    }
}

#[async_trait]
impl Channel for FakeChannel {
    async fn invoke(
        &self,
        method: &str,
        _payload: Vec<u8>,
        _deadline: Option<Instant>,
    ) -> Result<Vec<u8>, Status> {
        self.calls.lock().unwrap().push(method.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.handler)(method)
    }

    fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    async fn wait_for_state_change(&self, source: ConnectivityState) -> ConnectivityState {
        let mut rx = self.state.subscribe();
        let changed = rx.wait_for(|s| *s != source).await.map(|s| *s);
        changed.unwrap_or(ConnectivityState::Shutdown)
    }

    fn close(&self) {
        self.state.send_replace(ConnectivityState::Shutdown);
    }
}

pub(crate) struct FakeDialer {
    handler: Handler,
    dials: AtomicUsize,
    connect_delay: Mutex<Duration>,
    latency: Mutex<Duration>,
    stuck_idle: AtomicBool,
    failing: AtomicBool,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeDialer {
    pub(crate) fn new(handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            handler,
            dials: AtomicUsize::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            latency: Mutex::new(Duration::ZERO),
            stuck_idle: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// A plugin that answers `response` on the given versions and
    /// `Unimplemented` on every other one.
    pub(crate) fn serving(versions: &[ApiVersion], response: Vec<u8>) -> Arc<Self> {
        let versions = versions.to_vec();
        Self::new(Arc::new(move |method: &str| -> Result<Vec<u8>, Status> {
            let (version, _) = ApiVersion::parse_method(method)
                .ok_or_else(|| Status::unimplemented(format!("unknown method {}", method)))?;
            if versions.contains(&version) {
                Ok(response.clone())
            } else {
                Err(Status::unimplemented(format!(
                    "unknown service {}",
                    version.service_name()
                )))
            }
        }))
    }

    pub(crate) fn with_connect_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.connect_delay.lock().unwrap() = delay;
        self
    }

    pub(crate) fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        *self.latency.lock().unwrap() = latency;
        self
    }

    /// Channels never leave the idle state
    pub(crate) fn stuck_idle(self: Arc<Self>) -> Arc<Self> {
        self.stuck_idle.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_dial(self: Arc<Self>) -> Arc<Self> {
        self.failing.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    /// Every call made on every channel, in dial order
    pub(crate) fn calls(&self) -> Vec<String> {
        self.channels().iter().flat_map(|c| c.calls()).collect()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, _endpoint: &Path) -> std::io::Result<Arc<dyn Channel>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "bad endpoint",
            ));
        }

        let (state, _) = watch::channel(ConnectivityState::Idle);
        let channel = Arc::new(FakeChannel {
            state,
            handler: Arc::clone(&self.handler),
            latency: *self.latency.lock().unwrap(),
            calls: Mutex::new(Vec::new()),
        });
        self.channels.lock().unwrap().push(Arc::clone(&channel));

        if !self.stuck_idle.load(Ordering::SeqCst) {
            let delay = *self.connect_delay.lock().unwrap();
            let connecting = Arc::clone(&channel);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                connecting.state.send_if_modified(|s| {
                    if *s != ConnectivityState::Idle {
                        return false;
                    }
                    *s = ConnectivityState::Ready;
                    true
                });
            });
        }

        Ok(channel)
    }
}
