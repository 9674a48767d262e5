use super::protocol::{
    read_frame, MessageFrame, RequestFrame, ResponseFrame, Status, MAX_FRAME_LEN,
};
use super::{Channel, ConnectivityState, Dialer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Longest path that fits in `sockaddr_un.sun_path` on Linux.
const MAX_SOCKET_PATH: usize = 107;

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseFrame>>>>;

fn lock(pending: &PendingCalls) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<ResponseFrame>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dials plugin sockets. The channel is local-trust: no transport security.
#[derive(Debug, Default, Clone)]
pub struct UnixDialer;

impl UnixDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for UnixDialer {
    async fn dial(&self, endpoint: &Path) -> std::io::Result<Arc<dyn Channel>> {
        validate_endpoint(endpoint)?;
        let channel: Arc<dyn Channel> = UnixChannel::open(endpoint.to_path_buf());
        Ok(channel)
    }
}

fn validate_endpoint(endpoint: &Path) -> std::io::Result<()> {
    let len = endpoint.as_os_str().len();
    if len == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty socket path",
        ));
    }
    if len > MAX_SOCKET_PATH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "socket path {} is {} bytes, limit is {}",
                endpoint.display(),
                len,
                MAX_SOCKET_PATH
            ),
        ));
    }
    Ok(())
}

/// Multiplexed connection to one plugin socket.
///
/// Connecting happens in a background task; the state moves
/// Idle -> Connecting -> Ready (or TransientFailure). Calls wait while the
/// connect is in flight and fail with `Unavailable` once it has failed.
pub struct UnixChannel {
    endpoint: PathBuf,
    state: Arc<watch::Sender<ConnectivityState>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingCalls,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl UnixChannel {
    /// Create the channel and start connecting in the background.
    pub fn open(endpoint: PathBuf) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        let state = Arc::new(state);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(drive(
            endpoint.clone(),
            Arc::clone(&state),
            outbound_rx,
            Arc::clone(&pending),
            shutdown.clone(),
        ));

        Arc::new(Self {
            endpoint,
            state,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    async fn settled_state(&self) -> ConnectivityState {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| !matches!(s, ConnectivityState::Idle | ConnectivityState::Connecting))
            .await
            .map(|s| *s);
        settled.unwrap_or(ConnectivityState::Shutdown)
    }
}

#[async_trait]
impl Channel for UnixChannel {
    async fn invoke(
        &self,
        method: &str,
        payload: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>, Status> {
        let state = self.settled_state().await;
        if state != ConnectivityState::Ready {
            return Err(Status::unavailable(format!(
                "connection to {} is {}",
                self.endpoint.display(),
                state.as_str()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame {
            id,
            method: method.to_string(),
            timeout_ms: deadline
                .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64),
            payload,
        };
        let bytes = MessageFrame::encode_request(&frame)
            .map_err(|e| Status::internal(format!("failed to encode request: {}", e)))?;
        // The plugin drops the whole connection on an oversized frame.
        if !MessageFrame::within_limit(&bytes) {
            return Err(Status::resource_exhausted(format!(
                "request of {} bytes exceeds frame limit of {}",
                bytes.len() - 4,
                MAX_FRAME_LEN
            )));
        }

        let (tx, rx) = oneshot::channel();
        let _slot = PendingSlot::insert(&self.pending, id, tx);

        trace!(id, method, "Sending request frame");
        self.outbound.send(bytes).map_err(|_| {
            Status::unavailable(format!("connection to {} closed", self.endpoint.display()))
        })?;

        let response = rx.await.map_err(|_| {
            Status::unavailable(format!(
                "connection to {} closed before response",
                self.endpoint.display()
            ))
        })?;

        if response.status.is_ok() {
            Ok(response.payload)
        } else {
            Err(response.status)
        }
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
        self.shutdown.cancel();
        self.state.send_replace(ConnectivityState::Shutdown);
    }
}

impl Drop for UnixChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Removes a call's response slot when the caller stops waiting,
/// including when the call future is dropped on timeout.
struct PendingSlot<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl<'a> PendingSlot<'a> {
    fn insert(pending: &'a PendingCalls, id: u64, tx: oneshot::Sender<ResponseFrame>) -> Self {
        lock(pending).insert(id, tx);
        Self { pending, id }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

async fn drive(
    endpoint: PathBuf,
    state: Arc<watch::Sender<ConnectivityState>>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: PendingCalls,
    shutdown: CancellationToken,
) {
    advance(&state, ConnectivityState::Connecting);

    let connected = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = UnixStream::connect(&endpoint) => Some(result),
    };

    let stream = match connected {
        Some(Ok(stream)) => stream,
        Some(Err(e)) => {
            debug!(endpoint = %endpoint.display(), error = %e, "Plugin socket connect failed");
            finish(&state, &shutdown, &mut outbound, &pending);
            return;
        }
        None => {
            finish(&state, &shutdown, &mut outbound, &pending);
            return;
        }
    };

    debug!(endpoint = %endpoint.display(), "Plugin socket connected");
    advance(&state, ConnectivityState::Ready);

    let (mut reader, mut writer) = stream.into_split();

    let read_loop = async {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(body)) => match MessageFrame::decode_response(&body) {
                    Ok(response) => route(&pending, response),
                    Err(e) => {
                        warn!(
                            endpoint = %endpoint.display(),
                            "Failed to decode response frame: {}",
                            e
                        );
                        return;
                    }
                },
                Ok(None) => {
                    debug!(endpoint = %endpoint.display(), "Plugin closed the connection");
                    return;
                }
                Err(e) => {
                    debug!(
                        endpoint = %endpoint.display(),
                        error = %e,
                        "Read from plugin socket failed"
                    );
                    return;
                }
            }
        }
    };

    let write_loop = async {
        while let Some(bytes) = outbound.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!(endpoint = %endpoint.display(), error = %e, "Write to plugin socket failed");
                return;
            }
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = read_loop => {}
        _ = write_loop => {}
    }

    finish(&state, &shutdown, &mut outbound, &pending);
}

/// Shutdown is terminal: a racing driver must not move a closed channel
/// back to Ready.
fn advance(state: &watch::Sender<ConnectivityState>, next: ConnectivityState) {
    state.send_if_modified(|current| {
        if *current == ConnectivityState::Shutdown || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

fn route(pending: &PendingCalls, response: ResponseFrame) {
    let id = response.id;
    match lock(pending).remove(&id) {
        Some(tx) => {
            // The caller may have given up already.
            let _ = tx.send(response);
        }
        None => trace!(id, "Dropping response for abandoned call"),
    }
}

fn finish(
    state: &watch::Sender<ConnectivityState>,
    shutdown: &CancellationToken,
    outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    pending: &PendingCalls,
) {
    if shutdown.is_cancelled() {
        state.send_replace(ConnectivityState::Shutdown);
    } else {
        advance(state, ConnectivityState::TransientFailure);
    }
    // Close the queue before failing waiters so no call can slip in between.
    outbound.close();
    lock(pending).clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint(Path::new("/run/plugins/driver-A.sock")).is_ok());
        assert!(validate_endpoint(Path::new("")).is_err());
        let long = format!("/run/{}", "x".repeat(MAX_SOCKET_PATH));
        assert!(validate_endpoint(Path::new(&long)).is_err());
    }

    #[tokio::test]
    async fn test_missing_socket_ends_in_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let channel = UnixChannel::open(dir.path().join("absent.sock"));

        let state = tokio::time::timeout(Duration::from_secs(2), channel.settled_state())
            .await
            .unwrap();
        assert_eq!(state, ConnectivityState::TransientFailure);

        let err = channel
            .invoke("/v1beta1.Node/NodePrepareResources", Vec::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::transport::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_close_moves_to_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let _listener = tokio::net::UnixListener::bind(dir.path().join("p.sock")).unwrap();
        let channel = UnixChannel::open(dir.path().join("p.sock"));

        channel.wait_for_state_change(ConnectivityState::Idle).await;
        channel.close();
        assert_eq!(channel.state(), ConnectivityState::Shutdown);
        assert!(!channel.state().is_live());
    }
}
