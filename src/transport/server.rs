use super::protocol::{
    read_frame, MessageFrame, Payload, RequestFrame, ResponseFrame, Status, MAX_FRAME_LEN,
};
use crate::api::{ApiVersion, NodeMethod};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Plugin-side implementation of one contract version.
#[async_trait]
pub trait NodeService: Send + Sync {
    async fn prepare_resources(&self, request: Payload) -> Result<Payload, Status>;

    async fn unprepare_resources(&self, request: Payload) -> Result<Payload, Status>;
}

/// Serves the node contracts on a Unix socket.
///
/// Requests for a contract version with no registered service are answered
/// with `Unimplemented`, which is what clients use to fall back.
pub struct PluginServer {
    services: HashMap<ApiVersion, Arc<dyn NodeService>>,
}

impl PluginServer {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Serve `version` with `service`
    pub fn with_service(mut self, version: ApiVersion, service: Arc<dyn NodeService>) -> Self {
        self.services.insert(version, service);
        self
    }

    /// Versions this server answers, newest first
    pub fn versions(&self) -> Vec<ApiVersion> {
        ApiVersion::FALLBACK_ORDER
            .into_iter()
            .filter(|v| self.services.contains_key(v))
            .collect()
    }

    /// Bind `socket_path`, replacing a stale socket file.
    pub fn bind(socket_path: &Path) -> Result<UnixListener> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(UnixListener::bind(socket_path)?)
    }

    /// Bind, serve until `shutdown` fires, then remove the socket file.
    pub async fn serve_at(self, socket_path: &Path, shutdown: CancellationToken) -> Result<()> {
        let listener = Self::bind(socket_path)?;
        info!(
            "Plugin server listening on: {} (versions: {:?})",
            socket_path.display(),
            self.versions()
        );

        self.serve(listener, shutdown).await;

        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }

        info!("Plugin server stopped");
        Ok(())
    }

    pub async fn serve(self, listener: UnixListener, shutdown: CancellationToken) {
        let server = Arc::new(self);

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, shutdown).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Shutdown signal received");
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: UnixStream,
        shutdown: CancellationToken,
    ) -> Result<()> {
        trace!("New connection accepted");

        let (mut reader, mut writer) = stream.into_split();
        let (responses, mut response_rx) = mpsc::unbounded_channel::<ResponseFrame>();

        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let bytes = match encode_within_limit(&response) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Failed to encode response {}: {}", response.id, e);
                        continue;
                    }
                };
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let body = tokio::select! {
                _ = shutdown.cancelled() => break,
                body = read_frame(&mut reader) => body?,
            };
            let Some(body) = body else {
                trace!("Client closed connection");
                break;
            };

            let request = MessageFrame::decode_request(&body)
                .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

            // Each request runs on its own task so a slow call does not hold
            // up the rest of the connection.
            let server = Arc::clone(&self);
            let responses = responses.clone();
            tokio::spawn(async move {
                let response = server.handle_request(request).await;
                let _ = responses.send(response);
            });
        }

        Ok(())
    }

    async fn handle_request(&self, request: RequestFrame) -> ResponseFrame {
        let RequestFrame {
            id,
            method,
            timeout_ms,
            payload,
        } = request;
        debug!("Handling: {} (id: {})", method, id);

        let Some((version, node_method)) = ApiVersion::parse_method(&method) else {
            let status = Status::unimplemented(format!("unknown method {}", method));
            return ResponseFrame::error(id, status);
        };
        let Some(service) = self.services.get(&version) else {
            return ResponseFrame::error(
                id,
                Status::unimplemented(format!("unknown service {}", version.service_name())),
            );
        };

        let call = async {
            match node_method {
                NodeMethod::PrepareResources => service.prepare_resources(payload.into()).await,
                NodeMethod::UnprepareResources => {
                    service.unprepare_resources(payload.into()).await
                }
            }
        };

        let result = match timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                .await
                .unwrap_or_else(|_| {
                    Err(Status::deadline_exceeded(
                        "request deadline passed in handler",
                    ))
                }),
            None => call.await,
        };

        match result {
            Ok(response) => ResponseFrame::ok(id, response.into_bytes()),
            Err(status) => ResponseFrame::error(id, status),
        }
    }
}

/// Encode `response`, replacing it with an error status when the frame
/// would exceed what the client accepts.
fn encode_within_limit(response: &ResponseFrame) -> Result<Vec<u8>, rkyv::rancor::Error> {
    let bytes = MessageFrame::encode_response(response)?;
    if MessageFrame::within_limit(&bytes) {
        return Ok(bytes);
    }

    warn!(
        "Response {} of {} bytes exceeds frame limit of {}",
        response.id,
        bytes.len() - 4,
        MAX_FRAME_LEN
    );
    let status = Status::resource_exhausted(format!(
        "response of {} bytes exceeds frame limit of {}",
        bytes.len() - 4,
        MAX_FRAME_LEN
    ));
    MessageFrame::encode_response(&ResponseFrame::error(response.id, status))
}

impl Default for PluginServer {
    fn default() -> Self {
        Self::new()
    }
}
