//! Minimal driver used by `dractl serve` and end-to-end tests.

use crate::api::ApiVersion;
use crate::transport::{NodeService, Payload, PluginServer, Status};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Grants every prepare and releases every unprepare, after `delay`.
pub struct DemoDriver {
    version: ApiVersion,
    delay: Duration,
}

impl DemoDriver {
    pub fn new(version: ApiVersion, delay: Duration) -> Self {
        Self { version, delay }
    }

    async fn answer(
        &self,
        operation: &str,
        request: &Payload,
        body: serde_json::Value,
    ) -> Result<Payload, Status> {
        if !request.is_empty() {
            request
                .json::<serde_json::Value>()
                .map_err(|e| Status::new(crate::transport::Code::InvalidArgument, e.to_string()))?;
        }
        info!(version = %self.version, request_bytes = request.as_bytes().len(), "{}", operation);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Payload::from_json(&body).map_err(|e| Status::internal(e.to_string()))
    }
}

#[async_trait]
impl NodeService for DemoDriver {
    async fn prepare_resources(&self, request: Payload) -> Result<Payload, Status> {
        self.answer("Preparing resources", &request, json!({ "granted": true }))
            .await
    }

    async fn unprepare_resources(&self, request: Payload) -> Result<Payload, Status> {
        self.answer("Releasing resources", &request, json!({ "released": true }))
            .await
    }
}

/// A server answering every version in `versions` with a [`DemoDriver`].
pub fn demo_server(versions: &[ApiVersion], delay: Duration) -> PluginServer {
    versions.iter().fold(PluginServer::new(), |server, version| {
        server.with_service(*version, Arc::new(DemoDriver::new(*version, delay)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::plugin::metrics::OperationsDuration;
    use crate::plugin::registry::{new_plugin_client, PluginStore};
    use crate::plugin::{CallContext, Plugin};
    use crate::transport::Code;
    use tokio_util::sync::CancellationToken;

    async fn start(
        versions: &[ApiVersion],
        delay: Duration,
    ) -> (tempfile::TempDir, std::path::PathBuf, CancellationToken) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("driver-A.sock");
        let listener = PluginServer::bind(&socket).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(demo_server(versions, delay).serve(listener, shutdown.clone()));
        (dir, socket, shutdown)
    }

    #[tokio::test]
    async fn test_older_driver_over_unix_socket() {
        let (_dir, socket, shutdown) = start(&[ApiVersion::V1Alpha4], Duration::ZERO).await;
        let recorder = Arc::new(OperationsDuration::new());
        let store = PluginStore::new();
        store.add(
            Plugin::builder("driver-A", socket)
                .observer(recorder.clone())
                .build()
                .unwrap(),
        );

        let plugin = new_plugin_client(&store, "driver-A").unwrap();
        let ctx = CallContext::background();

        let prepared: serde_json::Value = plugin
            .prepare_resources(&ctx, Payload::from_json(&json!({ "claims": ["gpu-0"] })).unwrap())
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(prepared, json!({ "granted": true }));

        let released: serde_json::Value = plugin
            .unprepare_resources(&ctx, Payload::default())
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(released, json!({ "released": true }));

        assert_eq!(recorder.total(), 3);
        assert_eq!(
            recorder.count("driver-A", "/v1beta1.Node/NodePrepareResources", Code::Unimplemented),
            1
        );
        assert_eq!(
            recorder.count("driver-A", "/v1alpha4.Node/NodePrepareResources", Code::Ok),
            1
        );
        assert_eq!(
            recorder.count("driver-A", "/v1alpha4.Node/NodeUnprepareResources", Code::Ok),
            1
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_slow_driver_hits_call_timeout() {
        let (_dir, socket, shutdown) = start(&[ApiVersion::V1Beta1], Duration::from_secs(5)).await;
        let plugin = Plugin::builder("driver-A", socket)
            .call_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let err = plugin
            .prepare_resources(&CallContext::background(), Payload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::DeadlineExceeded { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_oversized_request_fails_alone() {
        let (_dir, socket, shutdown) =
            start(&[ApiVersion::V1Beta1], Duration::from_millis(500)).await;
        let plugin = Arc::new(Plugin::builder("driver-A", socket).build().unwrap());

        let in_flight = {
            let plugin = Arc::clone(&plugin);
            tokio::spawn(async move {
                plugin
                    .prepare_resources(&CallContext::background(), Payload::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let oversized = Payload::from(vec![b' '; 17 * 1024 * 1024]);
        let err = plugin
            .prepare_resources(&CallContext::background(), oversized)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(Code::ResourceExhausted));

        let granted: serde_json::Value = in_flight.await.unwrap().unwrap().json().unwrap();
        assert_eq!(granted, json!({ "granted": true }));
        assert_eq!(
            plugin.negotiated_version().await,
            crate::plugin::negotiator::NegotiatedVersion::Confirmed(ApiVersion::V1Beta1)
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_json_is_invalid_argument() {
        let driver = DemoDriver::new(ApiVersion::V1Beta1, Duration::ZERO);
        let err = driver
            .prepare_resources(Payload::from(b"not json".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }
}
