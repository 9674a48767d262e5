use super::context::{CallContext, CallScope};
use super::Plugin;
use crate::api::{ApiVersion, NodeMethod};
use crate::error::{PluginError, Result};
use crate::transport::{Channel, Code, Payload, Status};
use std::sync::Arc;
use tracing::debug;

impl Plugin {
    /// Ask the plugin to prepare the resources described by `request`.
    pub async fn prepare_resources(&self, ctx: &CallContext, request: Payload) -> Result<Payload> {
        self.call(ctx, NodeMethod::PrepareResources, request).await
    }

    /// Ask the plugin to release the resources described by `request`.
    pub async fn unprepare_resources(
        &self,
        ctx: &CallContext,
        request: Payload,
    ) -> Result<Payload> {
        self.call(ctx, NodeMethod::UnprepareResources, request).await
    }

    async fn call(
        &self,
        ctx: &CallContext,
        method: NodeMethod,
        request: Payload,
    ) -> Result<Payload> {
        debug!(
            plugin = %self.name,
            method = %method,
            request_bytes = request.as_bytes().len(),
            "Calling {} rpc",
            method
        );

        let conn = self.connection(ctx).await?;
        let scope = CallScope::new(ctx, self.call_timeout, &self.lifecycle);

        let (version, outcome) = match self.negotiated_version().await.confirmed() {
            Some(version) => {
                let outcome = self
                    .attempt(&conn, &scope, version, method, request.as_bytes())
                    .await;
                (version, outcome)
            }
            None => self.probe(&conn, &scope, method, request.as_bytes()).await,
        };

        let code = match &outcome {
            Ok(_) => Code::Ok,
            Err(status) => status.code,
        };
        debug!(
            plugin = %self.name,
            method = %method,
            version = %version,
            code = code.as_str(),
            "Done calling {} rpc",
            method
        );

        outcome
            .map(Payload::from)
            .map_err(|status| self.classify(method, version, status))
    }

    /// One attempt on one version, bounded by the call scope and recorded
    /// by the metrics interceptor.
    pub(crate) async fn attempt(
        &self,
        conn: &Arc<dyn Channel>,
        scope: &CallScope<'_>,
        version: ApiVersion,
        method: NodeMethod,
        payload: &[u8],
    ) -> std::result::Result<Vec<u8>, Status> {
        let path = version.method_path(method);
        let call = conn.invoke(path, payload.to_vec(), Some(scope.deadline()));
        self.interceptor.intercept(path, scope.bound(call)).await
    }

    fn classify(&self, method: NodeMethod, version: ApiVersion, status: Status) -> PluginError {
        match status.code {
            Code::Unimplemented => PluginError::Unimplemented {
                plugin: self.name.clone(),
                method,
                version,
                message: status.message,
            },
            Code::DeadlineExceeded => PluginError::DeadlineExceeded {
                plugin: self.name.clone(),
                method,
                version,
            },
            Code::Cancelled if self.lifecycle.is_cancelled() => self.decommissioned_error(),
            Code::Cancelled => PluginError::Cancelled {
                plugin: self.name.clone(),
                cause: status.message,
            },
            _ => PluginError::Remote {
                plugin: self.name.clone(),
                method,
                version,
                status,
            },
        }
    }
}
