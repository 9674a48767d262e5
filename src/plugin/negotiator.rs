use super::context::CallScope;
use super::Plugin;
use crate::api::{ApiVersion, NodeMethod};
use crate::transport::{Channel, Code, Status};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Contract version known to work with a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiatedVersion {
    /// No call has settled yet
    #[default]
    Unknown,
    Confirmed(ApiVersion),
}

impl NegotiatedVersion {
    pub fn confirmed(&self) -> Option<ApiVersion> {
        match self {
            NegotiatedVersion::Unknown => None,
            NegotiatedVersion::Confirmed(version) => Some(*version),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, NegotiatedVersion::Unknown)
    }
}

impl std::fmt::Display for NegotiatedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiatedVersion::Unknown => f.write_str("unknown"),
            NegotiatedVersion::Confirmed(version) => write!(f, "{}", version),
        }
    }
}

/// Whether an attempt's outcome proves the plugin speaks the attempted
/// version.
///
/// Success and errors raised by the plugin's handler settle. Unimplemented
/// does not, and neither do outcomes the transport or the local deadline
/// produced, since those say nothing about the plugin's API surface.
pub(crate) fn settles<T>(outcome: &Result<T, Status>) -> bool {
    match outcome {
        Ok(_) => true,
        Err(status) => status.code != Code::Unimplemented && !status.code.is_transport(),
    }
}

fn is_unimplemented<T>(outcome: &Result<T, Status>) -> bool {
    matches!(outcome, Err(status) if status.code == Code::Unimplemented)
}

impl Plugin {
    /// Cached version, read under the plugin lock
    pub async fn negotiated_version(&self) -> NegotiatedVersion {
        self.state.lock().await.version
    }

    /// Forget the cached version so the next call probes again.
    ///
    /// Meant for callers that know the plugin process was replaced.
    pub async fn reset_negotiated_version(&self) {
        let mut state = self.state.lock().await;
        if let NegotiatedVersion::Confirmed(previous) = state.version {
            info!(plugin = %self.name, previous = %previous, "Resetting negotiated API version");
        }
        state.version = NegotiatedVersion::Unknown;
    }

    /// Try versions newest first, falling back on `Unimplemented`, and
    /// cache the version that settled. All attempts share `scope`.
    pub(crate) async fn probe(
        &self,
        conn: &Arc<dyn Channel>,
        scope: &CallScope<'_>,
        method: NodeMethod,
        payload: &[u8],
    ) -> (ApiVersion, Result<Vec<u8>, Status>) {
        let mut version = ApiVersion::newest();
        let mut outcome = self.attempt(conn, scope, version, method, payload).await;

        while is_unimplemented(&outcome) {
            let Some(next) = version.fallback() else {
                break;
            };
            debug!(
                plugin = %self.name,
                method = %method,
                from = %version,
                to = %next,
                "Plugin does not implement API version, falling back"
            );
            version = next;
            outcome = self.attempt(conn, scope, version, method, payload).await;
        }

        if settles(&outcome) {
            self.settle_version(version).await;
        }

        (version, outcome)
    }

    async fn settle_version(&self, version: ApiVersion) {
        let mut state = self.state.lock().await;
        match state.version {
            NegotiatedVersion::Unknown => {
                info!(plugin = %self.name, version = %version, "Negotiated plugin API version");
                state.version = NegotiatedVersion::Confirmed(version);
            }
            NegotiatedVersion::Confirmed(existing) if existing == version => {}
            NegotiatedVersion::Confirmed(existing) => {
                // A concurrent first call settled first; switching needs an
                // explicit reset.
                warn!(
                    plugin = %self.name,
                    kept = %existing,
                    observed = %version,
                    "Concurrent calls settled on different API versions"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settles_on_success_and_application_errors() {
        assert!(settles::<()>(&Ok(())));
        assert!(settles::<()>(&Err(Status::internal("claim not found"))));
        assert!(settles::<()>(&Err(Status::new(Code::InvalidArgument, "bad claim"))));
    }

    #[test]
    fn test_does_not_settle_on_unimplemented_or_transport_errors() {
        assert!(!settles::<()>(&Err(Status::unimplemented("unknown service"))));
        assert!(!settles::<()>(&Err(Status::deadline_exceeded("slow"))));
        assert!(!settles::<()>(&Err(Status::unavailable("refused"))));
        assert!(!settles::<()>(&Err(Status::resource_exhausted("frame too large"))));
        assert!(!settles::<()>(&Err(Status::cancelled("caller"))));
    }

    #[test]
    fn test_negotiated_version_display() {
        assert_eq!(NegotiatedVersion::Unknown.to_string(), "unknown");
        assert_eq!(
            NegotiatedVersion::Confirmed(ApiVersion::V1Alpha4).to_string(),
            "v1alpha4"
        );
        assert_eq!(
            NegotiatedVersion::Confirmed(ApiVersion::V1Beta1).confirmed(),
            Some(ApiVersion::V1Beta1)
        );
    }
}
