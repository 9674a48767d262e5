use crate::api::{ApiVersion, NodeMethod};
use crate::transport::{Code, Status};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin name is empty")]
    EmptyName,

    #[error("plugin name {name} not found in the list of registered plugins")]
    NotFound { name: String },

    #[error(
        "connecting to plugin {plugin} at {endpoint}: {reason}",
        endpoint = .endpoint.display()
    )]
    Connection {
        plugin: String,
        endpoint: PathBuf,
        reason: String,
    },

    /// Every contract version that was tried answered `Unimplemented`.
    #[error("plugin {plugin} does not implement {method} (last tried {version}): {message}")]
    Unimplemented {
        plugin: String,
        method: NodeMethod,
        version: ApiVersion,
        message: String,
    },

    #[error("{method} on plugin {plugin} ({version}) exceeded its deadline")]
    DeadlineExceeded {
        plugin: String,
        method: NodeMethod,
        version: ApiVersion,
    },

    #[error("call to plugin {plugin} cancelled: {cause}")]
    Cancelled { plugin: String, cause: String },

    #[error("{method} on plugin {plugin} ({version}) failed: {status}")]
    Remote {
        plugin: String,
        method: NodeMethod,
        version: ApiVersion,
        status: Status,
    },

    #[error("payload encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

impl PluginError {
    /// Status code of the failed call, when the failure came from a call.
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Unimplemented { .. } => Some(Code::Unimplemented),
            Self::DeadlineExceeded { .. } => Some(Code::DeadlineExceeded),
            Self::Cancelled { .. } => Some(Code::Cancelled),
            Self::Remote { status, .. } => Some(status.code),
            Self::EmptyName
            | Self::NotFound { .. }
            | Self::Connection { .. }
            | Self::Codec(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = PluginError::Remote {
            plugin: "driver-A".to_string(),
            method: NodeMethod::PrepareResources,
            version: ApiVersion::V1Alpha4,
            status: Status::internal("claim not found"),
        };
        let message = err.to_string();
        assert!(message.contains("driver-A"));
        assert!(message.contains("NodePrepareResources"));
        assert!(message.contains("v1alpha4"));
        assert!(message.contains("claim not found"));
        assert_eq!(err.code(), Some(Code::Internal));
    }

    #[test]
    fn test_connection_error_has_no_code() {
        let err = PluginError::Connection {
            plugin: "driver-A".to_string(),
            endpoint: PathBuf::from("/run/plugins/driver-A.sock"),
            reason: "timed out".to_string(),
        };
        assert!(err.to_string().contains("/run/plugins/driver-A.sock"));
        assert_eq!(err.code(), None);
    }
}
