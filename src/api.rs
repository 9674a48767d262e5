//! Versioned plugin service contracts
//!
//! Two incompatible contract versions exist. Both expose the same two
//! methods; only the service name in the method path differs.

use std::fmt;
use std::str::FromStr;

/// Contract version spoken with a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVersion {
    /// Older contract
    V1Alpha4,
    /// Newer contract, tried first
    V1Beta1,
}

impl ApiVersion {
    /// Order in which versions are tried against a plugin of unknown version.
    pub const FALLBACK_ORDER: [ApiVersion; 2] = [ApiVersion::V1Beta1, ApiVersion::V1Alpha4];

    pub fn newest() -> Self {
        Self::FALLBACK_ORDER[0]
    }

    /// Next version to try when this one is unimplemented by the plugin.
    pub fn fallback(&self) -> Option<Self> {
        match self {
            ApiVersion::V1Beta1 => Some(ApiVersion::V1Alpha4),
            ApiVersion::V1Alpha4 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1Alpha4 => "v1alpha4",
            ApiVersion::V1Beta1 => "v1beta1",
        }
    }

    pub fn service_name(&self) -> &'static str {
        match self {
            ApiVersion::V1Alpha4 => "v1alpha4.Node",
            ApiVersion::V1Beta1 => "v1beta1.Node",
        }
    }

    pub fn method_path(&self, method: NodeMethod) -> &'static str {
        match (self, method) {
            (ApiVersion::V1Alpha4, NodeMethod::PrepareResources) => {
                "/v1alpha4.Node/NodePrepareResources"
            }
            (ApiVersion::V1Alpha4, NodeMethod::UnprepareResources) => {
                "/v1alpha4.Node/NodeUnprepareResources"
            }
            (ApiVersion::V1Beta1, NodeMethod::PrepareResources) => {
                "/v1beta1.Node/NodePrepareResources"
            }
            (ApiVersion::V1Beta1, NodeMethod::UnprepareResources) => {
                "/v1beta1.Node/NodeUnprepareResources"
            }
        }
    }

    /// Split a full method path back into contract version and method.
    pub fn parse_method(path: &str) -> Option<(ApiVersion, NodeMethod)> {
        let (service, method) = path.strip_prefix('/')?.split_once('/')?;
        let version = Self::FALLBACK_ORDER
            .into_iter()
            .find(|v| v.service_name() == service)?;
        let method = NodeMethod::ALL.into_iter().find(|m| m.as_str() == method)?;
        Some((version, method))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1alpha4" => Ok(ApiVersion::V1Alpha4),
            "v1beta1" => Ok(ApiVersion::V1Beta1),
            other => Err(format!(
                "unknown API version '{}' (expected v1alpha4 or v1beta1)",
                other
            )),
        }
    }
}

/// Remote operation exposed by every contract version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeMethod {
    PrepareResources,
    UnprepareResources,
}

impl NodeMethod {
    pub const ALL: [NodeMethod; 2] = [NodeMethod::PrepareResources, NodeMethod::UnprepareResources];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMethod::PrepareResources => "NodePrepareResources",
            NodeMethod::UnprepareResources => "NodeUnprepareResources",
        }
    }
}

impl fmt::Display for NodeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
