pub mod api;
pub mod clienv;
pub mod config;
pub mod demo;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod transport;

pub use api::{ApiVersion, NodeMethod};
pub use config::ClientConfig;
pub use error::{PluginError, Result};
pub use plugin::negotiator::NegotiatedVersion;
pub use plugin::registry::{new_plugin_client, PluginRegistry, PluginStore};
pub use plugin::{CallContext, Plugin, PluginBuilder};
pub use transport::{Code, Payload, Status};
