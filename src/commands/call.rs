use anyhow::Context;
use dra_plugin_client::plugin::metrics::OperationsDuration;
use dra_plugin_client::{new_plugin_client, CallContext, ClientConfig, NodeMethod, Payload};
use std::sync::Arc;
use std::time::Duration;

use crate::args::CallArgs;

pub(crate) async fn cmd_call(
    config: &ClientConfig,
    method: NodeMethod,
    args: CallArgs,
) -> anyhow::Result<()> {
    let body: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;
    let request = Payload::from_json(&body)?;

    let recorder = Arc::new(OperationsDuration::new());
    let registry = config.build_registry(recorder.clone())?;
    let plugin = new_plugin_client(&registry, &args.name)?;

    let mut ctx = CallContext::background();
    if let Some(secs) = args.timeout {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }

    let call = async {
        match method {
            NodeMethod::PrepareResources => plugin.prepare_resources(&ctx, request).await,
            NodeMethod::UnprepareResources => plugin.unprepare_resources(&ctx, request).await,
        }
    };

    let response = tokio::select! {
        response = call => response,
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("{} on {} interrupted", method, args.name);
        }
    };

    tracing::debug!(
        negotiated = %plugin.negotiated_version().await,
        "Call metrics:\n{}",
        recorder.render()
    );

    let response = response?;
    if response.is_empty() {
        return Ok(());
    }
    match response.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", String::from_utf8_lossy(response.as_bytes())),
    }
    Ok(())
}
