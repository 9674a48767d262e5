use dra_plugin_client::ClientConfig;

pub(crate) fn cmd_plugins(config: &ClientConfig) {
    if config.plugins.is_empty() {
        println!("No plugins configured ({})", ClientConfig::config_path().display());
        return;
    }

    let width = config
        .plugins
        .iter()
        .map(|p| p.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());

    println!("{:<width$}  ENDPOINT", "NAME", width = width);
    for entry in &config.plugins {
        println!("{:<width$}  {}", entry.name, entry.endpoint.display(), width = width);
    }
}
