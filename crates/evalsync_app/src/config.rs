//! RON configuration file handling.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Context;
use evalsync_core::ClientConfig;
use evalsync_logging::sync_info;

/// Loads `path`, falling back to defaults when the file does not exist.
/// Missing fields take their defaults too.
pub fn load(path: &Path) -> anyhow::Result<ClientConfig> {
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            sync_info!("no config at {:?}, using defaults", path);
            return Ok(ClientConfig::default());
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };

    let config: ClientConfig =
        ron::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    sync_info!("loaded config from {:?}", path);
    Ok(config)
}

/// Writes `config` as pretty RON, creating parent directories as needed.
pub fn save(path: &Path, config: &ClientConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let pretty = ron::ser::PrettyConfig::new();
    let content = ron::ser::to_string_pretty(config, pretty).context("serializing config")?;
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Applies command-line overrides, then validates the result.
pub fn finalize(
    mut config: ClientConfig,
    api: Option<String>,
    ws: Option<String>,
) -> anyhow::Result<ClientConfig> {
    if let Some(api) = api {
        config.api_base_url = api;
    }
    if let Some(ws) = ws {
        config.ws_base_url = ws;
    }
    config.validate()?;
    Ok(config)
}
