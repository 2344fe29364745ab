//! YAML config surface: structures, loader, favicon pipeline, and the
//! `SIGHUP` reload path.

use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose;
use image::GenericImageView;
use image::imageops::FilterType;
use serde::Deserialize;

use crate::upstream::{UpstreamConfig, UpstreamEntry, UpstreamRegistry};

#[derive(Debug, Clone, Deserialize)]
pub struct LogOptions {
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_file() -> String {
    "minegate.log".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

/// Raw, as-deserialized config. `extras` is a catch-all map for fields a
/// plugin might look up by name but which this crate doesn't interpret
/// itself.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub daemon: bool,
    #[serde(default)]
    pub log: LogOptions,
    #[serde(default)]
    pub host_not_found: crate::upstream::ChatMessageFields,
    #[serde(default)]
    pub bad_host: crate::upstream::ChatMessageFields,
    /// Path to a favicon used when an upstream entry doesn't configure its
    /// own `icon`.
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(flatten)]
    pub extras: serde_yaml::Mapping,
}

/// Reads and parses the YAML config file at `path`.
pub fn load(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

/// Validates every upstream entry (dropping and logging invalid ones),
/// resolves favicons, and builds the matchable registry.
pub fn build_registry(config: &Config) -> UpstreamRegistry {
    let mut entries = Vec::with_capacity(config.upstreams.len());
    for raw in &config.upstreams {
        let Some(mut entry) = UpstreamEntry::from_config(raw.clone()) else {
            continue;
        };
        resolve_favicon(&mut entry, config);
        entries.push(entry);
    }

    let mut host_not_found = config.host_not_found.clone();
    if host_not_found.text.is_empty() {
        host_not_found.text = "No such host.".to_owned();
    }
    let mut bad_host = config.bad_host.clone();
    if bad_host.text.is_empty() {
        bad_host.text = "Invalid hostname.".to_owned();
    }

    UpstreamRegistry {
        entries,
        bad_host: bad_host.to_chat_message(),
        host_not_found: host_not_found.to_chat_message(),
    }
}

fn resolve_favicon(entry: &mut UpstreamEntry, config: &Config) {
    let path = entry.icon_path.clone().or_else(|| config.icon.clone());
    let Some(path) = path else {
        return;
    };
    match load_favicon_base64(Path::new(&path)) {
        Ok(favicon) => entry.favicon = Some(favicon),
        Err(e) => log::warn!("could not load favicon {path}: {e}"),
    }
}

/// Resizes an image to 64x64 (if it isn't already) and returns it as a
/// `data:image/png;base64,...` URI, the shape Minecraft clients expect in
/// a status response's `favicon` field.
pub fn load_favicon_base64(path: &Path) -> Result<String> {
    let img = image::open(path).with_context(|| format!("opening {}", path.display()))?;
    let (width, height) = img.dimensions();
    let resized = if width == 64 && height == 64 {
        img
    } else {
        img.resize_exact(64, 64, FilterType::CatmullRom)
    };

    let mut png_bytes = Vec::new();
    resized
        .write_to(
            &mut std::io::Cursor::new(&mut png_bytes),
            image::ImageFormat::Png,
        )
        .context("encoding favicon as PNG")?;
    let encoded = general_purpose::STANDARD.encode(&png_bytes);
    Ok(format!("data:image/png;base64,{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let yaml = "listen: \"0.0.0.0:25565\"\nupstreams: []\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen, "0.0.0.0:25565");
        assert!(!config.daemon);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn invalid_upstream_is_dropped_not_fatal() {
        let yaml = "\
listen: \"0.0.0.0:25565\"
upstreams:
  - hostname: \"valid.local\"
    upstream: \"10.0.0.1:25565\"
  - hostname: \"bad host!\"
    upstream: \"10.0.0.2:25565\"
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let registry = build_registry(&config);
        assert_eq!(registry.entries.len(), 1);
        assert_eq!(registry.entries[0].pattern, "valid.local");
    }

    #[test]
    fn empty_host_not_found_text_gets_default() {
        let yaml = "listen: \"0.0.0.0:25565\"\nupstreams: []\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let registry = build_registry(&config);
        assert_eq!(registry.host_not_found.text, "No such host.");
    }
}
