use crate::services::compositor::CompositorChoice;
use anyhow::{Context, Result};
use hex_color::HexColor;
use log::{info, warn};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_FILE_PATH: &str = "~/.config/matshell/config.toml";

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outputs {
    #[default]
    All,
    #[serde(untagged)]
    Targets { targets: Vec<String> },
}

impl Outputs {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            Outputs::All => true,
            Outputs::Targets { targets } => targets.iter().any(|target| target == name),
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[default]
    Top,
    Bottom,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BarConfig {
    pub height: u32,
    pub position: Position,
}

impl Default for BarConfig {
    fn default() -> Self {
        Self {
            height: 6,
            position: Position::Top,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Appearance {
    pub background: HexColor,
    pub focused: HexColor,
    pub occupied: HexColor,
    pub urgent: HexColor,
    pub empty: HexColor,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            background: HexColor::rgb(30, 30, 46),
            focused: HexColor::rgb(250, 179, 135),
            occupied: HexColor::rgb(180, 190, 254),
            urgent: HexColor::rgb(243, 139, 168),
            empty: HexColor::rgb(69, 71, 90),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub compositor: CompositorChoice,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default)]
    pub bar: BarConfig,
    #[serde(default)]
    pub appearance: Appearance,
}

fn default_log_level() -> String {
    "warn".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            compositor: CompositorChoice::default(),
            outputs: Outputs::default(),
            bar: BarConfig::default(),
            appearance: Appearance::default(),
        }
    }
}

pub fn get_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = match path {
        Some(path) => path,
        None => PathBuf::from(
            shellexpand::full(DEFAULT_CONFIG_FILE_PATH)
                .context("Failed to expand the config path")?
                .as_ref(),
        ),
    };

    Ok((read_config(&path), path))
}

/// A missing file means defaults, a broken one is reported and ignored.
pub fn read_config(path: &Path) -> Config {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => {
            info!("No config file at {}, using defaults", path.display());
            return Config::default();
        }
    };

    match parse_config(&content) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to parse config file {}: {e}", path.display());
            Config::default()
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(parse_config("").unwrap(), Config::default());
    }

    #[test]
    fn parses_every_key() {
        let config = parse_config(
            r##"
            log_level = "debug"
            compositor = "river"
            outputs = { targets = ["DP-1", "eDP-1"] }

            [bar]
            height = 10
            position = "bottom"

            [appearance]
            focused = "#ff0000"
            "##,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.compositor, CompositorChoice::River);
        assert_eq!(
            config.outputs,
            Outputs::Targets {
                targets: vec!["DP-1".into(), "eDP-1".into()]
            }
        );
        assert_eq!(config.bar.height, 10);
        assert_eq!(config.bar.position, Position::Bottom);
        assert_eq!(config.appearance.focused, HexColor::rgb(255, 0, 0));
        assert_eq!(config.appearance.urgent, Appearance::default().urgent);
    }

    #[test]
    fn outputs_all_is_a_plain_string() {
        let config = parse_config(r#"outputs = "all""#).unwrap();

        assert_eq!(config.outputs, Outputs::All);
        assert!(config.outputs.allows("anything"));
    }

    #[test]
    fn targets_filter_by_connector() {
        let outputs = Outputs::Targets {
            targets: vec!["DP-1".into()],
        };

        assert!(outputs.allows("DP-1"));
        assert!(!outputs.allows("HDMI-1"));
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "compositor = \"sway\"").unwrap();

        assert_eq!(read_config(file.path()), Config::default());
        assert_eq!(
            read_config(Path::new("/nonexistent/matshell.toml")),
            Config::default()
        );
    }
}
