//! User configuration for the GE core and the presentation layer.
//!
//! Stored as JSON. Missing fields take their defaults so older files keep
//! loading.

use crate::geometry::ScreenRotation;
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How the 480x272 image is fitted into the output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ZoomMode {
    /// Fill the frame, ignoring aspect ratio
    Stretch,
    /// Keep aspect ratio but stretch half way towards the frame
    PartialStretch,
    /// Integer-ish scaling at common resolutions, aspect fit otherwise
    #[default]
    Auto,
    /// User zoom factor and offset
    Manual,
}

/// Safe-area insets in density-independent units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SafeAreaInsets {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardboardConfig {
    pub enabled: bool,
    /// Eye image size as a percentage of half the screen
    pub screen_size: i32,
    /// -100..100, percentage of the maximum shift
    pub x_shift: i32,
    pub y_shift: i32,
}

impl Default for CardboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            screen_size: 50,
            x_shift: 0,
            y_shift: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Apply bone matrices on the CPU while decoding vertices
    pub software_skinning: bool,
    /// Display list queue capacity
    pub max_display_lists: usize,
    /// Count per-frame statistics
    pub collect_stats: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            software_skinning: true,
            max_display_lists: 64,
            collect_stats: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    /// Post-processing chain by shader name; empty means passthrough
    pub post_shaders: Vec<String>,
    /// Per-shader setting overrides, by shader name
    pub shader_settings: BTreeMap<String, [f32; 4]>,
    /// Internal resolution multiplier; 0 picks one from the backbuffer size
    pub render_scale: u32,
    pub nearest_filtering: bool,
    pub zoom: ZoomMode,
    pub manual_zoom: f32,
    /// 0.5 is centered
    pub manual_offset_x: f32,
    pub manual_offset_y: f32,
    pub internal_rotation: ScreenRotation,
    pub cardboard: CardboardConfig,
    pub ignore_insets: bool,
    pub insets: SafeAreaInsets,
    pub dpi_scale_x: f32,
    pub dpi_scale_y: f32,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            post_shaders: Vec::new(),
            shader_settings: BTreeMap::new(),
            render_scale: 0,
            nearest_filtering: false,
            zoom: ZoomMode::Auto,
            manual_zoom: 1.0,
            manual_offset_x: 0.5,
            manual_offset_y: 0.5,
            internal_rotation: ScreenRotation::Horizontal,
            cardboard: CardboardConfig::default(),
            ignore_insets: true,
            insets: SafeAreaInsets::default(),
            dpi_scale_x: 1.0,
            dpi_scale_y: 1.0,
        }
    }
}

impl PresentationConfig {
    /// Portrait when the internal rotation turns the screen on its side.
    pub fn is_portrait(&self) -> bool {
        self.internal_rotation.is_vertical()
    }
}

/// Everything the core reads from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub gpu: GpuConfig,
    pub presentation: PresentationConfig,
}

impl Config {
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load from `path`, falling back to defaults on error.
    pub fn load_from_path(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(_)) => Self::default(),
            Err(e) => {
                log(LogCategory::GE, LogLevel::Warn, || {
                    format!(
                        "Failed to parse {}: {}. Using defaults.",
                        path.display(),
                        e
                    )
                });
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.gpu.software_skinning);
        assert_eq!(config.gpu.max_display_lists, 64);
        assert!(config.presentation.post_shaders.is_empty());
        assert_eq!(config.presentation.zoom, ZoomMode::Auto);
        assert_eq!(config.presentation.cardboard.screen_size, 50);
        assert!(!config.presentation.is_portrait());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "presentation": { "post_shaders": ["Natural"] } }"#)
                .expect("parse");
        assert_eq!(config.presentation.post_shaders, vec!["Natural".to_string()]);
        assert_eq!(config.presentation.manual_zoom, 1.0);
        assert_eq!(config.gpu, GpuConfig::default());
    }

    #[test]
    fn test_save_load() {
        let dir = std::env::temp_dir().join("emu_psp_test_config");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut config = Config::default();
        config.presentation.render_scale = 3;
        config.presentation.zoom = ZoomMode::Manual;
        config
            .presentation
            .shader_settings
            .insert("Scanlines".to_string(), [0.5, 1.0, 0.0, 0.0]);
        config.save(&path).unwrap();

        let loaded = Config::load_from_path(&path);
        assert_eq!(loaded, config);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_bad_file_falls_back() {
        let dir = std::env::temp_dir().join("emu_psp_test_config_bad");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert_eq!(Config::load_from_path(&path), Config::default());
        assert!(matches!(Config::try_load(&path), Err(ConfigError::Parse(_))));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_falls_back() {
        let path = std::env::temp_dir().join("emu_psp_definitely_missing.json");
        assert_eq!(Config::load_from_path(&path), Config::default());
    }
}
