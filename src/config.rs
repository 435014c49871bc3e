// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section has defaults, so a missing file, a missing section or a
// missing key all fall back to them. A file that fails to parse is reported
// and ignored.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::render::GraphicsApi;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Lumen".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub api: GraphicsApi,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// Generate full mip chains for loaded textures
    pub mipmaps: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            api: GraphicsApi::Vulkan,
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
            mipmaps: true,
        }
    }
}

/// Where to find shaders and what to load at startup
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub shader_dir: PathBuf,
    pub model: Option<PathBuf>,
    pub environment_texture: Option<PathBuf>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("shaders"),
            model: None,
            environment_texture: None,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "lumen_debug.log".to_string(),
            show_fps: true,
        }
    }
}

/// Control key bindings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub quit_key: String,
    /// Reloads `assets.model` from disk
    pub reload_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            quit_key: "Escape".to_string(),
            reload_key: "F5".to_string(),
        }
    }
}

impl Config {
    /// Like [`Config::load_from_path`], but a broken file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load_from_path(path).unwrap_or_else(|e| {
            log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("config.toml")).unwrap();

        assert_eq!(config.graphics.api, GraphicsApi::Vulkan);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert!(config.graphics.mipmaps);
        assert_eq!(config.assets.shader_dir, PathBuf::from("shaders"));
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[graphics]
api = "legacy"
present_mode = "FIFO"
max_frames_in_flight = 3

[assets]
model = "models/viking_room.obj"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.graphics.api, GraphicsApi::Legacy);
        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.graphics.clear_color, [0.1, 0.2, 0.8, 1.0]);
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
        assert_eq!(
            config.assets.model,
            Some(PathBuf::from("models/viking_room.obj"))
        );
        assert_eq!(config.assets.environment_texture, None);
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.controls.quit_key, "Escape");
        assert_eq!(config.controls.reload_key, "F5");
    }

    #[test]
    fn broken_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[graphics\nmax_frames_in_flight = ").unwrap();

        assert!(Config::load_from_path(&path).is_err());
        let config = Config::load_or_default(&path);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
    }

    #[test]
    fn unknown_present_mode_is_fifo() {
        let mut config = Config::default();
        config.graphics.present_mode = "vsync-ish".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
    }
}
