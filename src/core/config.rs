//! Engine configuration
//!
//! Everything the engine can be tuned with at startup, loadable from a
//! RON file or assembled with builder setters.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::TextureFilter;
use crate::render::ShadowConfig;

/// Errors from loading a configuration file.
#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    ParseError(ron::error::SpannedError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "config io error: {e}"),
            Self::ParseError(e) => write!(f, "config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}

impl From<ron::error::SpannedError> for ConfigError {
    fn from(e: ron::error::SpannedError) -> Self {
        Self::ParseError(e)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Shadow mapping setup.
    pub shadows: ShadowConfig,
    /// Multisampled rendering of the 3D scene.
    pub msaa: bool,
    /// Substitute a blurred still of the world while paused.
    pub pause_blur: bool,
    /// Filtering for loaded textures.
    pub texture_filter: TextureFilter,
    /// Generate mipmaps for loaded textures.
    pub texture_mipmap: bool,
    /// Directory texture names are resolved against.
    pub texture_dir: String,
    /// Frame clear color.
    pub background_color: [f32; 4],
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shadows: ShadowConfig::default(),
            msaa: true,
            pause_blur: true,
            texture_filter: TextureFilter::Trilinear,
            texture_mipmap: true,
            texture_dir: String::from("textures"),
            background_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a RON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_ron_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(ron::from_str(&text)?)
    }

    /// Set the shadow configuration.
    pub fn with_shadows(mut self, shadows: ShadowConfig) -> Self {
        self.shadows = shadows;
        self
    }

    /// Enable or disable multisampling.
    pub fn with_msaa(mut self, msaa: bool) -> Self {
        self.msaa = msaa;
        self
    }

    /// Enable or disable the pause blur.
    pub fn with_pause_blur(mut self, pause_blur: bool) -> Self {
        self.pause_blur = pause_blur;
        self
    }

    /// Set texture filtering and mipmap generation.
    pub fn with_texture_filtering(mut self, filter: TextureFilter, mipmap: bool) -> Self {
        self.texture_filter = filter;
        self.texture_mipmap = mipmap;
        self
    }

    /// Set the texture directory.
    pub fn with_texture_dir(mut self, dir: impl Into<String>) -> Self {
        self.texture_dir = dir.into();
        self
    }

    /// Set the frame clear color.
    pub fn with_background_color(mut self, color: [f32; 4]) -> Self {
        self.background_color = color;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_setters() {
        let config = EngineConfig::default()
            .with_msaa(false)
            .with_texture_dir("assets/tex")
            .with_shadows(ShadowConfig {
                quality: false,
                ..ShadowConfig::default()
            });

        assert!(!config.msaa);
        assert_eq!(config.texture_dir, "assets/tex");
        assert!(!config.shadows.quality);
        assert!(config.pause_blur);
    }

    #[test]
    fn test_ron_round_trip() {
        let config = EngineConfig::default().with_msaa(false);
        let text = ron::to_string(&config).unwrap();
        let parsed: EngineConfig = ron::from_str(&text).unwrap();
        assert!(!parsed.msaa);
        assert_eq!(parsed.shadows.resolution, config.shadows.resolution);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::from_ron_file("does-not-exist.ron").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
