//! Portal configuration.
//!
//! Loaded once at startup from a JSON file (`assets/portal.json` for the game). Every section and
//! field has a default, so a partial file only overrides what it names.

use std::{fmt, fs, io, path::Path};

use bevy::prelude::*;
use bevy_rapier3d::prelude::Group;
use serde::{Deserialize, Serialize};

use crate::plugins::physics::*;

/// Hard cap on recursion levels; each level costs a camera, an image and a render layer.
pub const MAX_RECURSION_LIMIT: u32 = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub surface: SurfaceConfig,
    pub teleport: TeleportConfig,
    pub view: ViewConfig,
    pub layers: LayerConfig,
}

/// Dimensions of the opening and of the volumes queried around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub half_extents: [f32; 2],
    /// Half depth of the entry volume, which straddles the plane.
    pub entry_half_depth: f32,
    /// Depth of the volume behind the surface searched for blocking colliders.
    pub blocking_depth: f32,
    /// Depth of the volume in front of the surface whose colliders are never blocking.
    pub guard_depth: f32,
    /// Seconds before the blocking collider cache goes stale.
    pub blocking_cache_duration: f32,
    pub overhang_ray_length: f32,
    /// Offset off the mounting wall for placement rays and the footprint box.
    pub placement_clearance: f32,
    pub overlap_depth: f32,
    pub receptive_material_prefix: String,
    /// Shift new placements away from obstacles protruding from the wall.
    pub nudge_placement: bool,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        SurfaceConfig {
            half_extents: [1., 1.],
            entry_half_depth: 0.6,
            blocking_depth: 1.,
            guard_depth: 0.1,
            blocking_cache_duration: 0.05,
            overhang_ray_length: 0.1,
            placement_clearance: 0.02,
            overlap_depth: 0.1,
            receptive_material_prefix: "portalable".to_string(),
            nudge_placement: true,
        }
    }
}

impl SurfaceConfig {
    pub fn half_extents(&self) -> Vec2 {
        Vec2::from(self.half_extents)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleportConfig {
    /// Minimum depth in front of the destination plane after a teleport.
    pub hysteresis_offset: f32,
    /// Minimum outward speed out of an upward facing portal, rigid bodies.
    pub min_exit_speed: f32,
    /// Minimum outward speed out of an upward facing portal, characters.
    pub character_min_exit_speed: f32,
    /// Added to the character minimum when the character was grounded before teleporting.
    pub grounded_exit_bonus: f32,
    /// Downward speed a grounded character picks up from standing contact. Anything faster is a
    /// real fall and goes through untouched.
    pub grounded_bias: f32,
}

impl Default for TeleportConfig {
    fn default() -> Self {
        TeleportConfig {
            hysteresis_offset: 0.01,
            min_exit_speed: 4.,
            character_min_exit_speed: 8.,
            grounded_exit_bonus: 2.,
            grounded_bias: 1.,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub max_recursion: u32,
    pub border_color: [f32; 4],
    pub inactive_colors: [[f32; 4]; 2],
}

impl Default for ViewConfig {
    fn default() -> Self {
        ViewConfig {
            max_recursion: 5,
            border_color: [0.1, 0.1, 0.1, 1.],
            inactive_colors: [[0., 0.5, 1., 1.], [1., 0.55, 0., 1.]],
        }
    }
}

impl ViewConfig {
    pub fn recursion_limit(&self) -> u32 {
        self.max_recursion.clamp(1, MAX_RECURSION_LIMIT)
    }
}

/// Collision group bit masks, see the `physics` plugin for the named groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub placement: u32,
    pub blocking: u32,
    pub tracked: u32,
    pub overlap: u32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            placement: PLACEMENT_GROUPS.bits(),
            blocking: (WALLS_GROUP | GROUND_GROUP).bits(),
            tracked: TRACKED_GROUPS.bits(),
            overlap: (WALLS_GROUP | GROUND_GROUP | PORTAL_GROUP).bits(),
        }
    }
}

impl LayerConfig {
    pub fn placement(&self) -> Group {
        Group::from_bits_truncate(self.placement)
    }

    pub fn blocking(&self) -> Group {
        Group::from_bits_truncate(self.blocking)
    }

    pub fn tracked(&self) -> Group {
        Group::from_bits_truncate(self.tracked)
    }

    pub fn overlap(&self) -> Group {
        Group::from_bits_truncate(self.overlap)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "Portal config IO error: {}", err),
            ConfigError::Parse(err) => write!(f, "Portal config parse error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}

impl PortalConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Load `path`, falling back to the defaults if it is missing or malformed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => {
                info!("Loaded portal config from {}", path.display());
                config
            }
            Err(err) => {
                warn!("{}, using default portal config", err);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = PortalConfig::from_json(
            r#"{ "view": { "max_recursion": 3 }, "teleport": { "hysteresis_offset": 0.02 } }"#,
        )
        .unwrap();
        assert_eq!(config.view.max_recursion, 3);
        assert_eq!(config.teleport.hysteresis_offset, 0.02);
        assert_eq!(config.teleport.character_min_exit_speed, 8.);
        assert_eq!(config.surface, SurfaceConfig::default());
    }

    #[test]
    fn recursion_limit_is_clamped() {
        let mut view = ViewConfig {
            max_recursion: 0,
            ..default()
        };
        assert_eq!(view.recursion_limit(), 1);
        view.max_recursion = 100;
        assert_eq!(view.recursion_limit(), MAX_RECURSION_LIMIT);
    }

    #[test]
    fn default_layers_match_named_groups() {
        let layers = LayerConfig::default();
        assert_eq!(layers.placement(), WALLS_GROUP | GROUND_GROUP);
        assert!(layers.tracked().contains(PLAYER_GROUP));
        assert!(layers.overlap().contains(PORTAL_GROUP));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            PortalConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            PortalConfig::load("/definitely/not/here.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
