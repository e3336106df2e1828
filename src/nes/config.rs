use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use super::bus::Clock;
use super::ppu::{NTSC_SCANLINES, PAL_SCANLINES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSystem {
    #[default]
    Ntsc,
    Pal,
}

impl VideoSystem {
    pub fn scanlines_per_frame(self) -> u16 {
        match self {
            Self::Ntsc => NTSC_SCANLINES,
            Self::Pal => PAL_SCANLINES,
        }
    }

    pub fn clock(self) -> Clock {
        match self {
            Self::Ntsc => Clock::ntsc(),
            Self::Pal => Clock::pal(),
        }
    }
}

/// Engine settings fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub video_system: VideoSystem,
    /// Eight sprites per line when set, all 64 otherwise.
    pub sprite_limit: bool,
    /// Frames after power or reset during which the pixel engine ignores
    /// register writes and outputs a blank picture.
    pub dead_frames: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video_system: VideoSystem::Ntsc,
            sprite_limit: true,
            dead_frames: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid engine config JSON")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn clock(&self) -> Clock {
        self.video_system.clock()
    }

    pub fn scanlines_per_frame(&self) -> u16 {
        self.video_system.scanlines_per_frame()
    }
}
