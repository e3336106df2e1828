//! Golden-frame scenes: a cartridge-free description of pattern data, video
//! memory and timed register writes, rendered through the real frame loop and
//! summarised as a SHA-1 digest of the framebuffer.

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{fs, path::Path};

use crate::nes::Nes;
use crate::nes::bus::MASTER_PER_CPU_CYCLE;
use crate::nes::cart::Mirroring;
use crate::nes::cartridge::Cartridge;
use crate::nes::config::{EngineConfig, VideoSystem};
use crate::nes::cpu::ScriptedCpu;
use crate::nes::ppu::{DOTS_PER_SCANLINE, FRAME_HEIGHT};

const NAMETABLE_BYTES: usize = 0x400;
const CHR_RAM_SIZE: usize = 0x2000;
/// Dots from the start of the pre-render line to the reference point of
/// visible line 0.
const LINE0_FROM_PRE_RENDER: u64 = 256 + 69;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneMirroring {
    #[default]
    Horizontal,
    Vertical,
    SingleLower,
    SingleUpper,
    FourScreen,
}

impl From<SceneMirroring> for Mirroring {
    fn from(value: SceneMirroring) -> Self {
        match value {
            SceneMirroring::Horizontal => Mirroring::Horizontal,
            SceneMirroring::Vertical => Mirroring::Vertical,
            SceneMirroring::SingleLower => Mirroring::OneScreenLower,
            SceneMirroring::SingleUpper => Mirroring::OneScreenUpper,
            SceneMirroring::FourScreen => Mirroring::FourScreen,
        }
    }
}

/// CPU write at a fixed beam position. Scanlines count from 0 (first
/// visible line); 240 and up are the idle line and vertical blank. On
/// visible lines dots 16..272 draw pixels 0..256; elsewhere `dot` counts
/// from the start of the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneWrite {
    pub frame: u32,
    pub scanline: u16,
    pub dot: u16,
    pub addr: u16,
    pub value: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scene {
    pub video_system: VideoSystem,
    pub sprite_limit: bool,
    pub mirroring: SceneMirroring,
    /// Base64 pattern data; empty selects 8 KiB of zeroed CHR RAM.
    pub chr: String,
    /// Nametable bytes, 1 KiB per quadrant starting at quadrant 0.
    pub nametables: Vec<u8>,
    pub palette: Vec<u8>,
    pub oam: Vec<u8>,
    pub writes: Vec<SceneWrite>,
    pub frames: u32,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            video_system: VideoSystem::Ntsc,
            sprite_limit: true,
            mirroring: SceneMirroring::Horizontal,
            chr: String::new(),
            nametables: Vec::new(),
            palette: Vec::new(),
            oam: Vec::new(),
            writes: Vec::new(),
            frames: 1,
        }
    }
}

impl Scene {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid scene JSON")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read scene: {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    fn config(&self) -> EngineConfig {
        EngineConfig {
            video_system: self.video_system,
            sprite_limit: self.sprite_limit,
            dead_frames: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        let scanlines = self.video_system.scanlines_per_frame();
        let quadrants = if self.mirroring == SceneMirroring::FourScreen {
            4
        } else {
            2
        };
        if self.nametables.len() > quadrants * NAMETABLE_BYTES {
            bail!(
                "scene has {} nametable bytes, {:?} mirroring holds {}",
                self.nametables.len(),
                self.mirroring,
                quadrants * NAMETABLE_BYTES
            );
        }
        if self.palette.len() > 32 {
            bail!("scene palette has {} entries, at most 32", self.palette.len());
        }
        if self.oam.len() > 256 {
            bail!("scene OAM has {} bytes, at most 256", self.oam.len());
        }
        for write in &self.writes {
            if write.frame >= self.frames {
                bail!(
                    "write to ${:04X} at frame {} is past the last frame ({})",
                    write.addr,
                    write.frame,
                    self.frames
                );
            }
            if write.scanline >= scanlines || u32::from(write.dot) >= DOTS_PER_SCANLINE {
                bail!(
                    "write to ${:04X} at line {} dot {} is outside the frame",
                    write.addr,
                    write.scanline,
                    write.dot
                );
            }
        }
        Ok(())
    }

    fn cartridge(&self) -> Result<Cartridge> {
        let chr_data = STANDARD
            .decode(self.chr.trim())
            .context("scene chr is not valid base64")?;
        if chr_data.len() % 0x400 != 0 {
            bail!(
                "scene chr holds {} bytes, expected a multiple of 1 KiB",
                chr_data.len()
            );
        }
        let chr_is_ram = chr_data.is_empty();
        let four_screen = self.mirroring == SceneMirroring::FourScreen;
        Ok(Cartridge {
            mapper_id: 0,
            submapper_id: 0,
            mirroring: self.mirroring.into(),
            four_screen,
            has_battery_backed_ram: false,
            prg_rom: vec![0; 0x4000],
            chr_data: if chr_is_ram {
                vec![0; CHR_RAM_SIZE]
            } else {
                chr_data
            },
            chr_is_ram,
            prg_ram_size: 0x2000,
        })
    }
}

/// Hex SHA-1 of a framebuffer.
pub fn frame_digest(frame: &[u8]) -> String {
    format!("{:x}", Sha1::digest(frame))
}

/// CPU cycle, counted from power-on with no dead frames, at which `write`
/// lands. Odd frames drop one dot from the pre-render line.
pub fn scene_cycle(write: &SceneWrite, video_system: VideoSystem) -> u64 {
    let scanlines = video_system.scanlines_per_frame() as u64;
    let dots_per_line = DOTS_PER_SCANLINE as u64;
    let frame_dots = scanlines * dots_per_line;
    let frame = write.frame as u64;
    let frame_start = frame * frame_dots - frame / 2;
    let odd = frame % 2;

    let line = write.scanline as u64;
    let visible_lines = FRAME_HEIGHT as u64;
    let line_dots = if line >= visible_lines {
        (line - visible_lines) * dots_per_line
    } else {
        let line0 = (scanlines - visible_lines - 1) * dots_per_line + LINE0_FROM_PRE_RENDER;
        let skip = if line >= 1 { odd } else { 0 };
        line0 + line * dots_per_line - skip
    };

    let dot_units = video_system.clock().dot_units() as u64;
    (frame_start + line_dots + write.dot as u64) * dot_units / MASTER_PER_CPU_CYCLE as u64
}

/// Renders `scene` and returns the digest of the final frame.
pub fn run_scene(scene: &Scene) -> Result<String> {
    scene.validate()?;
    let mut nes = Nes::new(ScriptedCpu::new(), scene.config());
    nes.load_cartridge(scene.cartridge()?)?;

    for (idx, byte) in scene.nametables.iter().enumerate() {
        nes.cart_mut()
            .nt_write(idx / NAMETABLE_BYTES, idx % NAMETABLE_BYTES, *byte);
    }
    {
        let ppu = &mut nes.system_mut().ppu;
        ppu.load_palette(&scene.palette);
        ppu.load_oam(&scene.oam);
    }
    for write in &scene.writes {
        let cycle = scene_cycle(write, scene.video_system);
        nes.cpu_mut().write_at(cycle, write.addr, write.value);
    }

    for _ in 0..scene.frames {
        nes.run_frame();
    }
    log::debug!(
        "scene rendered {} frame(s), {} write(s) left unexecuted",
        scene.frames,
        nes.cpu().pending_ops()
    );
    Ok(frame_digest(nes.frame_buffer()))
}

/// One `<scene>` entry of a suite file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteEntry {
    pub file: String,
    /// Overrides the scene's own frame count.
    pub frames: Option<u32>,
    pub sha1: String,
}

pub fn parse_suite(xml: &str) -> Result<Vec<SuiteEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"scene" => {
                entries.push(parse_entry(&e, &reader)?);
            }
            Ok(Event::Eof) => break,
            Err(err) => bail!(
                "failed to parse suite XML at byte {}: {err}",
                reader.buffer_position()
            ),
            _ => {}
        }
    }
    Ok(entries)
}

fn parse_entry(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<SuiteEntry> {
    let mut file = String::new();
    let mut frames = None;
    let mut sha1 = String::new();
    for attr in e.attributes().flatten() {
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map(|v| v.to_string())
            .unwrap_or_default();
        match attr.key.as_ref() {
            b"file" => file = value,
            b"frames" => {
                frames = Some(
                    value
                        .parse::<u32>()
                        .with_context(|| format!("invalid frames value: {value}"))?,
                )
            }
            b"sha1" => sha1 = value.trim().to_ascii_lowercase(),
            _ => {}
        }
    }
    if file.is_empty() {
        bail!("<scene> entry without a file attribute");
    }
    Ok(SuiteEntry { file, frames, sha1 })
}
