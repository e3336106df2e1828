mod lut;
mod sprites;
mod tiles;

use super::bus::Clock;
use super::cart::Cart;
use super::mapper::MapperRef;
use super::state::{StateVisitor, visit_bool, visit_u8, visit_u16, visit_u32};

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

pub const DOTS_PER_SCANLINE: u32 = 341;
pub const NTSC_SCANLINES: u16 = 262;
pub const PAL_SCANLINES: u16 = 312;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_VRAM_INC_32: u8 = 0x04;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

/// Set on framebuffer bytes where the background pixel is transparent.
pub const PIXEL_BG_TRANSPARENT: u8 = 0x40;
/// Framebuffer fill used while the engine is dead after power-on.
pub const PIXEL_DEAD: u8 = 0x80;

const SPRITE_NONE: u8 = 0x80;
const NO_SPRITE_HIT: u16 = 0x100;

/// Line position, in dots from the line's reference point, past which the
/// vertical scroll step is applied.
const LINE_FIX_PIXEL: i64 = 272 - 4;
const LINE_END_PIXEL: i64 = 272;
const MAX_LINE_TILES: i64 = 34;

#[derive(Debug, Clone, Copy, Default)]
pub struct PpuDebugCounters {
    pub vblank_entries: u64,
    pub nmi_edges: u64,
    pub retroactive_nmis: u64,
    pub status_reads: u64,
    pub status_read_last_scanline: i16,
    pub scroll_writes_2005: u64,
    pub addr_writes_2006: u64,
    pub data_reads: u64,
    pub data_writes: u64,
    pub oam_writes: u64,
    pub dead_writes_dropped: u64,
    pub line_refreshes: u64,
    pub tiles_fetched: u64,
    pub hook_fetches: u64,
    pub sprite_overflow_events: u64,
    pub sprite_overflow_last_scanline: i16,
    pub sprite0_hit_events: u64,
    pub sprite0_hit_last_scanline: i16,
    pub sprite0_hit_last_x: i16,
    pub last_read_addr: u16,
    pub last_write_addr: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct SpriteSlot {
    lo: u8,
    hi: u8,
    attr: u8,
    x: u8,
}

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,
    oam_addr: u8,
    /// Low OAM write pointer used for the first eight bytes after $2003.
    oam_spl: u8,
    gen_latch: u8,
    read_buffer: u8,

    write_toggle: bool,
    v: u16,
    t: u16,
    fine_x: u8,

    oam: [u8; 256],
    palette_ram: [u8; 32],

    dead_frames: u8,
    odd_frame: bool,
    scanline: u16,
    scanlines_per_frame: u16,

    line_row: Option<usize>,
    line_pos: usize,
    first_tile: i64,
    line_start: i64,
    pending_y_step: bool,
    pattern_shift: [u32; 2],
    attr_latch: u8,

    sprite_buf: [SpriteSlot; 64],
    sprite_count: usize,
    sprite_limit: usize,
    sprite0_in_buf: bool,
    sprite_line: [u8; FRAME_WIDTH + 8],
    sprites_on_line: bool,
    sprite_hit_x: u16,
    sprite_hit_mask: u8,

    emphasis: u8,
    emphasis_lines: [u32; 8],
    frame_emphasis: u8,

    frame_buffer: Vec<u8>,
    nmi_pending: bool,
    debug: PpuDebugCounters,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam_spl: 0,
            gen_latch: 0,
            read_buffer: 0,
            write_toggle: false,
            v: 0,
            t: 0,
            fine_x: 0,
            oam: [0; 256],
            palette_ram: [0; 32],
            dead_frames: 0,
            odd_frame: false,
            scanline: FRAME_HEIGHT as u16,
            scanlines_per_frame: NTSC_SCANLINES,
            line_row: None,
            line_pos: 0,
            first_tile: 0,
            line_start: 0,
            pending_y_step: false,
            pattern_shift: [0; 2],
            attr_latch: 0,
            sprite_buf: [SpriteSlot::default(); 64],
            sprite_count: 0,
            sprite_limit: 8,
            sprite0_in_buf: false,
            sprite_line: [SPRITE_NONE; FRAME_WIDTH + 8],
            sprites_on_line: false,
            sprite_hit_x: NO_SPRITE_HIT,
            sprite_hit_mask: 0,
            emphasis: 0,
            emphasis_lines: [0; 8],
            frame_emphasis: 0,
            frame_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
            nmi_pending: false,
            debug: PpuDebugCounters::default(),
        }
    }

    pub fn set_scanlines_per_frame(&mut self, scanlines: u16) {
        self.scanlines_per_frame = scanlines;
    }

    pub fn scanlines_per_frame(&self) -> u16 {
        self.scanlines_per_frame
    }

    /// `true` keeps the hardware limit of eight sprites per line.
    pub fn set_sprite_limit(&mut self, limited: bool) {
        self.sprite_limit = if limited { 8 } else { 64 };
    }

    pub fn power(&mut self, dead_frames: u8) {
        self.oam.fill(0);
        self.palette_ram.fill(0);
        self.reset(dead_frames);
    }

    pub fn reset(&mut self, dead_frames: u8) {
        self.ctrl = 0;
        self.mask = 0;
        self.status = 0;
        self.oam_addr = 0;
        self.oam_spl = 0;
        self.gen_latch = 0;
        self.read_buffer = 0;
        self.v = 0;
        self.t = 0;
        self.write_toggle = false;
        self.dead_frames = dead_frames;
        self.odd_frame = false;
        self.sprite_hit_x = 0;
        self.sprite_hit_mask = 0;
        self.pattern_shift = [0; 2];
        self.fine_x = 0;
        self.nmi_pending = false;
        self.line_row = None;
        log::debug!("ppu reset, {dead_frames} dead frame(s)");
    }

    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    pub fn debug_ctrl(&self) -> u8 {
        self.ctrl
    }

    pub fn debug_mask(&self) -> u8 {
        self.mask
    }

    pub fn debug_status(&self) -> u8 {
        self.status
    }

    pub fn debug_vram_addr(&self) -> (u16, u16, u8, bool) {
        (self.v, self.t, self.fine_x, self.write_toggle)
    }

    pub fn debug_scanline(&self) -> u16 {
        self.scanline
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[index & 0x1F]
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.oam[index & 0xFF]
    }

    pub fn debug_counters(&self) -> PpuDebugCounters {
        self.debug
    }

    pub fn dead_frames(&self) -> u8 {
        self.dead_frames
    }

    /// Most frequent colour-emphasis value over the last rendered frame.
    pub fn frame_emphasis(&self) -> u8 {
        self.frame_emphasis
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending)
    }

    pub(crate) fn rendering_enabled(&self) -> bool {
        self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES) != 0
    }

    pub(crate) fn sprites_enabled(&self) -> bool {
        self.mask & MASK_SHOW_SPRITES != 0
    }

    pub(crate) fn nmi_enabled(&self) -> bool {
        self.ctrl & CTRL_NMI_ENABLE != 0
    }

    /// Hblank callbacks are skipped when background and sprites both fetch
    /// from $1000 in 8x8 mode.
    pub(crate) fn hblank_hook_allowed(&self) -> bool {
        self.rendering_enabled()
            && self.ctrl & (CTRL_SPRITE_SIZE_16 | CTRL_BG_TABLE | CTRL_SPRITE_TABLE)
                != (CTRL_BG_TABLE | CTRL_SPRITE_TABLE)
    }

    pub(crate) fn scanline(&self) -> u16 {
        self.scanline
    }

    pub(crate) fn odd_frame(&self) -> bool {
        self.odd_frame
    }

    pub(crate) fn toggle_frame_parity(&mut self) {
        self.odd_frame = !self.odd_frame;
    }

    pub(crate) fn fill_dead_frame(&mut self) {
        self.frame_buffer.fill(PIXEL_DEAD);
    }

    pub(crate) fn end_dead_frame(&mut self) {
        self.dead_frames = self.dead_frames.saturating_sub(1);
    }

    pub(crate) fn enter_vblank(&mut self) {
        self.debug.vblank_entries = self.debug.vblank_entries.wrapping_add(1);
        self.status |= STATUS_VBLANK;
        self.oam_addr = 0;
        self.oam_spl = 0;
    }

    pub(crate) fn raise_vblank_nmi(&mut self) -> bool {
        if self.nmi_enabled() {
            self.debug.nmi_edges = self.debug.nmi_edges.wrapping_add(1);
            return true;
        }
        false
    }

    pub(crate) fn leave_vblank(&mut self) {
        self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
    }

    pub(crate) fn reload_vram_addr(&mut self) {
        self.v = self.t;
    }

    pub(crate) fn vram_addr(&self) -> u16 {
        self.v
    }

    /// Forgets sprites fetched during the previous frame.
    pub(crate) fn begin_frame(&mut self) {
        self.sprites_on_line = false;
        self.sprite_count = 0;
    }

    pub(crate) fn start_visible_lines(&mut self) {
        self.scanline = 0;
        self.emphasis = self.mask >> 5;
    }

    /// Copies up to 256 bytes into sprite memory starting at entry 0.
    pub fn load_oam(&mut self, data: &[u8]) {
        let len = data.len().min(self.oam.len());
        self.oam[..len].copy_from_slice(&data[..len]);
    }

    /// Copies up to 32 palette entries; values keep their low six bits.
    pub fn load_palette(&mut self, data: &[u8]) {
        for (slot, value) in self.palette_ram.iter_mut().zip(data) {
            *slot = value & 0x3F;
        }
    }

    pub(crate) fn count_line_emphasis(&mut self) {
        let slot = &mut self.emphasis_lines[self.emphasis as usize & 7];
        *slot = slot.wrapping_add(1);
    }

    pub(crate) fn end_frame(&mut self) {
        let mut best = 0;
        let mut best_count = 0;
        for (value, count) in self.emphasis_lines.iter_mut().enumerate() {
            if *count > best_count {
                best_count = *count;
                best = value as u8;
            }
            *count = 0;
        }
        self.frame_emphasis = best;
    }

    /// Starts a new output line. `clock` supplies the reference point that
    /// later register accesses measure their pixel position from.
    pub(crate) fn begin_line(
        &mut self,
        row: usize,
        cart: &mut Cart,
        clock: &Clock,
        mapper: MapperRef<'_>,
    ) {
        let start = row * FRAME_WIDTH;
        self.frame_buffer[start..start + FRAME_WIDTH].fill(0xFF);
        self.line_row = Some(row);
        self.line_pos = 0;
        self.first_tile = 0;
        self.line_start = clock.scheduled_master();
        self.pending_y_step = false;
        self.line_update(cart, clock, mapper);
        self.pending_y_step = true;
    }

    /// Renders every tile the beam has passed since the last flush.
    pub fn line_update(&mut self, cart: &mut Cart, clock: &Clock, mapper: MapperRef<'_>) {
        if self.line_row.is_none() {
            return;
        }
        let elapsed = clock.master_now() - self.line_start;
        let pixel = elapsed.div_euclid(clock.dot_units());
        let mut mapper = mapper;
        self.refresh_line(pixel, cart, &mut mapper);
    }

    pub(crate) fn end_line(&mut self, cart: &mut Cart, mapper: MapperRef<'_>) {
        let mut mapper = mapper;
        self.refresh_line(LINE_END_PIXEL, cart, &mut mapper);
        if self.pending_y_step {
            self.increment_y();
        }
        self.check_sprite_hit(LINE_END_PIXEL);
        self.line_row = None;
    }

    /// Sprite overlay, greyscale and emphasis for the line just finished.
    pub(crate) fn finish_line(&mut self) {
        let row = self.scanline as usize;
        if self.sprites_enabled() {
            self.copy_sprites(row);
        }

        let grayscale = self.rendering_enabled() && self.mask & MASK_GRAYSCALE != 0;
        let emphasis = self.mask >> 5;
        let start = row * FRAME_WIDTH;
        let line = &mut self.frame_buffer[start..start + FRAME_WIDTH];
        for chunk in line.chunks_exact_mut(4) {
            let mut word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if grayscale {
                word &= 0x3030_3030;
            }
            word = if emphasis == 0x07 {
                (word & 0x3F3F_3F3F) | 0xC0C0_C0C0
            } else if emphasis != 0 {
                word | 0x4040_4040
            } else {
                (word & 0x3F3F_3F3F) | 0x8080_8080
            };
            chunk.copy_from_slice(&word.to_le_bytes());
        }

        self.sprite_hit_x = NO_SPRITE_HIT;
    }

    pub(crate) fn advance_scanline(&mut self) -> u16 {
        self.scanline += 1;
        self.scanline
    }

    /// Coarse X/Y restore from `t` at the start of horizontal blank.
    pub(crate) fn copy_horizontal_bits(&mut self) {
        if self.rendering_enabled() {
            self.v = (self.v & 0xFBE0) | (self.t & 0x041F);
        }
    }

    /// Vertical scroll step. Coarse Y wraps 29 -> 0 with a nametable flip
    /// and 31 -> 0 without one; rows 30 and 31 are reachable by writing
    /// them directly.
    pub(crate) fn increment_y(&mut self) {
        if !self.rendering_enabled() {
            return;
        }
        self.v = step_y(self.v);
    }

    pub fn read_register(
        &mut self,
        addr: u16,
        cart: &mut Cart,
        clock: &Clock,
        mapper: MapperRef<'_>,
    ) -> u8 {
        let mut mapper = mapper;
        self.debug.last_read_addr = addr;
        match addr & 0x07 {
            2 => {
                self.line_update(cart, clock, mapper.as_deref_mut());
                self.debug.status_reads = self.debug.status_reads.wrapping_add(1);
                self.debug.status_read_last_scanline = self.scanline as i16;
                let value = self.status | (self.gen_latch & 0x1F);
                self.write_toggle = false;
                self.status &= !STATUS_VBLANK;
                self.gen_latch = value;
                value
            }
            4 => {
                self.line_update(cart, clock, mapper.as_deref_mut());
                let value = self.oam[self.oam_addr as usize];
                self.gen_latch = value;
                value
            }
            7 => self.read_data(cart, clock, &mut mapper),
            _ => {
                self.line_update(cart, clock, mapper.as_deref_mut());
                self.gen_latch
            }
        }
    }

    fn read_data(&mut self, cart: &mut Cart, clock: &Clock, mapper: &mut MapperRef<'_>) -> u8 {
        let addr = self.v & 0x3FFF;
        self.line_update(cart, clock, mapper.as_deref_mut());
        self.debug.data_reads = self.debug.data_reads.wrapping_add(1);

        fetch_hook(mapper, addr, cart);
        let value = if addr >= 0x3F00 {
            // Palette bytes come straight out; the buffer picks up the
            // nametable byte hidden underneath.
            self.read_buffer = cart.nt_read((addr as usize >> 10) & 3, addr as usize & 0x3FF);
            (self.gen_latch & 0xC0) | self.palette_ram[palette_read_index(addr)]
        } else {
            let buffered = self.read_buffer;
            self.read_buffer = if addr < 0x2000 {
                cart.chr_read(addr)
            } else {
                cart.nt_read((addr as usize >> 10) & 3, addr as usize & 0x3FF)
            };
            buffered
        };
        self.gen_latch = value;

        if self.rendering_enabled() && (self.scanline as usize) < FRAME_HEIGHT {
            self.v = step_y(self.v);
        } else {
            self.increment_vram_addr();
        }
        fetch_hook(mapper, self.v & 0x3FFF, cart);
        value
    }

    pub fn write_register(
        &mut self,
        addr: u16,
        value: u8,
        cart: &mut Cart,
        clock: &Clock,
        mapper: MapperRef<'_>,
    ) {
        let mut mapper = mapper;
        let reg = addr & 0x07;
        self.debug.last_write_addr = addr;
        self.gen_latch = value;

        if self.dead_frames > 0 && matches!(reg, 0 | 1 | 5 | 6) {
            self.debug.dead_writes_dropped = self.debug.dead_writes_dropped.wrapping_add(1);
            return;
        }

        match reg {
            0 => {
                self.line_update(cart, clock, mapper.as_deref_mut());
                if self.ctrl & CTRL_NMI_ENABLE == 0
                    && value & CTRL_NMI_ENABLE != 0
                    && self.status & STATUS_VBLANK != 0
                {
                    self.debug.retroactive_nmis = self.debug.retroactive_nmis.wrapping_add(1);
                    self.nmi_pending = true;
                }
                self.ctrl = value;
                self.t = (self.t & 0xF3FF) | (((value as u16) & 0x03) << 10);
            }
            1 => {
                self.line_update(cart, clock, mapper.as_deref_mut());
                self.mask = value;
                if value & 0xE0 != 0 {
                    self.emphasis = value >> 5;
                }
            }
            2 => {}
            3 => {
                self.oam_addr = value;
                self.oam_spl = value & 0x07;
            }
            4 => {
                self.debug.oam_writes = self.debug.oam_writes.wrapping_add(1);
                if self.oam_spl >= 8 {
                    if self.oam_addr >= 8 {
                        self.oam[self.oam_addr as usize] = value;
                    }
                } else {
                    self.oam[self.oam_spl as usize] = value;
                }
                self.oam_addr = self.oam_addr.wrapping_add(1);
                self.oam_spl = self.oam_spl.wrapping_add(1);
            }
            5 => {
                self.line_update(cart, clock, mapper.as_deref_mut());
                self.debug.scroll_writes_2005 = self.debug.scroll_writes_2005.wrapping_add(1);
                if !self.write_toggle {
                    self.t = (self.t & 0xFFE0) | ((value as u16) >> 3);
                    self.fine_x = value & 0x07;
                } else {
                    self.t = (self.t & 0x8C1F)
                        | (((value as u16) & !0x07) << 2)
                        | (((value as u16) & 0x07) << 12);
                }
                self.write_toggle = !self.write_toggle;
            }
            6 => {
                self.line_update(cart, clock, mapper.as_deref_mut());
                self.debug.addr_writes_2006 = self.debug.addr_writes_2006.wrapping_add(1);
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0xFF00) | value as u16;
                    self.v = self.t;
                    fetch_hook(&mut mapper, self.v, cart);
                }
                self.write_toggle = !self.write_toggle;
            }
            _ => self.write_data(value, cart, &mut mapper),
        }
    }

    fn write_data(&mut self, value: u8, cart: &mut Cart, mapper: &mut MapperRef<'_>) {
        let addr = self.v & 0x3FFF;
        self.debug.data_writes = self.debug.data_writes.wrapping_add(1);
        if addr >= 0x3F00 {
            let idx = (addr & 0x1F) as usize;
            if idx & 0x0F == 0 {
                for entry in [0x00, 0x04, 0x08, 0x0C] {
                    self.palette_ram[entry] = value & 0x3F;
                }
            } else if idx & 0x03 != 0 {
                self.palette_ram[idx] = value & 0x3F;
            }
        } else if addr < 0x2000 {
            cart.chr_write(addr, value);
        } else {
            cart.nt_write((addr as usize >> 10) & 3, addr as usize & 0x3FF, value);
        }
        self.increment_vram_addr();
        fetch_hook(mapper, self.v & 0x3FFF, cart);
    }

    fn increment_vram_addr(&mut self) {
        let step = if self.ctrl & CTRL_VRAM_INC_32 != 0 {
            32
        } else {
            1
        };
        self.v = self.v.wrapping_add(step) & 0x7FFF;
    }

    pub fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visitor.region("PRAM", &mut self.palette_ram);
        visitor.region("SPRA", &mut self.oam);
        let mut regs = [self.ctrl, self.mask, self.status, self.oam_addr];
        visitor.region("PPUR", &mut regs);
        [self.ctrl, self.mask, self.status, self.oam_addr] = regs;
        visit_bool(visitor, "PARI", &mut self.odd_frame);
        visit_u8(visitor, "DEAD", &mut self.dead_frames);
        visit_u8(visitor, "PSPL", &mut self.oam_spl);
        visit_u8(visitor, "XOFF", &mut self.fine_x);
        visit_bool(visitor, "VTOG", &mut self.write_toggle);
        visit_u16(visitor, "RADD", &mut self.v);
        visit_u16(visitor, "TADD", &mut self.t);
        visit_u8(visitor, "VBUF", &mut self.read_buffer);
        visit_u8(visitor, "PGEN", &mut self.gen_latch);
        visit_u32(visitor, "PSH1", &mut self.pattern_shift[0]);
        visit_u32(visitor, "PSH2", &mut self.pattern_shift[1]);
        let mut hit_x = self.sprite_hit_x as u32;
        visit_u32(visitor, "Psph", &mut hit_x);
        self.sprite_hit_x = hit_x.min(NO_SPRITE_HIT as u32) as u16;
        visit_u8(visitor, "Pspd", &mut self.sprite_hit_mask);
    }
}

/// Vertical step on a VRAM address, including the attribute-row wrap.
fn step_y(addr: u16) -> u16 {
    let mut addr = addr;
    if addr & 0x7000 == 0x7000 {
        addr ^= 0x7000;
        match addr & 0x03E0 {
            0x03A0 => addr ^= 0x0BA0,
            0x03E0 => addr ^= 0x03E0,
            _ => addr += 0x20,
        }
    } else {
        addr += 0x1000;
    }
    addr
}

/// Horizontal step: coarse X wraps 31 -> 0 and flips the nametable.
fn step_x(addr: u16) -> u16 {
    if addr & 0x1F == 0x1F {
        addr ^ 0x041F
    } else {
        addr + 1
    }
}

fn palette_read_index(addr: u16) -> usize {
    let idx = (addr & 0x1F) as usize;
    if idx & 0x03 == 0 { 0 } else { idx }
}

fn fetch_hook(mapper: &mut MapperRef<'_>, addr: u16, cart: &mut Cart) {
    if let Some(mapper) = mapper.as_deref_mut()
        && mapper.wants_fetch_hook()
    {
        mapper.ppu_fetch(addr, cart);
    }
}
