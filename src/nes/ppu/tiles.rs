use super::lut::{ATTRIBUTE, PLANE0, PLANE1};
use super::{
    CTRL_BG_TABLE, CTRL_SPRITE_SIZE_16, FRAME_WIDTH, LINE_FIX_PIXEL, MASK_SHOW_BG,
    MASK_SHOW_BG_LEFT, MAX_LINE_TILES, NO_SPRITE_HIT, PIXEL_BG_TRANSPARENT, Ppu,
    STATUS_SPRITE_ZERO_HIT, fetch_hook, step_x,
};
use crate::nes::cart::Cart;
use crate::nes::mapper::MapperRef;

impl Ppu {
    /// Catches the line up to `last_pixel`, measured in dots from the line's
    /// reference point. Tiles run two ahead of the visible pixels, so tile
    /// `n` produces output pixels `(n - 2) * 8 ..`.
    pub(super) fn refresh_line(
        &mut self,
        last_pixel: i64,
        cart: &mut Cart,
        mapper: &mut MapperRef<'_>,
    ) {
        let Some(row) = self.line_row else {
            return;
        };
        let row_start = row * FRAME_WIDTH;

        let mut last_tile = last_pixel >> 3;
        // Let a pending sprite-0 hit land within the same access that
        // reaches its pixel.
        if self.sprite_hit_x != NO_SPRITE_HIT
            && self.status & STATUS_SPRITE_ZERO_HIT == 0
            && (self.sprite_hit_x as i64) < last_pixel - 16
            && (self.sprite_hit_x as i64) >= (last_tile - 2) * 8
        {
            last_tile += 1;
        }
        last_tile = last_tile.min(MAX_LINE_TILES);

        let num_tiles = last_tile - self.first_tile;
        if num_tiles <= 0 {
            return;
        }
        self.debug.line_refreshes = self.debug.line_refreshes.wrapping_add(1);

        let backdrop = self.palette_ram[0] | PIXEL_BG_TRANSPARENT;

        // Tiles 0 and 1 are fetch-only; output starts with tile 2.
        let out_start = (self.first_tile - 2).max(0) as usize * 8;
        let out_count = (last_tile - 2).max(0) as usize * 8 - out_start;

        if !self.rendering_enabled() {
            fill_row(&mut self.frame_buffer, row_start, out_start, out_count, backdrop);
            self.line_pos = out_start + out_count;
            self.first_tile = last_tile;
            if last_pixel >= LINE_FIX_PIXEL && self.pending_y_step {
                self.increment_y();
                self.pending_y_step = false;
            }
            return;
        }

        let mut colors = [0u8; 16];
        colors.copy_from_slice(&self.palette_ram[..16]);
        for group in (0..16).step_by(4) {
            colors[group] = backdrop;
        }

        for tile in self.first_tile..last_tile {
            self.fetch_tile(tile, row_start, &colors, cart, mapper);
        }

        if self.first_tile <= 2 && 2 < last_tile && self.mask & MASK_SHOW_BG_LEFT == 0 {
            fill_row(&mut self.frame_buffer, row_start, 0, 8, backdrop);
        }

        if self.mask & MASK_SHOW_BG == 0 {
            fill_row(&mut self.frame_buffer, row_start, out_start, out_count, backdrop);
        }

        if last_pixel >= LINE_FIX_PIXEL && self.pending_y_step {
            self.increment_y();
            self.pending_y_step = false;
        }

        self.check_sprite_hit(last_pixel);
        self.first_tile = last_tile;
    }

    /// One background tile: shifts out the previous tile's pixels, then
    /// fetches the nametable, attribute and pattern bytes and steps coarse X.
    fn fetch_tile(
        &mut self,
        tile: i64,
        row_start: usize,
        colors: &[u8; 16],
        cart: &mut Cart,
        mapper: &mut MapperRef<'_>,
    ) {
        self.debug.tiles_fetched = self.debug.tiles_fetched.wrapping_add(1);

        if tile >= 2 {
            let shift = 8 - self.fine_x as u32;
            let pixels = PLANE0[((self.pattern_shift[0] >> shift) & 0xFF) as usize]
                | PLANE1[((self.pattern_shift[1] >> shift) & 0xFF) as usize]
                | ATTRIBUTE[(self.fine_x | (self.attr_latch << 3)) as usize & 0x7F];
            if self.line_pos + 8 <= FRAME_WIDTH {
                let dst = row_start + self.line_pos;
                for (idx, out) in self.frame_buffer[dst..dst + 8].iter_mut().enumerate() {
                    *out = colors[((pixels >> (idx * 4)) & 0x0F) as usize];
                }
            }
            self.line_pos += 8;
        }

        let v = self.v;
        let quadrant = ((v >> 10) & 0x03) as usize;
        let pattern_base = ((self.ctrl & CTRL_BG_TABLE) as u16) << 8 | ((v >> 12) & 0x07);

        let tile_index = cart.nt_read(quadrant, (v & 0x3FF) as usize);
        let pattern_addr = ((tile_index as u16) << 4) + pattern_base;
        fetch_hook(mapper, 0x2000 | (v & 0x0FFF), cart);

        let coarse_x = v & 0x1F;
        let attr_offset = 0x3C0 + (coarse_x >> 2) + ((v & 0x380) >> 4);
        let attr = cart.nt_read(quadrant, attr_offset as usize);
        let attr_shift = (coarse_x & 0x02) + ((v & 0x40) >> 4);
        let palette_group = (attr >> attr_shift) & 0x03;
        self.attr_latch = (self.attr_latch >> 2) | (palette_group << 2);

        self.pattern_shift[0] <<= 8;
        self.pattern_shift[1] <<= 8;

        let (lo, hi) = self.background_pattern(pattern_addr, cart, mapper);
        fetch_hook(mapper, pattern_addr, cart);
        self.pattern_shift[0] |= lo as u32;
        self.pattern_shift[1] |= hi as u32;

        self.v = step_x(v);
        fetch_hook(mapper, 0x2000 | (self.v & 0x0FFF), cart);
    }

    /// Pattern planes are read before the fetch hook runs, so a bank switch
    /// triggered by this fetch only affects later tiles.
    fn background_pattern(
        &self,
        addr: u16,
        cart: &Cart,
        mapper: &mut MapperRef<'_>,
    ) -> (u8, u8) {
        let tall = self.ctrl & CTRL_SPRITE_SIZE_16 != 0;
        if let Some(ext) = mapper.as_deref().and_then(|m| m.extended_chr()) {
            return (
                ext.background_byte(addr, tall, cart),
                ext.background_byte(addr + 8, tall, cart),
            );
        }
        (cart.chr_read(addr), cart.chr_read(addr + 8))
    }

    /// Reports sprite 0 once any of its opaque pixels overlaps an opaque
    /// background pixel drawn so far.
    pub(super) fn check_sprite_hit(&mut self, last_pixel: i64) {
        if self.sprite_hit_x == NO_SPRITE_HIT {
            return;
        }
        let Some(row) = self.line_row else {
            return;
        };
        let row_start = row * FRAME_WIDTH;
        let limit = (last_pixel - 16).min(255);
        let hit_x = self.sprite_hit_x as i64;

        for x in hit_x..hit_x + 8 {
            if x >= limit {
                break;
            }
            let bit = 0x80u8 >> (x - hit_x);
            if self.sprite_hit_mask & bit != 0
                && self.frame_buffer[row_start + x as usize] & PIXEL_BG_TRANSPARENT == 0
            {
                self.status |= STATUS_SPRITE_ZERO_HIT;
                self.sprite_hit_x = NO_SPRITE_HIT;
                self.debug.sprite0_hit_events = self.debug.sprite0_hit_events.wrapping_add(1);
                self.debug.sprite0_hit_last_scanline = self.scanline as i16;
                self.debug.sprite0_hit_last_x = x as i16;
                log::trace!("sprite 0 hit at line {} x {x}", self.scanline);
                break;
            }
        }
    }
}

fn fill_row(buffer: &mut [u8], row_start: usize, start: usize, count: usize, value: u8) {
    let end = (start + count).min(FRAME_WIDTH);
    if start < end {
        buffer[row_start + start..row_start + end].fill(value);
    }
}
