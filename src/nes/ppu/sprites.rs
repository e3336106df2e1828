use super::lut::{PLANE0, PLANE1};
use super::{
    CTRL_SPRITE_SIZE_16, CTRL_SPRITE_TABLE, FRAME_WIDTH, MASK_SHOW_SPRITE_LEFT,
    PIXEL_BG_TRANSPARENT, Ppu, SPRITE_NONE, STATUS_SPRITE_OVERFLOW, STATUS_SPRITE_ZERO_HIT,
    SpriteSlot, fetch_hook,
};
use crate::nes::cart::Cart;
use crate::nes::mapper::MapperRef;

const ATTR_PALETTE: u8 = 0x03;
const ATTR_BEHIND_BG: u8 = 0x20;
const ATTR_FLIP_H: u8 = 0x40;
const ATTR_FLIP_V: u8 = 0x80;

impl Ppu {
    /// Scans OAM for sprites covering the current scanline and fetches their
    /// pattern rows for display on the next line.
    pub(crate) fn fetch_sprites(&mut self, cart: &mut Cart, mapper: MapperRef<'_>) {
        let mut mapper = mapper;
        let hooked = mapper.as_deref().is_some_and(|m| m.wants_fetch_hook());
        let tall = self.ctrl & CTRL_SPRITE_SIZE_16 != 0;
        let height: u32 = if tall { 16 } else { 8 };
        let scanline = self.scanline as i32;
        let covers = |y: u8| ((scanline - y as i32) as u32) < height;

        self.sprite0_in_buf = covers(self.oam[0]);
        let table: u16 = if !tall && self.ctrl & CTRL_SPRITE_TABLE != 0 {
            0x1000
        } else {
            0
        };

        let mut count = 0usize;
        for entry in 0..64 {
            let base = entry * 4;
            let (y, tile, attr, x) = (
                self.oam[base],
                self.oam[base + 1],
                self.oam[base + 2],
                self.oam[base + 3],
            );
            if !covers(y) {
                continue;
            }
            if count >= self.sprite_limit {
                self.status |= STATUS_SPRITE_OVERFLOW;
                self.note_overflow();
                break;
            }

            let row = (scanline - y as i32) as u16;
            let pattern = if tall {
                ((tile as u16 & 0x01) << 12) + ((tile as u16 & 0xFE) << 4)
            } else {
                ((tile as u16) << 4) + table
            };
            let addr = if attr & ATTR_FLIP_V != 0 {
                let span = if tall { 16 } else { 0 };
                pattern + 7 + span - row - (row & 8)
            } else {
                pattern + row + (row & 8)
            };

            let (lo, hi) = match mapper.as_deref().and_then(|m| m.extended_chr()) {
                Some(ext) => (ext.sprite_byte(addr, cart), ext.sprite_byte(addr + 8, cart)),
                None => (cart.chr_read(addr), cart.chr_read(addr + 8)),
            };
            if hooked && count < 8 {
                fetch_hook(&mut mapper, 0x2000, cart);
                fetch_hook(&mut mapper, addr, cart);
            }

            self.sprite_buf[count] = SpriteSlot { lo, hi, attr, x };
            count += 1;
        }

        if count > 8 {
            self.status |= STATUS_SPRITE_OVERFLOW;
            self.note_overflow();
        } else if hooked {
            // Idle sprite slots still perform dummy fetches.
            for _ in count..8 {
                fetch_hook(&mut mapper, 0x2000, cart);
                fetch_hook(&mut mapper, table, cart);
            }
        }
        self.sprite_count = count;
    }

    fn note_overflow(&mut self) {
        self.debug.sprite_overflow_events = self.debug.sprite_overflow_events.wrapping_add(1);
        self.debug.sprite_overflow_last_scanline = self.scanline as i16;
    }

    /// Builds the sprite line from the fetched slots. Lower OAM indices are
    /// drawn last so they win overlaps.
    pub(crate) fn compose_sprites(&mut self) {
        self.sprites_on_line = false;
        if self.sprite_count == 0 {
            return;
        }
        self.sprite_line.fill(SPRITE_NONE);

        for idx in (0..self.sprite_count).rev() {
            let slot = self.sprite_buf[idx];
            let opaque = slot.lo | slot.hi;
            if opaque == 0 {
                continue;
            }
            let flip_h = slot.attr & ATTR_FLIP_H != 0;

            if idx == 0 && self.sprite0_in_buf && self.status & STATUS_SPRITE_ZERO_HIT == 0 {
                self.sprite_hit_x = slot.x as u16;
                self.sprite_hit_mask = if flip_h { opaque.reverse_bits() } else { opaque };
            }

            let pixels = PLANE0[slot.lo as usize] | PLANE1[slot.hi as usize];
            let base = 0x10 + ((slot.attr & ATTR_PALETTE) as usize) * 4;
            let priority = if slot.attr & ATTR_BEHIND_BG != 0 {
                PIXEL_BG_TRANSPARENT
            } else {
                0
            };
            for bit in 0..8 {
                if opaque & (0x80 >> bit) == 0 {
                    continue;
                }
                let color = self.palette_ram[base + ((pixels >> (bit * 4)) & 0x03) as usize];
                let dst = slot.x as usize + if flip_h { 7 - bit } else { bit };
                self.sprite_line[dst] = color | priority;
            }
        }

        self.sprite0_in_buf = false;
        self.sprites_on_line = true;
    }

    /// Merges the sprite line into framebuffer row `row`. Sprites flagged to
    /// sit behind the background only show through transparent pixels.
    pub(super) fn copy_sprites(&mut self, row: usize) {
        if !self.sprites_on_line {
            return;
        }
        self.sprites_on_line = false;

        let start = if self.mask & MASK_SHOW_SPRITE_LEFT == 0 {
            8
        } else {
            0
        };
        let row_start = row * FRAME_WIDTH;
        let line = &mut self.frame_buffer[row_start..row_start + FRAME_WIDTH];
        for (x, out) in line.iter_mut().enumerate().skip(start) {
            let sprite = self.sprite_line[x];
            if sprite & SPRITE_NONE != 0 {
                continue;
            }
            if sprite & PIXEL_BG_TRANSPARENT == 0 || *out & PIXEL_BG_TRANSPARENT != 0 {
                *out = sprite;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::ATTR_FLIP_H;
    use crate::nes::cart::{ChipKind, ChrWindow};

    /// Tile 2 is a solid block; tile 3 has only its leftmost column set.
    fn sprite_cart() -> Cart {
        let mut chr = vec![0u8; 0x2000];
        chr[0x20..0x30].fill(0xFF);
        chr[0x30..0x38].fill(0x80);
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Chr, 0, chr, false);
        cart.map_chr(0, 0x0000, 0, ChrWindow::K8);
        cart
    }

    fn place(ppu: &mut Ppu, index: usize, y: u8, tile: u8, attr: u8, x: u8) {
        ppu.oam[index * 4..index * 4 + 4].copy_from_slice(&[y, tile, attr, x]);
    }

    fn ppu_with_sprites() -> Ppu {
        let mut ppu = Ppu::new();
        ppu.mask = MASK_SHOW_SPRITES | MASK_SHOW_SPRITE_LEFT;
        // Park every sprite off screen.
        for idx in 0..64 {
            place(&mut ppu, idx, 0xF0, 0, 0, 0);
        }
        ppu
    }

    #[test]
    fn sprite_covers_eight_lines_after_its_y() {
        let mut cart = sprite_cart();
        let mut ppu = ppu_with_sprites();
        place(&mut ppu, 5, 100, 2, 0, 40);

        for line in 95..115u16 {
            ppu.scanline = line;
            ppu.fetch_sprites(&mut cart, None);
            let expected = usize::from((100..108).contains(&line));
            assert_eq!(ppu.sprite_count, expected, "line {line}");
        }
    }

    #[test]
    fn ninth_sprite_sets_overflow() {
        let mut cart = sprite_cart();
        let mut ppu = ppu_with_sprites();
        for idx in 0..9 {
            place(&mut ppu, idx, 50, 2, 0, idx as u8 * 10);
        }
        ppu.scanline = 52;
        ppu.fetch_sprites(&mut cart, None);
        assert_eq!(ppu.sprite_count, 8);
        assert_ne!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn unlimited_sprites_still_flag_overflow() {
        let mut cart = sprite_cart();
        let mut ppu = ppu_with_sprites();
        ppu.set_sprite_limit(false);
        for idx in 0..12 {
            place(&mut ppu, idx, 50, 2, 0, idx as u8 * 10);
        }
        ppu.scanline = 50;
        ppu.fetch_sprites(&mut cart, None);
        assert_eq!(ppu.sprite_count, 12);
        assert_ne!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn eight_sprites_do_not_overflow() {
        let mut cart = sprite_cart();
        let mut ppu = ppu_with_sprites();
        for idx in 0..8 {
            place(&mut ppu, idx, 50, 2, 0, idx as u8 * 10);
        }
        ppu.scanline = 50;
        ppu.fetch_sprites(&mut cart, None);
        assert_eq!(ppu.sprite_count, 8);
        assert_eq!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn lower_index_wins_overlap() {
        let mut cart = sprite_cart();
        let mut ppu = ppu_with_sprites();
        ppu.palette_ram[0x13] = 0x16;
        ppu.palette_ram[0x17] = 0x2A;
        place(&mut ppu, 1, 10, 2, 0, 20);
        place(&mut ppu, 2, 10, 2, 1, 24);
        ppu.scanline = 10;
        ppu.fetch_sprites(&mut cart, None);
        ppu.compose_sprites();

        assert_eq!(ppu.sprite_line[20], 0x16);
        assert_eq!(ppu.sprite_line[27], 0x16);
        assert_eq!(ppu.sprite_line[28], 0x2A);
        assert_eq!(ppu.sprite_line[19], SPRITE_NONE);
    }

    #[test]
    fn horizontal_flip_mirrors_pixels_and_hit_mask() {
        let mut cart = sprite_cart();
        let mut ppu = ppu_with_sprites();
        ppu.palette_ram[0x11] = 0x05;
        place(&mut ppu, 0, 10, 3, ATTR_FLIP_H, 40);
        ppu.scanline = 10;
        ppu.fetch_sprites(&mut cart, None);
        ppu.compose_sprites();

        assert_eq!(ppu.sprite_line[40], SPRITE_NONE);
        assert_eq!(ppu.sprite_line[47], 0x05);
        assert_eq!(ppu.sprite_hit_x, 40);
        assert_eq!(ppu.sprite_hit_mask, 0x01);
    }

    #[test]
    fn behind_background_sprite_only_fills_transparent_pixels() {
        let mut ppu = ppu_with_sprites();
        ppu.sprite_line.fill(SPRITE_NONE);
        ppu.sprite_line[10] = 0x21 | PIXEL_BG_TRANSPARENT;
        ppu.sprite_line[11] = 0x21 | PIXEL_BG_TRANSPARENT;
        ppu.sprite_line[12] = 0x22;
        ppu.frame_buffer[10] = 0x0F | PIXEL_BG_TRANSPARENT;
        ppu.frame_buffer[11] = 0x30;
        ppu.frame_buffer[12] = 0x30;
        ppu.sprites_on_line = true;

        ppu.copy_sprites(0);
        assert_eq!(ppu.frame_buffer[10], 0x21 | PIXEL_BG_TRANSPARENT);
        assert_eq!(ppu.frame_buffer[11], 0x30);
        assert_eq!(ppu.frame_buffer[12], 0x22);
    }

    #[test]
    fn left_column_hidden_without_sprite_left_flag() {
        let mut ppu = ppu_with_sprites();
        ppu.mask = MASK_SHOW_SPRITES;
        ppu.sprite_line.fill(SPRITE_NONE);
        ppu.sprite_line[3] = 0x22;
        ppu.sprite_line[8] = 0x22;
        ppu.frame_buffer[3] = 0x4F;
        ppu.frame_buffer[8] = 0x4F;
        ppu.sprites_on_line = true;
        ppu.copy_sprites(0);
        assert_eq!(ppu.frame_buffer[3], 0x4F);
        assert_eq!(ppu.frame_buffer[8], 0x22);
    }

    #[test]
    fn tall_sprites_use_tile_bit_zero_for_table() {
        let mut chr = vec![0u8; 0x2000];
        // Bottom half of the 8x16 pair at tiles 0x02/0x03 in the $1000 table.
        chr[0x1030] = 0xAA;
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Chr, 0, chr, false);
        cart.map_chr(0, 0x0000, 0, ChrWindow::K8);

        let mut ppu = ppu_with_sprites();
        ppu.ctrl = CTRL_SPRITE_SIZE_16;
        place(&mut ppu, 0, 20, 0x03, 0, 0);
        ppu.scanline = 28;
        ppu.fetch_sprites(&mut cart, None);
        assert_eq!(ppu.sprite_count, 1);
        assert_eq!(ppu.sprite_buf[0].lo, 0xAA);
    }
}
