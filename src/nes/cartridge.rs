use anyhow::{Context, Result, bail};
use std::{fs, path::Path};

use super::cart::{Cart, ChipKind, Mirroring, PrgWindow, WRAM_CHIP};

const WORK_RAM_SIZE: usize = 8 * 1024;
const CHR_RAM_SIZE: usize = 8 * 1024;

/// Parsed iNES / NES 2.0 image.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub submapper_id: u8,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_data: Vec<u8>,
    pub chr_is_ram: bool,
    pub prg_ram_size: usize,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("in {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            bail!("image is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mapper_low = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        let mapper_id = if is_nes2 {
            mapper_low | (((bytes[8] as u16) & 0x0F) << 8)
        } else {
            mapper_low
        };
        let submapper_id = if is_nes2 { bytes[8] >> 4 } else { 0 };
        let four_screen = (flags6 & 0x08) != 0;
        let mirroring = if four_screen {
            Mirroring::FourScreen
        } else if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        let has_trainer = (flags6 & 0x04) != 0;
        let has_battery_backed_ram = (flags6 & 0x02) != 0;

        let (prg_rom_size, chr_rom_size, prg_ram_size) = if is_nes2 {
            let prg_msb = (bytes[9] & 0x0F) as usize;
            let chr_msb = (bytes[9] >> 4) as usize;
            if prg_msb == 0x0F || chr_msb == 0x0F {
                bail!("NES 2.0 exponent-multiplier ROM sizes are not supported");
            }

            let prg_units = (prg_msb << 8) | bytes[4] as usize;
            let chr_units = (chr_msb << 8) | bytes[5] as usize;

            let prg_ram_shift = bytes[10] & 0x0F;
            let prg_ram = if prg_ram_shift == 0 {
                WORK_RAM_SIZE
            } else {
                64usize << prg_ram_shift
            };

            (prg_units * 16 * 1024, chr_units * 8 * 1024, prg_ram)
        } else {
            let prg_units = bytes[4] as usize;
            let chr_units = bytes[5] as usize;
            let prg_ram_units = if bytes[8] == 0 { 1 } else { bytes[8] as usize };
            (
                prg_units * 16 * 1024,
                chr_units * 8 * 1024,
                prg_ram_units * WORK_RAM_SIZE,
            )
        };

        if prg_rom_size == 0 {
            bail!("header declares no PRG ROM");
        }

        let mut cursor = 16usize;
        if has_trainer {
            cursor += 512;
        }

        let prg_end = cursor + prg_rom_size;
        if bytes.len() < prg_end {
            bail!(
                "image truncated: expected {prg_rom_size} PRG bytes, found {}",
                bytes.len().saturating_sub(cursor)
            );
        }
        let prg_rom = bytes[cursor..prg_end].to_vec();
        cursor = prg_end;

        let (chr_data, chr_is_ram) = if chr_rom_size == 0 {
            (vec![0; CHR_RAM_SIZE], true)
        } else {
            if bytes.len() < cursor + chr_rom_size {
                bail!(
                    "image truncated: expected {chr_rom_size} CHR bytes, found {}",
                    bytes.len().saturating_sub(cursor)
                );
            }
            (bytes[cursor..cursor + chr_rom_size].to_vec(), false)
        };

        Ok(Self {
            mapper_id,
            submapper_id,
            mirroring,
            four_screen,
            has_battery_backed_ram,
            prg_rom,
            chr_data,
            chr_is_ram,
            prg_ram_size,
        })
    }

    /// Registers the image's chips with `cart` and applies the header
    /// mirroring. Work RAM is mapped at $6000; everything else is left to
    /// the mapper's power hook.
    pub fn install(self, cart: &mut Cart) {
        cart.clear_mappings();
        cart.register_chip(ChipKind::Prg, 0, self.prg_rom, false);
        cart.register_chip(ChipKind::Chr, 0, self.chr_data, self.chr_is_ram);
        let wram_size = self.prg_ram_size.max(WORK_RAM_SIZE);
        cart.register_chip(ChipKind::Prg, WRAM_CHIP, vec![0; wram_size], true);
        cart.map_prg(WRAM_CHIP, 0x6000, 0, PrgWindow::K8);
        cart.setup_mirroring(self.mirroring, self.four_screen);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds an iNES 1.0 image with patterned 16K PRG and 8K CHR banks.
    pub(crate) fn ines_image(mapper_id: u8, prg_banks: u8, chr_banks: u8, flags6: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(b"NES\x1A");
        bytes[4] = prg_banks;
        bytes[5] = chr_banks;
        bytes[6] = (mapper_id << 4) | (flags6 & 0x0F);
        bytes[7] = mapper_id & 0xF0;
        for bank in 0..prg_banks {
            bytes.extend(std::iter::repeat_n(bank.wrapping_add(1), 0x4000));
        }
        for bank in 0..chr_banks {
            bytes.extend(std::iter::repeat_n(bank.wrapping_add(0x11), 0x2000));
        }
        bytes
    }

    #[test]
    fn parses_mapper_and_mirroring() {
        let cart = Cartridge::from_bytes(&ines_image(66, 2, 1, 0x03)).unwrap();
        assert_eq!(cart.mapper_id, 66);
        assert_eq!(cart.mirroring, Mirroring::Vertical);
        assert!(cart.has_battery_backed_ram);
        assert_eq!(cart.prg_rom.len(), 0x8000);
        assert!(!cart.chr_is_ram);
    }

    #[test]
    fn missing_chr_rom_becomes_chr_ram() {
        let cart = Cartridge::from_bytes(&ines_image(2, 1, 0, 0)).unwrap();
        assert!(cart.chr_is_ram);
        assert_eq!(cart.chr_data.len(), CHR_RAM_SIZE);
    }

    #[test]
    fn trainer_is_skipped() {
        let mut bytes = ines_image(0, 1, 1, 0x04);
        bytes.splice(16..16, std::iter::repeat_n(0xEE, 512));
        let cart = Cartridge::from_bytes(&bytes).unwrap();
        assert_eq!(cart.prg_rom[0], 1);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut bytes = ines_image(0, 2, 1, 0);
        bytes.truncate(16 + 0x4000);
        let err = Cartridge::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("PRG"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = ines_image(0, 1, 1, 0);
        bytes[3] = 0;
        assert!(Cartridge::from_bytes(&bytes).is_err());
    }

    #[test]
    fn install_maps_work_ram_and_mirroring() {
        let image = Cartridge::from_bytes(&ines_image(0, 1, 0, 0x01)).unwrap();
        let mut cart = Cart::new();
        image.install(&mut cart);
        cart.write(0x6123, 0x5A);
        assert_eq!(cart.read(0x6123, 0), 0x5A);
        assert_eq!(cart.read(0x7FFF, 0xFF), 0);
        assert_eq!(cart.chip_len(ChipKind::Chr, 0), CHR_RAM_SIZE);
        assert_ne!(cart.nametable_page(0), cart.nametable_page(1));
        assert!(!cart.mirroring_is_hard());
    }

    #[test]
    fn four_screen_locks_mirroring() {
        let image = Cartridge::from_bytes(&ines_image(4, 2, 1, 0x08)).unwrap();
        let mut cart = Cart::new();
        image.install(&mut cart);
        assert!(cart.mirroring_is_hard());
        cart.set_mirroring(Mirroring::Horizontal);
        assert_ne!(cart.nametable_page(2), cart.nametable_page(0));
    }
}
