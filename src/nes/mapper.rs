use anyhow::{Result, bail};

use super::bus::{Clock, Handlers, ReadHandler, WriteHandler};
use super::cart::{Cart, ChrWindow, Mirroring, NtPage, PrgWindow};
use super::cpu::IrqSource;
use super::ppu::Ppu;
use super::state::{StateVisitor, visit_bool, visit_u8};

/// Borrowed mapper handed to the pixel engine for fetch callbacks and the
/// extended pattern source.
pub type MapperRef<'a> = Option<&'a mut (dyn Mapper + 'static)>;

/// Alternate pattern-byte source for boards with their own graphics modes.
pub trait ExtendedChr {
    fn background_byte(&self, addr: u16, tall_sprites: bool, cart: &Cart) -> u8;
    fn sprite_byte(&self, addr: u16, cart: &Cart) -> u8;
}

/// Cartridge board logic. Boards drive the generic banking primitives
/// through [`MapperBus`] and opt into rendering callbacks with the `wants_*`
/// methods.
pub trait Mapper {
    fn name(&self) -> &'static str;

    /// Installs handlers and the initial banks.
    fn power(&mut self, bus: &mut MapperBus<'_>);

    fn write(&mut self, _addr: u16, _value: u8, _bus: &mut MapperBus<'_>) {}

    /// Read hook for addresses the board claimed with
    /// [`ReadHandler::Mapper`].
    fn read(&mut self, addr: u16, open_bus: u8, cart: &Cart) -> u8 {
        cart.read(addr, open_bus)
    }

    fn wants_fetch_hook(&self) -> bool {
        false
    }

    /// Called with every video address the pixel engine fetches.
    fn ppu_fetch(&mut self, _addr: u16, _cart: &mut Cart) {}

    fn wants_hblank(&self) -> bool {
        false
    }

    /// Called once per rendered line, shortly after horizontal blank starts.
    fn hblank(&mut self, _bus: &mut MapperBus<'_>) {}

    fn wants_hblank_late(&self) -> bool {
        false
    }

    /// Called after the next line's sprites are composed.
    fn hblank_late(&mut self, _bus: &mut MapperBus<'_>) {}

    fn extended_chr(&self) -> Option<&dyn ExtendedChr> {
        None
    }

    fn visit_state(&mut self, _visitor: &mut dyn StateVisitor) {}

    fn debug_state(&self) -> String {
        String::new()
    }
}

/// Banking facade over the cartridge address space. Calls that change
/// what the pixel engine sees render the partial scanline first.
pub struct MapperBus<'a> {
    cart: &'a mut Cart,
    ppu: &'a mut Ppu,
    clock: &'a Clock,
    handlers: &'a mut Handlers,
    irq_lines: &'a mut u8,
}

impl<'a> MapperBus<'a> {
    pub(crate) fn new(
        cart: &'a mut Cart,
        ppu: &'a mut Ppu,
        clock: &'a Clock,
        handlers: &'a mut Handlers,
        irq_lines: &'a mut u8,
    ) -> Self {
        Self {
            cart,
            ppu,
            clock,
            handlers,
            irq_lines,
        }
    }

    fn flush(&mut self) {
        self.ppu.line_update(self.cart, self.clock, None);
    }

    /// No flush: the pixel engine never reads PRG space.
    pub fn map_prg(&mut self, slot: usize, addr: u16, bank: u32, window: PrgWindow) {
        self.cart.map_prg(slot, addr, bank, window);
    }

    pub fn unmap_prg(&mut self, addr: u16, pages_2k: usize) {
        self.cart.unmap_prg(addr, pages_2k);
    }

    pub fn map_chr(&mut self, slot: usize, addr: u16, bank: u32, window: ChrWindow) {
        self.flush();
        self.cart.map_chr(slot, addr, bank, window);
    }

    pub fn set_mirroring(&mut self, mirroring: Mirroring) {
        self.flush();
        self.cart.set_mirroring(mirroring);
    }

    pub fn set_mirroring_custom(&mut self, pages: [u8; 4]) {
        self.flush();
        self.cart.set_mirroring_custom(pages);
    }

    pub fn set_nametable(&mut self, quadrant: usize, page: NtPage, writable: bool) {
        self.flush();
        self.cart.set_nametable(quadrant, page, writable);
    }

    pub fn mirroring_is_hard(&self) -> bool {
        self.cart.mirroring_is_hard()
    }

    pub fn cart(&self) -> &Cart {
        self.cart
    }

    pub fn scanline(&self) -> u16 {
        self.ppu.scanline()
    }

    pub fn raise_irq(&mut self, source: IrqSource) {
        *self.irq_lines |= source.bit();
    }

    pub fn lower_irq(&mut self, source: IrqSource) {
        *self.irq_lines &= !source.bit();
    }

    pub fn set_read_handler(&mut self, start: u16, end: u16, handler: ReadHandler) {
        self.handlers.set_read(start, end, handler);
    }

    pub fn set_write_handler(&mut self, start: u16, end: u16, handler: WriteHandler) {
        self.handlers.set_write(start, end, handler);
    }
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        5 => "MMC5",
        7 => "AxROM",
        9 => "MMC2",
        10 => "MMC4",
        66 => "GxROM",
        _ => "Unknown",
    }
}

pub fn create_mapper(mapper_id: u16) -> Result<Box<dyn Mapper>> {
    let mapper: Box<dyn Mapper> = match mapper_id {
        0 => Box::new(Nrom),
        2 => Box::new(Uxrom::default()),
        3 => Box::new(Cnrom::default()),
        4 => Box::new(Mmc3::default()),
        7 => Box::new(Axrom::default()),
        9 => Box::new(Mmc2::default()),
        66 => Box::new(Gxrom::default()),
        id => {
            log::warn!("no board for mapper {id} ({})", mapper_name(id));
            bail!("mapper {id} ({}) is not supported", mapper_name(id));
        }
    };
    Ok(mapper)
}

/// Fixed 32K program and 8K graphics; most boards start from this layout.
fn map_fixed_banks(bus: &mut MapperBus<'_>) {
    bus.map_prg(0, 0x8000, 0, PrgWindow::K32);
    bus.map_chr(0, 0x0000, 0, ChrWindow::K8);
}

fn claim_registers(bus: &mut MapperBus<'_>) {
    bus.set_write_handler(0x8000, 0xFFFF, WriteHandler::Mapper);
}

struct Nrom;

impl Mapper for Nrom {
    fn name(&self) -> &'static str {
        "NROM"
    }

    fn power(&mut self, bus: &mut MapperBus<'_>) {
        map_fixed_banks(bus);
    }
}

#[derive(Default)]
struct Uxrom {
    bank: u8,
}

impl Uxrom {
    fn sync(&self, bus: &mut MapperBus<'_>) {
        bus.map_prg(0, 0x8000, self.bank as u32, PrgWindow::K16);
        bus.map_prg(0, 0xC000, !0, PrgWindow::K16);
    }
}

impl Mapper for Uxrom {
    fn name(&self) -> &'static str {
        "UxROM"
    }

    fn power(&mut self, bus: &mut MapperBus<'_>) {
        self.bank = 0;
        claim_registers(bus);
        bus.map_chr(0, 0x0000, 0, ChrWindow::K8);
        self.sync(bus);
    }

    fn write(&mut self, _addr: u16, value: u8, bus: &mut MapperBus<'_>) {
        self.bank = value;
        self.sync(bus);
    }

    fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visit_u8(visitor, "UXRB", &mut self.bank);
    }
}

#[derive(Default)]
struct Cnrom {
    bank: u8,
}

impl Mapper for Cnrom {
    fn name(&self) -> &'static str {
        "CNROM"
    }

    fn power(&mut self, bus: &mut MapperBus<'_>) {
        self.bank = 0;
        claim_registers(bus);
        map_fixed_banks(bus);
    }

    fn write(&mut self, _addr: u16, value: u8, bus: &mut MapperBus<'_>) {
        self.bank = value;
        bus.map_chr(0, 0x0000, value as u32, ChrWindow::K8);
    }

    fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visit_u8(visitor, "CNRB", &mut self.bank);
    }
}

#[derive(Default)]
struct Axrom {
    reg: u8,
}

impl Axrom {
    fn sync(&self, bus: &mut MapperBus<'_>) {
        bus.map_prg(0, 0x8000, (self.reg & 0x07) as u32, PrgWindow::K32);
        bus.set_mirroring(if self.reg & 0x10 != 0 {
            Mirroring::OneScreenUpper
        } else {
            Mirroring::OneScreenLower
        });
    }
}

impl Mapper for Axrom {
    fn name(&self) -> &'static str {
        "AxROM"
    }

    fn power(&mut self, bus: &mut MapperBus<'_>) {
        self.reg = 0;
        claim_registers(bus);
        bus.map_chr(0, 0x0000, 0, ChrWindow::K8);
        self.sync(bus);
    }

    fn write(&mut self, _addr: u16, value: u8, bus: &mut MapperBus<'_>) {
        self.reg = value;
        self.sync(bus);
    }

    fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visit_u8(visitor, "AXRR", &mut self.reg);
    }
}

#[derive(Default)]
struct Gxrom {
    reg: u8,
}

impl Gxrom {
    fn sync(&self, bus: &mut MapperBus<'_>) {
        bus.map_prg(0, 0x8000, ((self.reg >> 4) & 0x03) as u32, PrgWindow::K32);
        bus.map_chr(0, 0x0000, (self.reg & 0x03) as u32, ChrWindow::K8);
    }
}

impl Mapper for Gxrom {
    fn name(&self) -> &'static str {
        "GxROM"
    }

    fn power(&mut self, bus: &mut MapperBus<'_>) {
        self.reg = 0;
        claim_registers(bus);
        self.sync(bus);
    }

    fn write(&mut self, _addr: u16, value: u8, bus: &mut MapperBus<'_>) {
        self.reg = value;
        self.sync(bus);
    }

    fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visit_u8(visitor, "GXRR", &mut self.reg);
    }
}

/// MMC2: two 4K graphics windows whose bank flips when the pixel engine
/// fetches tile $FD or $FE from them.
#[derive(Default)]
struct Mmc2 {
    prg_bank: u8,
    /// $FD/$FE banks for $0000, then for $1000.
    chr_banks: [u8; 4],
    /// `true` selects the $FE bank.
    latches: [bool; 2],
    mirror: u8,
}

impl Mmc2 {
    fn chr_bank(&self, half: usize) -> u32 {
        let idx = half * 2 + usize::from(self.latches[half]);
        self.chr_banks[idx] as u32
    }

    fn sync(&self, bus: &mut MapperBus<'_>) {
        bus.map_prg(0, 0x8000, self.prg_bank as u32, PrgWindow::K8);
        bus.map_prg(0, 0xA000, !2, PrgWindow::K8);
        bus.map_prg(0, 0xC000, !1, PrgWindow::K8);
        bus.map_prg(0, 0xE000, !0, PrgWindow::K8);
        bus.map_chr(0, 0x0000, self.chr_bank(0), ChrWindow::K4);
        bus.map_chr(0, 0x1000, self.chr_bank(1), ChrWindow::K4);
        if !bus.mirroring_is_hard() {
            bus.set_mirroring(if self.mirror & 0x01 != 0 {
                Mirroring::Horizontal
            } else {
                Mirroring::Vertical
            });
        }
    }
}

impl Mapper for Mmc2 {
    fn name(&self) -> &'static str {
        "MMC2"
    }

    fn power(&mut self, bus: &mut MapperBus<'_>) {
        *self = Self {
            latches: [true, true],
            ..Self::default()
        };
        claim_registers(bus);
        self.sync(bus);
    }

    fn write(&mut self, addr: u16, value: u8, bus: &mut MapperBus<'_>) {
        match addr & 0xF000 {
            0xA000 => self.prg_bank = value & 0x0F,
            0xB000 => self.chr_banks[0] = value & 0x1F,
            0xC000 => self.chr_banks[1] = value & 0x1F,
            0xD000 => self.chr_banks[2] = value & 0x1F,
            0xE000 => self.chr_banks[3] = value & 0x1F,
            0xF000 => self.mirror = value,
            _ => return,
        }
        self.sync(bus);
    }

    fn wants_fetch_hook(&self) -> bool {
        true
    }

    fn ppu_fetch(&mut self, addr: u16, cart: &mut Cart) {
        let high = addr >> 8;
        if high >= 0x20 || high & 0x0F != 0x0F {
            return;
        }
        let select_fe = match addr & 0xF0 {
            0xD0 => false,
            0xE0 => true,
            _ => return,
        };
        let half = usize::from(high >= 0x10);
        self.latches[half] = select_fe;
        cart.map_chr(0, (half as u16) << 12, self.chr_bank(half), ChrWindow::K4);
    }

    fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visit_u8(visitor, "M2PR", &mut self.prg_bank);
        visitor.region("M2CR", &mut self.chr_banks);
        visit_bool(visitor, "M2L0", &mut self.latches[0]);
        visit_bool(visitor, "M2L1", &mut self.latches[1]);
        visit_u8(visitor, "M2MI", &mut self.mirror);
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC2 prg=${:02X} chr=[{:02X},{:02X},{:02X},{:02X}] latch0={} latch1={}",
            self.prg_bank,
            self.chr_banks[0],
            self.chr_banks[1],
            self.chr_banks[2],
            self.chr_banks[3],
            if self.latches[0] { "FE" } else { "FD" },
            if self.latches[1] { "FE" } else { "FD" },
        )
    }
}

/// MMC3 with the scanline counter clocked once per rendered line by the
/// hblank callback.
struct Mmc3 {
    bank_select: u8,
    bank_regs: [u8; 8],
    irq_latch: u8,
    irq_counter: u8,
    irq_reload: bool,
    irq_enabled: bool,
    debug_irq_clocks: u64,
}

impl Default for Mmc3 {
    fn default() -> Self {
        Self {
            bank_select: 0,
            bank_regs: [0, 2, 4, 5, 6, 7, 0, 1],
            irq_latch: 0,
            irq_counter: 0,
            irq_reload: false,
            irq_enabled: false,
            debug_irq_clocks: 0,
        }
    }
}

impl Mmc3 {
    fn sync_prg(&self, bus: &mut MapperBus<'_>) {
        let (low, high) = if self.bank_select & 0x40 != 0 {
            (!1, self.bank_regs[6] as u32)
        } else {
            (self.bank_regs[6] as u32, !1)
        };
        bus.map_prg(0, 0x8000, low, PrgWindow::K8);
        bus.map_prg(0, 0xA000, self.bank_regs[7] as u32, PrgWindow::K8);
        bus.map_prg(0, 0xC000, high, PrgWindow::K8);
        bus.map_prg(0, 0xE000, !0, PrgWindow::K8);
    }

    fn sync_chr(&self, bus: &mut MapperBus<'_>) {
        let invert: u16 = if self.bank_select & 0x80 != 0 {
            0x1000
        } else {
            0
        };
        let r = |idx: usize| self.bank_regs[idx] as u32;
        let layout = [
            (0x0000, r(0) & !1),
            (0x0400, r(0) | 1),
            (0x0800, r(1) & !1),
            (0x0C00, r(1) | 1),
            (0x1000, r(2)),
            (0x1400, r(3)),
            (0x1800, r(4)),
            (0x1C00, r(5)),
        ];
        for (addr, bank) in layout {
            bus.map_chr(0, addr ^ invert, bank, ChrWindow::K1);
        }
    }

    fn clock_counter(&mut self, bus: &mut MapperBus<'_>) {
        self.debug_irq_clocks = self.debug_irq_clocks.wrapping_add(1);
        if self.irq_counter == 0 || self.irq_reload {
            self.irq_counter = self.irq_latch;
            self.irq_reload = false;
        } else {
            self.irq_counter -= 1;
        }
        if self.irq_counter == 0 && self.irq_enabled {
            bus.raise_irq(IrqSource::Mapper);
        }
    }
}

impl Mapper for Mmc3 {
    fn name(&self) -> &'static str {
        "MMC3"
    }

    fn power(&mut self, bus: &mut MapperBus<'_>) {
        *self = Self::default();
        claim_registers(bus);
        self.sync_prg(bus);
        self.sync_chr(bus);
    }

    fn write(&mut self, addr: u16, value: u8, bus: &mut MapperBus<'_>) {
        match addr & 0xE001 {
            0x8000 => {
                let changed = self.bank_select ^ value;
                self.bank_select = value;
                if changed & 0x40 != 0 {
                    self.sync_prg(bus);
                }
                if changed & 0x80 != 0 {
                    self.sync_chr(bus);
                }
            }
            0x8001 => {
                let target = (self.bank_select & 0x07) as usize;
                self.bank_regs[target] = value;
                if target < 6 {
                    self.sync_chr(bus);
                } else {
                    self.sync_prg(bus);
                }
            }
            0xA000 => {
                if !bus.mirroring_is_hard() {
                    bus.set_mirroring(if value & 0x01 != 0 {
                        Mirroring::Horizontal
                    } else {
                        Mirroring::Vertical
                    });
                }
            }
            0xC000 => self.irq_latch = value,
            0xC001 => self.irq_reload = true,
            0xE000 => {
                self.irq_enabled = false;
                bus.lower_irq(IrqSource::Mapper);
            }
            0xE001 => self.irq_enabled = true,
            _ => {}
        }
    }

    fn wants_hblank(&self) -> bool {
        true
    }

    fn hblank(&mut self, bus: &mut MapperBus<'_>) {
        self.clock_counter(bus);
    }

    fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visit_u8(visitor, "M3CM", &mut self.bank_select);
        visitor.region("M3RG", &mut self.bank_regs);
        visit_u8(visitor, "M3IL", &mut self.irq_latch);
        visit_u8(visitor, "M3IC", &mut self.irq_counter);
        visit_bool(visitor, "M3IR", &mut self.irq_reload);
        visit_bool(visitor, "M3IE", &mut self.irq_enabled);
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC3 bank_select=${:02X} prg=[{:02X},{:02X}] chr=[{:02X},{:02X},{:02X},{:02X},{:02X},{:02X}] irq_latch=${:02X} irq_counter=${:02X} reload={} en={} irq_clocks={}",
            self.bank_select,
            self.bank_regs[6],
            self.bank_regs[7],
            self.bank_regs[0],
            self.bank_regs[1],
            self.bank_regs[2],
            self.bank_regs[3],
            self.bank_regs[4],
            self.bank_regs[5],
            self.irq_latch,
            self.irq_counter,
            self.irq_reload,
            self.irq_enabled,
            self.debug_irq_clocks
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cart::ChipKind;

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    struct Rig {
        cart: Cart,
        ppu: Ppu,
        clock: Clock,
        handlers: Handlers,
        irq: u8,
    }

    impl Rig {
        fn new(prg: Vec<u8>, chr: Vec<u8>) -> Self {
            let mut cart = Cart::new();
            cart.register_chip(ChipKind::Prg, 0, prg, false);
            cart.register_chip(ChipKind::Chr, 0, chr, false);
            cart.setup_mirroring(Mirroring::Horizontal, false);
            Self {
                cart,
                ppu: Ppu::new(),
                clock: Clock::ntsc(),
                handlers: Handlers::new(),
                irq: 0,
            }
        }

        fn bus(&mut self) -> MapperBus<'_> {
            MapperBus::new(
                &mut self.cart,
                &mut self.ppu,
                &self.clock,
                &mut self.handlers,
                &mut self.irq,
            )
        }

        fn power(&mut self, mapper: &mut dyn Mapper) {
            let mut bus = self.bus();
            mapper.power(&mut bus);
        }

        fn write(&mut self, mapper: &mut dyn Mapper, addr: u16, value: u8) {
            let mut bus = self.bus();
            mapper.write(addr, value, &mut bus);
        }
    }

    #[test]
    fn nrom_mirrors_16k_program() {
        let mut rig = Rig::new(patterned_banks(0x4000, 0x4000), vec![0; 0x2000]);
        let mut mapper = create_mapper(0).unwrap();
        rig.power(mapper.as_mut());
        assert_eq!(rig.cart.read(0x8000, 0), 1);
        assert_eq!(rig.cart.read(0xC000, 0), 1);
        assert_eq!(rig.handlers.write(0x8000), WriteHandler::Cart);
    }

    #[test]
    fn uxrom_keeps_last_bank_fixed() {
        let mut rig = Rig::new(patterned_banks(8 * 0x4000, 0x4000), vec![0; 0x2000]);
        let mut mapper = create_mapper(2).unwrap();
        rig.power(mapper.as_mut());
        assert_eq!(rig.handlers.write(0xC123), WriteHandler::Mapper);

        rig.write(mapper.as_mut(), 0x8000, 3);
        assert_eq!(rig.cart.read(0x8000, 0), 4);
        assert_eq!(rig.cart.read(0xC000, 0), 8);
    }

    #[test]
    fn cnrom_switches_whole_pattern_space() {
        let mut rig = Rig::new(patterned_banks(0x8000, 0x8000), patterned_banks(4 * 0x2000, 0x2000));
        let mut mapper = create_mapper(3).unwrap();
        rig.power(mapper.as_mut());
        rig.write(mapper.as_mut(), 0x8000, 2);
        assert_eq!(rig.cart.chr_read(0x0000), 3);
        assert_eq!(rig.cart.chr_read(0x1FFF), 3);
    }

    #[test]
    fn axrom_selects_single_screen() {
        let mut rig = Rig::new(patterned_banks(4 * 0x8000, 0x8000), vec![0; 0x2000]);
        let mut mapper = create_mapper(7).unwrap();
        rig.power(mapper.as_mut());
        rig.write(mapper.as_mut(), 0x8000, 0x12);
        assert_eq!(rig.cart.read(0x8000, 0), 3);
        for quadrant in 0..4 {
            assert_eq!(rig.cart.nametable_page(quadrant), NtPage::Ciram(1));
        }
    }

    #[test]
    fn gxrom_splits_register_fields() {
        let mut rig = Rig::new(
            patterned_banks(4 * 0x8000, 0x8000),
            patterned_banks(4 * 0x2000, 0x2000),
        );
        let mut mapper = create_mapper(66).unwrap();
        rig.power(mapper.as_mut());
        rig.write(mapper.as_mut(), 0x8000, 0x21);
        assert_eq!(rig.cart.read(0xFFFF, 0), 3);
        assert_eq!(rig.cart.chr_read(0x0000), 2);
    }

    #[test]
    fn mmc3_prg_mode_swaps_fixed_bank() {
        let mut rig = Rig::new(
            patterned_banks(8 * 0x2000, 0x2000),
            patterned_banks(8 * 0x0400, 0x0400),
        );
        let mut mapper = create_mapper(4).unwrap();
        rig.power(mapper.as_mut());
        rig.write(mapper.as_mut(), 0x8000, 0x06);
        rig.write(mapper.as_mut(), 0x8001, 0x02);
        assert_eq!(rig.cart.read(0x8000, 0), 3);
        assert_eq!(rig.cart.read(0xC000, 0), 7);
        assert_eq!(rig.cart.read(0xE000, 0), 8);

        rig.write(mapper.as_mut(), 0x8000, 0x46);
        assert_eq!(rig.cart.read(0x8000, 0), 7);
        assert_eq!(rig.cart.read(0xC000, 0), 3);
    }

    #[test]
    fn mmc3_chr_inversion_moves_2k_banks_high() {
        let mut rig = Rig::new(
            patterned_banks(8 * 0x2000, 0x2000),
            patterned_banks(8 * 0x0400, 0x0400),
        );
        let mut mapper = create_mapper(4).unwrap();
        rig.power(mapper.as_mut());
        // R0 defaults to banks 0/1, R2 to bank 4.
        assert_eq!(rig.cart.chr_read(0x0400), 2);
        assert_eq!(rig.cart.chr_read(0x1000), 5);

        rig.write(mapper.as_mut(), 0x8000, 0x80);
        assert_eq!(rig.cart.chr_read(0x1400), 2);
        assert_eq!(rig.cart.chr_read(0x0000), 5);
    }

    #[test]
    fn mmc3_counter_raises_irq_after_latch_lines() {
        let mut rig = Rig::new(
            patterned_banks(8 * 0x2000, 0x2000),
            patterned_banks(8 * 0x0400, 0x0400),
        );
        let mut mapper = create_mapper(4).unwrap();
        rig.power(mapper.as_mut());
        rig.write(mapper.as_mut(), 0xC000, 3);
        rig.write(mapper.as_mut(), 0xC001, 0);
        rig.write(mapper.as_mut(), 0xE001, 0);

        let mut fired_at = None;
        for line in 0..6 {
            let mut bus = rig.bus();
            mapper.hblank(&mut bus);
            if rig.irq != 0 && fired_at.is_none() {
                fired_at = Some(line);
            }
        }
        // Reload on the first clock, then 3 -> 2 -> 1 -> 0.
        assert_eq!(fired_at, Some(3));

        rig.write(mapper.as_mut(), 0xE000, 0);
        assert_eq!(rig.irq, 0);
    }

    #[test]
    fn mmc2_latch_follows_pattern_fetches() {
        let mut rig = Rig::new(
            patterned_banks(8 * 0x2000, 0x2000),
            patterned_banks(8 * 0x1000, 0x1000),
        );
        let mut mapper = create_mapper(9).unwrap();
        rig.power(mapper.as_mut());
        rig.write(mapper.as_mut(), 0xB000, 2);
        rig.write(mapper.as_mut(), 0xC000, 5);
        // Latch starts on $FE.
        assert_eq!(rig.cart.chr_read(0x0000), 6);

        mapper.ppu_fetch(0x0FD3, &mut rig.cart);
        assert_eq!(rig.cart.chr_read(0x0000), 3);
        mapper.ppu_fetch(0x0FE0, &mut rig.cart);
        assert_eq!(rig.cart.chr_read(0x0000), 6);
        // Nametable fetches and other tiles leave the latch alone.
        mapper.ppu_fetch(0x2FD0, &mut rig.cart);
        mapper.ppu_fetch(0x0ED0, &mut rig.cart);
        assert_eq!(rig.cart.chr_read(0x0000), 6);
    }

    #[test]
    fn unsupported_mapper_is_an_error() {
        let err = create_mapper(5).err().unwrap();
        assert!(err.to_string().contains("MMC5"));
    }
}
