use std::collections::VecDeque;

use super::cart::Cart;
use super::cpu::{CpuBus, IrqSource};
use super::mapper::{Mapper, MapperBus};
use super::ppu::Ppu;

pub const MASTER_PER_CPU_CYCLE: i64 = 48;
pub const NTSC_DOT_UNITS: i64 = 16;
pub const PAL_DOT_UNITS: i64 = 15;

const MAX_DEBUG_EVENTS: usize = 512;

/// Master-clock bookkeeping shared by the CPU slices and the pixel engine.
///
/// `timestamp` counts CPU cycles actually executed. `pending` is the master
/// time granted to the CPU but not yet consumed; it goes negative when an
/// instruction overruns its slice, and the overrun is taken from the next
/// grant.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    timestamp: u64,
    pending: i64,
    dot_units: i64,
}

impl Clock {
    pub fn new(dot_units: i64) -> Self {
        Self {
            timestamp: 0,
            pending: 0,
            dot_units,
        }
    }

    pub fn ntsc() -> Self {
        Self::new(NTSC_DOT_UNITS)
    }

    pub fn pal() -> Self {
        Self::new(PAL_DOT_UNITS)
    }

    pub fn reset(&mut self) {
        self.timestamp = 0;
        self.pending = 0;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn dot_units(&self) -> i64 {
        self.dot_units
    }

    /// Master time reached by the CPU so far.
    pub fn master_now(&self) -> i64 {
        self.timestamp as i64 * MASTER_PER_CPU_CYCLE
    }

    /// Master time the current slice ends at.
    pub fn scheduled_master(&self) -> i64 {
        self.master_now() + self.pending
    }

    pub fn grant_dots(&mut self, dots: u32) {
        self.pending += dots as i64 * self.dot_units;
    }

    pub fn add_cycles(&mut self, cycles: u32) {
        self.timestamp += cycles as u64;
        self.pending -= cycles as i64 * MASTER_PER_CPU_CYCLE;
    }

    /// Whole CPU cycles the current slice still allows; a partial cycle
    /// counts as one.
    pub fn cycles_remaining(&self) -> i64 {
        if self.pending <= 0 {
            0
        } else {
            (self.pending + MASTER_PER_CPU_CYCLE - 1) / MASTER_PER_CPU_CYCLE
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadHandler {
    Ram,
    Ppu,
    Cart,
    Mapper,
    OpenBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHandler {
    Ram,
    Ppu,
    OamDma,
    Cart,
    Mapper,
    Ignore,
}

/// Per-address CPU dispatch tables.
pub struct Handlers {
    read: Box<[ReadHandler]>,
    write: Box<[WriteHandler]>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self::new()
    }
}

impl Handlers {
    pub fn new() -> Self {
        let mut handlers = Self {
            read: vec![ReadHandler::OpenBus; 0x10000].into_boxed_slice(),
            write: vec![WriteHandler::Ignore; 0x10000].into_boxed_slice(),
        };
        handlers.set_read(0x0000, 0x1FFF, ReadHandler::Ram);
        handlers.set_read(0x2000, 0x3FFF, ReadHandler::Ppu);
        handlers.set_read(0x4020, 0xFFFF, ReadHandler::Cart);
        handlers.set_write(0x0000, 0x1FFF, WriteHandler::Ram);
        handlers.set_write(0x2000, 0x3FFF, WriteHandler::Ppu);
        handlers.set_write(0x4014, 0x4014, WriteHandler::OamDma);
        handlers.set_write(0x4020, 0xFFFF, WriteHandler::Cart);
        handlers
    }

    pub fn set_read(&mut self, start: u16, end: u16, handler: ReadHandler) {
        for addr in start..=end {
            self.read[addr as usize] = handler;
        }
    }

    pub fn set_write(&mut self, start: u16, end: u16, handler: WriteHandler) {
        for addr in start..=end {
            self.write[addr as usize] = handler;
        }
    }

    pub fn read(&self, addr: u16) -> ReadHandler {
        self.read[addr as usize]
    }

    pub fn write(&self, addr: u16) -> WriteHandler {
        self.write[addr as usize]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NesDebugCounters {
    pub frame_count: u64,
    pub dead_frames: u64,
    pub cpu_reads: u64,
    pub cpu_writes: u64,
    pub cpu_reads_ram: u64,
    pub cpu_reads_ppu_regs: u64,
    pub cpu_reads_cart: u64,
    pub cpu_reads_open_bus: u64,
    pub cpu_writes_ram: u64,
    pub cpu_writes_ppu_regs: u64,
    pub cpu_writes_cart: u64,
    pub cpu_writes_mapper: u64,
    pub dma_transfers: u64,
    pub nmi_delivered: u64,
    pub irq_delivered: u64,
    pub hblank_hooks: u64,
    pub last_cpu_read_addr: u16,
    pub last_cpu_write_addr: u16,
    pub last_cpu_write_value: u8,
}

/// Everything the CPU can reach: internal RAM, the pixel engine, the
/// cartridge address space and its mapper.
pub struct System {
    pub(crate) ram: [u8; 0x800],
    pub(crate) ppu: Ppu,
    pub(crate) cart: Cart,
    pub(crate) mapper: Option<Box<dyn Mapper>>,
    pub(crate) clock: Clock,
    handlers: Handlers,
    open_bus: u8,
    irq_lines: u8,
    irq_reported: u8,
    debug: NesDebugCounters,
    debug_events: VecDeque<String>,
}

impl System {
    pub fn new(clock: Clock) -> Self {
        Self {
            ram: [0; 0x800],
            ppu: Ppu::new(),
            cart: Cart::new(),
            mapper: None,
            clock,
            handlers: Handlers::new(),
            open_bus: 0,
            irq_lines: 0,
            irq_reported: 0,
            debug: NesDebugCounters::default(),
            debug_events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        }
    }

    pub fn open_bus(&self) -> u8 {
        self.open_bus
    }

    pub fn handlers_mut(&mut self) -> &mut Handlers {
        &mut self.handlers
    }

    pub(crate) fn reset_handlers(&mut self) {
        self.handlers = Handlers::new();
    }

    pub(crate) fn clear_irq_lines(&mut self) {
        self.irq_lines = 0;
        self.irq_reported = 0;
    }

    pub fn debug_counters(&self) -> NesDebugCounters {
        self.debug
    }

    pub(crate) fn debug_counters_mut(&mut self) -> &mut NesDebugCounters {
        &mut self.debug
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }

    pub(crate) fn clear_debug(&mut self) {
        self.debug = NesDebugCounters::default();
        self.debug_events.clear();
    }

    /// Runs `f` against the mapper with a banking facade over the rest of
    /// the system. Returns `None` when no mapper is installed.
    pub(crate) fn with_mapper<R>(
        &mut self,
        f: impl FnOnce(&mut dyn Mapper, &mut MapperBus<'_>) -> R,
    ) -> Option<R> {
        let mapper = self.mapper.as_deref_mut()?;
        let mut bus = MapperBus::new(
            &mut self.cart,
            &mut self.ppu,
            &self.clock,
            &mut self.handlers,
            &mut self.irq_lines,
        );
        Some(f(mapper, &mut bus))
    }

    pub(crate) fn wants_fetch_hook(&self) -> bool {
        self.mapper.as_ref().is_some_and(|m| m.wants_fetch_hook())
    }

    pub(crate) fn wants_hblank(&self) -> bool {
        self.mapper.as_ref().is_some_and(|m| m.wants_hblank())
    }

    pub(crate) fn wants_hblank_late(&self) -> bool {
        self.mapper.as_ref().is_some_and(|m| m.wants_hblank_late())
    }

    /// Renders the current line up to the CPU's position.
    pub(crate) fn flush_line(&mut self) {
        self.ppu
            .line_update(&mut self.cart, &self.clock, self.mapper.as_deref_mut());
    }

    pub(crate) fn begin_line(&mut self, row: usize) {
        self.ppu.begin_line(
            row,
            &mut self.cart,
            &self.clock,
            self.mapper.as_deref_mut(),
        );
    }

    pub(crate) fn end_line(&mut self) {
        self.ppu.end_line(&mut self.cart, self.mapper.as_deref_mut());
    }

    pub(crate) fn fetch_sprites(&mut self) {
        self.ppu
            .fetch_sprites(&mut self.cart, self.mapper.as_deref_mut());
    }

    pub(crate) fn fetch_hook(&mut self, addr: u16) {
        if let Some(mapper) = self.mapper.as_deref_mut()
            && mapper.wants_fetch_hook()
        {
            mapper.ppu_fetch(addr, &mut self.cart);
        }
    }

    pub(crate) fn run_hblank(&mut self) {
        if !self.wants_hblank() {
            return;
        }
        self.flush_line();
        self.debug.hblank_hooks = self.debug.hblank_hooks.wrapping_add(1);
        self.with_mapper(|mapper, bus| mapper.hblank(bus));
    }

    pub(crate) fn run_hblank_late(&mut self) {
        if !self.wants_hblank_late() {
            return;
        }
        self.flush_line();
        self.with_mapper(|mapper, bus| mapper.hblank_late(bus));
    }

    /// IRQ sources asserted since the last call.
    pub(crate) fn take_irq_edges(&mut self) -> u8 {
        let edges = self.irq_lines & !self.irq_reported;
        self.irq_reported = self.irq_lines;
        edges
    }

    /// Asserts an IRQ source from outside the cartridge.
    pub fn raise_irq(&mut self, source: IrqSource) {
        self.irq_lines |= source.bit();
    }

    pub fn lower_irq(&mut self, source: IrqSource) {
        self.irq_lines &= !source.bit();
    }

    fn oam_dma(&mut self, page: u8) {
        self.debug.dma_transfers = self.debug.dma_transfers.wrapping_add(1);
        let base = (page as u16) << 8;
        for offset in 0..=0xFFu16 {
            let value = self.read(base | offset);
            self.clock.add_cycles(1);
            self.write(0x2004, value);
            self.clock.add_cycles(1);
        }
        self.push_debug_event(format!(
            "OAM DMA page=${page:02X} at cycle {}",
            self.clock.timestamp()
        ));
    }
}

impl CpuBus for System {
    fn read(&mut self, addr: u16) -> u8 {
        self.debug.cpu_reads = self.debug.cpu_reads.wrapping_add(1);
        self.debug.last_cpu_read_addr = addr;
        let value = match self.handlers.read(addr) {
            ReadHandler::Ram => {
                self.debug.cpu_reads_ram = self.debug.cpu_reads_ram.wrapping_add(1);
                self.ram[addr as usize & 0x07FF]
            }
            ReadHandler::Ppu => {
                self.debug.cpu_reads_ppu_regs = self.debug.cpu_reads_ppu_regs.wrapping_add(1);
                self.ppu.read_register(
                    addr,
                    &mut self.cart,
                    &self.clock,
                    self.mapper.as_deref_mut(),
                )
            }
            ReadHandler::Cart => {
                self.debug.cpu_reads_cart = self.debug.cpu_reads_cart.wrapping_add(1);
                self.cart.read(addr, self.open_bus)
            }
            ReadHandler::Mapper => {
                self.debug.cpu_reads_cart = self.debug.cpu_reads_cart.wrapping_add(1);
                let open_bus = self.open_bus;
                match self.mapper.as_deref_mut() {
                    Some(mapper) => mapper.read(addr, open_bus, &self.cart),
                    None => open_bus,
                }
            }
            ReadHandler::OpenBus => {
                self.debug.cpu_reads_open_bus = self.debug.cpu_reads_open_bus.wrapping_add(1);
                self.open_bus
            }
        };
        self.open_bus = value;
        value
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.debug.cpu_writes = self.debug.cpu_writes.wrapping_add(1);
        self.debug.last_cpu_write_addr = addr;
        self.debug.last_cpu_write_value = value;
        self.open_bus = value;
        match self.handlers.write(addr) {
            WriteHandler::Ram => {
                self.debug.cpu_writes_ram = self.debug.cpu_writes_ram.wrapping_add(1);
                self.ram[addr as usize & 0x07FF] = value;
            }
            WriteHandler::Ppu => {
                self.debug.cpu_writes_ppu_regs = self.debug.cpu_writes_ppu_regs.wrapping_add(1);
                self.ppu.write_register(
                    addr,
                    value,
                    &mut self.cart,
                    &self.clock,
                    self.mapper.as_deref_mut(),
                );
            }
            WriteHandler::OamDma => self.oam_dma(value),
            WriteHandler::Cart => {
                self.debug.cpu_writes_cart = self.debug.cpu_writes_cart.wrapping_add(1);
                self.cart.write(addr, value);
            }
            WriteHandler::Mapper => {
                self.debug.cpu_writes_mapper = self.debug.cpu_writes_mapper.wrapping_add(1);
                // Pixels already passed must be drawn with the old banks.
                self.flush_line();
                self.with_mapper(|mapper, bus| mapper.write(addr, value, bus));
            }
            WriteHandler::Ignore => {}
        }
    }

    fn add_cycles(&mut self, cycles: u32) {
        self.clock.add_cycles(cycles);
    }

    fn timestamp(&self) -> u64 {
        self.clock.timestamp()
    }

    fn cycles_remaining(&self) -> i64 {
        self.clock.cycles_remaining()
    }

    fn take_nmi(&mut self) -> bool {
        self.ppu.take_nmi()
    }

    fn irq_line(&self) -> u8 {
        self.irq_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cart::{ChipKind, PrgWindow, WRAM_CHIP};
    use crate::nes::mapper::ExtendedChr;

    fn system() -> System {
        let mut sys = System::new(Clock::ntsc());
        sys.cart
            .register_chip(ChipKind::Prg, WRAM_CHIP, vec![0; 0x2000], true);
        sys.cart.map_prg(WRAM_CHIP, 0x6000, 0, PrgWindow::K8);
        sys
    }

    #[test]
    fn clock_rounds_partial_cycles_up() {
        let mut clock = Clock::ntsc();
        clock.grant_dots(4);
        // 64 master units: one full cycle plus a partial one.
        assert_eq!(clock.cycles_remaining(), 2);
        clock.add_cycles(2);
        assert_eq!(clock.cycles_remaining(), 0);
        assert_eq!(clock.scheduled_master(), 64);

        // The 32-unit overrun comes out of the next grant.
        clock.grant_dots(3);
        assert_eq!(clock.cycles_remaining(), 1);
    }

    #[test]
    fn internal_ram_is_mirrored() {
        let mut sys = system();
        sys.write(0x0012, 0x5A);
        assert_eq!(sys.read(0x0812), 0x5A);
        assert_eq!(sys.read(0x1812), 0x5A);
    }

    #[test]
    fn unmapped_reads_return_last_bus_value() {
        let mut sys = system();
        sys.write(0x6000, 0x77);
        assert_eq!(sys.read(0x6000), 0x77);
        sys.write(0x0000, 0x3C);
        assert_eq!(sys.read(0x8000), 0x3C);
        assert_eq!(sys.read(0x4018), 0x3C);
    }

    #[test]
    fn ppu_registers_mirror_every_eight_bytes() {
        let mut sys = system();
        sys.write(0x3456, 0x21);
        sys.write(0x2006, 0x00);
        sys.write(0x2007, 0x99);
        sys.write(0x2006, 0x21);
        sys.write(0x2006, 0x00);
        sys.read(0x2007);
        assert_eq!(sys.read(0x3FFF), 0x99);
    }

    #[test]
    fn oam_dma_copies_page_and_costs_cycles() {
        let mut sys = system();
        for idx in 0..256u16 {
            sys.write(0x0200 + idx, idx as u8);
        }
        let before = sys.timestamp();
        sys.write(0x4014, 0x02);

        assert_eq!(sys.timestamp() - before, 512);
        assert_eq!(sys.ppu.debug_peek_oam(0), 0);
        assert_eq!(sys.ppu.debug_peek_oam(200), 200);
        assert_eq!(sys.debug_counters().dma_transfers, 1);
        assert_eq!(sys.debug_recent_events(1).len(), 1);
    }

    #[test]
    fn irq_edges_are_reported_once() {
        let mut sys = system();
        sys.raise_irq(IrqSource::External);
        assert_eq!(sys.irq_line(), IrqSource::External.bit());
        assert_eq!(sys.take_irq_edges(), IrqSource::External.bit());
        assert_eq!(sys.take_irq_edges(), 0);
        sys.lower_irq(IrqSource::External);
        sys.take_irq_edges();
        sys.raise_irq(IrqSource::External);
        assert_eq!(sys.take_irq_edges(), IrqSource::External.bit());
    }

    /// Board that serves $5000-$5FFF itself and supplies every pattern byte.
    #[derive(Default)]
    struct ServingBoard {
        fetches: usize,
    }

    impl ExtendedChr for ServingBoard {
        fn background_byte(&self, _addr: u16, _tall_sprites: bool, _cart: &Cart) -> u8 {
            0xFF
        }

        fn sprite_byte(&self, _addr: u16, _cart: &Cart) -> u8 {
            0x00
        }
    }

    impl Mapper for ServingBoard {
        fn name(&self) -> &'static str {
            "serving"
        }

        fn power(&mut self, bus: &mut MapperBus<'_>) {
            bus.set_read_handler(0x5000, 0x5FFF, ReadHandler::Mapper);
        }

        fn read(&mut self, addr: u16, _open_bus: u8, _cart: &Cart) -> u8 {
            addr as u8
        }

        fn wants_fetch_hook(&self) -> bool {
            true
        }

        fn ppu_fetch(&mut self, _addr: u16, _cart: &mut Cart) {
            self.fetches += 1;
        }

        fn extended_chr(&self) -> Option<&dyn ExtendedChr> {
            Some(self)
        }

        fn debug_state(&self) -> String {
            format!("fetches={}", self.fetches)
        }
    }

    #[test]
    fn mapper_read_handler_and_pattern_source() {
        let mut sys = system();
        sys.mapper = Some(Box::new(ServingBoard::default()));
        sys.with_mapper(|mapper, bus| mapper.power(bus));
        assert_eq!(sys.read(0x5042), 0x42);

        sys.ppu.load_palette(&[0x0F, 0x01, 0x02, 0x03]);
        sys.write(0x2001, 0x0A);
        sys.begin_line(0);
        sys.end_line();
        // No CHR chip is mapped; the board's bytes make every pixel color 3.
        assert_eq!(sys.ppu.frame_buffer()[10], 0x03);
        let state = sys.mapper.as_ref().map(|m| m.debug_state());
        assert_ne!(state.as_deref(), Some("fetches=0"));
    }

    #[test]
    fn debug_events_are_bounded_and_newest_first() {
        let mut sys = system();
        for idx in 0..600 {
            sys.push_debug_event(format!("event {idx}"));
        }
        let recent = sys.debug_recent_events(2);
        assert_eq!(recent, vec!["event 599".to_string(), "event 598".to_string()]);
        assert_eq!(sys.debug_recent_events(1000).len(), MAX_DEBUG_EVENTS);
    }
}
