use anyhow::{Context, Result, bail};

use super::state::{Snapshot, StateVisitor};

pub const PRG_CHIP_SLOTS: usize = 32;
pub const CHR_CHIP_SLOTS: usize = 32;

/// Chip slot conventionally used for cartridge work RAM at $6000.
pub const WRAM_CHIP: usize = 0x10;

const PRG_PAGE_SHIFT: u32 = 11;
const PRG_PAGE_MASK: usize = 0x07FF;
const PRG_PAGES: usize = 32;
const CHR_PAGE_SHIFT: u32 = 10;
const CHR_PAGE_MASK: usize = 0x03FF;
const CHR_PAGES: usize = 8;
const NT_PAGE_SIZE: usize = 0x400;
const PAGE_TABLE_LEN: usize = (PRG_PAGES + CHR_PAGES) * 6 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipKind {
    Prg,
    Chr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrgWindow {
    K2,
    K4,
    K8,
    K16,
    K32,
}

impl PrgWindow {
    const fn shift(self) -> u32 {
        match self {
            Self::K2 => 11,
            Self::K4 => 12,
            Self::K8 => 13,
            Self::K16 => 14,
            Self::K32 => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChrWindow {
    K1,
    K2,
    K4,
    K8,
}

impl ChrWindow {
    const fn shift(self) -> u32 {
        match self {
            Self::K1 => 10,
            Self::K2 => 11,
            Self::K4 => 12,
            Self::K8 => 13,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
}

/// Backing store for one logical nametable quadrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtPage {
    /// 1 KiB page of the console's 2 KiB nametable RAM.
    Ciram(u8),
    /// 1 KiB page of cartridge-provided nametable memory.
    Extra(u8),
}

impl NtPage {
    fn encode(self) -> u8 {
        match self {
            Self::Ciram(page) => page & 0x01,
            Self::Extra(page) => 0x80 | (page & 0x7F),
        }
    }

    fn decode(byte: u8) -> Self {
        if byte & 0x80 != 0 {
            Self::Extra(byte & 0x7F)
        } else {
            Self::Ciram(byte & 0x01)
        }
    }
}

struct Chip {
    data: Vec<u8>,
    is_ram: bool,
    /// Bank masks indexed by `shift - base_shift`.
    masks: [u32; 5],
}

impl Chip {
    fn new(data: Vec<u8>, is_ram: bool, base_shift: u32) -> Self {
        let size = data.len() as u32;
        let mut masks = [0u32; 5];
        for (idx, mask) in masks.iter_mut().enumerate() {
            *mask = (size >> (base_shift + idx as u32)).saturating_sub(1);
        }
        Self {
            data,
            is_ram,
            masks,
        }
    }

    #[inline]
    fn byte(&self, idx: usize) -> u8 {
        match self.data.get(idx) {
            Some(value) => *value,
            None => self.data[idx % self.data.len()],
        }
    }

    #[inline]
    fn store(&mut self, idx: usize, value: u8) {
        let len = self.data.len();
        let idx = if idx < len { idx } else { idx % len };
        self.data[idx] = value;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Page {
    chip: u8,
    base: usize,
    ram: bool,
}

/// Cartridge address space: chip slots, the CPU and video page tables and
/// nametable routing.
pub struct Cart {
    prg_chips: Vec<Option<Chip>>,
    chr_chips: Vec<Option<Chip>>,
    prg_pages: [Option<Page>; PRG_PAGES],
    chr_pages: [Option<Page>; CHR_PAGES],
    chr_writable: u8,

    ciram: [u8; 0x800],
    extra_nt: Vec<u8>,
    nt_pages: [NtPage; 4],
    nt_writable: u8,
    mirror_hard: bool,
}

impl Default for Cart {
    fn default() -> Self {
        Self::new()
    }
}

impl Cart {
    pub fn new() -> Self {
        Self {
            prg_chips: (0..PRG_CHIP_SLOTS).map(|_| None).collect(),
            chr_chips: (0..CHR_CHIP_SLOTS).map(|_| None).collect(),
            prg_pages: [None; PRG_PAGES],
            chr_pages: [None; CHR_PAGES],
            chr_writable: 0,
            ciram: [0; 0x800],
            extra_nt: Vec::new(),
            nt_pages: [
                NtPage::Ciram(0),
                NtPage::Ciram(0),
                NtPage::Ciram(1),
                NtPage::Ciram(1),
            ],
            nt_writable: 0x0F,
            mirror_hard: false,
        }
    }

    /// Forget every mapping. Registered chips stay in their slots.
    pub fn clear_mappings(&mut self) {
        self.prg_pages = [None; PRG_PAGES];
        self.chr_pages = [None; CHR_PAGES];
        self.chr_writable = 0;
    }

    pub fn power(&mut self) {
        self.ciram.fill(0);
    }

    /// Installs a physical chip in `slot`.
    ///
    /// Panics when `data` is empty or `slot` is outside the fixed slot range:
    /// both indicate a bug in cartridge setup code.
    pub fn register_chip(&mut self, kind: ChipKind, slot: usize, data: Vec<u8>, is_ram: bool) {
        if data.is_empty() {
            panic!("{kind:?} chip {slot} registered with zero size");
        }
        let (slots, base_shift) = match kind {
            ChipKind::Prg => (&mut self.prg_chips, PrgWindow::K2.shift()),
            ChipKind::Chr => (&mut self.chr_chips, ChrWindow::K1.shift()),
        };
        if slot >= slots.len() {
            panic!(
                "{kind:?} chip slot {slot} out of range (0..{})",
                slots.len()
            );
        }
        log::debug!(
            "register {kind:?} chip {slot}: {} bytes{}",
            data.len(),
            if is_ram { " (ram)" } else { "" }
        );
        slots[slot] = Some(Chip::new(data, is_ram, base_shift));
    }

    pub fn chip_len(&self, kind: ChipKind, slot: usize) -> usize {
        let slots = match kind {
            ChipKind::Prg => &self.prg_chips,
            ChipKind::Chr => &self.chr_chips,
        };
        slots
            .get(slot)
            .and_then(|chip| chip.as_ref())
            .map_or(0, |chip| chip.data.len())
    }

    /// Selects `bank` of PRG chip `slot` into the window starting at `addr`.
    ///
    /// A chip smaller than the window is decomposed into 2 KiB pages, each
    /// masked to the chip's own 2 KiB bank count. An unregistered chip unmaps
    /// the window.
    pub fn map_prg(&mut self, slot: usize, addr: u16, bank: u32, window: PrgWindow) {
        let shift = window.shift();
        let pages = 1usize << (shift - PRG_PAGE_SHIFT);
        let first = (addr as usize >> PRG_PAGE_SHIFT) & (PRG_PAGES - 1);
        log::trace!("map prg chip {slot} ${addr:04X} bank {bank} {window:?}");

        let Some(chip) = self.prg_chips.get(slot).and_then(|chip| chip.as_ref()) else {
            for page in self.prg_pages.iter_mut().skip(first).take(pages) {
                *page = None;
            }
            return;
        };

        let ram = chip.is_ram;
        let window_size = 1usize << shift;
        if chip.data.len() >= window_size {
            let bank = (bank & chip.masks[(shift - PRG_PAGE_SHIFT) as usize]) as usize;
            for idx in 0..pages {
                self.set_prg_page(
                    first + idx,
                    slot,
                    (bank << shift) + (idx << PRG_PAGE_SHIFT),
                    ram,
                );
            }
        } else {
            let mask2 = chip.masks[0];
            let first_bank = bank.wrapping_mul(pages as u32);
            for idx in 0..pages {
                let sub = (first_bank.wrapping_add(idx as u32) & mask2) as usize;
                self.set_prg_page(first + idx, slot, sub << PRG_PAGE_SHIFT, ram);
            }
        }
    }

    fn set_prg_page(&mut self, page: usize, chip: usize, base: usize, ram: bool) {
        if let Some(entry) = self.prg_pages.get_mut(page) {
            *entry = Some(Page {
                chip: chip as u8,
                base,
                ram,
            });
        }
    }

    /// Removes the PRG mapping for `pages_2k` pages starting at `addr`.
    pub fn unmap_prg(&mut self, addr: u16, pages_2k: usize) {
        let first = (addr as usize >> PRG_PAGE_SHIFT) & (PRG_PAGES - 1);
        for page in self.prg_pages.iter_mut().skip(first).take(pages_2k) {
            *page = None;
        }
    }

    /// Selects `bank` of CHR chip `slot` into the window starting at `addr`
    /// and updates the CHR-RAM write mask. An unregistered chip is ignored.
    ///
    /// Callers rendering mid-scanline must flush the pixel engine first.
    pub fn map_chr(&mut self, slot: usize, addr: u16, bank: u32, window: ChrWindow) {
        let Some(chip) = self.chr_chips.get(slot).and_then(|chip| chip.as_ref()) else {
            return;
        };
        log::trace!("map chr chip {slot} ${addr:04X} bank {bank} {window:?}");

        let shift = window.shift();
        let pages = 1usize << (shift - CHR_PAGE_SHIFT);
        let first = (addr as usize >> CHR_PAGE_SHIFT) & (CHR_PAGES - 1);
        let ram = chip.is_ram;
        let window_size = 1usize << shift;

        let mut bases = [0usize; CHR_PAGES];
        if chip.data.len() >= window_size {
            let bank = (bank & chip.masks[(shift - CHR_PAGE_SHIFT) as usize]) as usize;
            for (idx, base) in bases.iter_mut().take(pages).enumerate() {
                *base = (bank << shift) + (idx << CHR_PAGE_SHIFT);
            }
        } else {
            let mask1 = chip.masks[0];
            let first_bank = bank.wrapping_mul(pages as u32);
            for (idx, base) in bases.iter_mut().take(pages).enumerate() {
                *base = ((first_bank.wrapping_add(idx as u32) & mask1) as usize) << CHR_PAGE_SHIFT;
            }
        }

        for (idx, base) in bases.iter().take(pages).enumerate() {
            let page = (first + idx) & (CHR_PAGES - 1);
            self.chr_pages[page] = Some(Page {
                chip: slot as u8,
                base: *base,
                ram,
            });
            if ram {
                self.chr_writable |= 1 << page;
            } else {
                self.chr_writable &= !(1 << page);
            }
        }
    }

    pub fn chr_writable_mask(&self) -> u8 {
        self.chr_writable
    }

    /// CPU read through the page table; unmapped pages yield `open_bus`.
    #[inline]
    pub fn read(&self, addr: u16, open_bus: u8) -> u8 {
        match self.prg_pages[addr as usize >> PRG_PAGE_SHIFT] {
            Some(page) => match &self.prg_chips[page.chip as usize] {
                Some(chip) => chip.byte(page.base + (addr as usize & PRG_PAGE_MASK)),
                None => open_bus,
            },
            None => open_bus,
        }
    }

    /// CPU write; dropped unless the page is mapped RAM.
    #[inline]
    pub fn write(&mut self, addr: u16, value: u8) {
        if let Some(page) = self.prg_pages[addr as usize >> PRG_PAGE_SHIFT] {
            if !page.ram {
                return;
            }
            if let Some(chip) = self.prg_chips[page.chip as usize].as_mut() {
                chip.store(page.base + (addr as usize & PRG_PAGE_MASK), value);
            }
        }
    }

    pub fn is_prg_mapped(&self, addr: u16) -> bool {
        self.prg_pages[addr as usize >> PRG_PAGE_SHIFT].is_some()
    }

    /// Pattern-table read. Unmapped pages read as zero.
    #[inline]
    pub fn chr_read(&self, addr: u16) -> u8 {
        let addr = addr as usize & 0x1FFF;
        match self.chr_pages[addr >> CHR_PAGE_SHIFT] {
            Some(page) => match &self.chr_chips[page.chip as usize] {
                Some(chip) => chip.byte(page.base + (addr & CHR_PAGE_MASK)),
                None => 0,
            },
            None => 0,
        }
    }

    /// Pattern-table write; only lands on pages flagged as CHR RAM.
    pub fn chr_write(&mut self, addr: u16, value: u8) {
        let addr = addr as usize & 0x1FFF;
        let page_idx = addr >> CHR_PAGE_SHIFT;
        if self.chr_writable & (1 << page_idx) == 0 {
            return;
        }
        if let Some(page) = self.chr_pages[page_idx]
            && let Some(chip) = self.chr_chips[page.chip as usize].as_mut()
        {
            chip.store(page.base + (addr & CHR_PAGE_MASK), value);
        }
    }

    /// Reads byte `offset` of CHR chip `slot` directly, bypassing the page
    /// table. Used by extended pattern sources.
    pub fn chr_chip_byte(&self, slot: usize, offset: usize) -> u8 {
        self.chr_chips
            .get(slot)
            .and_then(|chip| chip.as_ref())
            .map_or(0, |chip| chip.byte(offset))
    }

    /// Allocates cartridge nametable memory addressed by `NtPage::Extra`.
    pub fn set_extra_nametable_ram(&mut self, size: usize) {
        self.extra_nt = vec![0; size];
    }

    /// Applies a standard mirroring mode. Ignored once hard mirroring is set.
    pub fn set_mirroring(&mut self, mirroring: Mirroring) {
        if self.mirror_hard {
            return;
        }
        self.nt_pages = match mirroring {
            Mirroring::Horizontal => [
                NtPage::Ciram(0),
                NtPage::Ciram(0),
                NtPage::Ciram(1),
                NtPage::Ciram(1),
            ],
            Mirroring::Vertical => [
                NtPage::Ciram(0),
                NtPage::Ciram(1),
                NtPage::Ciram(0),
                NtPage::Ciram(1),
            ],
            Mirroring::OneScreenLower => [NtPage::Ciram(0); 4],
            Mirroring::OneScreenUpper => [NtPage::Ciram(1); 4],
            Mirroring::FourScreen => self.four_screen_pages(),
        };
        self.nt_writable = 0x0F;
    }

    /// Points each quadrant at a console nametable page. Honoured even when
    /// mirroring is hard-wired.
    pub fn set_mirroring_custom(&mut self, pages: [u8; 4]) {
        for (quadrant, page) in pages.iter().enumerate() {
            self.nt_pages[quadrant] = NtPage::Ciram(page & 0x01);
        }
    }

    /// Cartridge-load mirroring setup. Four-screen uses 2 KiB of extra
    /// nametable RAM for the lower quadrants.
    pub fn setup_mirroring(&mut self, mirroring: Mirroring, hard: bool) {
        self.mirror_hard = false;
        if mirroring == Mirroring::FourScreen && self.extra_nt.len() < 2 * NT_PAGE_SIZE {
            self.extra_nt = vec![0; 2 * NT_PAGE_SIZE];
        }
        self.set_mirroring(mirroring);
        self.mirror_hard = hard;
        log::debug!("nametable mirroring {mirroring:?} hard={hard}");
    }

    /// Clears the hard-mirroring lock so mappers may remap again.
    pub fn release_hard_mirroring(&mut self) {
        self.mirror_hard = false;
    }

    pub fn mirroring_is_hard(&self) -> bool {
        self.mirror_hard
    }

    fn four_screen_pages(&self) -> [NtPage; 4] {
        if self.extra_nt.len() < 2 * NT_PAGE_SIZE {
            panic!("four-screen mirroring without 2 KiB of cartridge nametable RAM");
        }
        [
            NtPage::Ciram(0),
            NtPage::Ciram(1),
            NtPage::Extra(0),
            NtPage::Extra(1),
        ]
    }

    /// Routes one quadrant to `page`; `writable` controls $2007 writes.
    pub fn set_nametable(&mut self, quadrant: usize, page: NtPage, writable: bool) {
        if quadrant >= 4 {
            panic!("nametable quadrant {quadrant} out of range");
        }
        if let NtPage::Extra(idx) = page
            && (idx as usize + 1) * NT_PAGE_SIZE > self.extra_nt.len()
        {
            panic!(
                "nametable page {idx} beyond {} bytes of cartridge nametable memory",
                self.extra_nt.len()
            );
        }
        self.nt_pages[quadrant] = page;
        if writable {
            self.nt_writable |= 1 << quadrant;
        } else {
            self.nt_writable &= !(1 << quadrant);
        }
    }

    pub fn nametable_page(&self, quadrant: usize) -> NtPage {
        self.nt_pages[quadrant & 3]
    }

    #[inline]
    fn nt_index(&self, quadrant: usize) -> (bool, usize) {
        match self.nt_pages[quadrant & 3] {
            NtPage::Ciram(page) => (false, page as usize * NT_PAGE_SIZE),
            NtPage::Extra(page) => (true, page as usize * NT_PAGE_SIZE),
        }
    }

    /// Reads nametable byte `offset` (0..0x400) of `quadrant`.
    #[inline]
    pub fn nt_read(&self, quadrant: usize, offset: usize) -> u8 {
        let offset = offset & (NT_PAGE_SIZE - 1);
        match self.nt_index(quadrant) {
            (false, base) => self.ciram[base + offset],
            (true, base) => self.extra_nt.get(base + offset).copied().unwrap_or(0),
        }
    }

    pub fn nt_write(&mut self, quadrant: usize, offset: usize, value: u8) {
        if self.nt_writable & (1 << (quadrant & 3)) == 0 {
            return;
        }
        let offset = offset & (NT_PAGE_SIZE - 1);
        match self.nt_index(quadrant) {
            (false, base) => self.ciram[base + offset] = value,
            (true, base) => {
                if let Some(slot) = self.extra_nt.get_mut(base + offset) {
                    *slot = value;
                }
            }
        }
    }

    /// Page-table selection packed as bytes, for save states.
    fn encode_pages(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PAGE_TABLE_LEN);
        for page in &self.prg_pages {
            encode_page(&mut out, *page);
        }
        for page in &self.chr_pages {
            encode_page(&mut out, *page);
        }
        out.push(self.chr_writable);
        out
    }

    /// Unpacks a page table produced by `encode_pages`. Every mapped page
    /// must point into a chip registered with this cart.
    fn decode_pages(&self, bytes: &[u8]) -> Result<PageTable> {
        if bytes.len() != PAGE_TABLE_LEN {
            bail!(
                "page table is {} bytes, expected {PAGE_TABLE_LEN}",
                bytes.len()
            );
        }
        let mut chunks = bytes.chunks_exact(6);
        let mut table = PageTable {
            prg: [None; PRG_PAGES],
            chr: [None; CHR_PAGES],
            chr_writable: bytes[PAGE_TABLE_LEN - 1],
        };
        for (idx, (page, chunk)) in table.prg.iter_mut().zip(chunks.by_ref()).enumerate() {
            *page = self
                .checked_page(ChipKind::Prg, chunk)
                .with_context(|| format!("PRG page {idx}"))?;
        }
        for (idx, (page, chunk)) in table.chr.iter_mut().zip(chunks.by_ref()).enumerate() {
            *page = self
                .checked_page(ChipKind::Chr, chunk)
                .with_context(|| format!("CHR page {idx}"))?;
        }
        Ok(table)
    }

    fn checked_page(&self, kind: ChipKind, chunk: &[u8]) -> Result<Option<Page>> {
        let Some(page) = decode_page(chunk) else {
            return Ok(None);
        };
        let chips = match kind {
            ChipKind::Prg => &self.prg_chips,
            ChipKind::Chr => &self.chr_chips,
        };
        let Some(Some(chip)) = chips.get(page.chip as usize) else {
            bail!("chip {} is not registered", page.chip);
        };
        if page.base >= chip.data.len() {
            bail!(
                "offset {:#x} is outside chip {} ({} bytes)",
                page.base,
                page.chip,
                chip.data.len()
            );
        }
        Ok(Some(page))
    }

    /// Checks the page table stored in `snapshot` against the chips
    /// registered here, so a restore cannot leave dangling pages.
    pub fn validate_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(bytes) = snapshot.region_bytes("PGTB")? {
            self.decode_pages(&bytes)
                .context("snapshot page table does not fit this cartridge")?;
        }
        Ok(())
    }

    pub fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visitor.region("NTAR", &mut self.ciram);

        let mut pages = self.encode_pages();
        visitor.region("PGTB", &mut pages);
        match self.decode_pages(&pages) {
            Ok(table) => {
                self.prg_pages = table.prg;
                self.chr_pages = table.chr;
                self.chr_writable = table.chr_writable;
            }
            Err(err) => log::warn!("page table left unchanged: {err:#}"),
        }

        let mut nt = [0u8; 5];
        for (slot, page) in nt.iter_mut().zip(self.nt_pages.iter()) {
            *slot = page.encode();
        }
        nt[4] = self.nt_writable;
        visitor.region("NTMP", &mut nt);
        for (page, byte) in self.nt_pages.iter_mut().zip(nt.iter()) {
            *page = NtPage::decode(*byte);
        }
        self.nt_writable = nt[4];

        if !self.extra_nt.is_empty() {
            visitor.region("FSNT", &mut self.extra_nt);
        }
        for (slot, chip) in self.prg_chips.iter_mut().enumerate() {
            if let Some(chip) = chip.as_mut().filter(|chip| chip.is_ram) {
                visitor.region(&format!("WRM{slot:X}"), &mut chip.data);
            }
        }
        for (slot, chip) in self.chr_chips.iter_mut().enumerate() {
            if let Some(chip) = chip.as_mut().filter(|chip| chip.is_ram) {
                visitor.region(&format!("CRM{slot:X}"), &mut chip.data);
            }
        }
    }
}

struct PageTable {
    prg: [Option<Page>; PRG_PAGES],
    chr: [Option<Page>; CHR_PAGES],
    chr_writable: u8,
}

fn encode_page(out: &mut Vec<u8>, page: Option<Page>) {
    match page {
        Some(page) => {
            out.push(page.chip | if page.ram { 0x40 } else { 0 });
            out.push(1);
            out.extend_from_slice(&(page.base as u32).to_le_bytes());
        }
        None => out.extend_from_slice(&[0; 6]),
    }
}

fn decode_page(chunk: &[u8]) -> Option<Page> {
    if chunk[1] == 0 {
        return None;
    }
    Some(Page {
        chip: chunk[0] & 0x3F,
        ram: chunk[0] & 0x40 != 0,
        base: u32::from_le_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]) as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    #[test]
    fn large_chip_maps_like_direct_offsets() {
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Prg, 0, patterned_banks(0x20000, 0x4000), false);
        cart.map_prg(0, 0x8000, 5, PrgWindow::K16);
        cart.map_prg(0, 0xC000, 7, PrgWindow::K16);

        assert_eq!(cart.read(0x8000, 0xEE), 6);
        assert_eq!(cart.read(0xBFFF, 0xEE), 6);
        assert_eq!(cart.read(0xC123, 0xEE), 8);
    }

    #[test]
    fn bank_values_wrap_by_chip_mask() {
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Prg, 0, patterned_banks(0x8000, 0x2000), false);
        cart.map_prg(0, 0x8000, 6, PrgWindow::K8);
        assert_eq!(cart.read(0x8000, 0), 3);
    }

    #[test]
    fn small_chip_in_large_window_decomposes_into_2k_pages() {
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Prg, 0, patterned_banks(0x2000, 0x800), false);
        cart.map_prg(0, 0x8000, 1, PrgWindow::K16);

        // 2K banks 8..15 masked by 3: the 8K chip appears twice.
        for half in 0..2u16 {
            let base = 0x8000 + half * 0x2000;
            assert_eq!(cart.read(base, 0), 1);
            assert_eq!(cart.read(base + 0x0800, 0), 2);
            assert_eq!(cart.read(base + 0x1000, 0), 3);
            assert_eq!(cart.read(base + 0x1800, 0), 4);
        }

        cart.map_prg(0, 0x8000, 1, PrgWindow::K16);
        assert_eq!(cart.read(0x9800, 0), 4);
    }

    #[test]
    fn unmapped_reads_return_open_bus_and_writes_drop() {
        let mut cart = Cart::new();
        assert_eq!(cart.read(0x8000, 0x5A), 0x5A);
        cart.write(0x8000, 0x12);
        assert_eq!(cart.read(0x8000, 0x5A), 0x5A);

        cart.register_chip(ChipKind::Prg, 0, vec![0x11; 0x4000], false);
        cart.map_prg(0, 0x8000, 0, PrgWindow::K16);
        cart.write(0x8000, 0x99);
        assert_eq!(cart.read(0x8000, 0), 0x11);
    }

    #[test]
    fn ram_pages_accept_writes() {
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Prg, WRAM_CHIP, vec![0; 0x2000], true);
        cart.map_prg(WRAM_CHIP, 0x6000, 0, PrgWindow::K8);
        cart.write(0x6123, 0x42);
        assert_eq!(cart.read(0x6123, 0), 0x42);
    }

    #[test]
    fn missing_prg_chip_unmaps_window() {
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Prg, 0, vec![1; 0x8000], false);
        cart.map_prg(0, 0x8000, 0, PrgWindow::K32);
        cart.map_prg(3, 0x8000, 0, PrgWindow::K8);
        assert_eq!(cart.read(0x8000, 0x77), 0x77);
        assert_eq!(cart.read(0xA000, 0x77), 1);
    }

    #[test]
    fn chr_mapping_tracks_ram_mask() {
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Chr, 0, patterned_banks(0x4000, 0x400), false);
        cart.register_chip(ChipKind::Chr, 1, vec![0; 0x2000], true);

        cart.map_chr(0, 0x0000, 0, ChrWindow::K8);
        assert_eq!(cart.chr_writable_mask(), 0);
        cart.map_chr(1, 0x1000, 0, ChrWindow::K4);
        assert_eq!(cart.chr_writable_mask(), 0xF0);

        cart.chr_write(0x0010, 0xAA);
        cart.chr_write(0x1010, 0xBB);
        assert_eq!(cart.chr_read(0x0010), 1);
        assert_eq!(cart.chr_read(0x1010), 0xBB);

        cart.map_chr(0, 0x0400, 9, ChrWindow::K1);
        assert_eq!(cart.chr_read(0x0400), 10);
    }

    #[test]
    fn unregistered_chr_chip_is_ignored() {
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Chr, 0, patterned_banks(0x2000, 0x400), false);
        cart.map_chr(0, 0x0000, 0, ChrWindow::K8);
        cart.map_chr(5, 0x0000, 1, ChrWindow::K1);
        assert_eq!(cart.chr_read(0x0000), 1);
    }

    #[test]
    fn hard_mirroring_ignores_mapper_requests() {
        let mut cart = Cart::new();
        cart.setup_mirroring(Mirroring::Vertical, true);
        cart.set_mirroring(Mirroring::Horizontal);
        assert_eq!(cart.nametable_page(1), NtPage::Ciram(1));

        cart.release_hard_mirroring();
        cart.set_mirroring(Mirroring::Horizontal);
        assert_eq!(cart.nametable_page(1), NtPage::Ciram(0));
    }

    #[test]
    fn four_screen_uses_extra_ram() {
        let mut cart = Cart::new();
        cart.setup_mirroring(Mirroring::FourScreen, true);
        cart.nt_write(3, 5, 0x33);
        cart.nt_write(0, 5, 0x44);
        assert_eq!(cart.nt_read(3, 5), 0x33);
        assert_eq!(cart.nt_read(2, 5), 0);
        assert_eq!(cart.nt_read(0, 5), 0x44);
    }

    #[test]
    fn read_only_nametable_quadrant_drops_writes() {
        let mut cart = Cart::new();
        cart.set_extra_nametable_ram(0x400);
        cart.set_nametable(2, NtPage::Extra(0), false);
        cart.nt_write(2, 0, 0x10);
        assert_eq!(cart.nt_read(2, 0), 0);
    }

    #[test]
    #[should_panic(expected = "zero size")]
    fn zero_sized_chip_is_fatal() {
        Cart::new().register_chip(ChipKind::Prg, 0, Vec::new(), false);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn slot_out_of_range_is_fatal() {
        Cart::new().register_chip(ChipKind::Chr, CHR_CHIP_SLOTS, vec![0; 0x400], false);
    }

    #[test]
    fn page_table_survives_state_round_trip() {
        struct Capture(Vec<(String, Vec<u8>)>);
        impl StateVisitor for Capture {
            fn region(&mut self, tag: &str, data: &mut [u8]) {
                self.0.push((tag.to_string(), data.to_vec()));
            }
        }
        struct Replay(Vec<(String, Vec<u8>)>);
        impl StateVisitor for Replay {
            fn region(&mut self, tag: &str, data: &mut [u8]) {
                if let Some((_, bytes)) = self.0.iter().find(|(name, _)| name == tag) {
                    data.copy_from_slice(bytes);
                }
            }
        }

        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Prg, 0, patterned_banks(0x10000, 0x2000), false);
        cart.map_prg(0, 0x8000, 3, PrgWindow::K8);
        let mut capture = Capture(Vec::new());
        cart.visit_state(&mut capture);

        cart.map_prg(0, 0x8000, 1, PrgWindow::K8);
        assert_eq!(cart.read(0x8000, 0), 2);
        cart.visit_state(&mut Replay(capture.0));
        assert_eq!(cart.read(0x8000, 0), 4);
    }

    #[test]
    fn page_table_pointing_outside_chips_is_rejected() {
        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Prg, 0, patterned_banks(0x8000, 0x2000), false);
        cart.map_prg(0, 0x8000, 2, PrgWindow::K8);
        let good = cart.encode_pages();
        let page = 0x8000usize >> PRG_PAGE_SHIFT;

        let mut out_of_range = good.clone();
        out_of_range[page * 6] = 0x25;
        assert!(cart.decode_pages(&out_of_range).is_err());

        let mut unregistered = good.clone();
        unregistered[page * 6] = 0x05;
        let err = cart.decode_pages(&unregistered).err().unwrap();
        assert!(format!("{err:#}").contains("not registered"), "{err:#}");

        let mut past_end = good.clone();
        past_end[page * 6 + 2..page * 6 + 6].copy_from_slice(&0x8000u32.to_le_bytes());
        assert!(cart.decode_pages(&past_end).is_err());

        assert!(cart.decode_pages(&good[..good.len() - 1]).is_err());
        assert!(cart.decode_pages(&good).is_ok());
    }

    #[test]
    fn rejected_page_table_leaves_mapping_in_place() {
        struct Overwrite(Vec<u8>);
        impl StateVisitor for Overwrite {
            fn region(&mut self, tag: &str, data: &mut [u8]) {
                if tag == "PGTB" {
                    data.copy_from_slice(&self.0);
                }
            }
        }

        let mut cart = Cart::new();
        cart.register_chip(ChipKind::Prg, 0, patterned_banks(0x8000, 0x2000), false);
        cart.map_prg(0, 0x8000, 2, PrgWindow::K8);
        let mut pages = cart.encode_pages();
        pages[(0x8000usize >> PRG_PAGE_SHIFT) * 6] = 0x3F;

        cart.visit_state(&mut Overwrite(pages));
        assert_eq!(cart.read(0x8000, 0), 3);
    }
}
