pub mod bus;
pub mod cart;
pub mod cartridge;
pub mod config;
pub mod cpu;
mod frame;
pub mod mapper;
pub mod ppu;
pub mod state;

use anyhow::Result;
use std::path::Path;

use bus::{NesDebugCounters, System};
use cart::Cart;
use cartridge::Cartridge;
use config::EngineConfig;
use cpu::Cpu;
use mapper::{create_mapper, mapper_name};
use ppu::{Ppu, PpuDebugCounters};
use state::{RegionLister, Snapshot, SnapshotRestore, StateRegion, StateVisitor};

/// One emulation session: a CPU core driving the pixel engine and the
/// cartridge address space through the frame loop.
pub struct Nes<C: Cpu> {
    pub(crate) cpu: C,
    pub(crate) sys: System,
    config: EngineConfig,

    mapper_name: String,
    mapper_id: Option<u16>,
    loaded_rom_name: Option<String>,
}

impl<C: Cpu> Nes<C> {
    pub fn new(cpu: C, config: EngineConfig) -> Self {
        let mut sys = System::new(config.clock());
        sys.ppu.set_scanlines_per_frame(config.scanlines_per_frame());
        sys.ppu.set_sprite_limit(config.sprite_limit);
        Self {
            cpu,
            sys,
            config,
            mapper_name: "None".to_string(),
            mapper_id: None,
            loaded_rom_name: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.sys.ppu
    }

    pub fn cart(&self) -> &Cart {
        &self.sys.cart
    }

    /// Direct access for setting up chips and nametables outside a ROM image.
    pub fn cart_mut(&mut self) -> &mut Cart {
        &mut self.sys.cart
    }

    pub fn system_mut(&mut self) -> &mut System {
        &mut self.sys
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn mapper_id(&self) -> Option<u16> {
        self.mapper_id
    }

    pub fn loaded_rom_name(&self) -> Option<&str> {
        self.loaded_rom_name.as_deref()
    }

    pub fn has_rom(&self) -> bool {
        self.sys.mapper.is_some()
    }

    pub fn frame_buffer(&self) -> &[u8] {
        self.sys.ppu.frame_buffer()
    }

    /// CPU cycles executed since power-on.
    pub fn cpu_cycles(&self) -> u64 {
        self.sys.clock.timestamp()
    }

    pub fn debug_counters(&self) -> NesDebugCounters {
        self.sys.debug_counters()
    }

    pub fn debug_ppu_counters(&self) -> PpuDebugCounters {
        self.sys.ppu.debug_counters()
    }

    pub fn debug_mapper_state(&self) -> String {
        match self.sys.mapper.as_deref() {
            Some(mapper) => {
                let state = mapper.debug_state();
                if state.is_empty() {
                    mapper.name().to_string()
                } else {
                    state
                }
            }
            None => "No mapper".to_string(),
        }
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        self.sys.debug_recent_events(limit)
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        self.load_cartridge(cart)?;
        self.loaded_rom_name = path
            .file_name()
            .and_then(|v| v.to_str())
            .map(|v| v.to_ascii_lowercase());
        Ok(())
    }

    /// Installs `cart` and powers the console on. Fails without touching the
    /// current session when no board exists for the image's mapper id.
    pub fn load_cartridge(&mut self, cart: Cartridge) -> Result<()> {
        let mapper_id = cart.mapper_id;
        let submapper_id = cart.submapper_id;
        let mapper = create_mapper(mapper_id)?;

        cart.install(&mut self.sys.cart);
        self.sys.mapper = Some(mapper);
        self.mapper_id = Some(mapper_id);
        self.loaded_rom_name = None;
        let name = mapper_name(mapper_id);
        self.mapper_name = if submapper_id != 0 {
            format!("{name} (mapper {mapper_id}, submapper {submapper_id})")
        } else {
            format!("{name} (mapper {mapper_id})")
        };
        log::debug!("cartridge loaded: {}", self.mapper_name);

        self.power();
        self.sys
            .push_debug_event(format!("ROM loaded: {}", self.mapper_name));
        Ok(())
    }

    /// Cold start: clears console memory, re-runs the board's power hook
    /// and arms the configured number of dead frames.
    pub fn power(&mut self) {
        self.sys.ram.fill(0);
        self.sys.cart.power();
        self.sys.ppu.power(self.config.dead_frames);
        self.restart();
        self.sys.clock.reset();
        self.sys.clear_debug();
        self.sys.push_debug_event("power on");
        log::debug!("power on, mapper {}", self.mapper_name);
    }

    /// Warm reset: memories survive, registers and dead frames do not.
    pub fn reset(&mut self) {
        self.sys.ppu.reset(self.config.dead_frames);
        self.restart();
        self.sys.push_debug_event(format!(
            "reset at cycle {}",
            self.sys.clock.timestamp()
        ));
        log::debug!("reset");
    }

    fn restart(&mut self) {
        self.sys.reset_handlers();
        self.sys.clear_irq_lines();
        self.sys.with_mapper(|mapper, bus| mapper.power(bus));
        self.cpu.reset();
    }

    /// Walks every saved region: console RAM, pixel engine, cartridge, then
    /// the mapper's own registers.
    pub fn visit_state(&mut self, visitor: &mut dyn StateVisitor) {
        visitor.region("IRAM", &mut self.sys.ram);
        self.sys.ppu.visit_state(visitor);
        self.sys.cart.visit_state(visitor);
        if let Some(mapper) = self.sys.mapper.as_deref_mut() {
            mapper.visit_state(visitor);
        }
    }

    pub fn state_regions(&mut self) -> Vec<StateRegion> {
        let mut lister = RegionLister::default();
        self.visit_state(&mut lister);
        lister.regions
    }

    pub fn save_snapshot(&mut self) -> Snapshot {
        let mut capture = Snapshot::capturer();
        self.visit_state(&mut capture);
        capture.finish()
    }

    /// Restores `snapshot`. The layout is validated first so a mismatched
    /// snapshot leaves the session untouched.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        SnapshotRestore::validate(&self.state_regions(), snapshot)?;
        self.sys.cart.validate_snapshot(snapshot)?;
        let mut restore = snapshot.restorer()?;
        self.visit_state(&mut restore);
        restore.finish()?;
        self.sys
            .push_debug_event(format!("snapshot restored ({} regions)", snapshot.region_count()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::tests::ines_image;
    use crate::nes::cpu::ScriptedCpu;

    fn nes_with(mapper_id: u8, prg_banks: u8, chr_banks: u8) -> Nes<ScriptedCpu> {
        let mut nes = Nes::new(ScriptedCpu::new(), EngineConfig::default());
        let image = Cartridge::from_bytes(&ines_image(mapper_id, prg_banks, chr_banks, 0)).unwrap();
        nes.load_cartridge(image).unwrap();
        nes
    }

    #[test]
    fn load_names_board_and_powers_on() {
        let nes = nes_with(4, 4, 2);
        assert_eq!(nes.mapper_name(), "MMC3 (mapper 4)");
        assert_eq!(nes.ppu().dead_frames(), 2);
        assert_eq!(nes.cart().read(0xE000, 0), 4);
        assert!(
            nes.debug_recent_events(1)[0].starts_with("ROM loaded"),
            "{:?}",
            nes.debug_recent_events(4)
        );
    }

    #[test]
    fn unsupported_board_keeps_previous_session() {
        let mut nes = nes_with(0, 1, 1);
        let image = Cartridge::from_bytes(&ines_image(5, 1, 1, 0)).unwrap();
        assert!(nes.load_cartridge(image).is_err());
        assert_eq!(nes.mapper_id(), Some(0));
    }

    #[test]
    fn snapshot_restores_ram_and_mapper_registers() {
        let mut nes = nes_with(2, 4, 0);
        {
            let sys = nes.system_mut();
            sys.ram[0x10] = 0x42;
            sys.with_mapper(|mapper, bus| mapper.write(0x8000, 2, bus));
        }
        let snapshot = nes.save_snapshot();
        let json = snapshot.to_json().unwrap();

        nes.system_mut().ram[0x10] = 0;
        nes.system_mut()
            .with_mapper(|mapper, bus| mapper.write(0x8000, 1, bus));
        assert_eq!(nes.cart().read(0x8000, 0), 2);

        nes.load_snapshot(&Snapshot::from_json(&json).unwrap()).unwrap();
        assert_eq!(nes.system_mut().ram[0x10], 0x42);
        // The page table comes back with the saved bank selected.
        assert_eq!(nes.cart().read(0x8000, 0), 3);
    }

    #[test]
    fn snapshot_from_other_board_is_rejected_untouched() {
        let mut donor = nes_with(4, 4, 2);
        let snapshot = donor.save_snapshot();

        let mut nes = nes_with(2, 4, 0);
        nes.system_mut().ram[0] = 7;
        assert!(nes.load_snapshot(&snapshot).is_err());
        assert_eq!(nes.system_mut().ram[0], 7);
    }

    #[test]
    fn snapshot_with_dangling_page_is_rejected_untouched() {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let mut nes = nes_with(2, 4, 0);
        let snapshot = nes.save_snapshot();
        let mut doc: serde_json::Value =
            serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        let regions = doc["regions"].as_array_mut().unwrap();
        let pages = regions.iter_mut().find(|r| r["tag"] == "PGTB").unwrap();
        let mut bytes = STANDARD.decode(pages["data"].as_str().unwrap()).unwrap();
        // PRG page 16 covers $8000; point it at chip slot 0x25.
        bytes[16 * 6] = 0x25;
        pages["data"] = STANDARD.encode(&bytes).into();
        let tampered = Snapshot::from_json(&doc.to_string()).unwrap();

        nes.system_mut().ram[1] = 5;
        let err = nes.load_snapshot(&tampered).unwrap_err();
        assert!(format!("{err:#}").contains("page table"), "{err:#}");
        assert_eq!(nes.system_mut().ram[1], 5);
        assert_eq!(nes.cart().read(0x8000, 0), 1);
    }

    #[test]
    fn reset_rearms_dead_frames_and_keeps_ram() {
        let mut nes = nes_with(0, 1, 1);
        nes.run_frame();
        nes.run_frame();
        assert_eq!(nes.ppu().dead_frames(), 0);
        nes.system_mut().ram[3] = 9;
        nes.reset();
        assert_eq!(nes.ppu().dead_frames(), 2);
        assert_eq!(nes.system_mut().ram[3], 9);
    }
}
