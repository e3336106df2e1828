use super::Nes;
use super::cpu::{Cpu, IrqSource};
use super::ppu::{DOTS_PER_SCANLINE, FRAME_HEIGHT};

/// Dots from the start of the idle line to the vblank NMI.
const NMI_DELAY_DOTS: u32 = 12;
/// Dot at which the sprite unit finishes with a line; horizontal blank
/// covers the rest.
const HBLANK_START_DOT: u32 = 256;
/// Lead-in dots that prefetch the first two tiles of the next line.
const LINE_LEAD_IN_DOTS: u32 = 16;
const HBLANK_DOTS: u32 = DOTS_PER_SCANLINE - HBLANK_START_DOT;

impl<C: Cpu> Nes<C> {
    /// Runs one video frame: a blank frame while dead frames remain,
    /// otherwise vblank, the pre-render line and 240 visible lines.
    pub fn run_frame(&mut self) {
        let scanlines = self.sys.ppu.scanlines_per_frame() as u32;
        if self.sys.ppu.dead_frames() > 0 {
            self.sys.ppu.fill_dead_frame();
            self.run_cpu(scanlines * DOTS_PER_SCANLINE);
            self.sys.ppu.end_dead_frame();
            let debug = self.sys.debug_counters_mut();
            debug.dead_frames = debug.dead_frames.wrapping_add(1);
            log::trace!("dead frame, {} left", self.sys.ppu.dead_frames());
        } else {
            self.run_live_frame(scanlines);
        }
        let debug = self.sys.debug_counters_mut();
        debug.frame_count = debug.frame_count.wrapping_add(1);
    }

    fn run_live_frame(&mut self, scanlines: u32) {
        self.run_cpu(DOTS_PER_SCANLINE);
        self.sys.ppu.enter_vblank();
        self.run_cpu(NMI_DELAY_DOTS);
        if self.sys.ppu.raise_vblank_nmi() {
            self.cpu.trigger_nmi();
            let debug = self.sys.debug_counters_mut();
            debug.nmi_delivered = debug.nmi_delivered.wrapping_add(1);
            let cycle = self.sys.clock.timestamp();
            self.sys.push_debug_event(format!("NMI at cycle {cycle}"));
        }
        self.run_cpu((scanlines - 242) * DOTS_PER_SCANLINE - NMI_DELAY_DOTS);
        self.sys.ppu.leave_vblank();

        // Pre-render line.
        self.run_cpu(HBLANK_START_DOT);
        if self.sys.ppu.rendering_enabled() {
            if self.sys.ppu.hblank_hook_allowed() {
                self.sys.run_hblank();
            }
            if self.sys.wants_fetch_hook() {
                for _ in 0..42 {
                    self.sys.fetch_hook(0x2000);
                    self.sys.fetch_hook(0x0000);
                }
            }
            self.sys.run_hblank_late();
        }
        self.run_cpu(HBLANK_DOTS - LINE_LEAD_IN_DOTS);
        if self.sys.ppu.rendering_enabled() {
            self.sys.ppu.reload_vram_addr();
            let addr = self.sys.ppu.vram_addr() & 0x3FFF;
            self.sys.fetch_hook(addr);
        }

        self.sys.ppu.begin_frame();
        self.sys.begin_line(0);
        // Odd frames are one dot shorter.
        let skip = u32::from(self.sys.ppu.odd_frame());
        self.run_cpu(LINE_LEAD_IN_DOTS - skip);
        self.sys.ppu.toggle_frame_parity();

        self.sys.ppu.start_visible_lines();
        for _ in 0..FRAME_HEIGHT {
            self.sys.ppu.count_line_emphasis();
            self.do_line();
        }
        self.sys.ppu.end_frame();
    }

    fn do_line(&mut self) {
        self.run_cpu(HBLANK_START_DOT);
        self.sys.end_line();
        self.sys.ppu.finish_line();

        if self.sys.ppu.rendering_enabled() {
            self.sys.fetch_sprites();
        }

        if self.hblank_hook_due() {
            self.run_cpu(6);
            self.sys.ppu.copy_horizontal_bits();
            self.run_cpu(4);
            self.sys.run_hblank();
            self.run_cpu(HBLANK_DOTS - LINE_LEAD_IN_DOTS - 10);
        } else {
            self.run_cpu(6);
            self.sys.ppu.copy_horizontal_bits();
            self.run_cpu(HBLANK_DOTS - LINE_LEAD_IN_DOTS - 6);
            // Rendering may have been switched on during the slice above.
            if self.hblank_hook_due() {
                self.sys.run_hblank();
            }
        }

        if self.sys.ppu.sprites_enabled() {
            self.sys.ppu.compose_sprites();
        }
        if self.sys.ppu.rendering_enabled() {
            self.sys.run_hblank_late();
        }

        let next = self.sys.ppu.advance_scanline();
        if (next as usize) < FRAME_HEIGHT {
            self.sys.begin_line(next as usize);
        }
        self.run_cpu(LINE_LEAD_IN_DOTS);
    }

    fn hblank_hook_due(&self) -> bool {
        self.sys.wants_hblank() && self.sys.ppu.hblank_hook_allowed()
    }

    /// Lets the CPU run for `dots` pixel-clock dots, delivering interrupts
    /// raised before and during the slice.
    fn run_cpu(&mut self, dots: u32) {
        self.deliver_interrupts();
        self.sys.clock.grant_dots(dots);
        self.cpu.run(&mut self.sys);
        self.deliver_interrupts();
    }

    fn deliver_interrupts(&mut self) {
        if self.sys.ppu.take_nmi() {
            self.cpu.trigger_nmi();
            let debug = self.sys.debug_counters_mut();
            debug.nmi_delivered = debug.nmi_delivered.wrapping_add(1);
        }
        let edges = self.sys.take_irq_edges();
        if edges == 0 {
            return;
        }
        for source in IrqSource::ALL {
            if edges & source.bit() != 0 {
                self.cpu.trigger_irq(source);
                let debug = self.sys.debug_counters_mut();
                debug.irq_delivered = debug.irq_delivered.wrapping_add(1);
            }
        }
    }
}
