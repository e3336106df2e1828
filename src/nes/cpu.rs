use std::collections::VecDeque;

/// Interrupt sources that can hold the CPU IRQ line low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    Mapper,
    External,
}

impl IrqSource {
    pub const ALL: [IrqSource; 2] = [IrqSource::Mapper, IrqSource::External];

    pub const fn bit(self) -> u8 {
        match self {
            Self::Mapper => 0x01,
            Self::External => 0x02,
        }
    }
}

/// What the CPU sees of the rest of the console.
pub trait CpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
    /// Advances the CPU timestamp, consuming budget from the current slice.
    fn add_cycles(&mut self, cycles: u32);
    /// CPU cycles since power-on.
    fn timestamp(&self) -> u64;
    /// Whole CPU cycles left in the current slice; zero or less means stop.
    fn cycles_remaining(&self) -> i64;
    fn take_nmi(&mut self) -> bool;
    fn irq_line(&self) -> u8;
}

/// Instruction interpreter contract. `run` executes until the bus reports
/// the slice budget exhausted.
pub trait Cpu {
    fn run(&mut self, bus: &mut dyn CpuBus);
    fn trigger_nmi(&mut self);
    fn trigger_irq(&mut self, source: IrqSource);
    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    Read(u16),
    Write(u16, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOp {
    pub cycle: u64,
    pub op: BusOp,
}

/// Deterministic stand-in CPU that performs queued bus accesses at fixed
/// absolute cycles and otherwise idles. Each access costs one cycle.
#[derive(Debug, Default)]
pub struct ScriptedCpu {
    script: VecDeque<TimedOp>,
    reads: Vec<(u64, u16, u8)>,
    nmi_count: u64,
    nmi_cycles: Vec<u64>,
    irq_count: u64,
    irq_sources: Vec<IrqSource>,
    now: u64,
}

impl ScriptedCpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an access. Operations are kept sorted by cycle; ties keep
    /// insertion order.
    pub fn push(&mut self, cycle: u64, op: BusOp) {
        let idx = self.script.partition_point(|item| item.cycle <= cycle);
        self.script.insert(idx, TimedOp { cycle, op });
    }

    pub fn write_at(&mut self, cycle: u64, addr: u16, value: u8) {
        self.push(cycle, BusOp::Write(addr, value));
    }

    pub fn read_at(&mut self, cycle: u64, addr: u16) {
        self.push(cycle, BusOp::Read(addr));
    }

    pub fn pending_ops(&self) -> usize {
        self.script.len()
    }

    /// `(cycle, addr, value)` for every scripted read, in execution order.
    pub fn reads(&self) -> &[(u64, u16, u8)] {
        &self.reads
    }

    pub fn nmi_count(&self) -> u64 {
        self.nmi_count
    }

    /// CPU timestamps at which NMIs were delivered.
    pub fn nmi_cycles(&self) -> &[u64] {
        &self.nmi_cycles
    }

    pub fn irq_count(&self) -> u64 {
        self.irq_count
    }

    pub fn irq_sources(&self) -> &[IrqSource] {
        &self.irq_sources
    }

    fn poll_nmi(&mut self, bus: &mut dyn CpuBus) {
        if bus.take_nmi() {
            self.trigger_nmi();
        }
    }
}

impl Cpu for ScriptedCpu {
    fn run(&mut self, bus: &mut dyn CpuBus) {
        loop {
            self.now = bus.timestamp();
            self.poll_nmi(bus);
            let remaining = bus.cycles_remaining();
            if remaining <= 0 {
                break;
            }

            match self.script.front().copied() {
                Some(item) if item.cycle <= self.now => {
                    self.script.pop_front();
                    match item.op {
                        BusOp::Read(addr) => {
                            let value = bus.read(addr);
                            self.reads.push((self.now, addr, value));
                        }
                        BusOp::Write(addr, value) => bus.write(addr, value),
                    }
                    bus.add_cycles(1);
                }
                Some(item) => {
                    let gap = (item.cycle - self.now).min(remaining as u64);
                    bus.add_cycles(gap as u32);
                }
                None => bus.add_cycles(remaining as u32),
            }
        }
    }

    fn trigger_nmi(&mut self) {
        self.nmi_count += 1;
        self.nmi_cycles.push(self.now);
    }

    fn trigger_irq(&mut self, source: IrqSource) {
        self.irq_count += 1;
        self.irq_sources.push(source);
    }
}
