//! Register allocator interface
//!
//! Graph colouring lives outside the scheduler. The spill loop only needs a
//! verdict, a storage class per value, and a cost-weighted spill candidate.
//! [`PressureAllocator`] answers those questions from live ranges alone and
//! serves as the allocator for the command-line driver.

use std::collections::HashMap;

use crate::context::SchedulingContext;
use crate::pipeline::ScheduledProgram;
use crate::ir::ValueId;

/// Storage class of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RegClass {
    /// General purpose work registers, spilled to scratch memory
    #[default]
    Work,
    /// Load/store address registers
    LoadStore,
    /// Texture coordinate registers
    TextureRead,
    /// Texture result registers
    TextureWrite,
}

impl RegClass {
    /// Special classes are backed by work registers rather than memory
    pub fn is_special(self) -> bool {
        self != RegClass::Work
    }
}

/// External register allocator driving the spill loop
pub trait RegisterAllocator {
    /// Try to allocate the scheduled program; false when it does not fit
    fn allocate(&mut self, ctx: &SchedulingContext, program: &ScheduledProgram) -> bool;

    /// Weight a value for spilling; negative values are never spilled
    fn set_spill_cost(&mut self, value: ValueId, cost: f32);

    /// Best value to spill after a failed allocation
    fn best_spill_node(&self) -> Option<ValueId>;

    fn node_class(&self, value: ValueId) -> RegClass;
}

/// Live range of a value in global bundle indices
#[derive(Debug, Clone, Copy)]
struct LiveRange {
    def: usize,
    last_use: usize,
}

impl LiveRange {
    /// Live across the boundary after bundle `b`
    fn live_after(&self, b: usize) -> bool {
        self.def <= b && b < self.last_use
    }

    fn span(&self) -> usize {
        self.last_use.saturating_sub(self.def)
    }
}

/// Allocator that succeeds when work register pressure fits the register file
#[derive(Debug, Clone)]
pub struct PressureAllocator {
    work_registers: u32,
    classes: HashMap<ValueId, RegClass>,
    costs: HashMap<ValueId, f32>,
    ranges: HashMap<ValueId, LiveRange>,
    live_at_peak: Vec<ValueId>,
    max_pressure: u32,
}

impl PressureAllocator {
    pub fn new(work_registers: u32) -> Self {
        Self {
            work_registers,
            classes: HashMap::new(),
            costs: HashMap::new(),
            ranges: HashMap::new(),
            live_at_peak: Vec::new(),
            max_pressure: 0,
        }
    }

    /// Place `value` in a special class
    pub fn with_class(mut self, value: ValueId, class: RegClass) -> Self {
        self.classes.insert(value, class);
        self
    }

    /// Peak work register pressure seen by the last allocation
    pub fn max_pressure(&self) -> u32 {
        self.max_pressure
    }

    pub fn work_registers(&self) -> u32 {
        self.work_registers
    }

    fn compute_ranges(&mut self, program: &ScheduledProgram) -> usize {
        self.ranges.clear();
        let mut bundle_count = 0;

        for (b, bundle) in program.bundles().enumerate() {
            bundle_count = b + 1;

            for ins in &bundle.instructions {
                if let Some(dest) = ins.dest.filter(|d| !d.is_fixed()) {
                    self.ranges
                        .entry(dest)
                        .and_modify(|r| r.def = r.def.min(b))
                        .or_insert(LiveRange { def: b, last_use: b });
                }

                for src in ins.sources().filter(|s| !s.is_fixed()) {
                    self.ranges
                        .entry(src)
                        .and_modify(|r| r.last_use = r.last_use.max(b))
                        .or_insert(LiveRange { def: b, last_use: b });
                }
            }
        }

        bundle_count
    }
}

impl RegisterAllocator for PressureAllocator {
    fn allocate(&mut self, _ctx: &SchedulingContext, program: &ScheduledProgram) -> bool {
        self.costs.clear();
        self.live_at_peak.clear();
        self.max_pressure = 0;

        let bundle_count = self.compute_ranges(program);
        let mut peak_at = None;

        for b in 0..bundle_count {
            let pressure = self
                .ranges
                .iter()
                .filter(|(v, r)| self.node_class(**v) == RegClass::Work && r.live_after(b))
                .count() as u32;

            if pressure > self.max_pressure {
                self.max_pressure = pressure;
                peak_at = Some(b);
            }
        }

        if let Some(b) = peak_at {
            let mut live: Vec<ValueId> = self
                .ranges
                .iter()
                .filter(|(v, r)| self.node_class(**v) == RegClass::Work && r.live_after(b))
                .map(|(v, _)| *v)
                .collect();
            live.sort_unstable();
            self.live_at_peak = live;
        }

        tracing::debug!(
            "Peak pressure {} of {} work registers",
            self.max_pressure,
            self.work_registers
        );

        self.max_pressure <= self.work_registers
    }

    fn set_spill_cost(&mut self, value: ValueId, cost: f32) {
        self.costs.insert(value, cost);
    }

    fn best_spill_node(&self) -> Option<ValueId> {
        let mut best: Option<(ValueId, f32)> = None;

        for &value in &self.live_at_peak {
            let cost = self.costs.get(&value).copied().unwrap_or(0.0);
            if cost <= 0.0 {
                continue;
            }

            let span = self.ranges.get(&value).map_or(0, LiveRange::span);
            let score = cost * span as f32;

            // live_at_peak is sorted, so ties keep the lower id
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((value, score));
            }
        }

        best.map(|(value, _)| value)
    }

    fn node_class(&self, value: ValueId) -> RegClass {
        self.classes.get(&value).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::squeeze;
    use crate::ir::{AluOp, Block, Instruction, LoadStoreOp, Program};
    use crate::pipeline::schedule_blocks;
    use ms_core::SchedulerConfig;

    /// Four loads reduced pairwise, peaking at four live values
    fn reduction() -> Program {
        let mut instructions: Vec<_> = (0..4)
            .map(|i| Instruction::load_store(LoadStoreOp::LoadAttribute, Some(ValueId(i)), [None; 3]))
            .collect();

        let add = |dest: u32, a: u32, b: u32| {
            Instruction::alu(AluOp::Fadd, ValueId(dest), [Some(ValueId(a)), Some(ValueId(b)), None])
                .with_mask(0b0001)
        };
        instructions.push(add(4, 0, 1));
        instructions.push(add(5, 2, 3));
        instructions.push(add(6, 4, 5));
        instructions.push(Instruction::load_store(
            LoadStoreOp::StoreVarying,
            None,
            [Some(ValueId(6)), None, None],
        ));

        Program::new(vec![Block::new(0, instructions)])
    }

    fn scheduled() -> (SchedulingContext, ScheduledProgram) {
        let mut program = reduction();
        let (mut ctx, remap) = squeeze(&SchedulingContext::new(), &program);
        remap.apply(&mut program);
        let scheduled = schedule_blocks(&mut ctx, &SchedulerConfig::default(), &program);
        (ctx, scheduled)
    }

    #[test]
    fn test_pressure_fits() {
        let (ctx, program) = scheduled();
        assert_eq!(program.bundle_count(), 5);

        let mut ra = PressureAllocator::new(4);
        assert!(ra.allocate(&ctx, &program));
        assert_eq!(ra.max_pressure(), 4);
    }

    #[test]
    fn test_pressure_exceeds() {
        let (ctx, program) = scheduled();

        let mut ra = PressureAllocator::new(3);
        assert!(!ra.allocate(&ctx, &program));

        for t in 0..ctx.temp_count {
            ra.set_spill_cost(ValueId(t), 1.0);
        }
        assert_eq!(ra.best_spill_node(), Some(ValueId(0)));

        ra.set_spill_cost(ValueId(0), -1.0);
        assert_eq!(ra.best_spill_node(), Some(ValueId(1)));
    }

    #[test]
    fn test_no_candidate_without_costs() {
        let (ctx, program) = scheduled();

        let mut ra = PressureAllocator::new(1);
        assert!(!ra.allocate(&ctx, &program));
        assert_eq!(ra.best_spill_node(), None);
    }

    #[test]
    fn test_special_classes_do_not_count() {
        let (ctx, program) = scheduled();

        let mut ra = PressureAllocator::new(3).with_class(ValueId(0), RegClass::LoadStore);
        assert!(ra.allocate(&ctx, &program));
        assert_eq!(ra.node_class(ValueId(0)), RegClass::LoadStore);
        assert!(ra.node_class(ValueId(0)).is_special());
        assert_eq!(ra.node_class(ValueId(1)), RegClass::Work);
    }
}
