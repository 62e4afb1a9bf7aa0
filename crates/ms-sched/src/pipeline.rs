//! Program-level scheduling and the spill/fill loop
//!
//! Every round squeezes value ids, schedules all blocks from the unscheduled
//! program and asks the register allocator for a verdict. On failure a value
//! is spilled in the unscheduled program and the round repeats.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ms_core::{ScheduleError, SchedulerConfig};

use crate::bundle::Bundle;
use crate::context::{squeeze, SchedulingContext};
use crate::ir::{Block, BundleKind, Instruction, Program, Unit};
use crate::packer::BlockScheduler;
use crate::ra::RegisterAllocator;
use crate::spill::{assign_spill_costs, spill_register};

/// Block after scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledBlock {
    pub id: u32,
    #[serde(default)]
    pub successors: Vec<u32>,
    pub bundles: Vec<Bundle>,
    pub quadword_count: u32,
}

impl ScheduledBlock {
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.bundles.iter().flat_map(|b| b.instructions.iter())
    }

    /// Plain instruction list in bundle order with slot assignments cleared
    pub fn flatten(&self) -> Block {
        let instructions = self
            .instructions()
            .cloned()
            .map(|mut ins| {
                ins.unit = Unit::empty();
                ins
            })
            .collect();

        Block {
            id: self.id,
            successors: self.successors.clone(),
            instructions,
        }
    }
}

/// Program after scheduling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduledProgram {
    pub blocks: Vec<ScheduledBlock>,
    pub quadword_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blend_constant_offset: Option<u32>,
}

impl ScheduledProgram {
    /// Bundles of every block in program order
    pub fn bundles(&self) -> impl Iterator<Item = &Bundle> {
        self.blocks.iter().flat_map(|b| b.bundles.iter())
    }

    pub fn bundle_count(&self) -> usize {
        self.blocks.iter().map(|b| b.bundles.len()).sum()
    }

    pub fn flatten(&self) -> Program {
        Program::new(self.blocks.iter().map(ScheduledBlock::flatten).collect())
    }

    /// Instructions issued per unit, with memory bundles counted by kind
    pub fn unit_histogram(&self) -> BTreeMap<&'static str, usize> {
        let mut histogram = BTreeMap::new();

        for bundle in self.bundles() {
            for ins in &bundle.instructions {
                let key = match bundle.kind {
                    BundleKind::Alu => ins.unit.name(),
                    BundleKind::LoadStore => "ldst",
                    BundleKind::Texture => "tex",
                };
                *histogram.entry(key).or_insert(0) += 1;
            }
        }

        histogram
    }
}

/// Outcome of register allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationStatus {
    Allocated,
    /// Allocation gave up; the program is best-effort
    Degraded(ScheduleError),
}

/// Spilling statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpillStats {
    pub spills: u32,
    pub fills: u32,
    /// Thread-local storage in bytes
    pub tls_size: u32,
    /// Spill rounds performed
    pub iterations: u32,
}

/// Result of [`schedule_program`]
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub scheduled: ScheduledProgram,
    /// Unscheduled program including spill code
    pub program: Program,
    pub stats: SpillStats,
    pub status: AllocationStatus,
}

impl CompiledProgram {
    pub fn is_degraded(&self) -> bool {
        matches!(self.status, AllocationStatus::Degraded(_))
    }
}

/// Schedule every block of `program`
///
/// `ctx` must describe the program's value ids, as produced by
/// [`squeeze`]. Temporaries created while packing are allocated from it.
pub fn schedule_blocks(
    ctx: &mut SchedulingContext,
    config: &SchedulerConfig,
    program: &Program,
) -> ScheduledProgram {
    ctx.reset_layout();
    let mut blocks = Vec::with_capacity(program.blocks.len());

    for block in &program.blocks {
        let bundles = BlockScheduler::new(ctx, config, block.instructions.clone()).schedule();
        let quadword_count = bundles.iter().map(Bundle::quadword_size).sum();

        tracing::debug!(
            "Block {}: {} instructions in {} bundles ({} quadwords)",
            block.id,
            block.instructions.len(),
            bundles.len(),
            quadword_count
        );

        blocks.push(ScheduledBlock {
            id: block.id,
            successors: block.successors.clone(),
            bundles,
            quadword_count,
        });
    }

    ScheduledProgram {
        blocks,
        quadword_count: ctx.quadword_count,
        blend_constant_offset: ctx.blend_constant_offset,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Schedule,
    Spill,
}

/// Schedule `program`, spilling until `allocator` accepts it
pub fn schedule_program<A: RegisterAllocator + ?Sized>(
    program: &Program,
    config: &SchedulerConfig,
    allocator: &mut A,
) -> CompiledProgram {
    debug_assert!(
        program.validate().is_ok(),
        "malformed program reached the scheduler"
    );

    let mut program = program.clone();
    let mut ctx = SchedulingContext::new();
    let mut scheduled = ScheduledProgram::default();
    let mut iterations = 0u32;
    let mut phase = Phase::Schedule;

    let status = loop {
        match phase {
            Phase::Schedule => {
                let (squeezed, remap) = squeeze(&ctx, &program);
                remap.apply(&mut program);
                ctx = squeezed;

                scheduled = schedule_blocks(&mut ctx, config, &program);

                if allocator.allocate(&ctx, &scheduled) {
                    break AllocationStatus::Allocated;
                }
                phase = Phase::Spill;
            }
            Phase::Spill => {
                if iterations >= config.max_spill_iterations {
                    let err = ScheduleError::SpillNonConvergence(iterations);
                    tracing::error!("Internal compiler error: {}", err);
                    break AllocationStatus::Degraded(err);
                }

                assign_spill_costs(allocator, &ctx, &program, &scheduled);

                let Some(node) = allocator.best_spill_node() else {
                    let err = ScheduleError::NoSpillCandidate;
                    tracing::error!("Internal compiler error: {}", err);
                    break AllocationStatus::Degraded(err);
                };

                let class = allocator.node_class(node);
                tracing::debug!("Spilling {} ({:?}), round {}", node, class, iterations + 1);

                spill_register(&mut ctx, &mut program, node, class);
                iterations += 1;
                phase = Phase::Schedule;
            }
        }
    };

    let stats = SpillStats {
        spills: ctx.spills,
        fills: ctx.fills,
        tls_size: ctx.tls_size(),
        iterations,
    };

    if let AllocationStatus::Degraded(err) = &status {
        tracing::warn!("Rendering will be incomplete: {}", err);
    }

    tracing::info!(
        "Scheduled {} blocks into {} bundles ({} quadwords), {} spills, {} fills",
        scheduled.blocks.len(),
        scheduled.bundle_count(),
        scheduled.quadword_count,
        stats.spills,
        stats.fills
    );

    CompiledProgram {
        scheduled,
        program,
        stats,
        status,
    }
}
