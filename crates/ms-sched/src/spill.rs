//! Spill and fill insertion
//!
//! Runs on the unscheduled program after a failed allocation. Work registers
//! go to 128-bit thread-local scratch slots; special classes are relieved
//! with register copies instead.

use crate::context::SchedulingContext;
use crate::ir::{
    from_bytemask, InstrFlags, Instruction, Program, RegMode, ValueId, IDENTITY_SWIZZLE,
};
use crate::pipeline::ScheduledProgram;
use crate::ra::{RegClass, RegisterAllocator};

/// How a spilled value is moved out of the way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Store after each def, load before each use
    Scratch { slot: u32 },
    /// Copy into a fresh work register before each use
    CopyBeforeUse,
    /// Copy into one work register after each def
    CopyAfterDef { target: ValueId },
}

/// Hand spill costs to the allocator
///
/// Every temporary starts at 1.0. Values feeding spill/fill plumbing or the
/// condition pipeline, values written in a bundle with either, conditions
/// moved into r31 and values the unscheduled program does not name are never
/// spilled.
pub fn assign_spill_costs<A: RegisterAllocator + ?Sized>(
    allocator: &mut A,
    ctx: &SchedulingContext,
    program: &Program,
    scheduled: &ScheduledProgram,
) {
    let mut costs = vec![-1.0f32; ctx.temp_count as usize];

    for ins in program.instructions() {
        for value in ins.dest.into_iter().chain(ins.sources()) {
            if let Some(cost) = value.temp().and_then(|t| costs.get_mut(t)) {
                *cost = 1.0;
            }
        }
    }

    let mut pin = |value: ValueId| {
        if let Some(cost) = value.temp().and_then(|t| costs.get_mut(t)) {
            *cost = -1.0;
        }
    };

    // Spliced conditions no longer appear under their own id
    ctx.pipelined.iter().copied().for_each(&mut pin);

    for bundle in scheduled.bundles() {
        let plumbing = bundle
            .instructions
            .iter()
            .any(|ins| ins.flags.intersects(InstrFlags::NO_SPILL | InstrFlags::PIPELINED));

        for ins in &bundle.instructions {
            if ins.flags.intersects(InstrFlags::NO_SPILL | InstrFlags::PIPELINED) {
                ins.sources().for_each(&mut pin);
            }

            if plumbing {
                ins.dest.into_iter().for_each(&mut pin);
            }
        }
    }

    for (t, cost) in costs.into_iter().enumerate() {
        allocator.set_spill_cost(ValueId(t as u32), cost);
    }
}

/// Rewrite `program` so that `node` no longer needs a register of `class`
/// across its whole live range
pub fn spill_register(
    ctx: &mut SchedulingContext,
    program: &mut Program,
    node: ValueId,
    class: RegClass,
) {
    let strategy = match class {
        RegClass::Work => {
            let slot = ctx.spill_slots;
            ctx.spill_slots += 1;
            Strategy::Scratch { slot }
        }
        RegClass::TextureWrite => Strategy::CopyAfterDef {
            target: ctx.make_temp(),
        },
        RegClass::LoadStore | RegClass::TextureRead => Strategy::CopyBeforeUse,
    };

    tracing::trace!("Spilling {} with {:?}", node, strategy);

    spill_defs(ctx, program, node, strategy);
    fill_uses(ctx, program, node, strategy);

    for ins in program.instructions_mut() {
        ins.flags.remove(InstrFlags::HINT);
    }
}

fn spill_defs(ctx: &mut SchedulingContext, program: &mut Program, node: ValueId, strategy: Strategy) {
    for block in &mut program.blocks {
        let mut out = Vec::with_capacity(block.instructions.len() + 1);

        for mut ins in block.instructions.drain(..) {
            if ins.dest != Some(node) {
                out.push(ins);
                continue;
            }

            let mask = from_bytemask(ins.bytemask(), RegMode::Bits32);

            let mut spill = match strategy {
                Strategy::Scratch { slot } => {
                    let fresh = ctx.make_temp();
                    ins.dest = Some(fresh);
                    ins.flags |= InstrFlags::NO_SPILL;
                    Instruction::scratch(fresh, slot, true, mask)
                }
                Strategy::CopyAfterDef { target } => {
                    let mut mov = Instruction::mov(node, IDENTITY_SWIZZLE, target).with_mask(mask);
                    mov.flags |= InstrFlags::NO_SPILL;
                    mov
                }
                Strategy::CopyBeforeUse => {
                    out.push(ins);
                    continue;
                }
            };

            spill.flags |= InstrFlags::HINT;
            ctx.spills += 1;

            out.push(ins);
            out.push(spill);
        }

        block.instructions = out;
    }
}

fn fill_uses(ctx: &mut SchedulingContext, program: &mut Program, node: ValueId, strategy: Strategy) {
    for block in &mut program.blocks {
        let mut out = Vec::with_capacity(block.instructions.len() + 1);

        for mut ins in block.instructions.drain(..) {
            if ins.flags.contains(InstrFlags::HINT) || !ins.has_arg(node) {
                out.push(ins);
                continue;
            }

            let mask = from_bytemask(ins.read_bytemask(node), RegMode::Bits32);

            let replacement = match strategy {
                Strategy::Scratch { slot } => {
                    let fresh = ctx.make_temp();
                    out.push(Instruction::scratch(fresh, slot, false, mask));
                    ctx.fills += 1;
                    fresh
                }
                Strategy::CopyBeforeUse => {
                    let fresh = ctx.make_temp();
                    let mut mov = Instruction::mov(node, IDENTITY_SWIZZLE, fresh).with_mask(mask);
                    mov.flags |= InstrFlags::NO_SPILL;
                    out.push(mov);
                    ctx.fills += 1;
                    fresh
                }
                Strategy::CopyAfterDef { target } => target,
            };

            ins.rewrite_src(node, replacement);
            out.push(ins);
        }

        block.instructions = out;
    }
}
