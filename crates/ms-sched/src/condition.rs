//! Conditional scheduling
//!
//! Branches and csel read their condition from r31, which only lives within
//! one bundle. The producer of the condition is either moved into the bundle
//! of its consumer and retargeted at r31, or, when that is not possible, a
//! move from the condition into r31 is synthesized in its place.

use crate::bundle::BundleBuilder;
use crate::ir::{InstrFlags, Instruction, RegMode, Unit, ValueId, COMPONENT_W, IDENTITY_SWIZZLE};
use crate::packer::BlockScheduler;
use crate::worklist::Predicate;

impl BlockScheduler<'_> {
    /// Producer of `cond` that can be spliced into the current bundle on
    /// `target`, if there is exactly one
    ///
    /// A consumer already reading r31 takes the r31 writer paired with it.
    fn condition_mobile(
        &self,
        cond: ValueId,
        target: Unit,
        builder: &BundleBuilder,
        consumer: usize,
    ) -> Option<usize> {
        let candidate = if cond == ValueId::CONDITION {
            self.pipelined_producer(consumer)?
        } else {
            if !self.ctx.is_single_use(cond) {
                return None;
            }

            let mut writers = self.instructions[..self.block_len()]
                .iter()
                .enumerate()
                .filter(|(_, ins)| ins.dest == Some(cond))
                .map(|(i, _)| i);

            let first = writers.next()?;

            // Written more than once in the block
            if writers.next().is_some() {
                return None;
            }
            first
        };

        let ins = &self.instructions[candidate];
        let op = ins.alu_op()?;

        // Rewriting to .w breaks ops with a fixed channel count
        if op.props().channel_count != 0 || ins.is_conditional() {
            return None;
        }

        // Scalar units only have 16 and 32-bit lanes
        if Unit::SCALAR.contains(target)
            && matches!(ins.reg_mode, RegMode::Bits8 | RegMode::Bits64)
        {
            return None;
        }

        if !ins.issue_units().contains(target) || !builder.can_accept(ins) {
            return None;
        }

        self.worklist.contains(candidate).then_some(candidate)
    }

    /// Nearest r31 writer before `consumer`
    fn pipelined_producer(&self, consumer: usize) -> Option<usize> {
        let end = consumer.min(self.block_len());
        self.instructions[..end].iter().rposition(|ins| {
            ins.dest == Some(ValueId::CONDITION) && ins.flags.contains(InstrFlags::PIPELINED)
        })
    }

    /// Put the condition of `consumer` in r31 within the current bundle
    ///
    /// Returns the instruction writing r31 and the slot it must occupy.
    pub(crate) fn schedule_condition(
        &mut self,
        pred: &mut Predicate,
        builder: &mut BundleBuilder,
        consumer: usize,
    ) -> Option<(usize, Unit)> {
        let user = &self.instructions[consumer];
        let index = user.condition_index()?;
        let cond = user.src[index]?;

        let branch = user.is_branch();
        let vector = user.alu_op().is_some_and(|op| op.is_csel_v());
        let swizzle = user.swizzle[index];
        let pipelined = cond == ValueId::CONDITION;

        // csel sits in the latter stage, so its condition comes from the
        // former one; branch conditions come from smul
        let target = if branch {
            Unit::SMUL
        } else if vector {
            Unit::VMUL
        } else {
            Unit::SADD
        };

        let mobile = if pipelined || (!vector && swizzle[0] == 0) {
            self.condition_mobile(cond, target, builder, consumer)
        } else {
            None
        };

        let chosen = match mobile {
            Some(producer) => {
                self.worklist.remove(producer);
                let committed = builder.commit(&mut self.instructions[producer]);
                debug_assert!(committed, "constants checked before commit");

                tracing::trace!("Splicing condition {} from {}", cond, producer);
                producer
            }
            None if pipelined => return None,
            None => {
                let mask = if vector { 0xF } else { 0x1 };
                let mov = Instruction::mov(cond, swizzle, cond).with_mask(mask);

                tracing::trace!("Copying condition {} into r31", cond);
                self.synthesize(mov)
            }
        };

        let ins = &mut self.instructions[chosen];
        ins.flags |= InstrFlags::PIPELINED;
        ins.unit = target;

        // Lanes and consumer were rewritten by an earlier pass
        if pipelined {
            pred.exclude = match ins.alu_op() {
                Some(op) if op.is_mov() => ins.src[1],
                _ => None,
            };
            return Some((chosen, target));
        }

        pred.exclude = ins.dest;
        self.ctx.pipelined.insert(cond);

        ins.dest = Some(ValueId::CONDITION);

        if !vector {
            ins.mask = 1 << COMPONENT_W;

            for s in 0..3 {
                if ins.src[s].is_none() {
                    continue;
                }
                let lane = ins.swizzle[s][0];
                ins.swizzle[s] = [0; 16];
                ins.swizzle[s][COMPONENT_W as usize] = lane;
            }
        }

        let user = &mut self.instructions[consumer];
        user.src[index] = Some(ValueId::CONDITION);
        user.swizzle[index] = if vector {
            IDENTITY_SWIZZLE
        } else {
            [COMPONENT_W; 16]
        };

        Some((chosen, target))
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{squeeze, SchedulingContext};
    use crate::ir::{
        AluOp, Block, Branch, InstrFlags, Instruction, LoadStoreOp, Program, RegMode, Unit,
        ValueId, IDENTITY_SWIZZLE,
    };
    use crate::packer::BlockScheduler;
    use crate::bundle::Bundle;
    use ms_core::SchedulerConfig;

    fn schedule(instructions: Vec<Instruction>) -> Vec<Bundle> {
        let mut program = Program::new(vec![Block::new(0, instructions)]);
        let (mut ctx, remap) = squeeze(&SchedulingContext::new(), &program);
        remap.apply(&mut program);

        let block = std::mem::take(&mut program.blocks[0].instructions);
        BlockScheduler::new(&mut ctx, &SchedulerConfig::default(), block).schedule()
    }

    fn compare_then_branch(cond_lane: u8) -> Vec<Instruction> {
        let load = Instruction::load_store(LoadStoreOp::LoadAttribute, Some(ValueId(0)), [None; 3]);
        let compare = Instruction::alu(
            AluOp::Feq,
            ValueId(1),
            [Some(ValueId(0)), Some(ValueId(0)), None],
        )
        .with_mask(0b0011);

        let mut swizzle = IDENTITY_SWIZZLE;
        swizzle[0] = cond_lane;
        let branch = Instruction::branch(
            Branch {
                conditional: true,
                target: Some(1),
                ..Default::default()
            },
            Some(ValueId(1)),
            None,
        )
        .with_swizzle(0, swizzle);

        vec![load, compare, branch]
    }

    fn assert_condition_pipelined(bundle: &Bundle) {
        let writers: Vec<_> = bundle
            .instructions
            .iter()
            .filter(|i| i.dest == Some(ValueId::CONDITION))
            .collect();
        assert_eq!(writers.len(), 1);
        assert!(writers[0].flags.contains(InstrFlags::PIPELINED));

        let consumer = bundle.instructions.iter().find(|i| i.is_conditional()).unwrap();
        let index = consumer.condition_index().unwrap();
        assert_eq!(consumer.src[index], Some(ValueId::CONDITION));
    }

    #[test]
    fn test_single_use_comparison_spliced() {
        let bundles = schedule(compare_then_branch(0));

        assert_eq!(bundles.len(), 2);
        let last = &bundles[1];
        assert_condition_pipelined(last);

        let compare = last.on_unit(Unit::SMUL).unwrap();
        assert_eq!(compare.alu_op(), Some(AluOp::Feq));
        assert_eq!(compare.mask, 0b1000);
        assert_eq!(compare.swizzle[0][3], 0);
    }

    #[test]
    fn test_swizzled_condition_copied() {
        let bundles = schedule(compare_then_branch(1));

        assert_eq!(bundles.len(), 3);
        let last = &bundles[2];
        assert_condition_pipelined(last);

        let mov = last.on_unit(Unit::SMUL).unwrap();
        assert_eq!(mov.alu_op(), Some(AluOp::Imov));
        assert_eq!(mov.mask, 0b1000);
        assert_eq!(mov.swizzle[1][3], 1);
        assert_eq!(mov.src[1], Some(ValueId(1)));

        // The comparison keeps its own bundle and original destination
        let compare = bundles[1].instructions.iter().find(|i| i.alu_op() == Some(AluOp::Feq));
        assert_eq!(compare.and_then(|i| i.dest), Some(ValueId(1)));
    }

    #[test]
    fn test_narrow_and_wide_lanes_not_spliced_into_scalar_units() {
        for mode in [RegMode::Bits8, RegMode::Bits64] {
            let mut instructions = compare_then_branch(0);
            instructions[1].reg_mode = mode;

            let bundles = schedule(instructions);

            assert_eq!(bundles.len(), 3);
            let last = bundles.last().unwrap();
            assert_condition_pipelined(last);
            assert_eq!(last.on_unit(Unit::SMUL).and_then(|i| i.alu_op()), Some(AluOp::Imov));
        }
    }

    #[test]
    fn test_multi_use_condition_copied() {
        let mut instructions = compare_then_branch(0);
        let extra = Instruction::load_store(
            LoadStoreOp::StoreVarying,
            None,
            [Some(ValueId(1)), None, None],
        );
        instructions.insert(2, extra);

        let bundles = schedule(instructions);
        let last = bundles.last().unwrap();
        assert_condition_pipelined(last);
        assert_eq!(last.on_unit(Unit::SMUL).and_then(|i| i.alu_op()), Some(AluOp::Imov));
    }

    #[test]
    fn test_scalar_csel_condition_in_sadd() {
        let compare = Instruction::alu(
            AluOp::Flt,
            ValueId(2),
            [Some(ValueId(0)), Some(ValueId(1)), None],
        )
        .with_mask(0b0001);
        let csel = Instruction::alu(
            AluOp::Fcsel,
            ValueId(3),
            [Some(ValueId(0)), Some(ValueId(1)), Some(ValueId(2))],
        )
        .with_mask(0b0001);
        let bundles = schedule(vec![compare, csel]);

        assert_eq!(bundles.len(), 1);
        assert_condition_pipelined(&bundles[0]);
        assert_eq!(
            bundles[0].on_unit(Unit::SADD).and_then(|i| i.alu_op()),
            Some(AluOp::Flt)
        );
        assert_eq!(
            bundles[0].on_unit(Unit::SMUL).and_then(|i| i.alu_op()),
            Some(AluOp::Fcsel)
        );
    }

    #[test]
    fn test_vector_csel_condition_copied_to_vmul() {
        let compare = Instruction::alu(
            AluOp::Flt,
            ValueId(2),
            [Some(ValueId(0)), Some(ValueId(1)), None],
        );
        let csel = Instruction::alu(
            AluOp::FcselV,
            ValueId(3),
            [Some(ValueId(0)), Some(ValueId(1)), Some(ValueId(2))],
        );
        let bundles = schedule(vec![compare, csel]);

        let last = bundles.last().unwrap();
        assert_condition_pipelined(last);
        let mov = last.on_unit(Unit::VMUL).unwrap();
        assert_eq!(mov.alu_op(), Some(AluOp::Imov));
        assert_eq!(mov.mask, 0xF);
        assert_eq!(last.on_unit(Unit::VADD).and_then(|i| i.alu_op()), Some(AluOp::FcselV));
    }
}
