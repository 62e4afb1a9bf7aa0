//! Bundle packers
//!
//! A block is scheduled from its last instruction backwards. Each step probes
//! the worklist for the best ready instruction, then hands over to the packer
//! for its bundle kind:
//! - Texture: one instruction per bundle
//! - Load/store: up to two instructions, retired together
//! - ALU: up to six slots filled in a fixed order
//!
//! Bundles come out in reverse and are flipped into program order at the end.

use ms_core::SchedulerConfig;

use crate::bundle::{
    instruction_bytes, quadword_size, Bundle, BundleBuilder, CONTROL_BYTES, TAG_ALU_4,
    TAG_LOAD_STORE_4, TAG_TEXTURE_4,
};
use crate::context::SchedulingContext;
use crate::graph::DependencyGraph;
use crate::ir::{BundleKind, Instruction, Unit, ValueId, IDENTITY_SWIZZLE, WRITEOUT_MASK};
use crate::worklist::{Choice, Predicate, Worklist};

/// Instructions picked for each ALU slot
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AluSlots {
    pub vmul: Option<usize>,
    pub sadd: Option<usize>,
    pub vadd: Option<usize>,
    pub smul: Option<usize>,
    pub vlut: Option<usize>,
    pub branch: Option<usize>,
}

impl AluSlots {
    /// Put `index` in the slot for `unit` if it is free
    pub fn place(&mut self, index: usize, unit: Unit) -> bool {
        let slot = if unit == Unit::VMUL {
            &mut self.vmul
        } else if unit == Unit::SADD {
            &mut self.sadd
        } else if unit == Unit::VADD {
            &mut self.vadd
        } else if unit == Unit::SMUL {
            &mut self.smul
        } else if unit == Unit::VLUT {
            &mut self.vlut
        } else {
            return false;
        };

        if slot.is_some() {
            return false;
        }
        *slot = Some(index);
        true
    }

    /// Slots in issue order
    pub fn stages(&self) -> [Option<usize>; 6] {
        [
            self.vmul,
            self.sadd,
            self.vadd,
            self.smul,
            self.vlut,
            self.branch,
        ]
    }
}

/// Bundle holding instruction indices until the block is done
#[derive(Debug)]
struct PendingBundle {
    kind: BundleKind,
    tag: u8,
    control: u32,
    members: Vec<usize>,
    constants: Option<[u32; 4]>,
    blend_constant: bool,
    padding: u32,
}

impl PendingBundle {
    fn memory(kind: BundleKind, tag: u8, members: Vec<usize>) -> Self {
        Self {
            kind,
            tag,
            control: tag as u32,
            members,
            constants: None,
            blend_constant: false,
            padding: 0,
        }
    }

    fn materialize(self, instructions: &mut [Option<Instruction>]) -> Bundle {
        let pool = self.constants;
        let members = self
            .members
            .iter()
            .filter_map(|&i| instructions.get_mut(i).and_then(Option::take))
            .map(|mut ins| {
                if ins.constants.is_some() {
                    ins.constants = pool;
                }
                ins
            })
            .collect();

        Bundle {
            kind: self.kind,
            tag: self.tag,
            control: self.control,
            instructions: members,
            constants: self.constants,
            blend_constant: self.blend_constant,
            padding: self.padding,
        }
    }
}

/// Scheduler state for one block
pub struct BlockScheduler<'a> {
    pub(crate) ctx: &'a mut SchedulingContext,
    window: usize,
    /// Block instructions followed by any the packers synthesize
    pub(crate) instructions: Vec<Instruction>,
    graph: DependencyGraph,
    pub(crate) worklist: Worklist,
    scheduled: usize,
}

impl<'a> BlockScheduler<'a> {
    pub fn new(
        ctx: &'a mut SchedulingContext,
        config: &SchedulerConfig,
        instructions: Vec<Instruction>,
    ) -> Self {
        let graph = DependencyGraph::build(&instructions, ctx.temp_count as usize);
        let worklist = Worklist::new(graph.roots());

        Self {
            ctx,
            window: config.lookback_window.max(1),
            instructions,
            graph,
            worklist,
            scheduled: 0,
        }
    }

    /// Instructions belonging to the block, excluding synthesized ones
    pub(crate) fn block_len(&self) -> usize {
        self.graph.len()
    }

    fn choose(&self, pred: &Predicate, builder: Option<&BundleBuilder>) -> Option<Choice> {
        self.worklist
            .choose(&self.instructions, pred, builder, self.window)
    }

    /// Take the best instruction for `pred` off the worklist, committing its
    /// constants and latching `no_cond` if it consumes a condition
    pub(crate) fn choose_instruction(
        &mut self,
        pred: &mut Predicate,
        builder: Option<&mut BundleBuilder>,
    ) -> Option<usize> {
        let choice = self.choose(pred, builder.as_deref())?;
        self.worklist.remove(choice.index);

        if let Some(builder) = builder {
            if pred.kind == Some(BundleKind::Alu) {
                let committed = builder.commit(&mut self.instructions[choice.index]);
                debug_assert!(committed, "constants checked before commit");
            }
        }

        pred.no_cond |= choice.conditional;
        Some(choice.index)
    }

    fn choose_alu(
        &mut self,
        slot: &mut Option<usize>,
        pred: &mut Predicate,
        builder: &mut BundleBuilder,
        unit: Unit,
    ) {
        if slot.is_some() {
            return;
        }

        pred.unit = Some(unit);
        *slot = self.choose_instruction(pred, Some(builder));

        if let Some(index) = *slot {
            let ins = &mut self.instructions[index];
            ins.unit = match ins.branch_info() {
                Some(branch) if branch.extended => Unit::BRANCH,
                Some(_) => Unit::BR_COMPACT,
                None => unit,
            };
        }
    }

    /// Release the dependents of a scheduled instruction
    pub(crate) fn retire(&mut self, index: Option<usize>) {
        let Some(index) = index.filter(|&i| i < self.graph.len()) else {
            return;
        };

        for ready in self.graph.release(index) {
            self.worklist.insert(ready);
        }
        self.scheduled += 1;
    }

    /// Append a synthesized instruction
    pub(crate) fn synthesize(&mut self, ins: Instruction) -> usize {
        self.instructions.push(ins);
        self.instructions.len() - 1
    }

    /// Kind of the next bundle, without taking anything
    fn choose_bundle(&self) -> Option<BundleKind> {
        self.choose(&Predicate::any(), None)
            .map(|choice| self.instructions[choice.index].kind())
    }

    fn schedule_texture(&mut self) -> PendingBundle {
        let mut pred = Predicate::of_kind(BundleKind::Texture);
        let ins = self.choose_instruction(&mut pred, None);
        self.retire(ins);

        PendingBundle::memory(BundleKind::Texture, TAG_TEXTURE_4, ins.into_iter().collect())
    }

    fn schedule_ldst(&mut self) -> PendingBundle {
        let mut pred = Predicate::of_kind(BundleKind::LoadStore);

        // The pair runs concurrently, so neither may unlock the other
        let ins = self.choose_instruction(&mut pred, None);
        let pair = self.choose_instruction(&mut pred, None);

        self.retire(ins);
        self.retire(pair);

        PendingBundle::memory(
            BundleKind::LoadStore,
            TAG_LOAD_STORE_4,
            ins.into_iter().chain(pair).collect(),
        )
    }

    fn schedule_alu(&mut self) -> PendingBundle {
        let mut builder = BundleBuilder::new();
        let mut pred = Predicate::of_kind(BundleKind::Alu);
        let mut slots = AluSlots::default();

        self.choose_alu(&mut slots.branch, &mut pred, &mut builder, Unit::BR_COMPACT);
        self.retire(slots.branch);

        let writeout = slots
            .branch
            .is_some_and(|b| self.instructions[b].is_writeout());

        // vmul stays free for writeout completion
        pred.no_cond |= writeout;

        if let Some(branch) = slots.branch {
            if self.instructions[branch].is_conditional_branch() {
                self.place_condition(&mut slots, &mut pred, &mut builder, branch);
            }
        }

        self.choose_alu(&mut slots.smul, &mut pred, &mut builder, Unit::SMUL);

        if !writeout {
            self.choose_alu(&mut slots.vlut, &mut pred, &mut builder, Unit::VLUT);
        }

        self.choose_alu(&mut slots.vadd, &mut pred, &mut builder, Unit::VADD);

        self.retire(slots.vlut);
        self.retire(slots.vadd);
        self.retire(slots.smul);

        let csel = [slots.vadd, slots.smul]
            .into_iter()
            .flatten()
            .find(|&i| self.instructions[i].is_csel());

        if let Some(csel) = csel {
            self.place_condition(&mut slots, &mut pred, &mut builder, csel);
        }

        self.choose_alu(&mut slots.sadd, &mut pred, &mut builder, Unit::SADD);

        if writeout {
            self.complete_writeout(&mut slots, &pred, &mut builder);
        }

        self.choose_alu(&mut slots.vmul, &mut pred, &mut builder, Unit::VMUL);

        self.retire(slots.vmul);
        self.retire(slots.sadd);

        self.pack_alu(&slots, &builder)
    }

    fn place_condition(
        &mut self,
        slots: &mut AluSlots,
        pred: &mut Predicate,
        builder: &mut BundleBuilder,
        consumer: usize,
    ) {
        let Some((cond, unit)) = self.schedule_condition(pred, builder, consumer) else {
            tracing::error!("Conditional at {} has no condition to pipeline", consumer);
            return;
        };

        if !slots.place(cond, unit) {
            tracing::error!("Condition for {} has no free {} slot", consumer, unit.name());
        }
    }

    /// Make sure every component of the writeout source is written in this
    /// bundle, borrowing vmul or synthesizing a move when needed
    fn complete_writeout(
        &mut self,
        slots: &mut AluSlots,
        pred: &Predicate,
        builder: &mut BundleBuilder,
    ) {
        let Some(branch) = slots.branch else {
            return;
        };

        let explicit = self.instructions[branch].src[1];
        let src = explicit.unwrap_or(ValueId::WRITEOUT);
        let stages = [slots.sadd, slots.vadd, slots.smul];

        let mut mask = 0u16;
        let mut bad = false;

        for i in stages.into_iter().flatten() {
            let ins = &self.instructions[i];
            if ins.dest != Some(src) {
                continue;
            }

            mask |= ins.mask;
            bad |= ins.has_arg(src);
        }

        if !bad && mask != WRITEOUT_MASK {
            let mut peek = Predicate {
                unit: Some(Unit::VMUL),
                dest: Some(src),
                mask: mask ^ WRITEOUT_MASK,
                ..pred.clone()
            };

            if let Some(index) = self.choose_instruction(&mut peek, Some(builder)) {
                self.instructions[index].unit = Unit::VMUL;
                slots.vmul = Some(index);
                mask |= peek.mask;
            }
        }

        if !bad && mask == WRITEOUT_MASK {
            return;
        }

        let temp = match explicit {
            Some(_) => self.ctx.make_temp(),
            None => ValueId::WRITEOUT,
        };

        tracing::trace!(
            "Completing writeout of {} into {} with mask 0x{:x}",
            src,
            temp,
            WRITEOUT_MASK ^ mask
        );

        if mask != WRITEOUT_MASK {
            let mov = Instruction::mov(src, IDENTITY_SWIZZLE, temp)
                .with_mask(WRITEOUT_MASK ^ mask)
                .with_unit(Unit::VMUL);
            slots.vmul = Some(self.synthesize(mov));
        }

        for i in stages.into_iter().flatten() {
            self.instructions[i].rewrite_dest(src, temp);
        }
        self.instructions[branch].rewrite_src(src, temp);
    }

    fn pack_alu(&self, slots: &AluSlots, builder: &BundleBuilder) -> PendingBundle {
        let mut bytes = CONTROL_BYTES;
        let mut control = 0u32;
        let mut members = Vec::with_capacity(6);

        for i in slots.stages().into_iter().flatten() {
            let ins = &self.instructions[i];
            debug_assert!(
                !Unit::from_bits_retain(control).intersects(ins.unit),
                "two instructions on {}",
                ins.unit.name()
            );

            control |= ins.unit.bits();
            bytes += instruction_bytes(ins);
            members.push(i);
        }

        let padding = match bytes % 16 {
            0 => 0,
            rem => 16 - rem,
        };
        bytes += padding;

        if builder.constant_count() > 0 {
            bytes += 16;
        }

        let tag = TAG_ALU_4 + (bytes / 16) as u8 - 1;

        PendingBundle {
            kind: BundleKind::Alu,
            tag,
            control: control | tag as u32,
            members,
            constants: builder
                .has_embedded_constants()
                .then(|| builder.constants()),
            blend_constant: builder.has_blend_constant(),
            padding,
        }
    }

    /// Schedule the whole block, returning its bundles in program order
    pub fn schedule(mut self) -> Vec<Bundle> {
        let mut pending = Vec::new();
        let mut quadwords = 0u32;
        let mut blend_offset = None;

        while let Some(kind) = self.choose_bundle() {
            let bundle = match kind {
                BundleKind::Texture => self.schedule_texture(),
                BundleKind::LoadStore => self.schedule_ldst(),
                BundleKind::Alu => self.schedule_alu(),
            };

            if bundle.members.is_empty() {
                tracing::error!(
                    "No {:?} instruction could be packed with {} ready",
                    kind,
                    self.worklist.len()
                );
                break;
            }

            tracing::trace!(
                "Bundle {:?} tag 0x{:x} with {} instructions",
                bundle.kind,
                bundle.tag,
                bundle.members.len()
            );

            if bundle.blend_constant {
                blend_offset = Some(quadwords);
            }

            quadwords += quadword_size(bundle.tag);
            pending.push(bundle);
        }

        if self.scheduled < self.block_len() {
            tracing::error!(
                "{} of {} instructions left unscheduled",
                self.block_len() - self.scheduled,
                self.block_len()
            );
        }

        if let Some(offset) = blend_offset {
            self.ctx.blend_constant_offset =
                Some((self.ctx.quadword_count + quadwords - offset - 1) * 16);
        }
        self.ctx.quadword_count += quadwords;

        let mut instructions: Vec<Option<Instruction>> =
            self.instructions.into_iter().map(Some).collect();

        pending
            .into_iter()
            .rev()
            .map(|bundle| bundle.materialize(&mut instructions))
            .collect()
    }
}
