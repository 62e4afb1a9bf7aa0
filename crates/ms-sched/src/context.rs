//! Per-compilation scheduling state
//!
//! Everything the passes share lives in an explicit [`SchedulingContext`]
//! threaded through each call. Renumbering values into a dense range is a
//! pure function producing a fresh context and a translation table.

use std::collections::{BTreeSet, HashMap};

use crate::ir::{Program, ValueId};

/// Counters and layout totals for one compilation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulingContext {
    /// Temporaries are numbered `0..temp_count`
    pub temp_count: u32,
    use_counts: Vec<u32>,
    /// Quadwords emitted so far across scheduled blocks
    pub quadword_count: u32,
    /// Byte offset of the blend constant, if a bundle claimed it
    pub blend_constant_offset: Option<u32>,
    /// Condition values moved into r31 during scheduling
    pub pipelined: BTreeSet<ValueId>,
    /// 128-bit scratch slots handed out by the spiller
    pub spill_slots: u32,
    pub spills: u32,
    pub fills: u32,
}

impl SchedulingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a temporary that no existing instruction names
    pub fn make_temp(&mut self) -> ValueId {
        let temp = ValueId(self.temp_count);
        self.temp_count += 1;
        temp
    }

    /// Number of instructions reading `value`
    pub fn use_count(&self, value: ValueId) -> u32 {
        value
            .temp()
            .and_then(|t| self.use_counts.get(t))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_single_use(&self, value: ValueId) -> bool {
        self.use_count(value) == 1
    }

    /// Thread-local storage needed for spilled values, in bytes
    pub fn tls_size(&self) -> u32 {
        self.spill_slots * 16
    }

    /// Forget layout totals from a previous scheduling pass
    pub fn reset_layout(&mut self) {
        self.quadword_count = 0;
        self.blend_constant_offset = None;
        self.pipelined.clear();
    }
}

/// Translation from old value ids to squeezed ones
#[derive(Debug, Clone, Default)]
pub struct ValueRemap {
    map: HashMap<ValueId, ValueId>,
}

impl ValueRemap {
    /// New id for `value`; fixed registers and unknown ids map to themselves
    pub fn get(&self, value: ValueId) -> ValueId {
        self.map.get(&value).copied().unwrap_or(value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Rewrite every destination and source of `program`
    pub fn apply(&self, program: &mut Program) {
        for ins in program.instructions_mut() {
            ins.dest = ins.dest.map(|d| self.get(d));

            for src in ins.src.iter_mut() {
                *src = src.map(|s| self.get(s));
            }
        }
    }
}

/// Renumber the temporaries of `program` into `0..n` in order of first
/// appearance and recount their uses
///
/// Spill statistics carry over from `ctx`; layout totals start fresh.
pub fn squeeze(ctx: &SchedulingContext, program: &Program) -> (SchedulingContext, ValueRemap) {
    let mut remap = ValueRemap::default();
    let mut next = 0u32;

    let mut assign = |value: ValueId, remap: &mut ValueRemap| {
        if value.is_fixed() || remap.map.contains_key(&value) {
            return;
        }
        remap.map.insert(value, ValueId(next));
        next += 1;
    };

    for ins in program.instructions() {
        if let Some(dest) = ins.dest {
            assign(dest, &mut remap);
        }
        for src in ins.sources() {
            assign(src, &mut remap);
        }
    }

    let mut use_counts = vec![0u32; next as usize];
    for ins in program.instructions() {
        let mut seen: Vec<ValueId> = Vec::with_capacity(3);

        for src in ins.sources().map(|s| remap.get(s)) {
            if seen.contains(&src) {
                continue;
            }
            seen.push(src);

            if let Some(t) = src.temp() {
                use_counts[t] += 1;
            }
        }
    }

    tracing::trace!("Squeezed {} temporaries", next);

    let squeezed = SchedulingContext {
        temp_count: next,
        use_counts,
        quadword_count: 0,
        blend_constant_offset: None,
        pipelined: BTreeSet::new(),
        spill_slots: ctx.spill_slots,
        spills: ctx.spills,
        fills: ctx.fills,
    };

    (squeezed, remap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AluOp, Block, Instruction};

    fn sparse_program() -> Program {
        Program::new(vec![Block::new(
            0,
            vec![
                Instruction::alu(AluOp::Fmov, ValueId(40), [None, Some(ValueId(7)), None]),
                Instruction::alu(
                    AluOp::Fadd,
                    ValueId(90),
                    [Some(ValueId(40)), Some(ValueId(40)), Some(ValueId::CONSTANT)],
                ),
            ],
        )])
    }

    #[test]
    fn test_squeeze_is_dense() {
        let program = sparse_program();
        let (ctx, remap) = squeeze(&SchedulingContext::new(), &program);

        assert_eq!(ctx.temp_count, 3);
        assert_eq!(remap.get(ValueId(40)), ValueId(0));
        assert_eq!(remap.get(ValueId(7)), ValueId(1));
        assert_eq!(remap.get(ValueId(90)), ValueId(2));
        assert_eq!(remap.get(ValueId::CONSTANT), ValueId::CONSTANT);
    }

    #[test]
    fn test_squeeze_counts_uses_once_per_instruction() {
        let mut program = sparse_program();
        let (ctx, remap) = squeeze(&SchedulingContext::new(), &program);
        remap.apply(&mut program);

        assert_eq!(ctx.use_count(ValueId(0)), 1);
        assert!(ctx.is_single_use(ValueId(1)));
        assert_eq!(ctx.use_count(ValueId(2)), 0);
        assert_eq!(program.blocks[0].instructions[1].src[0], Some(ValueId(0)));
    }

    #[test]
    fn test_squeeze_keeps_spill_statistics() {
        let mut ctx = SchedulingContext::new();
        ctx.spill_slots = 2;
        ctx.spills = 3;
        ctx.quadword_count = 12;

        let (squeezed, _) = squeeze(&ctx, &sparse_program());
        assert_eq!(squeezed.spill_slots, 2);
        assert_eq!(squeezed.spills, 3);
        assert_eq!(squeezed.quadword_count, 0);
        assert_eq!(squeezed.tls_size(), 32);
    }

    #[test]
    fn test_make_temp_is_fresh() {
        let (mut ctx, _) = squeeze(&SchedulingContext::new(), &sparse_program());
        assert_eq!(ctx.make_temp(), ValueId(3));
        assert_eq!(ctx.make_temp(), ValueId(4));
        assert_eq!(ctx.temp_count, 5);
    }
}
