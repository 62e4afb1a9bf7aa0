//! Ready set and predicate-driven instruction choice

use std::collections::BTreeSet;

use crate::bundle::BundleBuilder;
use crate::ir::{BundleKind, Instruction, Unit, ValueId};

/// Constraints a chosen instruction must satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    /// Bundle kind, `None` for don't-care
    pub kind: Option<BundleKind>,
    /// ALU slot being filled
    pub unit: Option<Unit>,
    /// Skip instructions writing this value
    pub exclude: Option<ValueId>,
    /// A condition has already been placed in this bundle
    pub no_cond: bool,
    /// Components the candidate must write, together with `dest`
    pub mask: u16,
    pub dest: Option<ValueId>,
}

impl Predicate {
    /// Matches anything ready
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of_kind(kind: BundleKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }
}

/// Outcome of a successful choice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Choice {
    pub index: usize,
    /// The instruction consumes a condition
    pub conditional: bool,
}

/// Instructions whose dependencies are all scheduled
#[derive(Debug, Clone, Default)]
pub struct Worklist {
    ready: BTreeSet<usize>,
}

impl Worklist {
    pub fn new(roots: impl IntoIterator<Item = usize>) -> Self {
        Self {
            ready: roots.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, index: usize) -> bool {
        self.ready.insert(index)
    }

    pub fn remove(&mut self, index: usize) -> bool {
        self.ready.remove(&index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.ready.contains(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.ready.iter().copied()
    }

    /// Most recently readied instruction, the latest in program order
    pub fn max_active(&self) -> Option<usize> {
        self.ready.last().copied()
    }

    /// Find the latest ready instruction satisfying `pred`
    ///
    /// Only instructions within `window` of the latest ready one are
    /// considered. Constant feasibility is checked against `builder` for ALU
    /// picks. Nothing is modified.
    pub fn choose(
        &self,
        instructions: &[Instruction],
        pred: &Predicate,
        builder: Option<&BundleBuilder>,
        window: usize,
    ) -> Option<Choice> {
        let max_active = self.max_active()?;

        let alu = pred.kind == Some(BundleKind::Alu);
        let unit = pred.unit.unwrap_or(Unit::empty());
        let branch_slot = alu && unit.intersects(Unit::BR_COMPACT | Unit::BRANCH);
        let scalar = alu && unit.intersects(Unit::SCALAR);
        let needs_dest = pred.mask & 0xF != 0;

        let mut best: Option<Choice> = None;

        for i in self.iter() {
            if max_active - i >= window {
                continue;
            }

            let ins = &instructions[i];

            if pred.kind.is_some_and(|kind| ins.kind() != kind) {
                continue;
            }

            if pred.exclude.is_some() && ins.dest == pred.exclude {
                continue;
            }

            if alu && !branch_slot && !ins.issue_units().intersects(unit) {
                continue;
            }

            if branch_slot && !ins.is_branch() {
                continue;
            }

            if scalar && !ins.is_scalar() {
                continue;
            }

            if alu && !builder.map_or(true, |b| b.can_accept(ins)) {
                continue;
            }

            if needs_dest && ins.dest != pred.dest {
                continue;
            }

            if pred.mask & !ins.mask != 0 {
                continue;
            }

            let conditional = if branch_slot {
                ins.is_conditional_branch()
            } else {
                alu && ins.is_csel()
            };

            if conditional && pred.no_cond {
                continue;
            }

            best = Some(Choice {
                index: i,
                conditional,
            });
        }

        best
    }
}
