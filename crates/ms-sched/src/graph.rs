//! Dependency graph construction
//!
//! Hazards are tracked per byte of each value so partial writes and reads of
//! disjoint components do not serialize. The graph points from later
//! instructions to earlier ones: a block is scheduled from its end, so an
//! instruction becomes ready once every later instruction that conflicts with
//! it has been placed.

use smallvec::SmallVec;
use std::collections::BTreeSet;

use crate::ir::{Instruction, Op, ValueId, BYTE_COUNT};

/// Most recent accesses of one byte seen during the reverse walk
#[derive(Debug, Clone, Default)]
struct ByteAccess {
    write: Option<usize>,
    reads: SmallVec<[usize; 2]>,
}

/// Hazard edges of one block
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependents: Vec<BTreeSet<usize>>,
    pending: Vec<u32>,
}

/// Access table indexed by `(node, byte)`
struct AccessTable {
    entries: Vec<ByteAccess>,
}

impl AccessTable {
    fn new(node_count: usize) -> Self {
        Self {
            entries: vec![ByteAccess::default(); node_count * BYTE_COUNT],
        }
    }

    fn bytes(mask: u16) -> impl Iterator<Item = usize> {
        (0..BYTE_COUNT).filter(move |b| mask & (1 << b) != 0)
    }

    fn entry(&mut self, node: usize, byte: usize) -> &mut ByteAccess {
        &mut self.entries[node * BYTE_COUNT + byte]
    }
}

/// Node accessed by an instruction and the bytes involved
struct Access {
    node: usize,
    mask: u16,
}

impl DependencyGraph {
    /// Build the graph for one block
    ///
    /// `temp_count` bounds the temporaries tracked; fixed registers other
    /// than r31 never create hazards. Scratch slots become extra nodes after
    /// the temporaries.
    pub fn build(instructions: &[Instruction], temp_count: usize) -> Self {
        let count = instructions.len();
        let mut graph = Self {
            dependents: vec![BTreeSet::new(); count],
            pending: vec![0; count],
        };

        if count == 0 {
            return graph;
        }

        let slot_count = instructions
            .iter()
            .filter_map(|ins| match ins.op {
                Op::LoadStore(op) => op.scratch_access().map(|(slot, _)| slot as usize + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        let mut table = AccessTable::new(temp_count + slot_count);

        // r31 only lives within a bundle, so each reader pairs with the
        // nearest writer before it
        let mut condition_reader = None;

        for i in (0..count).rev() {
            let ins = &instructions[i];

            if ins.dest == Some(ValueId::CONDITION) {
                if let Some(reader) = condition_reader.take() {
                    graph.add_edge(reader, i);
                }
            }
            if ins.has_arg(ValueId::CONDITION) {
                condition_reader = Some(i);
            }

            if ins.is_branch() {
                continue;
            }

            let (reads, write) = Self::accesses(ins, temp_count);

            for read in &reads {
                for byte in AccessTable::bytes(read.mask) {
                    if let Some(writer) = table.entry(read.node, byte).write {
                        graph.add_edge(writer, i);
                    }
                }
            }

            if let Some(write) = &write {
                for byte in AccessTable::bytes(write.mask) {
                    let entry = table.entry(write.node, byte);
                    let readers = std::mem::take(&mut entry.reads);
                    let writer = entry.write.replace(i);

                    for reader in readers {
                        graph.add_edge(reader, i);
                    }
                    if let Some(writer) = writer {
                        graph.add_edge(writer, i);
                    }
                }
            }

            for read in &reads {
                for byte in AccessTable::bytes(read.mask) {
                    let entry = table.entry(read.node, byte);
                    if !entry.reads.contains(&i) {
                        entry.reads.push(i);
                    }
                }
            }
        }

        // Control transfer has to be the final action of the block
        if instructions[count - 1].is_branch() {
            for i in 0..count - 1 {
                graph.add_edge(count - 1, i);
            }
        }

        graph
    }

    /// Tracked reads and write of one instruction
    fn accesses(ins: &Instruction, temp_count: usize) -> (SmallVec<[Access; 3]>, Option<Access>) {
        let mut reads: SmallVec<[Access; 3]> = SmallVec::new();

        for value in ins.sources() {
            let Some(node) = value.temp().filter(|&t| t < temp_count) else {
                continue;
            };
            if reads.iter().any(|r| r.node == node) {
                continue;
            }
            reads.push(Access {
                node,
                mask: ins.read_bytemask(value),
            });
        }

        let mut write = ins
            .dest
            .and_then(|d| d.temp())
            .filter(|&t| t < temp_count)
            .map(|node| Access {
                node,
                mask: ins.bytemask(),
            });

        if let Op::LoadStore(op) = ins.op {
            if let Some((slot, is_store)) = op.scratch_access() {
                let access = Access {
                    node: temp_count + slot as usize,
                    mask: 0xFFFF,
                };

                if is_store {
                    write = Some(access);
                } else {
                    reads.push(access);
                }
            }
        }

        (reads, write)
    }

    fn add_edge(&mut self, parent: usize, child: usize) {
        if parent != child && self.dependents[parent].insert(child) {
            self.pending[child] += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Instructions waiting on `index`
    pub fn dependents(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.dependents[index].iter().copied()
    }

    pub fn has_edge(&self, parent: usize, child: usize) -> bool {
        self.dependents
            .get(parent)
            .is_some_and(|d| d.contains(&child))
    }

    /// Unsatisfied dependencies of `index`
    pub fn dependency_count(&self, index: usize) -> u32 {
        self.pending[index]
    }

    /// Instructions ready before anything is scheduled
    pub fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, &n)| n == 0)
            .map(|(i, _)| i)
    }

    /// Mark `done` as scheduled, returning the instructions it made ready
    pub fn release(&mut self, done: usize) -> Vec<usize> {
        debug_assert_eq!(self.pending[done], 0, "released an instruction that was not ready");

        let dependents = std::mem::take(&mut self.dependents[done]);
        let mut ready = Vec::new();

        for child in dependents {
            debug_assert!(self.pending[child] > 0);
            self.pending[child] -= 1;

            if self.pending[child] == 0 {
                ready.push(child);
            }
        }

        ready
    }
}
