//! Midgard-style VLIW bundle scheduler
//!
//! This crate packs already-selected shader instructions into multi-issue
//! bundles:
//! - Byte-granular dependency graph per basic block
//! - Worklist scheduling with a bounded lookback window
//! - ALU, load/store and texture bundle packers
//! - Conditional scheduling through the r31 pipeline register
//! - Spill/fill loop driven by an external register allocator

pub mod bundle;
pub mod condition;
pub mod context;
pub mod graph;
pub mod ir;
pub mod packer;
pub mod pipeline;
pub mod print;
pub mod ra;
pub mod spill;
pub mod worklist;

pub use bundle::{Bundle, BundleBuilder};
pub use context::{squeeze, SchedulingContext, ValueRemap};
pub use graph::DependencyGraph;
pub use ir::{
    AluOp, Block, Branch, BundleKind, InstrFlags, Instruction, LoadStoreOp, Op, Program, RegMode,
    TextureOp, Unit, ValueId,
};
pub use packer::BlockScheduler;
pub use pipeline::{
    schedule_blocks, schedule_program, AllocationStatus, CompiledProgram, ScheduledBlock,
    ScheduledProgram, SpillStats,
};
pub use ra::{PressureAllocator, RegClass, RegisterAllocator};
pub use spill::{assign_spill_costs, spill_register};
pub use worklist::{Choice, Predicate, Worklist};
