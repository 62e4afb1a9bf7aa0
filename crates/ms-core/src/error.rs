//! Error types for the midsched scheduler

use thiserror::Error;

/// Main error type for the scheduler and its driver
#[derive(Error, Debug)]
pub enum MidschedError {
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Errors raised while validating or scheduling a shader program
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("block {block}: instruction {index} cannot issue on unit {unit}")]
    IllegalUnit {
        block: u32,
        index: usize,
        unit: String,
    },

    #[error("block {block}: branch at {index} is not the last instruction")]
    MisplacedBranch { block: u32, index: usize },

    #[error("block {block}: conditional at {index} has no condition source")]
    MissingCondition { block: u32, index: usize },

    #[error("block {block}: instruction {index} mask 0x{mask:04x} exceeds its register mode")]
    InvalidMask { block: u32, index: usize, mask: u16 },

    #[error("block {block}: instruction {index} mixes blend constant with inline constants")]
    BlendWithConstants { block: u32, index: usize },

    #[error("block {block}: swizzle at instruction {index} selects component {component}")]
    InvalidSwizzle {
        block: u32,
        index: usize,
        component: u8,
    },

    #[error("Gave up allocating registers after {0} spill iterations")]
    SpillNonConvergence(u32),

    #[error("Register allocation failed with no spillable value left")]
    NoSpillCandidate,
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, MidschedError>;
