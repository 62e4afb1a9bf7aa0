//! Scheduler IR
//!
//! Instructions arrive already selected and numbered. A value id is either a
//! dense temporary or a fixed physical register; only temporaries take part in
//! hazard tracking and register allocation.

use bitflags::bitflags;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use ms_core::ScheduleError;

/// Bytes in one full-width register (vec4 of 32-bit lanes)
pub const BYTE_COUNT: usize = 16;

/// First value id used for fixed physical registers
pub const FIXED_MINIMUM: u32 = 0x0100_0000;

/// Component mask of a full vec4 writeout
pub const WRITEOUT_MASK: u16 = 0xF;

/// Component of the condition register read by scalar conditionals
pub const COMPONENT_W: u8 = 3;

/// Identity swizzle for every lane
pub const IDENTITY_SWIZZLE: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

//=============================================================================
// VALUE IDS
//=============================================================================

/// SSA-like value: a temporary or a fixed register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ValueRepr", into = "ValueRepr")]
pub struct ValueId(pub u32);

impl ValueId {
    /// Writeout source when a branch names none
    pub const WRITEOUT: ValueId = ValueId::fixed(0);
    /// Embedded constants are read through this register
    pub const CONSTANT: ValueId = ValueId::fixed(26);
    /// Conditional pipeline register
    pub const CONDITION: ValueId = ValueId::fixed(31);

    pub const fn fixed(reg: u32) -> Self {
        Self(FIXED_MINIMUM + reg)
    }

    pub const fn is_fixed(self) -> bool {
        self.0 >= FIXED_MINIMUM
    }

    pub fn fixed_register(self) -> Option<u32> {
        self.is_fixed().then(|| self.0 - FIXED_MINIMUM)
    }

    /// Temporary index, `None` for fixed registers
    pub fn temp(self) -> Option<usize> {
        (!self.is_fixed()).then_some(self.0 as usize)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fixed_register() {
            // r16..r23 double as uniform registers
            Some(reg) if reg > 16 && reg < 24 => write!(f, "u{}", 23 - reg),
            Some(reg) => write!(f, "r{}", reg),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Serialized form: temporaries are integers, registers are "rN"
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ValueRepr {
    Temp(u32),
    Reg(String),
}

impl TryFrom<ValueRepr> for ValueId {
    type Error = String;

    fn try_from(repr: ValueRepr) -> Result<Self, Self::Error> {
        match repr {
            ValueRepr::Temp(t) if t < FIXED_MINIMUM => Ok(ValueId(t)),
            ValueRepr::Temp(t) => Err(format!("temporary {} collides with fixed registers", t)),
            ValueRepr::Reg(name) => name
                .strip_prefix('r')
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|&n| n < 32)
                .map(ValueId::fixed)
                .ok_or_else(|| format!("invalid register name '{}'", name)),
        }
    }
}

impl From<ValueId> for ValueRepr {
    fn from(value: ValueId) -> Self {
        match value.fixed_register() {
            Some(reg) => ValueRepr::Reg(format!("r{}", reg)),
            None => ValueRepr::Temp(value.0),
        }
    }
}

//=============================================================================
// UNITS AND MODES
//=============================================================================

bitflags! {
    /// ALU issue slots; values match the bundle control word enables
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Unit: u32 {
        const VMUL = 1 << 17;
        const SADD = 1 << 19;
        const VADD = 1 << 21;
        const SMUL = 1 << 23;
        const VLUT = 1 << 25;
        const BR_COMPACT = 1 << 26;
        const BRANCH = 1 << 27;

        const MUL = Self::VMUL.bits() | Self::SMUL.bits();
        const ADD = Self::VADD.bits() | Self::SADD.bits();
        const MOST = Self::MUL.bits() | Self::ADD.bits();
        const ALL = Self::MOST.bits() | Self::VLUT.bits();
        const SCALAR = Self::SADD.bits() | Self::SMUL.bits();
        const ANY_VECTOR = Self::VMUL.bits() | Self::VADD.bits() | Self::VLUT.bits();
        const CSEL = Self::VADD.bits() | Self::SMUL.bits();
    }
}

/// Single slots in issue order with their mnemonics
pub const SLOTS: [(Unit, &str); 7] = [
    (Unit::VMUL, "vmul"),
    (Unit::SADD, "sadd"),
    (Unit::VADD, "vadd"),
    (Unit::SMUL, "smul"),
    (Unit::VLUT, "lut"),
    (Unit::BR_COMPACT, "br"),
    (Unit::BRANCH, "brx"),
];

impl Unit {
    /// Short name of a single slot
    pub fn name(self) -> &'static str {
        SLOTS
            .iter()
            .find(|(unit, _)| *unit == self)
            .map_or("???", |(_, name)| name)
    }
}

/// Lane width of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegMode {
    Bits8,
    Bits16,
    #[default]
    Bits32,
    Bits64,
}

impl RegMode {
    pub fn bytes_per_component(self) -> usize {
        match self {
            RegMode::Bits8 => 1,
            RegMode::Bits16 => 2,
            RegMode::Bits32 => 4,
            RegMode::Bits64 => 8,
        }
    }

    pub fn component_count(self) -> usize {
        BYTE_COUNT / self.bytes_per_component()
    }

    /// Mask with every component of this mode set
    pub fn full_mask(self) -> u16 {
        ((1u32 << self.component_count()) - 1) as u16
    }
}

/// Expand a component mask to a byte mask
pub fn bytemask(mask: u16, mode: RegMode) -> u16 {
    let size = mode.bytes_per_component();
    let per_component = ((1u32 << size) - 1) as u16;

    (0..mode.component_count())
        .filter(|c| mask & (1 << c) != 0)
        .fold(0, |acc, c| acc | (per_component << (c * size)))
}

/// Collapse a byte mask to the components it touches
pub fn from_bytemask(bytemask: u16, mode: RegMode) -> u16 {
    let size = mode.bytes_per_component();
    let per_component = ((1u32 << size) - 1) as u16;

    (0..mode.component_count())
        .filter(|c| bytemask & (per_component << (c * size)) != 0)
        .fold(0, |acc, c| acc | (1 << c))
}

//=============================================================================
// OPCODES
//=============================================================================

/// ALU opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AluOp {
    Fadd,
    Fmul,
    Fmin,
    Fmax,
    Fmov,
    Imov,
    Iadd,
    Isub,
    Imul,
    Iand,
    Ior,
    Ixor,
    Ishl,
    Feq,
    Fne,
    Flt,
    Fle,
    Ieq,
    Ine,
    Ilt,
    Ile,
    Fcsel,
    FcselV,
    Icsel,
    IcselV,
    Frcp,
    Frsqrt,
    Fsqrt,
    Fexp2,
    Flog2,
    Fsin,
    Fcos,
    Fdot3,
    Fdot4,
    FballEq,
    FbanyNe,
    IballEq,
    IbanyNe,
}

/// Static properties of an ALU opcode
#[derive(Debug, Clone, Copy)]
pub struct AluOpProps {
    pub name: &'static str,
    /// Units able to execute the opcode
    pub units: Unit,
    /// Non-zero for ops reading a fixed number of channels regardless of mask
    pub channel_count: u8,
}

impl AluOp {
    pub fn props(self) -> AluOpProps {
        let (name, units, channel_count) = match self {
            AluOp::Fadd => ("fadd", Unit::ADD, 0),
            AluOp::Fmul => ("fmul", Unit::MUL, 0),
            AluOp::Fmin => ("fmin", Unit::MOST, 0),
            AluOp::Fmax => ("fmax", Unit::MOST, 0),
            AluOp::Fmov => ("fmov", Unit::ALL, 0),
            AluOp::Imov => ("imov", Unit::ALL, 0),
            AluOp::Iadd => ("iadd", Unit::ADD, 0),
            AluOp::Isub => ("isub", Unit::ADD, 0),
            AluOp::Imul => ("imul", Unit::MUL, 0),
            AluOp::Iand => ("iand", Unit::MOST, 0),
            AluOp::Ior => ("ior", Unit::MOST, 0),
            AluOp::Ixor => ("ixor", Unit::MOST, 0),
            AluOp::Ishl => ("ishl", Unit::ADD, 0),
            AluOp::Feq => ("feq", Unit::MOST, 0),
            AluOp::Fne => ("fne", Unit::MOST, 0),
            AluOp::Flt => ("flt", Unit::MOST, 0),
            AluOp::Fle => ("fle", Unit::MOST, 0),
            AluOp::Ieq => ("ieq", Unit::MOST, 0),
            AluOp::Ine => ("ine", Unit::MOST, 0),
            AluOp::Ilt => ("ilt", Unit::MOST, 0),
            AluOp::Ile => ("ile", Unit::MOST, 0),
            AluOp::Fcsel => ("fcsel", Unit::CSEL, 0),
            AluOp::FcselV => ("fcsel_v", Unit::CSEL, 0),
            AluOp::Icsel => ("icsel", Unit::CSEL, 0),
            AluOp::IcselV => ("icsel_v", Unit::CSEL, 0),
            AluOp::Frcp => ("frcp", Unit::VLUT, 0),
            AluOp::Frsqrt => ("frsqrt", Unit::VLUT, 0),
            AluOp::Fsqrt => ("fsqrt", Unit::VLUT, 0),
            AluOp::Fexp2 => ("fexp2", Unit::VLUT, 0),
            AluOp::Flog2 => ("flog2", Unit::VLUT, 0),
            AluOp::Fsin => ("fsin", Unit::VLUT, 0),
            AluOp::Fcos => ("fcos", Unit::VLUT, 0),
            AluOp::Fdot3 => ("fdot3", Unit::VMUL, 3),
            AluOp::Fdot4 => ("fdot4", Unit::VMUL, 4),
            AluOp::FballEq => ("fball_eq", Unit::VMUL.union(Unit::VADD), 4),
            AluOp::FbanyNe => ("fbany_neq", Unit::VMUL.union(Unit::VADD), 4),
            AluOp::IballEq => ("iball_eq", Unit::VMUL.union(Unit::VADD), 4),
            AluOp::IbanyNe => ("ibany_neq", Unit::VMUL.union(Unit::VADD), 4),
        };

        AluOpProps {
            name,
            units,
            channel_count,
        }
    }

    pub fn is_csel(self) -> bool {
        matches!(
            self,
            AluOp::Fcsel | AluOp::FcselV | AluOp::Icsel | AluOp::IcselV
        )
    }

    /// Vector csel selects per component on a full condition vector
    pub fn is_csel_v(self) -> bool {
        matches!(self, AluOp::FcselV | AluOp::IcselV)
    }

    /// Move used for synthesized copies
    pub fn is_mov(self) -> bool {
        matches!(self, AluOp::Fmov | AluOp::Imov)
    }
}

/// Load/store opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStoreOp {
    LoadAttribute,
    LoadVarying,
    StoreVarying,
    LoadUniform,
    LoadGlobal,
    StoreGlobal,
    /// Fill from thread-local scratch memory
    LoadScratch { slot: u32 },
    /// Spill to thread-local scratch memory
    StoreScratch { slot: u32 },
}

impl LoadStoreOp {
    pub fn name(self) -> &'static str {
        match self {
            LoadStoreOp::LoadAttribute => "ld_attr",
            LoadStoreOp::LoadVarying => "ld_vary",
            LoadStoreOp::StoreVarying => "st_vary",
            LoadStoreOp::LoadUniform => "ld_uniform",
            LoadStoreOp::LoadGlobal => "ld_global",
            LoadStoreOp::StoreGlobal => "st_global",
            LoadStoreOp::LoadScratch { .. } => "ld_int4",
            LoadStoreOp::StoreScratch { .. } => "st_int4",
        }
    }

    /// Scratch slot and whether the access writes it
    pub fn scratch_access(self) -> Option<(u32, bool)> {
        match self {
            LoadStoreOp::LoadScratch { slot } => Some((slot, false)),
            LoadStoreOp::StoreScratch { slot } => Some((slot, true)),
            _ => None,
        }
    }
}

/// Texture opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureOp {
    Sample,
    SampleLod,
    SampleGrad,
    Fetch,
}

impl TextureOp {
    pub fn name(self) -> &'static str {
        match self {
            TextureOp::Sample => "texture",
            TextureOp::SampleLod => "texture_lod",
            TextureOp::SampleGrad => "texture_grad",
            TextureOp::Fetch => "texel_fetch",
        }
    }
}

/// Branch descriptor. `src[0]` carries the condition, `src[1]` the writeout source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Branch {
    pub target: Option<u32>,
    pub conditional: bool,
    pub invert: bool,
    pub writeout: bool,
    /// Uses the 48-bit extended encoding
    pub extended: bool,
    /// Condition already folded into the encoding
    pub prepacked: bool,
}

/// Operation class of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Alu(AluOp),
    LoadStore(LoadStoreOp),
    Texture(TextureOp),
    Branch(Branch),
}

/// Kind of bundle an instruction is scheduled into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleKind {
    Alu,
    LoadStore,
    Texture,
}

bitflags! {
    /// Scheduling annotations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct InstrFlags: u8 {
        /// Spill/fill plumbing; its values must never be spilled again
        const NO_SPILL = 1 << 0;
        /// Inserted by the current spill round, skipped when rewriting uses
        const HINT = 1 << 1;
        /// Writes the conditional pipeline register
        const PIPELINED = 1 << 2;
    }
}

//=============================================================================
// INSTRUCTIONS
//=============================================================================

fn full_swizzles() -> [[u8; 16]; 3] {
    [IDENTITY_SWIZZLE; 3]
}

fn default_mask() -> u16 {
    0xF
}

/// Up to three sources; `null` or `"_"` leaves a slot empty
fn deserialize_sources<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<[Option<ValueId>; 3], D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Slot {
        Value(ValueId),
        Blank(Option<String>),
    }

    let slots = Vec::<Slot>::deserialize(deserializer)?;
    if slots.len() > 3 {
        return Err(D::Error::invalid_length(slots.len(), &"at most 3 sources"));
    }

    let mut src = [None; 3];
    for (i, slot) in slots.into_iter().enumerate() {
        src[i] = match slot {
            Slot::Value(value) => Some(value),
            Slot::Blank(None) => None,
            Slot::Blank(Some(blank)) if blank == "_" => None,
            Slot::Blank(Some(other)) => {
                return Err(D::Error::custom(format!("invalid source '{}'", other)))
            }
        };
    }

    Ok(src)
}

/// A single operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    #[serde(default)]
    pub dest: Option<ValueId>,
    #[serde(default, deserialize_with = "deserialize_sources")]
    pub src: [Option<ValueId>; 3],
    /// Per source: component read for each destination component
    #[serde(default = "full_swizzles")]
    pub swizzle: [[u8; 16]; 3],
    #[serde(default = "default_mask")]
    pub mask: u16,
    #[serde(default)]
    pub reg_mode: RegMode,
    /// Assigned slot; non-empty on input pins the instruction to it
    #[serde(default, skip_serializing_if = "Unit::is_empty")]
    pub unit: Unit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constants: Option<[u32; 4]>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blend_constant: bool,
    #[serde(default, skip_serializing_if = "InstrFlags::is_empty")]
    pub flags: InstrFlags,
}

impl Instruction {
    fn with_op(op: Op) -> Self {
        Self {
            op,
            dest: None,
            src: [None; 3],
            swizzle: full_swizzles(),
            mask: default_mask(),
            reg_mode: RegMode::default(),
            unit: Unit::empty(),
            constants: None,
            blend_constant: false,
            flags: InstrFlags::empty(),
        }
    }

    /// ALU instruction writing a full vec4
    pub fn alu(op: AluOp, dest: ValueId, src: [Option<ValueId>; 3]) -> Self {
        Self {
            dest: Some(dest),
            src,
            ..Self::with_op(Op::Alu(op))
        }
    }

    pub fn load_store(op: LoadStoreOp, dest: Option<ValueId>, src: [Option<ValueId>; 3]) -> Self {
        Self {
            dest,
            src,
            ..Self::with_op(Op::LoadStore(op))
        }
    }

    pub fn texture(op: TextureOp, dest: ValueId, coords: ValueId) -> Self {
        Self {
            dest: Some(dest),
            src: [Some(coords), None, None],
            ..Self::with_op(Op::Texture(op))
        }
    }

    pub fn branch(branch: Branch, condition: Option<ValueId>, writeout: Option<ValueId>) -> Self {
        Self {
            src: [condition, writeout, None],
            mask: 0,
            ..Self::with_op(Op::Branch(branch))
        }
    }

    /// Register copy `dest = src.swizzle`
    pub fn mov(src: ValueId, swizzle: [u8; 16], dest: ValueId) -> Self {
        let mut ins = Self::alu(AluOp::Imov, dest, [None, Some(src), None]);
        ins.swizzle[1] = swizzle;
        ins
    }

    /// Scratch store of `value` or scratch load into `value`, 128 bits per slot
    pub fn scratch(value: ValueId, slot: u32, is_store: bool, mask: u16) -> Self {
        let mut ins = if is_store {
            Self::load_store(LoadStoreOp::StoreScratch { slot }, None, [Some(value), None, None])
        } else {
            Self::load_store(LoadStoreOp::LoadScratch { slot }, Some(value), [None; 3])
        };
        ins.mask = mask;
        ins.flags = InstrFlags::NO_SPILL;
        ins
    }

    pub fn with_mask(mut self, mask: u16) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_constants(mut self, constants: [u32; 4]) -> Self {
        self.constants = Some(constants);
        self
    }

    pub fn with_swizzle(mut self, src: usize, swizzle: [u8; 16]) -> Self {
        self.swizzle[src] = swizzle;
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_reg_mode(mut self, mode: RegMode) -> Self {
        self.reg_mode = mode;
        self
    }

    pub fn kind(&self) -> BundleKind {
        match self.op {
            Op::Alu(_) | Op::Branch(_) => BundleKind::Alu,
            Op::LoadStore(_) => BundleKind::LoadStore,
            Op::Texture(_) => BundleKind::Texture,
        }
    }

    pub fn alu_op(&self) -> Option<AluOp> {
        match self.op {
            Op::Alu(op) => Some(op),
            _ => None,
        }
    }

    pub fn branch_info(&self) -> Option<Branch> {
        match self.op {
            Op::Branch(branch) => Some(branch),
            _ => None,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.op, Op::Branch(_))
    }

    pub fn is_csel(&self) -> bool {
        self.alu_op().is_some_and(AluOp::is_csel)
    }

    pub fn is_writeout(&self) -> bool {
        self.branch_info().is_some_and(|b| b.writeout)
    }

    /// Branch that needs its condition in r31 within its bundle
    pub fn is_conditional_branch(&self) -> bool {
        self.branch_info()
            .is_some_and(|b| b.conditional && !b.prepacked)
    }

    /// Consumes a condition from the pipeline register
    pub fn is_conditional(&self) -> bool {
        self.is_csel() || self.is_conditional_branch()
    }

    /// Source slot holding the condition of a conditional
    pub fn condition_index(&self) -> Option<usize> {
        if self.is_conditional_branch() {
            Some(0)
        } else if self.is_csel() {
            Some(2)
        } else {
            None
        }
    }

    /// Source slot holding the writeout value
    pub fn writeout_index(&self) -> Option<usize> {
        self.is_writeout().then_some(1)
    }

    /// Units this instruction may issue on
    pub fn issue_units(&self) -> Unit {
        match self.op {
            Op::Alu(op) if self.unit.is_empty() => op.props().units,
            Op::Alu(op) => op.props().units & self.unit,
            _ => Unit::empty(),
        }
    }

    /// Whether the op can run on a scalar unit
    pub fn is_scalar(&self) -> bool {
        self.mask.count_ones() == 1 && matches!(self.reg_mode, RegMode::Bits16 | RegMode::Bits32)
    }

    /// Bytes of the destination written
    pub fn bytemask(&self) -> u16 {
        bytemask(self.mask, self.reg_mode)
    }

    /// Component mask driving source reads
    fn read_mask(&self, src: usize) -> u16 {
        match self.op {
            Op::Branch(_) if src == 0 => 0x1,
            Op::Branch(_) => WRITEOUT_MASK,
            Op::Alu(op) if op.props().channel_count > 0 && src < 2 => {
                (1 << op.props().channel_count) - 1
            }
            _ => self.mask,
        }
    }

    /// Components of `value` read by this instruction
    pub fn read_components(&self, value: ValueId) -> u16 {
        let mut components = 0u16;

        for (s, src) in self.src.iter().enumerate() {
            if *src != Some(value) {
                continue;
            }

            let mask = self.read_mask(s);
            for c in 0..16 {
                if mask & (1 << c) != 0 {
                    components |= 1 << (self.swizzle[s][c] & 0xF);
                }
            }
        }

        components
    }

    /// Bytes of `value` read by this instruction
    pub fn read_bytemask(&self, value: ValueId) -> u16 {
        bytemask(self.read_components(value), self.reg_mode)
    }

    pub fn has_arg(&self, value: ValueId) -> bool {
        self.src.iter().any(|s| *s == Some(value))
    }

    /// Source values, skipping empty slots
    pub fn sources(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.src.iter().flatten().copied()
    }

    pub fn rewrite_src(&mut self, old: ValueId, new: ValueId) {
        for src in self.src.iter_mut() {
            if *src == Some(old) {
                *src = Some(new);
            }
        }
    }

    pub fn rewrite_dest(&mut self, old: ValueId, new: ValueId) {
        if self.dest == Some(old) {
            self.dest = Some(new);
        }
    }

    pub fn name(&self) -> &'static str {
        match self.op {
            Op::Alu(op) => op.props().name,
            Op::LoadStore(op) => op.name(),
            Op::Texture(op) => op.name(),
            Op::Branch(b) if b.writeout => "write",
            Op::Branch(b) if b.conditional => "cond",
            Op::Branch(_) => "always",
        }
    }
}

//=============================================================================
// BLOCKS AND PROGRAMS
//=============================================================================

/// Basic block of unscheduled instructions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: u32,
    #[serde(default)]
    pub successors: Vec<u32>,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn new(id: u32, instructions: Vec<Instruction>) -> Self {
        Self {
            id,
            successors: Vec::new(),
            instructions,
        }
    }
}

/// Shader program as handed over by instruction selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub blocks: Vec<Block>,
}

impl Program {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    pub fn instructions_mut(&mut self) -> impl Iterator<Item = &mut Instruction> {
        self.blocks.iter_mut().flat_map(|b| b.instructions.iter_mut())
    }

    /// Check the invariants instruction selection must uphold
    pub fn validate(&self) -> Result<(), ScheduleError> {
        for block in &self.blocks {
            let last = block.instructions.len().saturating_sub(1);

            for (index, ins) in block.instructions.iter().enumerate() {
                Self::validate_instruction(block.id, index, last, ins)?;
            }
        }

        Ok(())
    }

    fn validate_instruction(
        block: u32,
        index: usize,
        last: usize,
        ins: &Instruction,
    ) -> Result<(), ScheduleError> {
        if ins.is_branch() && index != last {
            return Err(ScheduleError::MisplacedBranch { block, index });
        }

        if let Some(cond) = ins.condition_index() {
            if ins.src[cond].is_none() {
                return Err(ScheduleError::MissingCondition { block, index });
            }
        }

        if ins.mask & !ins.reg_mode.full_mask() != 0 {
            return Err(ScheduleError::InvalidMask {
                block,
                index,
                mask: ins.mask,
            });
        }

        let components = ins.reg_mode.component_count();
        for (s, swizzle) in ins.swizzle.iter().enumerate() {
            if ins.src[s].is_none() {
                continue;
            }
            // Lanes past the mode's component count are never read
            let lanes = &swizzle[..components];
            if let Some(&component) = lanes.iter().find(|&&c| c as usize >= components) {
                return Err(ScheduleError::InvalidSwizzle {
                    block,
                    index,
                    component,
                });
            }
        }

        if let Some(op) = ins.alu_op() {
            let units = op.props().units;
            let pinned_illegal = !ins.unit.is_empty()
                && (!units.contains(ins.unit)
                    || ins.unit.bits().count_ones() != 1
                    || (Unit::SCALAR.contains(ins.unit) && !ins.is_scalar()));

            if pinned_illegal {
                return Err(ScheduleError::IllegalUnit {
                    block,
                    index,
                    unit: format!("{:?}", ins.unit),
                });
            }
        }

        if ins.blend_constant && ins.constants.is_some() {
            return Err(ScheduleError::BlendWithConstants { block, index });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_registers() {
        assert!(ValueId::CONDITION.is_fixed());
        assert_eq!(ValueId::CONDITION.fixed_register(), Some(31));
        assert_eq!(ValueId(5).temp(), Some(5));
        assert_eq!(ValueId::CONSTANT.temp(), None);
        assert_eq!(format!("{}", ValueId::fixed(0)), "r0");
        assert_eq!(format!("{}", ValueId::fixed(20)), "u3");
        assert_eq!(format!("{}", ValueId(12)), "12");
    }

    #[test]
    fn test_value_serde() {
        let json = serde_json::to_string(&[ValueId(3), ValueId::CONDITION]).unwrap();
        assert_eq!(json, r#"[3,"r31"]"#);

        let parsed: Vec<ValueId> = serde_json::from_str(r#"[7, "r26"]"#).unwrap();
        assert_eq!(parsed, vec![ValueId(7), ValueId::CONSTANT]);

        assert!(serde_json::from_str::<ValueId>(r#""x3""#).is_err());
    }

    #[test]
    fn test_bytemask_modes() {
        assert_eq!(bytemask(0b0001, RegMode::Bits32), 0x000F);
        assert_eq!(bytemask(0b1010, RegMode::Bits32), 0xF0F0);
        assert_eq!(bytemask(0b0000_0011, RegMode::Bits16), 0x000F);
        assert_eq!(bytemask(0b10, RegMode::Bits64), 0xFF00);
        assert_eq!(from_bytemask(0x00F0, RegMode::Bits32), 0b0010);
        assert_eq!(from_bytemask(0x0030, RegMode::Bits32), 0b0010);
    }

    #[test]
    fn test_read_components_follow_swizzle() {
        let mut swizzle = IDENTITY_SWIZZLE;
        swizzle[0] = 2;
        let ins = Instruction::alu(AluOp::Fadd, ValueId(3), [Some(ValueId(1)), None, None])
            .with_mask(0b0001)
            .with_swizzle(0, swizzle);

        assert_eq!(ins.read_components(ValueId(1)), 0b0100);
        assert_eq!(ins.read_bytemask(ValueId(1)), 0x0F00);
        assert_eq!(ins.read_components(ValueId(2)), 0);
    }

    #[test]
    fn test_dot_product_reads_channel_count() {
        let ins = Instruction::alu(AluOp::Fdot3, ValueId(3), [Some(ValueId(1)), Some(ValueId(2)), None])
            .with_mask(0b0001);
        assert_eq!(ins.read_components(ValueId(1)), 0b0111);
    }

    #[test]
    fn test_conditionals() {
        let csel = Instruction::alu(
            AluOp::Fcsel,
            ValueId(4),
            [Some(ValueId(1)), Some(ValueId(2)), Some(ValueId(3))],
        );
        assert!(csel.is_conditional());
        assert_eq!(csel.condition_index(), Some(2));

        let br = Instruction::branch(
            Branch {
                conditional: true,
                ..Default::default()
            },
            Some(ValueId(1)),
            None,
        );
        assert!(br.is_conditional());
        assert_eq!(br.condition_index(), Some(0));

        let packed = Instruction::branch(
            Branch {
                conditional: true,
                prepacked: true,
                ..Default::default()
            },
            Some(ValueId(1)),
            None,
        );
        assert!(!packed.is_conditional());
    }

    #[test]
    fn test_validate_rejects_misplaced_branch() {
        let block = Block::new(
            0,
            vec![
                Instruction::branch(Branch::default(), None, None),
                Instruction::alu(AluOp::Fmov, ValueId(0), [None, Some(ValueId(1)), None]),
            ],
        );
        let program = Program::new(vec![block]);
        assert_eq!(
            program.validate(),
            Err(ScheduleError::MisplacedBranch { block: 0, index: 0 })
        );
    }

    #[test]
    fn test_validate_rejects_vector_on_scalar_unit() {
        let ins = Instruction::alu(AluOp::Fadd, ValueId(2), [Some(ValueId(0)), Some(ValueId(1)), None])
            .with_unit(Unit::SADD);
        let program = Program::new(vec![Block::new(0, vec![ins])]);
        assert!(matches!(
            program.validate(),
            Err(ScheduleError::IllegalUnit { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_wide_mask() {
        let ins = Instruction::alu(AluOp::Fadd, ValueId(2), [Some(ValueId(0)), None, None])
            .with_mask(0x1F);
        let program = Program::new(vec![Block::new(0, vec![ins])]);
        assert!(matches!(
            program.validate(),
            Err(ScheduleError::InvalidMask { mask: 0x1F, .. })
        ));
    }

    #[test]
    fn test_validate_accepts_every_constant_lane() {
        let ins = Instruction::alu(
            AluOp::Fadd,
            ValueId(2),
            [Some(ValueId(0)), Some(ValueId::CONSTANT), None],
        )
        .with_reg_mode(RegMode::Bits16)
        .with_mask(0xFF)
        .with_constants([1, 2, 3, 4]);

        let program = Program::new(vec![Block::new(0, vec![ins])]);
        assert_eq!(program.validate(), Ok(()));
    }

    #[test]
    fn test_validate_swizzle_range() {
        let ins = Instruction::alu(AluOp::Fadd, ValueId(2), [Some(ValueId(0)), None, None]);
        let program = Program::new(vec![Block::new(0, vec![ins.clone()])]);
        assert_eq!(program.validate(), Ok(()));

        let mut swizzle = IDENTITY_SWIZZLE;
        swizzle[1] = 5;
        let program = Program::new(vec![Block::new(0, vec![ins.with_swizzle(0, swizzle)])]);
        assert!(matches!(
            program.validate(),
            Err(ScheduleError::InvalidSwizzle { component: 5, .. })
        ));
    }

    #[test]
    fn test_instruction_json() {
        let json = r#"{
            "op": { "alu": "fadd" },
            "dest": 2,
            "src": [0, "r26", null],
            "mask": 1,
            "constants": [1065353216, 0, 0, 0]
        }"#;
        let ins: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(ins.alu_op(), Some(AluOp::Fadd));
        assert_eq!(ins.src[1], Some(ValueId::CONSTANT));
        assert_eq!(ins.swizzle[0], IDENTITY_SWIZZLE);
        assert!(ins.unit.is_empty());
        assert!(ins.is_scalar());
    }

    #[test]
    fn test_instruction_toml_sources() {
        let toml_src = r#"
            op = { alu = "imov" }
            dest = 4
            src = ["_", 2]
        "#;
        let ins: Instruction = toml::from_str(toml_src).unwrap();
        assert_eq!(ins.src, [None, Some(ValueId(2)), None]);
        assert!(ins.alu_op().is_some_and(AluOp::is_mov));

        let bad = r#"
            op = { alu = "fadd" }
            dest = 4
            src = [1, "r99"]
        "#;
        assert!(toml::from_str::<Instruction>(bad).is_err());
    }
}
