//! Bundles and the embedded constant pool
//!
//! An ALU bundle carries at most one 16-byte constant pool shared by all its
//! instructions, or the blend constant in its place. Feasibility is checked
//! with [`BundleBuilder::can_accept`] while searching candidates and applied
//! with [`BundleBuilder::commit`] once an instruction is chosen.

use serde::{Deserialize, Serialize};

use crate::ir::{BundleKind, Instruction, RegMode, Unit, ValueId};

/// Texture bundle tag
pub const TAG_TEXTURE_4: u8 = 0x3;
/// Load/store bundle tag
pub const TAG_LOAD_STORE_4: u8 = 0x5;
/// One-quadword ALU bundle tag; larger ALU bundles count up to 0xB
pub const TAG_ALU_4: u8 = 0x8;

/// Bytes of the bundle control word
pub const CONTROL_BYTES: u32 = 4;

/// Quadwords occupied by a bundle with `tag`
pub fn quadword_size(tag: u8) -> u32 {
    match tag {
        TAG_ALU_4..=0xB => (tag - TAG_ALU_4) as u32 + 1,
        _ => 1,
    }
}

/// Encoded bytes an ALU-bundle member adds
pub fn instruction_bytes(ins: &Instruction) -> u32 {
    if ins.unit.intersects(Unit::ANY_VECTOR) {
        // register word + vector ALU word
        2 + 6
    } else if ins.unit == Unit::BRANCH {
        6
    } else if ins.is_branch() {
        2
    } else {
        // register word + scalar ALU word
        2 + 4
    }
}

/// How an instruction's constants land in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstantPlan {
    Nothing,
    Blend,
    Wholesale([u32; 4]),
    Packed {
        pool: [u32; 4],
        count: usize,
        indices: [u8; 4],
    },
}

/// Constant pool of the ALU bundle under construction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleBuilder {
    constants: [u32; 4],
    /// Bytes of the pool in use
    constant_count: usize,
    blend_constant: bool,
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn plan(&self, ins: &Instruction) -> Option<ConstantPlan> {
        if ins.blend_constant {
            return (self.constant_count == 0).then_some(ConstantPlan::Blend);
        }

        let Some(constants) = ins.constants else {
            return Some(ConstantPlan::Nothing);
        };

        if self.blend_constant {
            return None;
        }

        if ins.reg_mode != RegMode::Bits32 {
            if self.constant_count > 0 {
                return None;
            }

            let pool = match ins.reg_mode {
                RegMode::Bits16 => {
                    let mut halves = [0u16; 8];
                    for (half, constant) in halves.iter_mut().zip(constants) {
                        *half = constant as u16;
                    }
                    bytemuck::cast(halves)
                }
                _ => constants,
            };

            return Some(ConstantPlan::Wholesale(pool));
        }

        let read = ins.read_components(ValueId::CONSTANT) & 0xF;
        let mut pool = self.constants;
        let mut count = self.constant_count.div_ceil(4);
        let mut indices = [0u8; 4];

        for c in (0..4).filter(|c| read & (1 << c) != 0) {
            let wanted = constants[c];

            match pool[..count].iter().position(|&k| k == wanted) {
                Some(slot) => indices[c] = slot as u8,
                None if count < 4 => {
                    pool[count] = wanted;
                    indices[c] = count as u8;
                    count += 1;
                }
                None => return None,
            }
        }

        Some(ConstantPlan::Packed {
            pool,
            count,
            indices,
        })
    }

    /// Whether `ins` fits the pool as it stands
    pub fn can_accept(&self, ins: &Instruction) -> bool {
        self.plan(ins).is_some()
    }

    /// Claim pool space for `ins`, pointing its constant swizzles at the
    /// shared slots. Returns false and leaves both untouched if it does not fit.
    pub fn commit(&mut self, ins: &mut Instruction) -> bool {
        let Some(plan) = self.plan(ins) else {
            return false;
        };

        match plan {
            ConstantPlan::Nothing => {}
            ConstantPlan::Blend => {
                self.blend_constant = true;
                self.constant_count = 16;
            }
            ConstantPlan::Wholesale(pool) => {
                self.constants = pool;
                self.constant_count = 16;
            }
            ConstantPlan::Packed {
                pool,
                count,
                indices,
            } => {
                self.constants = pool;
                self.constant_count = count * 4;

                for s in 0..3 {
                    if ins.src[s] != Some(ValueId::CONSTANT) {
                        continue;
                    }
                    for lane in ins.swizzle[s].iter_mut() {
                        *lane = indices[(*lane & 3) as usize];
                    }
                }

                ins.constants = Some(self.constants);
            }
        }

        true
    }

    /// Pool bytes in use
    pub fn constant_count(&self) -> usize {
        self.constant_count
    }

    pub fn has_embedded_constants(&self) -> bool {
        self.constant_count > 0 && !self.blend_constant
    }

    pub fn has_blend_constant(&self) -> bool {
        self.blend_constant
    }

    pub fn constants(&self) -> [u32; 4] {
        self.constants
    }
}

/// Scheduled bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub kind: BundleKind,
    pub tag: u8,
    /// Enabled units ORed with the tag
    pub control: u32,
    /// Members in issue order
    pub instructions: Vec<Instruction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constants: Option<[u32; 4]>,
    #[serde(default)]
    pub blend_constant: bool,
    /// Bytes of padding to the quadword boundary
    #[serde(default)]
    pub padding: u32,
}

impl Bundle {
    pub fn quadword_size(&self) -> u32 {
        quadword_size(self.tag)
    }

    /// Units occupied by the members
    pub fn units(&self) -> Unit {
        self.instructions
            .iter()
            .fold(Unit::empty(), |acc, ins| acc | ins.unit)
    }

    pub fn has_writeout(&self) -> bool {
        self.instructions.iter().any(Instruction::is_writeout)
    }

    /// Member occupying `unit`
    pub fn on_unit(&self, unit: Unit) -> Option<&Instruction> {
        self.instructions.iter().find(|ins| ins.unit == unit)
    }
}
