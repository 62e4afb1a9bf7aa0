//! Textual dumps of programs and bundles

use std::fmt;

use crate::bundle::Bundle;
use crate::ir::{Block, BundleKind, InstrFlags, Instruction, Program};
use crate::pipeline::{ScheduledBlock, ScheduledProgram};

const COMPONENTS: &[u8; 16] = b"xyzwefghijklmnop";

fn write_mask(f: &mut fmt::Formatter<'_>, mask: u16) -> fmt::Result {
    for (c, name) in COMPONENTS.iter().enumerate() {
        if mask & (1 << c) != 0 {
            write!(f, "{}", *name as char)?;
        }
    }
    Ok(())
}

fn write_swizzle(f: &mut fmt::Formatter<'_>, swizzle: &[u8; 16], mask: u16) -> fmt::Result {
    let identity = (0..16).all(|c| mask & (1 << c) == 0 || swizzle[c] as usize == c);
    if identity {
        return Ok(());
    }

    write!(f, ".")?;
    for (c, &lane) in swizzle.iter().enumerate() {
        if mask & (1 << c) != 0 {
            write!(f, "{}", COMPONENTS[(lane & 0xF) as usize] as char)?;
        }
    }
    Ok(())
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\t")?;
        if self.kind() == BundleKind::Alu && !self.unit.is_empty() {
            write!(f, "{}.", self.unit.name())?;
        } else if self.is_branch() {
            write!(f, "br.")?;
        }
        write!(f, "{}", self.name())?;

        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            let text = if first { " " } else { ", " };
            first = false;
            write!(f, "{}", text)
        };

        if let Some(dest) = self.dest {
            sep(f)?;
            write!(f, "{}.", dest)?;
            write_mask(f, self.mask)?;
        }

        for (s, src) in self.src.iter().enumerate() {
            let Some(src) = src else {
                continue;
            };
            sep(f)?;
            write!(f, "{}", src)?;
            write_swizzle(f, &self.swizzle[s], self.mask)?;
        }

        if let Some(constants) = self.constants {
            write!(
                f,
                " <{:#x}, {:#x}, {:#x}, {:#x}>",
                constants[0], constants[1], constants[2], constants[3]
            )?;
        }

        if self.blend_constant {
            write!(f, " <blend>")?;
        }

        if self.flags.contains(InstrFlags::NO_SPILL) {
            write!(f, " /* no spill */")?;
        }

        Ok(())
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            BundleKind::Alu => "alu",
            BundleKind::LoadStore => "ldst",
            BundleKind::Texture => "tex",
        };
        writeln!(f, "{} (tag {:#x}, {} qw) {{", kind, self.tag, self.quadword_size())?;

        for ins in &self.instructions {
            writeln!(f, "{}", ins)?;
        }

        if let Some(constants) = self.constants {
            writeln!(
                f,
                "\tconstants {:#x}, {:#x}, {:#x}, {:#x}",
                constants[0], constants[1], constants[2], constants[3]
            )?;
        }

        if self.blend_constant {
            writeln!(f, "\tblend constant")?;
        }

        writeln!(f, "}}")
    }
}

fn write_successors(f: &mut fmt::Formatter<'_>, successors: &[u32]) -> fmt::Result {
    if successors.is_empty() {
        return Ok(());
    }

    write!(f, " ->")?;
    for s in successors {
        write!(f, " block{}", s)?;
    }
    Ok(())
}

impl fmt::Display for ScheduledBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block{} ({} qw): {{", self.id, self.quadword_count)?;
        for bundle in &self.bundles {
            write!(f, "{}", bundle)?;
        }
        write!(f, "}}")?;
        write_successors(f, &self.successors)?;
        writeln!(f)
    }
}

impl fmt::Display for ScheduledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        if let Some(offset) = self.blend_constant_offset {
            writeln!(f, "blend constant at byte {}", offset)?;
        }
        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block{}: {{", self.id)?;
        for ins in &self.instructions {
            writeln!(f, "{}", ins)?;
        }
        write!(f, "}}")?;
        write_successors(f, &self.successors)?;
        writeln!(f)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        Ok(())
    }
}
