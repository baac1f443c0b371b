//! Disassembly-style printing of single instructions (for diagnostics).

use crate::spv::{self, spec};
use std::fmt;

impl fmt::Display for spv::Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = self.result_id {
            write!(f, "%{id} = ")?;
        }
        write!(f, "{:?}", self.opcode)?;
        if let Some(id) = self.result_type_id {
            write!(f, " %{id}")?;
        }

        let mut operands = self.operands.iter().copied().peekable();
        while let Some(operand) = operands.next() {
            let first = match operand {
                spv::Operand::Id(id) => {
                    write!(f, " %{id}")?;
                    continue;
                }
                spv::Operand::Imm(imm) => imm,
            };

            let mut imms = vec![first];
            if let spv::Imm::LongStart(..) = first {
                while let Some(&spv::Operand::Imm(cont @ spv::Imm::LongCont(..))) =
                    operands.peek()
                {
                    imms.push(cont);
                    operands.next();
                }
            }

            if first.kind() == spec::OperandKind::LiteralString {
                let s = spv::extract_literal_string(&imms).unwrap_or_default();
                write!(f, " {s:?}")?;
            } else {
                // Multi-word numbers are little-endian word sequences.
                let value =
                    imms.iter().rev().fold(0u128, |acc, imm| (acc << 32) | u128::from(imm.word()));
                write!(f, " {value}")?;
            }
        }

        Ok(())
    }
}
