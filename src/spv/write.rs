//! Low-level emission of SPIR-V binary form.

use crate::spv::{self, spec};
use std::{iter, slice};

struct OperandEmitter<'a> {
    /// Input operands of an instruction.
    operands: iter::Copied<slice::Iter<'a, spv::Operand>>,

    /// Output SPIR-V words.
    out: &'a mut Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperandEmitError {
    /// Ran out of operands while emitting an instruction's operands.
    #[error("truncated instruction (expected {0:?})")]
    NotEnoughOperands(spec::OperandKind),

    /// Extra operands were left over, after emitting an instruction's operands.
    #[error("overlong instruction")]
    TooManyOperands,

    /// An immediate where an ID was expected (or vice versa).
    #[error("expected {expected:?}, found {found:?}")]
    KindMismatch { expected: spec::OperandKind, found: spv::Operand },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("in {inst_name}: result type ID (`IdResultType`) mismatch")]
    ResultTypeMismatch { inst_name: &'static str },

    #[error("in {inst_name}: result ID (`IdResult`) mismatch")]
    ResultMismatch { inst_name: &'static str },

    #[error("in {inst_name}: word count of SPIR-V instruction doesn't fit in 16 bits")]
    TooLong { inst_name: &'static str },

    #[error("in {inst_name}: {reason}")]
    Operands { inst_name: &'static str, reason: OperandEmitError },
}

impl OperandEmitter<'_> {
    fn is_exhausted(&self) -> bool {
        self.operands.len() == 0
    }

    fn imm_word(&mut self, kind: spec::OperandKind) -> Result<u32, OperandEmitError> {
        use OperandEmitError as Error;

        match self.operands.next().ok_or(Error::NotEnoughOperands(kind))? {
            spv::Operand::Imm(
                spv::Imm::Short(found_kind, word) | spv::Imm::LongStart(found_kind, word),
            ) if found_kind == kind =>
            {
                Ok(word)
            }
            found => Err(Error::KindMismatch { expected: kind, found }),
        }
    }

    fn operand(&mut self, kind: spec::OperandKind) -> Result<(), OperandEmitError> {
        use OperandEmitError as Error;

        match kind.def() {
            spec::OperandKindDef::BitEnum { params } => {
                let word = self.imm_word(kind)?;
                self.out.push(word);
                for param_kind in spec::enumerant_params(params, true, word) {
                    self.operand(param_kind)?;
                }
            }
            spec::OperandKindDef::ValueEnum { params } => {
                let word = self.imm_word(kind)?;
                self.out.push(word);
                for param_kind in spec::enumerant_params(params, false, word) {
                    self.operand(param_kind)?;
                }
            }
            spec::OperandKindDef::Id => match self.operands.next() {
                Some(spv::Operand::Id(id)) => self.out.push(id.get()),
                Some(found) => return Err(Error::KindMismatch { expected: kind, found }),
                None => return Err(Error::NotEnoughOperands(kind)),
            },
            spec::OperandKindDef::Literal { .. } => {
                let word = self.imm_word(kind)?;
                self.out.push(word);
                while let Some(spv::Operand::Imm(spv::Imm::LongCont(cont_kind, word))) =
                    self.operands.clone().next()
                {
                    if cont_kind != kind {
                        break;
                    }
                    self.operands.next();
                    self.out.push(word);
                }

                // HACK this isn't cleanly uniform because it's an odd special case.
                if kind == spec::OperandKind::LiteralSpecConstantOpInteger {
                    let inner_def = u16::try_from(word)
                        .ok()
                        .and_then(spec::Opcode::try_from_u16_with_name_and_def)
                        .map(|(_, _, def)| def);
                    match inner_def {
                        Some(inner_def) => self.operands(inner_def)?,
                        None => self.opaque_rest(),
                    }
                }
            }
        }

        Ok(())
    }

    fn operands(&mut self, def: &spec::InstructionDef) -> Result<(), OperandEmitError> {
        for (mode, kind) in def.all_operands() {
            if mode == spec::OperandMode::Optional && self.is_exhausted() {
                break;
            }
            self.operand(kind)?;
        }
        Ok(())
    }

    fn opaque_rest(&mut self) {
        for operand in &mut self.operands {
            self.out.push(operand.word());
        }
    }

    fn inst_operands(mut self, def: Option<&spec::InstructionDef>) -> Result<(), OperandEmitError> {
        match def {
            Some(def) => self.operands(def)?,
            None => self.opaque_rest(),
        }

        // The instruction must consume all of its operands.
        if !self.is_exhausted() {
            return Err(OperandEmitError::TooManyOperands);
        }

        Ok(())
    }
}

pub struct ModuleEmitter {
    /// Output SPIR-V words.
    pub words: Vec<u32>,
}

impl ModuleEmitter {
    pub fn with_header(header: &spv::Header) -> Self {
        Self {
            words: vec![
                spec::Spec::get().magic,
                header.version_word(),
                header.generator,
                header.bound,
                0,
            ],
        }
    }

    /// Set the ID bound in the header (known only once emission is finished).
    pub fn set_bound(&mut self, bound: u32) {
        self.words[3] = bound;
    }

    pub fn push_inst(&mut self, inst: &spv::Inst) -> Result<(), EmitError> {
        let (inst_name, def) = match inst.opcode.name_and_def() {
            Some((name, def)) => (name, Some(def)),
            None => ("OpUnknown", None),
        };

        if let Some(def) = def {
            if inst.result_type_id.is_some() != def.has_result_type_id {
                return Err(EmitError::ResultTypeMismatch { inst_name });
            }
            if inst.result_id.is_some() != def.has_result_id {
                return Err(EmitError::ResultMismatch { inst_name });
            }
        }

        let total_word_count = inst.word_count();

        self.words.reserve(total_word_count);
        let start = self.words.len();

        let word_count =
            u16::try_from(total_word_count).map_err(|_| EmitError::TooLong { inst_name })?;
        let opcode = u32::from(inst.opcode.as_u16()) | u32::from(word_count) << 16;
        self.words.extend(
            iter::once(opcode)
                .chain(inst.result_type_id.map(|id| id.get()))
                .chain(inst.result_id.map(|id| id.get())),
        );

        let emitter =
            OperandEmitter { operands: inst.operands.iter().copied(), out: &mut self.words };
        let result = emitter.inst_operands(def);
        if let Err(reason) = result {
            self.words.truncate(start);
            return Err(EmitError::Operands { inst_name, reason });
        }

        // If no error was produced so far, `OperandEmitter` should've pushed
        // the exact number of words.
        debug_assert_eq!(self.words.len(), start + total_word_count);

        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        bytemuck::cast_slice::<u32, u8>(&self.words).to_vec()
    }
}
