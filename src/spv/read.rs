//! Low-level parsing of SPIR-V binary form.

use crate::spv::{self, spec};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::{iter, slice};

/// Defining instruction of an ID.
///
/// Used currently only to help parsing `LiteralContextDependentNumber`.
enum KnownIdDef {
    TypeIntOrFloat(u32),
    Uncategorized { opcode: spec::Opcode, result_type_id: Option<spv::Id> },
}

impl KnownIdDef {
    fn result_type_id(&self) -> Option<spv::Id> {
        match *self {
            Self::TypeIntOrFloat(_) => None,
            Self::Uncategorized { result_type_id, .. } => result_type_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed SPIR-V (not a multiple of 4 bytes)")]
    NotWordAligned,

    #[error("malformed SPIR-V (truncated header)")]
    TruncatedHeader,

    #[error("malformed SPIR-V (incorrect magic number 0x{0:08x})")]
    BadMagic(u32),

    #[error("malformed SPIR-V (invalid version word 0x{0:08x})")]
    BadVersion(u32),

    #[error("malformed SPIR-V (at word {word_offset}, in {opcode_name}: {reason})")]
    Inst { word_offset: usize, opcode_name: String, reason: InstParseError },

    #[error("malformed SPIR-V ({0})")]
    Structure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstParseError {
    /// Ran out of words while parsing an instruction's operands.
    #[error("truncated instruction")]
    NotEnoughWords,

    /// Extra words were left over, after parsing an instruction's operands.
    #[error("overlong instruction")]
    TooManyWords,

    /// An instruction word count of `0` (which would never advance).
    #[error("word count of 0")]
    ZeroWordCount,

    /// An illegal ID of `0`.
    #[error("ID %0 is illegal")]
    IdZero,

    /// An `IdResultType` ID referring to an ID not already defined.
    #[error("ID %{0} used as result type before definition")]
    UnknownResultTypeId(spv::Id),

    /// The type of a `LiteralContextDependentNumber` could not be determined.
    #[error("missing type for literal")]
    MissingContextSensitiveLiteralType,

    /// The type of a `LiteralContextDependentNumber` was not a supported type
    /// (one of either `OpTypeInt` or `OpTypeFloat`).
    #[error("{} is not a supported literal type", .type_opcode.name())]
    UnsupportedContextSensitiveLiteralType { type_opcode: spec::Opcode },

    /// An `OpTypeInt`/`OpTypeFloat` with a width of `0`.
    #[error("width cannot be 0")]
    ZeroWidth,

    /// The same ID defined by more than one instruction.
    #[error("ID %{0} is a result of multiple instructions")]
    DuplicateResultId(spv::Id),
}

struct InstParser<'a> {
    wk: &'static spec::WellKnown,

    /// IDs defined so far in the module.
    known_ids: &'a FxHashMap<spv::Id, KnownIdDef>,

    /// Input words of an instruction.
    words: iter::Copied<slice::Iter<'a, u32>>,

    /// Output instruction, being parsed.
    inst: spv::Inst,
}

impl InstParser<'_> {
    fn is_exhausted(&self) -> bool {
        self.words.len() == 0
    }

    fn push_imm(&mut self, imm: spv::Imm) {
        self.inst.operands.push(spv::Operand::Imm(imm));
    }

    fn operand(&mut self, kind: spec::OperandKind) -> Result<(), InstParseError> {
        use InstParseError as Error;

        let word = self.words.next().ok_or(Error::NotEnoughWords)?;
        match kind.def() {
            spec::OperandKindDef::BitEnum { params } => {
                self.push_imm(spv::Imm::Short(kind, word));
                for param_kind in spec::enumerant_params(params, true, word) {
                    self.operand(param_kind)?;
                }
            }

            spec::OperandKindDef::ValueEnum { params } => {
                self.push_imm(spv::Imm::Short(kind, word));
                for param_kind in spec::enumerant_params(params, false, word) {
                    self.operand(param_kind)?;
                }
            }

            spec::OperandKindDef::Id => {
                let id = spv::Id::new(word).ok_or(Error::IdZero)?;
                self.inst.operands.push(spv::Operand::Id(id));
            }

            spec::OperandKindDef::Literal { size: spec::LiteralSize::Word } => {
                self.push_imm(spv::Imm::Short(kind, word));
            }
            spec::OperandKindDef::Literal { size: spec::LiteralSize::NulTerminated } => {
                let has_nul = |word: u32| word.to_le_bytes().contains(&0);
                if has_nul(word) {
                    self.push_imm(spv::Imm::Short(kind, word));
                } else {
                    self.push_imm(spv::Imm::LongStart(kind, word));
                    while let Some(word) = self.words.next() {
                        self.push_imm(spv::Imm::LongCont(kind, word));
                        if has_nul(word) {
                            break;
                        }
                    }
                }
            }
            spec::OperandKindDef::Literal { size: spec::LiteralSize::FromContextualType } => {
                let contextual_type = self
                    .inst
                    .result_type_id
                    .or_else(|| {
                        // `OpSwitch` takes its literal type from the first operand.
                        let id = self.inst.nth_id(0)?;
                        self.known_ids.get(&id)?.result_type_id()
                    })
                    .and_then(|id| self.known_ids.get(&id))
                    .ok_or(Error::MissingContextSensitiveLiteralType)?;

                let word_count = match *contextual_type {
                    KnownIdDef::TypeIntOrFloat(width) => width / 32 + u32::from(width % 32 != 0),
                    KnownIdDef::Uncategorized { opcode, .. } => {
                        return Err(Error::UnsupportedContextSensitiveLiteralType {
                            type_opcode: opcode,
                        });
                    }
                };

                if word_count <= 1 {
                    self.push_imm(spv::Imm::Short(kind, word));
                } else {
                    self.push_imm(spv::Imm::LongStart(kind, word));
                    for _ in 1..word_count {
                        let word = self.words.next().ok_or(Error::NotEnoughWords)?;
                        self.push_imm(spv::Imm::LongCont(kind, word));
                    }
                }
            }
        }

        // HACK this isn't cleanly uniform because it's an odd special case.
        if kind == spec::OperandKind::LiteralSpecConstantOpInteger {
            // Inner opcodes outside the known subset keep their operands opaque.
            let inner_def = u16::try_from(word)
                .ok()
                .and_then(spec::Opcode::try_from_u16_with_name_and_def)
                .map(|(_, _, def)| def);
            match inner_def {
                Some(inner_def) => self.operands(inner_def)?,
                None => self.opaque_rest(),
            }
        }

        Ok(())
    }

    fn operands(&mut self, def: &spec::InstructionDef) -> Result<(), InstParseError> {
        for (mode, kind) in def.all_operands() {
            if mode == spec::OperandMode::Optional && self.is_exhausted() {
                break;
            }
            self.operand(kind)?;
        }
        Ok(())
    }

    /// Consume all remaining words as uninterpreted literals.
    fn opaque_rest(&mut self) {
        while let Some(word) = self.words.next() {
            self.push_imm(spv::Imm::Short(spec::OperandKind::LiteralInteger, word));
        }
    }

    fn inst(mut self, def: Option<&spec::InstructionDef>) -> Result<spv::Inst, InstParseError> {
        use InstParseError as Error;

        let Some(def) = def else {
            self.opaque_rest();
            return Ok(self.inst);
        };

        {
            let mut id = || {
                spv::Id::new(self.words.next().ok_or(Error::NotEnoughWords)?).ok_or(Error::IdZero)
            };
            self.inst.result_type_id = def.has_result_type_id.then(&mut id).transpose()?;
            self.inst.result_id = def.has_result_id.then(&mut id).transpose()?;
        }

        if let Some(type_id) = self.inst.result_type_id {
            if !self.known_ids.contains_key(&type_id) {
                // FIXME also check that the ID is a valid type.
                return Err(Error::UnknownResultTypeId(type_id));
            }
        }

        self.operands(def)?;

        // The instruction must consume its entire word count.
        if !self.is_exhausted() {
            return Err(Error::TooManyWords);
        }

        if [self.wk.OpTypeInt, self.wk.OpTypeFloat].contains(&self.inst.opcode)
            && self.inst.int_or_float_type_bit_width() == Some(0)
        {
            return Err(Error::ZeroWidth);
        }

        Ok(self.inst)
    }
}

pub struct ModuleParser {
    pub header: spv::Header,

    /// The entire module's words, normalized to native endianness.
    words: Vec<u32>,

    /// Next (instructions') word position in the module.
    next_word: usize,

    /// IDs defined so far in the module.
    known_ids: FxHashMap<spv::Id, KnownIdDef>,
}

impl ModuleParser {
    pub fn read_from_spv_bytes(spv_bytes: &[u8]) -> Result<Self, ParseError> {
        if spv_bytes.len() % 4 != 0 {
            return Err(ParseError::NotWordAligned);
        }
        // `spv_bytes` may not be aligned to `u32`, so decode each word explicitly.
        let words = spv_bytes
            .chunks_exact(4)
            .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Self::read_from_spv_words(words)
    }

    pub fn read_from_spv_words(mut words: Vec<u32>) -> Result<Self, ParseError> {
        let spv_spec = spec::Spec::get();

        if words.len() < spec::HEADER_LEN {
            return Err(ParseError::TruncatedHeader);
        }

        // Check the magic, and swap endianness of all words if we have to.
        {
            let magic = words[0];
            if magic == spv_spec.magic {
                // Nothing to do, all words already match native endianness.
            } else if magic.swap_bytes() == spv_spec.magic {
                for word in &mut words {
                    *word = word.swap_bytes();
                }
            } else {
                return Err(ParseError::BadMagic(magic));
            }
        }

        let version = words[1];
        let [version_reserved_hi, version_major, version_minor, version_reserved_lo] =
            version.to_be_bytes();
        if (version_reserved_lo, version_reserved_hi) != (0, 0) || version_major != 1 {
            return Err(ParseError::BadVersion(version));
        }

        let header = spv::Header {
            version_major,
            version_minor,
            generator: words[2],
            bound: words[3],
        };
        if words[4] != 0 {
            return Err(ParseError::Structure(format!("non-zero schema {}", words[4])));
        }

        Ok(Self { header, words, next_word: spec::HEADER_LEN, known_ids: FxHashMap::default() })
    }
}

impl Iterator for ModuleParser {
    type Item = Result<spv::Inst, ParseError>;
    fn next(&mut self) -> Option<Self::Item> {
        let word_offset = self.next_word;
        let words = &self.words[word_offset..];
        let &opcode_word = words.first()?;

        let (inst_len, opcode) = ((opcode_word >> 16) as usize, opcode_word as u16);

        let (opcode, def) = match spec::Opcode::try_from_u16_with_name_and_def(opcode) {
            Some((opcode, _, def)) => (opcode, Some(def)),
            None => (spec::Opcode::from_u16_unchecked(opcode), None),
        };

        let invalid = |reason| {
            ParseError::Inst { word_offset, opcode_name: format!("{opcode:?}"), reason }
        };

        // Iteration stops after the first error.
        if inst_len == 0 {
            self.next_word = self.words.len();
            return Some(Err(invalid(InstParseError::ZeroWordCount)));
        }
        if words.len() < inst_len {
            self.next_word = self.words.len();
            return Some(Err(invalid(InstParseError::NotEnoughWords)));
        }

        let parser = InstParser {
            wk: &spec::Spec::get().well_known,
            known_ids: &self.known_ids,
            words: words[1..inst_len].iter().copied(),
            inst: spv::Inst {
                opcode,
                result_type_id: None,
                result_id: None,
                operands: SmallVec::new(),
            },
        };

        let inst = match parser.inst(def) {
            Ok(inst) => inst,
            Err(e) => {
                self.next_word = self.words.len();
                return Some(Err(invalid(e)));
            }
        };

        if let Some(id) = inst.result_id {
            let known_id_def = match inst.int_or_float_type_bit_width() {
                Some(width) => KnownIdDef::TypeIntOrFloat(width),
                None => KnownIdDef::Uncategorized { opcode, result_type_id: inst.result_type_id },
            };

            if self.known_ids.insert(id, known_id_def).is_some() {
                self.next_word = self.words.len();
                return Some(Err(invalid(InstParseError::DuplicateResultId(id))));
            }
        }

        self.next_word += inst_len;

        Some(Ok(inst))
    }
}
