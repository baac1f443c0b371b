//! SPIR-V support: the binary form ([`read`]/[`write`]), grouping into a
//! [`Module`](crate::Module) ([`lower`]/[`lift`]), and a minimal grammar ([`spec`]).

// NOTE all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod lift;
pub mod lower;
pub mod print;
pub mod read;
pub mod spec;
pub mod write;

use smallvec::SmallVec;
use std::iter;
use std::num::NonZeroU32;
use std::string::FromUtf8Error;

/// SPIR-V ID.
pub type Id = NonZeroU32;

/// Module header (the first [`spec::HEADER_LEN`] words, minus the magic).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version_major: u8,
    pub version_minor: u8,
    pub generator: u32,

    /// Upper bound (exclusive) of all IDs used in the module.
    pub bound: u32,
}

impl Header {
    pub fn version(&self) -> (u8, u8) {
        (self.version_major, self.version_minor)
    }

    pub fn version_word(&self) -> u32 {
        u32::from_be_bytes([0, self.version_major, self.version_minor, 0])
    }
}

/// SPIR-V immediate (one word, longer immediates are a sequence of multiple [`Imm`]s).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Imm {
    Short(spec::OperandKind, u32),
    LongStart(spec::OperandKind, u32),
    LongCont(spec::OperandKind, u32),
}

impl Imm {
    pub fn kind(self) -> spec::OperandKind {
        match self {
            Imm::Short(kind, _) | Imm::LongStart(kind, _) | Imm::LongCont(kind, _) => kind,
        }
    }

    pub fn word(self) -> u32 {
        match self {
            Imm::Short(_, word) | Imm::LongStart(_, word) | Imm::LongCont(_, word) => word,
        }
    }
}

/// One operand word of an [`Inst`], kept in the original operand order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operand {
    Imm(Imm),
    Id(Id),
}

impl Operand {
    pub fn id(self) -> Option<Id> {
        match self {
            Operand::Id(id) => Some(id),
            Operand::Imm(_) => None,
        }
    }

    pub fn word(self) -> u32 {
        match self {
            Operand::Id(id) => id.get(),
            Operand::Imm(imm) => imm.word(),
        }
    }
}

impl From<Id> for Operand {
    fn from(id: Id) -> Self {
        Operand::Id(id)
    }
}

impl From<Imm> for Operand {
    fn from(imm: Imm) -> Self {
        Operand::Imm(imm)
    }
}

/// A full SPIR-V instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Inst {
    pub opcode: spec::Opcode,

    // FIXME consider nesting "Result Type ID" in "Result ID".
    pub result_type_id: Option<Id>,
    pub result_id: Option<Id>,

    pub operands: SmallVec<[Operand; 4]>,
}

impl From<spec::Opcode> for Inst {
    fn from(opcode: spec::Opcode) -> Self {
        Self { opcode, result_type_id: None, result_id: None, operands: SmallVec::new() }
    }
}

impl Inst {
    pub fn with_result(mut self, result_type_id: Option<Id>, result_id: Id) -> Self {
        self.result_type_id = result_type_id;
        self.result_id = Some(result_id);
        self
    }

    pub fn with_result_type(mut self, result_type_id: Id) -> Self {
        self.result_type_id = Some(result_type_id);
        self
    }

    pub fn with_operands(mut self, operands: impl IntoIterator<Item = Operand>) -> Self {
        self.operands.extend(operands);
        self
    }

    pub fn with_ids(self, ids: impl IntoIterator<Item = Id>) -> Self {
        self.with_operands(ids.into_iter().map(Operand::Id))
    }

    /// Append a one-word immediate.
    pub fn with_imm(mut self, kind: spec::OperandKind, word: u32) -> Self {
        self.operands.push(Operand::Imm(Imm::Short(kind, word)));
        self
    }

    pub fn with_literal_string(mut self, s: &str) -> Self {
        self.operands.extend(encode_literal_string(s).map(Operand::Imm));
        self
    }

    /// ID operands (excluding the result type and result IDs), in order.
    pub fn ids(&self) -> impl DoubleEndedIterator<Item = Id> + '_ {
        self.operands.iter().filter_map(|operand| operand.id())
    }

    /// Immediate operands, in order.
    pub fn imms(&self) -> impl Iterator<Item = Imm> + '_ {
        self.operands.iter().filter_map(|&operand| match operand {
            Operand::Imm(imm) => Some(imm),
            Operand::Id(_) => None,
        })
    }

    pub fn nth_id(&self, n: usize) -> Option<Id> {
        self.ids().nth(n)
    }

    /// The `n`th one-word immediate (long immediates are skipped as a whole).
    pub fn nth_short_imm(&self, n: usize) -> Option<u32> {
        self.imms()
            .filter(|imm| !matches!(imm, Imm::LongCont(..)))
            .nth(n)
            .and_then(|imm| match imm {
                Imm::Short(_, word) => Some(word),
                _ => None,
            })
    }

    /// All IDs used by this instruction, including the result type, but not the result.
    pub fn used_ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.result_type_id.into_iter().chain(self.ids())
    }

    /// Apply `f` to every ID in the instruction (including the result ones).
    pub fn map_ids(&mut self, mut f: impl FnMut(Id) -> Id) {
        for id in self.result_type_id.iter_mut().chain(&mut self.result_id) {
            *id = f(*id);
        }
        for operand in &mut self.operands {
            if let Operand::Id(id) = operand {
                *id = f(*id);
            }
        }
    }

    /// Total word count (including the opcode word).
    pub fn word_count(&self) -> usize {
        1 + self.result_type_id.is_some() as usize
            + self.result_id.is_some() as usize
            + self.operands.len()
    }

    /// Return the bit width of an `OpTypeInt`/`OpTypeFloat` instruction.
    pub fn int_or_float_type_bit_width(&self) -> Option<u32> {
        let wk = &spec::Spec::get().well_known;

        if [wk.OpTypeInt, wk.OpTypeFloat].contains(&self.opcode) {
            self.nth_short_imm(0)
        } else {
            None
        }
    }

    /// Decode the first `LiteralString` operand, if any.
    pub fn literal_string(&self) -> Option<String> {
        let imms: SmallVec<[Imm; 8]> = self
            .imms()
            .skip_while(|imm| imm.kind() != spec::OperandKind::LiteralString)
            .take_while(|imm| imm.kind() == spec::OperandKind::LiteralString)
            .collect();
        let end = imms
            .iter()
            .skip(1)
            .position(|imm| !matches!(imm, Imm::LongCont(..)))
            .map_or(imms.len(), |i| i + 1);
        extract_literal_string(&imms[..end]).ok()
    }
}

// FIXME pick a "small string" crate, and fine-tune its inline size,
// instead of allocating a whole `String`.
//
/// Given a single `LiteralString` (as one [`Imm::Short`] or a [`Imm::LongStart`]
/// followed by some number of [`Imm::LongCont`]), returns a Rust [`String`]
/// if the literal is valid UTF-8, or the validation error otherwise.
///
/// A missing `\0` terminator is tolerated (the whole literal is used).
pub fn extract_literal_string(imms: &[Imm]) -> Result<String, FromUtf8Error> {
    let mut bytes = Vec::with_capacity(imms.len() * 4);
    'words: for imm in imms {
        for byte in imm.word().to_le_bytes() {
            if byte == 0 {
                break 'words;
            }
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes)
}

pub fn encode_literal_string(s: &str) -> impl Iterator<Item = Imm> + '_ {
    let kind = spec::OperandKind::LiteralString;

    debug_assert!(!s.contains('\0'));
    let bytes = s.as_bytes();

    let full_words = bytes.chunks_exact(4).map(|w| [w[0], w[1], w[2], w[3]]);

    let leftover_bytes = &bytes[full_words.len() * 4..];
    let mut last_word = [0; 4];
    last_word[..leftover_bytes.len()].copy_from_slice(leftover_bytes);

    let total_words = full_words.len() + 1;

    full_words.chain(iter::once(last_word)).map(u32::from_le_bytes).enumerate().map(
        move |(i, word)| match (i, total_words) {
            (0, 1) => Imm::Short(kind, word),
            (0, _) => Imm::LongStart(kind, word),
            (_, _) => Imm::LongCont(kind, word),
        },
    )
}
