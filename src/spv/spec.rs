//! SPIR-V specification subset, indexed for parsing and emission.
//!
//! Only the instructions and enumerants that the instrumentation passes and
//! the validation library need to understand are described here, everything
//! else is carried through as opaque words (see [`Opcode::def`]).

use arrayvec::ArrayVec;
use lazy_static::lazy_static;
use rustc_hash::FxHashMap;
use std::{fmt, iter};

pub const HEADER_LEN: usize = 5;

pub struct Spec {
    pub magic: u32,

    /// Pre-cached values for "well-known" names (opcodes and enumerants).
    pub well_known: WellKnown,

    instructions: FxHashMap<u16, (&'static str, InstructionDef)>,
}

impl Spec {
    /// Return a lazily-built [`Spec`] instance.
    #[inline(always)]
    pub fn get() -> &'static Spec {
        lazy_static! {
            static ref SPEC: Spec = Spec::build();
        }
        &SPEC
    }

    fn build() -> Self {
        Spec {
            magic: 0x0723_0203,
            well_known: WELL_KNOWN,
            instructions: all_instructions()
                .into_iter()
                .map(|(opcode, name, def)| (opcode.0, (name, def)))
                .collect(),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Opcode(u16);

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name_and_def() {
            Some((name, _)) => f.write_str(name),
            None => write!(f, "Op<{}>", self.0),
        }
    }
}

impl Opcode {
    /// Lookup the name & definition for `opcode` in the lazily-built [`Spec`],
    /// returning `None` if it's not a known opcode.
    pub fn try_from_u16_with_name_and_def(
        opcode: u16,
    ) -> Option<(Self, &'static str, &'static InstructionDef)> {
        let (name, def) = Spec::get().instructions.get(&opcode)?;
        Some((Self(opcode), name, def))
    }

    /// Wrap `opcode` without checking whether it's known.
    ///
    /// Unknown opcodes are kept opaque: their operands are never interpreted.
    pub fn from_u16_unchecked(opcode: u16) -> Self {
        Self(opcode)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    #[inline]
    pub fn name_and_def(self) -> Option<(&'static str, &'static InstructionDef)> {
        Spec::get().instructions.get(&self.0).map(|(name, def)| (*name, def))
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.name_and_def().map_or("OpUnknown", |(name, _)| name)
    }

    #[inline]
    pub fn def(self) -> Option<&'static InstructionDef> {
        self.name_and_def().map(|(_, def)| def)
    }

    pub fn category(self) -> InstructionCategory {
        self.def().map_or(InstructionCategory::Other, |def| def.category)
    }

    pub fn is_block_terminator(self) -> bool {
        self.category() == InstructionCategory::Terminator
    }
}

#[derive(PartialEq, Eq)]
pub struct InstructionDef {
    pub category: InstructionCategory,

    // FIXME consider nesting "Result Type ID" in "Result ID".
    pub has_result_type_id: bool,
    pub has_result_id: bool,

    pub req_operands: ArrayVec<OperandKind, 12>,
    pub opt_operands: ArrayVec<OperandKind, 2>,
    pub rest_operands: Option<RestOperandsUnit>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstructionCategory {
    Type,
    Const,
    Terminator,
    Other,
}

/// Whether the trailing `*` "operand" (i.e. repeated arbitrarily many times),
/// consists of just one operand, or two per repeat (used by e.g. `OpPhi`).
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum RestOperandsUnit {
    One(OperandKind),
    Two([OperandKind; 2]),
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum OperandMode {
    Required,
    Optional,
}

impl InstructionDef {
    /// Return a (potentially infinite) iterator of [`OperandKind`]s, along with
    /// the [`OperandMode`] indicating whether an operand is expected (`Required`),
    /// or that an operand's absence signals the end of operands (`Optional`),
    /// which is also the exit signal for the "rest operands" infinite iterators.
    pub fn all_operands(&self) -> impl Iterator<Item = (OperandMode, OperandKind)> + '_ {
        self.req_operands
            .iter()
            .map(|&kind| (OperandMode::Required, kind))
            .chain(self.opt_operands.iter().map(|&kind| (OperandMode::Optional, kind)))
            .chain(self.rest_operands.iter().flat_map(|&rest_unit| {
                // If the rest operands come in pairs, only the first operand in
                // the pair is optional, the second one must be present when the
                // first one is (i.e. only the pair as a whole is optional).
                let (opt_a, req_b) = match rest_unit {
                    RestOperandsUnit::One(kind) => (kind, None),
                    RestOperandsUnit::Two([a_kind, b_kind]) => (a_kind, Some(b_kind)),
                };
                iter::repeat(
                    iter::once((OperandMode::Optional, opt_a))
                        .chain(req_b.map(|kind| (OperandMode::Required, kind))),
                )
                .flatten()
            }))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperandKind {
    IdRef,

    LiteralInteger,
    LiteralString,
    LiteralContextDependentNumber,
    LiteralExtInstInteger,
    LiteralSpecConstantOpInteger,

    Capability,
    AddressingModel,
    MemoryModel,
    ExecutionModel,
    ExecutionMode,
    SourceLanguage,
    StorageClass,
    Decoration,
    LinkageType,
    Dim,
    ImageFormat,
    AccessQualifier,
    SamplerAddressingMode,
    SamplerFilterMode,
    GroupOperation,

    FunctionControl,
    SelectionControl,
    LoopControl,
    MemoryAccess,
    ImageOperands,
}

pub enum OperandKindDef {
    /// Bit-flags, where some bits may be followed by extra parameters
    /// (in order of increasing bit index). Bits not listed take no parameters.
    BitEnum { params: &'static [(u32, &'static [OperandKind])] },

    /// Single-word enumerant, where some values may be followed by extra
    /// parameters. Values not listed take no parameters.
    ValueEnum { params: &'static [(u32, &'static [OperandKind])] },

    Id,
    Literal { size: LiteralSize },
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum LiteralSize {
    /// The literal is always one word (but may occupy some of the bits).
    Word,

    /// The literal is a word-encoded byte array, that ends with a `0` byte.
    NulTerminated,

    /// The literal uses as many words as required by its type, which is known
    /// contextually (`OpConstant`'s result type or `OpSwitch`'s selector type).
    FromContextualType,
}

impl OperandKind {
    pub fn def(self) -> OperandKindDef {
        use OperandKind as K;

        match self {
            K::IdRef => OperandKindDef::Id,

            K::LiteralInteger | K::LiteralExtInstInteger | K::LiteralSpecConstantOpInteger => {
                OperandKindDef::Literal { size: LiteralSize::Word }
            }
            K::LiteralString => OperandKindDef::Literal { size: LiteralSize::NulTerminated },
            K::LiteralContextDependentNumber => {
                OperandKindDef::Literal { size: LiteralSize::FromContextualType }
            }

            K::MemoryAccess => OperandKindDef::BitEnum {
                params: &[
                    // Aligned
                    (0x2, &[K::LiteralInteger]),
                    // MakePointerAvailable
                    (0x8, &[K::IdRef]),
                    // MakePointerVisible
                    (0x10, &[K::IdRef]),
                ],
            },
            K::ImageOperands => OperandKindDef::BitEnum {
                params: &[
                    // Bias
                    (0x1, &[K::IdRef]),
                    // Lod
                    (0x2, &[K::IdRef]),
                    // Grad
                    (0x4, &[K::IdRef, K::IdRef]),
                    // ConstOffset
                    (0x8, &[K::IdRef]),
                    // Offset
                    (0x10, &[K::IdRef]),
                    // ConstOffsets
                    (0x20, &[K::IdRef]),
                    // Sample
                    (0x40, &[K::IdRef]),
                    // MinLod
                    (0x80, &[K::IdRef]),
                    // MakeTexelAvailable
                    (0x100, &[K::IdRef]),
                    // MakeTexelVisible
                    (0x200, &[K::IdRef]),
                    // Offsets
                    (0x10000, &[K::IdRef]),
                ],
            },
            K::FunctionControl | K::SelectionControl | K::LoopControl => {
                OperandKindDef::BitEnum { params: &[] }
            }

            // NOTE other decorations' parameters are all literal integers, and
            // are covered by the `OpDecorate` "rest operands".
            K::Decoration => OperandKindDef::ValueEnum {
                params: &[
                    // LinkageAttributes
                    (41, &[K::LiteralString, K::LinkageType]),
                ],
            },

            K::Capability
            | K::AddressingModel
            | K::MemoryModel
            | K::ExecutionModel
            | K::ExecutionMode
            | K::SourceLanguage
            | K::StorageClass
            | K::LinkageType
            | K::Dim
            | K::ImageFormat
            | K::AccessQualifier
            | K::SamplerAddressingMode
            | K::SamplerFilterMode
            | K::GroupOperation => OperandKindDef::ValueEnum { params: &[] },
        }
    }

    pub fn name(self) -> String {
        format!("{self:?}")
    }
}

/// Returns the parameters of `enumerant` (a `BitEnum`/`ValueEnum` word), in order.
pub fn enumerant_params(
    params: &'static [(u32, &'static [OperandKind])],
    is_bit_enum: bool,
    word: u32,
) -> impl Iterator<Item = OperandKind> {
    params
        .iter()
        .filter(move |&&(value, _)| if is_bit_enum { word & value != 0 } else { word == value })
        .flat_map(|&(_, kinds)| kinds.iter().copied())
}

macro_rules! result_ids {
    (N) => {
        (false, false)
    };
    (R) => {
        (false, true)
    };
    (TR) => {
        (true, true)
    };
}

macro_rules! rest_unit {
    () => {
        None
    };
    ($one:ident) => {
        Some(RestOperandsUnit::One(OperandKind::$one))
    };
    ($a:ident, $b:ident) => {
        Some(RestOperandsUnit::Two([OperandKind::$a, OperandKind::$b]))
    };
}

macro_rules! def_spec {
    (
        instructions {
            $($name:ident = $opcode:literal: $cat:ident $res:ident
                [$($req:ident),*] [$($opt:ident),*] [$($rest:ident),*];)+
        }
        enumerants {
            $($enumerant:ident = $value:literal),+ $(,)?
        }
    ) => {
        // FIXME find a way to namespace enumerants to avoid conflicts.
        #[allow(non_snake_case)]
        pub struct WellKnown {
            $(pub $name: Opcode,)+
            $(pub $enumerant: u32,)+
        }

        const WELL_KNOWN: WellKnown = WellKnown {
            $($name: Opcode($opcode),)+
            $($enumerant: $value,)+
        };

        fn all_instructions() -> Vec<(Opcode, &'static str, InstructionDef)> {
            vec![$({
                let (has_result_type_id, has_result_id) = result_ids!($res);
                let req: &[OperandKind] = &[$(OperandKind::$req),*];
                let opt: &[OperandKind] = &[$(OperandKind::$opt),*];
                (
                    Opcode($opcode),
                    stringify!($name),
                    InstructionDef {
                        category: InstructionCategory::$cat,
                        has_result_type_id,
                        has_result_id,
                        req_operands: req.iter().copied().collect(),
                        opt_operands: opt.iter().copied().collect(),
                        rest_operands: rest_unit!($($rest),*),
                    },
                )
            }),+]
        }
    };
}

def_spec! {
    instructions {
        OpNop = 0: Other N [] [] [];
        OpUndef = 1: Other TR [] [] [];
        OpSourceContinued = 2: Other N [LiteralString] [] [];
        OpSource = 3: Other N [SourceLanguage, LiteralInteger] [IdRef, LiteralString] [];
        OpSourceExtension = 4: Other N [LiteralString] [] [];
        OpName = 5: Other N [IdRef, LiteralString] [] [];
        OpMemberName = 6: Other N [IdRef, LiteralInteger, LiteralString] [] [];
        OpString = 7: Other R [LiteralString] [] [];
        OpLine = 8: Other N [IdRef, LiteralInteger, LiteralInteger] [] [];
        OpExtension = 10: Other N [LiteralString] [] [];
        OpExtInstImport = 11: Other R [LiteralString] [] [];
        OpExtInst = 12: Other TR [IdRef, LiteralExtInstInteger] [] [IdRef];
        OpMemoryModel = 14: Other N [AddressingModel, MemoryModel] [] [];
        OpEntryPoint = 15: Other N [ExecutionModel, IdRef, LiteralString] [] [IdRef];
        OpExecutionMode = 16: Other N [IdRef, ExecutionMode] [] [LiteralInteger];
        OpCapability = 17: Other N [Capability] [] [];

        OpTypeVoid = 19: Type R [] [] [];
        OpTypeBool = 20: Type R [] [] [];
        OpTypeInt = 21: Type R [LiteralInteger, LiteralInteger] [] [];
        OpTypeFloat = 22: Type R [LiteralInteger] [LiteralInteger] [];
        OpTypeVector = 23: Type R [IdRef, LiteralInteger] [] [];
        OpTypeMatrix = 24: Type R [IdRef, LiteralInteger] [] [];
        OpTypeImage = 25: Type R [IdRef, Dim, LiteralInteger, LiteralInteger, LiteralInteger,
            LiteralInteger, ImageFormat] [AccessQualifier] [];
        OpTypeSampler = 26: Type R [] [] [];
        OpTypeSampledImage = 27: Type R [IdRef] [] [];
        OpTypeArray = 28: Type R [IdRef, IdRef] [] [];
        OpTypeRuntimeArray = 29: Type R [IdRef] [] [];
        OpTypeStruct = 30: Type R [] [] [IdRef];
        OpTypeOpaque = 31: Type R [LiteralString] [] [];
        OpTypePointer = 32: Type R [StorageClass, IdRef] [] [];
        OpTypeFunction = 33: Type R [IdRef] [] [IdRef];
        OpTypeForwardPointer = 39: Type N [IdRef, StorageClass] [] [];

        OpConstantTrue = 41: Const TR [] [] [];
        OpConstantFalse = 42: Const TR [] [] [];
        OpConstant = 43: Const TR [LiteralContextDependentNumber] [] [];
        OpConstantComposite = 44: Const TR [] [] [IdRef];
        OpConstantSampler = 45: Const TR [SamplerAddressingMode, LiteralInteger,
            SamplerFilterMode] [] [];
        OpConstantNull = 46: Const TR [] [] [];
        OpSpecConstantTrue = 48: Const TR [] [] [];
        OpSpecConstantFalse = 49: Const TR [] [] [];
        OpSpecConstant = 50: Const TR [LiteralContextDependentNumber] [] [];
        OpSpecConstantComposite = 51: Const TR [] [] [IdRef];
        OpSpecConstantOp = 52: Const TR [LiteralSpecConstantOpInteger] [] [];

        OpFunction = 54: Other TR [FunctionControl, IdRef] [] [];
        OpFunctionParameter = 55: Other TR [] [] [];
        OpFunctionEnd = 56: Other N [] [] [];
        OpFunctionCall = 57: Other TR [IdRef] [] [IdRef];

        OpVariable = 59: Other TR [StorageClass] [IdRef] [];
        OpImageTexelPointer = 60: Other TR [IdRef, IdRef, IdRef] [] [];
        OpLoad = 61: Other TR [IdRef] [MemoryAccess] [];
        OpStore = 62: Other N [IdRef, IdRef] [MemoryAccess] [];
        OpCopyMemory = 63: Other N [IdRef, IdRef] [MemoryAccess, MemoryAccess] [];
        OpCopyMemorySized = 64: Other N [IdRef, IdRef, IdRef] [MemoryAccess, MemoryAccess] [];
        OpAccessChain = 65: Other TR [IdRef] [] [IdRef];
        OpInBoundsAccessChain = 66: Other TR [IdRef] [] [IdRef];
        OpPtrAccessChain = 67: Other TR [IdRef, IdRef] [] [IdRef];
        OpArrayLength = 68: Other TR [IdRef, LiteralInteger] [] [];
        OpInBoundsPtrAccessChain = 70: Other TR [IdRef, IdRef] [] [IdRef];

        OpDecorate = 71: Other N [IdRef, Decoration] [] [LiteralInteger];
        OpMemberDecorate = 72: Other N [IdRef, LiteralInteger, Decoration] [] [LiteralInteger];
        OpDecorationGroup = 73: Other R [] [] [];
        OpGroupDecorate = 74: Other N [IdRef] [] [IdRef];
        OpGroupMemberDecorate = 75: Other N [IdRef] [] [IdRef, LiteralInteger];

        OpVectorExtractDynamic = 77: Other TR [IdRef, IdRef] [] [];
        OpVectorInsertDynamic = 78: Other TR [IdRef, IdRef, IdRef] [] [];
        OpVectorShuffle = 79: Other TR [IdRef, IdRef] [] [LiteralInteger];
        OpCompositeConstruct = 80: Other TR [] [] [IdRef];
        OpCompositeExtract = 81: Other TR [IdRef] [] [LiteralInteger];
        OpCompositeInsert = 82: Other TR [IdRef, IdRef] [] [LiteralInteger];
        OpCopyObject = 83: Other TR [IdRef] [] [];
        OpTranspose = 84: Other TR [IdRef] [] [];

        OpSampledImage = 86: Other TR [IdRef, IdRef] [] [];
        OpImageSampleImplicitLod = 87: Other TR [IdRef, IdRef] [ImageOperands] [];
        OpImageSampleExplicitLod = 88: Other TR [IdRef, IdRef, ImageOperands] [] [];
        OpImageSampleDrefImplicitLod = 89: Other TR [IdRef, IdRef, IdRef] [ImageOperands] [];
        OpImageSampleDrefExplicitLod = 90: Other TR [IdRef, IdRef, IdRef, ImageOperands] [] [];
        OpImageSampleProjImplicitLod = 91: Other TR [IdRef, IdRef] [ImageOperands] [];
        OpImageSampleProjExplicitLod = 92: Other TR [IdRef, IdRef, ImageOperands] [] [];
        OpImageSampleProjDrefImplicitLod = 93: Other TR [IdRef, IdRef, IdRef] [ImageOperands] [];
        OpImageSampleProjDrefExplicitLod = 94: Other TR [IdRef, IdRef, IdRef, ImageOperands] [] [];
        OpImageFetch = 95: Other TR [IdRef, IdRef] [ImageOperands] [];
        OpImageGather = 96: Other TR [IdRef, IdRef, IdRef] [ImageOperands] [];
        OpImageDrefGather = 97: Other TR [IdRef, IdRef, IdRef] [ImageOperands] [];
        OpImageRead = 98: Other TR [IdRef, IdRef] [ImageOperands] [];
        OpImageWrite = 99: Other N [IdRef, IdRef, IdRef] [ImageOperands] [];
        OpImage = 100: Other TR [IdRef] [] [];
        OpImageQueryFormat = 101: Other TR [IdRef] [] [];
        OpImageQueryOrder = 102: Other TR [IdRef] [] [];
        OpImageQuerySizeLod = 103: Other TR [IdRef, IdRef] [] [];
        OpImageQuerySize = 104: Other TR [IdRef] [] [];
        OpImageQueryLod = 105: Other TR [IdRef, IdRef] [] [];
        OpImageQueryLevels = 106: Other TR [IdRef] [] [];
        OpImageQuerySamples = 107: Other TR [IdRef] [] [];

        OpConvertFToU = 109: Other TR [IdRef] [] [];
        OpConvertFToS = 110: Other TR [IdRef] [] [];
        OpConvertSToF = 111: Other TR [IdRef] [] [];
        OpConvertUToF = 112: Other TR [IdRef] [] [];
        OpUConvert = 113: Other TR [IdRef] [] [];
        OpSConvert = 114: Other TR [IdRef] [] [];
        OpFConvert = 115: Other TR [IdRef] [] [];
        OpQuantizeToF16 = 116: Other TR [IdRef] [] [];
        OpConvertPtrToU = 117: Other TR [IdRef] [] [];
        OpConvertUToPtr = 120: Other TR [IdRef] [] [];
        OpBitcast = 124: Other TR [IdRef] [] [];

        OpSNegate = 126: Other TR [IdRef] [] [];
        OpFNegate = 127: Other TR [IdRef] [] [];
        OpIAdd = 128: Other TR [IdRef, IdRef] [] [];
        OpFAdd = 129: Other TR [IdRef, IdRef] [] [];
        OpISub = 130: Other TR [IdRef, IdRef] [] [];
        OpFSub = 131: Other TR [IdRef, IdRef] [] [];
        OpIMul = 132: Other TR [IdRef, IdRef] [] [];
        OpFMul = 133: Other TR [IdRef, IdRef] [] [];
        OpUDiv = 134: Other TR [IdRef, IdRef] [] [];
        OpSDiv = 135: Other TR [IdRef, IdRef] [] [];
        OpFDiv = 136: Other TR [IdRef, IdRef] [] [];
        OpUMod = 137: Other TR [IdRef, IdRef] [] [];
        OpSRem = 138: Other TR [IdRef, IdRef] [] [];
        OpSMod = 139: Other TR [IdRef, IdRef] [] [];
        OpFRem = 140: Other TR [IdRef, IdRef] [] [];
        OpFMod = 141: Other TR [IdRef, IdRef] [] [];
        OpVectorTimesScalar = 142: Other TR [IdRef, IdRef] [] [];
        OpMatrixTimesScalar = 143: Other TR [IdRef, IdRef] [] [];
        OpVectorTimesMatrix = 144: Other TR [IdRef, IdRef] [] [];
        OpMatrixTimesVector = 145: Other TR [IdRef, IdRef] [] [];
        OpMatrixTimesMatrix = 146: Other TR [IdRef, IdRef] [] [];
        OpOuterProduct = 147: Other TR [IdRef, IdRef] [] [];
        OpDot = 148: Other TR [IdRef, IdRef] [] [];
        OpIAddCarry = 149: Other TR [IdRef, IdRef] [] [];
        OpISubBorrow = 150: Other TR [IdRef, IdRef] [] [];
        OpUMulExtended = 151: Other TR [IdRef, IdRef] [] [];
        OpSMulExtended = 152: Other TR [IdRef, IdRef] [] [];

        OpAny = 154: Other TR [IdRef] [] [];
        OpAll = 155: Other TR [IdRef] [] [];
        OpIsNan = 156: Other TR [IdRef] [] [];
        OpIsInf = 157: Other TR [IdRef] [] [];
        OpIsFinite = 158: Other TR [IdRef] [] [];
        OpIsNormal = 159: Other TR [IdRef] [] [];
        OpSignBitSet = 160: Other TR [IdRef] [] [];
        OpLessOrGreater = 161: Other TR [IdRef, IdRef] [] [];
        OpOrdered = 162: Other TR [IdRef, IdRef] [] [];
        OpUnordered = 163: Other TR [IdRef, IdRef] [] [];
        OpLogicalEqual = 164: Other TR [IdRef, IdRef] [] [];
        OpLogicalNotEqual = 165: Other TR [IdRef, IdRef] [] [];
        OpLogicalOr = 166: Other TR [IdRef, IdRef] [] [];
        OpLogicalAnd = 167: Other TR [IdRef, IdRef] [] [];
        OpLogicalNot = 168: Other TR [IdRef] [] [];
        OpSelect = 169: Other TR [IdRef, IdRef, IdRef] [] [];
        OpIEqual = 170: Other TR [IdRef, IdRef] [] [];
        OpINotEqual = 171: Other TR [IdRef, IdRef] [] [];
        OpUGreaterThan = 172: Other TR [IdRef, IdRef] [] [];
        OpSGreaterThan = 173: Other TR [IdRef, IdRef] [] [];
        OpUGreaterThanEqual = 174: Other TR [IdRef, IdRef] [] [];
        OpSGreaterThanEqual = 175: Other TR [IdRef, IdRef] [] [];
        OpULessThan = 176: Other TR [IdRef, IdRef] [] [];
        OpSLessThan = 177: Other TR [IdRef, IdRef] [] [];
        OpULessThanEqual = 178: Other TR [IdRef, IdRef] [] [];
        OpSLessThanEqual = 179: Other TR [IdRef, IdRef] [] [];
        OpFOrdEqual = 180: Other TR [IdRef, IdRef] [] [];
        OpFUnordEqual = 181: Other TR [IdRef, IdRef] [] [];
        OpFOrdNotEqual = 182: Other TR [IdRef, IdRef] [] [];
        OpFUnordNotEqual = 183: Other TR [IdRef, IdRef] [] [];
        OpFOrdLessThan = 184: Other TR [IdRef, IdRef] [] [];
        OpFUnordLessThan = 185: Other TR [IdRef, IdRef] [] [];
        OpFOrdGreaterThan = 186: Other TR [IdRef, IdRef] [] [];
        OpFUnordGreaterThan = 187: Other TR [IdRef, IdRef] [] [];
        OpFOrdLessThanEqual = 188: Other TR [IdRef, IdRef] [] [];
        OpFUnordLessThanEqual = 189: Other TR [IdRef, IdRef] [] [];
        OpFOrdGreaterThanEqual = 190: Other TR [IdRef, IdRef] [] [];
        OpFUnordGreaterThanEqual = 191: Other TR [IdRef, IdRef] [] [];
        OpShiftRightLogical = 194: Other TR [IdRef, IdRef] [] [];
        OpShiftRightArithmetic = 195: Other TR [IdRef, IdRef] [] [];
        OpShiftLeftLogical = 196: Other TR [IdRef, IdRef] [] [];
        OpBitwiseOr = 197: Other TR [IdRef, IdRef] [] [];
        OpBitwiseXor = 198: Other TR [IdRef, IdRef] [] [];
        OpBitwiseAnd = 199: Other TR [IdRef, IdRef] [] [];
        OpNot = 200: Other TR [IdRef] [] [];
        OpBitFieldInsert = 201: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpBitFieldSExtract = 202: Other TR [IdRef, IdRef, IdRef] [] [];
        OpBitFieldUExtract = 203: Other TR [IdRef, IdRef, IdRef] [] [];
        OpBitReverse = 204: Other TR [IdRef] [] [];
        OpBitCount = 205: Other TR [IdRef] [] [];
        OpDPdx = 207: Other TR [IdRef] [] [];
        OpDPdy = 208: Other TR [IdRef] [] [];
        OpFwidth = 209: Other TR [IdRef] [] [];
        OpDPdxFine = 210: Other TR [IdRef] [] [];
        OpDPdyFine = 211: Other TR [IdRef] [] [];
        OpFwidthFine = 212: Other TR [IdRef] [] [];
        OpDPdxCoarse = 213: Other TR [IdRef] [] [];
        OpDPdyCoarse = 214: Other TR [IdRef] [] [];
        OpFwidthCoarse = 215: Other TR [IdRef] [] [];
        OpEmitVertex = 218: Other N [] [] [];
        OpEndPrimitive = 219: Other N [] [] [];
        OpEmitStreamVertex = 220: Other N [IdRef] [] [];
        OpEndStreamPrimitive = 221: Other N [IdRef] [] [];

        OpControlBarrier = 224: Other N [IdRef, IdRef, IdRef] [] [];
        OpMemoryBarrier = 225: Other N [IdRef, IdRef] [] [];
        OpAtomicLoad = 227: Other TR [IdRef, IdRef, IdRef] [] [];
        OpAtomicStore = 228: Other N [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicExchange = 229: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicCompareExchange = 230: Other TR [IdRef, IdRef, IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicIIncrement = 232: Other TR [IdRef, IdRef, IdRef] [] [];
        OpAtomicIDecrement = 233: Other TR [IdRef, IdRef, IdRef] [] [];
        OpAtomicIAdd = 234: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicISub = 235: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicSMin = 236: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicUMin = 237: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicSMax = 238: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicUMax = 239: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicAnd = 240: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicOr = 241: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];
        OpAtomicXor = 242: Other TR [IdRef, IdRef, IdRef, IdRef] [] [];

        OpPhi = 245: Other TR [] [] [IdRef, IdRef];
        OpLoopMerge = 246: Other N [IdRef, IdRef, LoopControl] [] [LiteralInteger];
        OpSelectionMerge = 247: Other N [IdRef, SelectionControl] [] [];
        OpLabel = 248: Other R [] [] [];
        OpBranch = 249: Terminator N [IdRef] [] [];
        OpBranchConditional = 250: Terminator N [IdRef, IdRef, IdRef] [] [LiteralInteger];
        OpSwitch = 251: Terminator N [IdRef, IdRef] [] [LiteralContextDependentNumber, IdRef];
        OpKill = 252: Terminator N [] [] [];
        OpReturn = 253: Terminator N [] [] [];
        OpReturnValue = 254: Terminator N [IdRef] [] [];
        OpUnreachable = 255: Terminator N [] [] [];

        OpNoLine = 317: Other N [] [] [];
        OpModuleProcessed = 330: Other N [LiteralString] [] [];
        OpExecutionModeId = 331: Other N [IdRef, ExecutionMode] [] [IdRef];
        OpDecorateId = 332: Other N [IdRef, Decoration] [] [IdRef];

        OpGroupNonUniformElect = 333: Other TR [IdRef] [] [];
        OpGroupNonUniformAll = 334: Other TR [IdRef, IdRef] [] [];
        OpGroupNonUniformAny = 335: Other TR [IdRef, IdRef] [] [];
        OpGroupNonUniformAllEqual = 336: Other TR [IdRef, IdRef] [] [];
        OpGroupNonUniformBroadcast = 337: Other TR [IdRef, IdRef, IdRef] [] [];
        OpGroupNonUniformBroadcastFirst = 338: Other TR [IdRef, IdRef] [] [];
        OpGroupNonUniformBallot = 339: Other TR [IdRef, IdRef] [] [];
        OpGroupNonUniformShuffle = 345: Other TR [IdRef, IdRef, IdRef] [] [];
        OpGroupNonUniformIAdd = 349: Other TR [IdRef, GroupOperation, IdRef] [IdRef] [];
        OpGroupNonUniformFAdd = 350: Other TR [IdRef, GroupOperation, IdRef] [IdRef] [];
        OpGroupNonUniformUMin = 354: Other TR [IdRef, GroupOperation, IdRef] [IdRef] [];
        OpGroupNonUniformUMax = 357: Other TR [IdRef, GroupOperation, IdRef] [IdRef] [];

        OpCopyLogical = 400: Other TR [IdRef] [] [];
        OpPtrEqual = 401: Other TR [IdRef, IdRef] [] [];
        OpPtrNotEqual = 402: Other TR [IdRef, IdRef] [] [];

        OpTerminateInvocation = 4416: Terminator N [] [] [];
        OpTraceRayKHR = 4445: Other N [IdRef, IdRef, IdRef, IdRef, IdRef, IdRef, IdRef, IdRef,
            IdRef, IdRef, IdRef] [] [];
        OpExecuteCallableKHR = 4446: Other N [IdRef, IdRef] [] [];
        OpConvertUToAccelerationStructureKHR = 4447: Other TR [IdRef] [] [];
        OpIgnoreIntersectionKHR = 4448: Terminator N [] [] [];
        OpTerminateRayKHR = 4449: Terminator N [] [] [];
        OpTypeRayQueryKHR = 4472: Type R [] [] [];
        OpRayQueryInitializeKHR = 4473: Other N [IdRef, IdRef, IdRef, IdRef, IdRef, IdRef,
            IdRef, IdRef] [] [];
        OpRayQueryTerminateKHR = 4474: Other N [IdRef] [] [];
        OpRayQueryGenerateIntersectionKHR = 4475: Other N [IdRef, IdRef] [] [];
        OpRayQueryConfirmIntersectionKHR = 4476: Other N [IdRef] [] [];
        OpRayQueryProceedKHR = 4477: Other TR [IdRef] [] [];
        OpRayQueryGetIntersectionTypeKHR = 4479: Other TR [IdRef, IdRef] [] [];
        OpEmitMeshTasksEXT = 5294: Terminator N [IdRef, IdRef, IdRef] [IdRef] [];
        OpReportIntersectionKHR = 5334: Other TR [IdRef, IdRef] [] [];
        OpTypeAccelerationStructureKHR = 5341: Type R [] [] [];
        OpDemoteToHelperInvocation = 5380: Other N [] [] [];
        OpIsHelperInvocationEXT = 5381: Other TR [] [] [];
        OpDecorateString = 5632: Other N [IdRef, Decoration] [] [LiteralString];
        OpMemberDecorateString = 5633: Other N [IdRef, LiteralInteger, Decoration] [] [LiteralString];
        OpRayQueryGetRayTMinKHR = 6016: Other TR [IdRef] [] [];
        OpRayQueryGetRayFlagsKHR = 6017: Other TR [IdRef] [] [];
        OpRayQueryGetIntersectionTKHR = 6018: Other TR [IdRef, IdRef] [] [];
    }
    enumerants {
        // Capability
        Shader = 1,
        Linkage = 5,
        Int64 = 11,
        RayQueryKHR = 4472,
        PhysicalStorageBufferAddresses = 5347,

        // AddressingModel
        Logical = 0,
        PhysicalStorageBuffer64 = 5348,

        // MemoryModel
        GLSL450 = 1,

        // StorageClass
        UniformConstant = 0,
        Input = 1,
        Uniform = 2,
        Output = 3,
        Workgroup = 4,
        Private = 6,
        Function = 7,
        PushConstant = 9,
        StorageBuffer = 12,
        PhysicalStorageBuffer = 5349,

        // Decoration
        Block = 2,
        BufferBlock = 3,
        ArrayStride = 6,
        MatrixStride = 7,
        BuiltIn = 11,
        NonWritable = 24,
        Binding = 33,
        DescriptorSet = 34,
        Offset = 35,
        LinkageAttributes = 41,
        NonUniform = 5300,

        // LinkageType
        Export = 0,
        Import = 1,

        // MemoryAccess
        Aligned = 0x2,

        // Scope
        ScopeDevice = 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_opcodes_round_trip_through_the_table() {
        let wk = &Spec::get().well_known;
        for opcode in [wk.OpLoad, wk.OpPhi, wk.OpRayQueryInitializeKHR, wk.OpDecorateString] {
            let (found, name, _) = Opcode::try_from_u16_with_name_and_def(opcode.as_u16()).unwrap();
            assert_eq!(found, opcode);
            assert_eq!(name, opcode.name());
        }
        assert!(Opcode::try_from_u16_with_name_and_def(9999).is_none());
    }

    #[test]
    fn pair_rest_operands_make_only_the_first_optional() {
        let def = Spec::get().well_known.OpPhi.def().unwrap();
        let modes: Vec<_> = def.all_operands().take(4).map(|(mode, _)| mode).collect();
        assert!(
            modes
                == [
                    OperandMode::Optional,
                    OperandMode::Required,
                    OperandMode::Optional,
                    OperandMode::Required
                ]
        );
    }

    #[test]
    fn image_operand_params_follow_bit_order() {
        let OperandKindDef::BitEnum { params } = OperandKind::ImageOperands.def() else {
            unreachable!()
        };
        // Lod | ConstOffset
        let kinds: Vec<_> = enumerant_params(params, true, 0x2 | 0x8).collect();
        assert_eq!(kinds, [OperandKind::IdRef, OperandKind::IdRef]);
    }
}
