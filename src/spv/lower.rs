//! SPIR-V to [`Module`] lowering (grouping instructions into layout sections).

use crate::spv::read::{ModuleParser, ParseError};
use crate::spv::spec;
use crate::{Block, Func, Module};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Seq {
    Capability,
    Extension,
    ExtInstImport,
    MemoryModel,
    EntryPoint,
    ExecutionMode,
    DebugStringAndSource,
    DebugName,
    DebugModuleProcessed,
    Decoration,

    // NOTE not its own section, but only a "checkpoint", forcing
    // instructions following `OpLine`/`OpNoLine` into later sections.
    DebugLine,

    Globals,
    Functions,
}

/// A function being lowered (between `OpFunction` and `OpFunctionEnd`).
struct PendingFunc {
    func: Func,
    block: Option<Block>,
}

fn invalid(msg: impl Into<String>) -> ParseError {
    ParseError::Structure(msg.into())
}

impl Module {
    pub fn parse_spv_bytes(spv_bytes: &[u8]) -> Result<Self, ParseError> {
        Self::lower_from_spv_parser(ModuleParser::read_from_spv_bytes(spv_bytes)?)
    }

    pub fn parse_spv_words(spv_words: &[u32]) -> Result<Self, ParseError> {
        Self::lower_from_spv_parser(ModuleParser::read_from_spv_words(spv_words.to_vec())?)
    }

    fn lower_from_spv_parser(parser: ModuleParser) -> Result<Self, ParseError> {
        let wk = &spec::Spec::get().well_known;

        let header = parser.header;
        if header.bound > crate::MAX_ID_BOUND {
            return Err(invalid(format!("ID bound {} exceeds the SPIR-V limit", header.bound)));
        }

        let mut seq = None;
        let mut memory_model = None;
        let mut capabilities = vec![];
        let mut extensions = vec![];
        let mut ext_inst_imports = vec![];
        let mut entry_points = vec![];
        let mut execution_modes = vec![];
        let mut debug = vec![];
        let mut annotations = vec![];
        let mut globals = vec![];
        let mut funcs = vec![];
        let mut current_func: Option<PendingFunc> = None;

        for inst in parser {
            let inst = inst?;
            let opcode = inst.opcode;

            let invalid = |msg: &str| invalid(format!("in {opcode:?}: {msg}"));

            let bound = header.bound;
            let out_of_bounds =
                inst.result_id.into_iter().chain(inst.used_ids()).find(|id| id.get() >= bound);
            if let Some(id) = out_of_bounds {
                return Err(invalid(&format!("ID %{id} is not below the ID bound {bound}")));
            }

            let next_seq = if opcode == wk.OpCapability {
                capabilities.push(inst);
                Seq::Capability
            } else if opcode == wk.OpExtension {
                extensions.push(inst);
                Seq::Extension
            } else if opcode == wk.OpExtInstImport {
                ext_inst_imports.push(inst);
                Seq::ExtInstImport
            } else if opcode == wk.OpMemoryModel {
                if memory_model.replace(inst).is_some() {
                    return Err(invalid("duplicate OpMemoryModel"));
                }
                Seq::MemoryModel
            } else if opcode == wk.OpEntryPoint {
                entry_points.push(inst);
                Seq::EntryPoint
            } else if [wk.OpExecutionMode, wk.OpExecutionModeId].contains(&opcode) {
                execution_modes.push(inst);
                Seq::ExecutionMode
            } else if [wk.OpString, wk.OpSource, wk.OpSourceContinued, wk.OpSourceExtension]
                .contains(&opcode)
            {
                debug.push(inst);
                // NOTE these are in their own section together, but `OpString`
                // and `OpSource*` may be interleaved in any order.
                Seq::DebugStringAndSource
            } else if [wk.OpName, wk.OpMemberName].contains(&opcode) {
                debug.push(inst);
                Seq::DebugName
            } else if opcode == wk.OpModuleProcessed {
                debug.push(inst);
                Seq::DebugModuleProcessed
            } else if [
                wk.OpDecorate,
                wk.OpMemberDecorate,
                wk.OpDecorationGroup,
                wk.OpGroupDecorate,
                wk.OpGroupMemberDecorate,
                wk.OpDecorateId,
                wk.OpDecorateString,
                wk.OpMemberDecorateString,
            ]
            .contains(&opcode)
            {
                annotations.push(inst);
                Seq::Decoration
            } else if opcode == wk.OpFunction {
                if current_func.is_some() {
                    return Err(invalid("nested OpFunction while still in a function"));
                }
                current_func = Some(PendingFunc {
                    func: Func { def: inst, params: vec![], blocks: vec![], end: opcode.into() },
                    block: None,
                });
                Seq::Functions
            } else if let Some(pending) = &mut current_func {
                if opcode == wk.OpFunctionEnd {
                    if pending.block.is_some() {
                        return Err(invalid("block without a terminator"));
                    }
                    let mut func = current_func.take().map(|pending| pending.func);
                    if let Some(func) = &mut func {
                        func.end = inst;
                    }
                    funcs.extend(func);
                } else if opcode == wk.OpLabel {
                    if pending.block.is_some() {
                        return Err(invalid("block without a terminator"));
                    }
                    pending.block = Some(Block { label: inst, insts: vec![] });
                } else if let Some(block) = &mut pending.block {
                    let is_terminator = opcode.is_block_terminator();
                    block.insts.push(inst);
                    if is_terminator {
                        pending.func.blocks.extend(pending.block.take());
                    }
                } else if pending.func.blocks.is_empty()
                    && [wk.OpFunctionParameter, wk.OpLine, wk.OpNoLine].contains(&opcode)
                {
                    pending.func.params.push(inst);
                } else {
                    return Err(invalid("instruction outside of a block"));
                }
                Seq::Functions
            } else if [wk.OpLine, wk.OpNoLine].contains(&opcode) {
                globals.push(inst);
                // Advance to `Seq::DebugLine` if we're not there yet, forcing
                // any following instructions to not be in earlier sections.
                seq.max(Some(Seq::DebugLine)).unwrap_or(Seq::DebugLine)
            } else if opcode == wk.OpFunctionEnd
                || opcode == wk.OpLabel
                || opcode == wk.OpFunctionParameter
                || opcode.is_block_terminator()
            {
                return Err(invalid("outside of a function"));
            } else {
                // Types, constants, global variables, `OpUndef`, and anything
                // else appearing at module scope (e.g. non-semantic `OpExtInst`).
                if opcode == wk.OpVariable && inst.nth_short_imm(0) == Some(wk.Function) {
                    return Err(invalid("Function storage class outside of a function"));
                }
                globals.push(inst);
                Seq::Globals
            };
            if seq > Some(next_seq) {
                return Err(invalid(&format!(
                    "out of order: {next_seq:?} instructions must precede {seq:?} instructions",
                )));
            }
            seq = Some(next_seq);
        }

        if current_func.is_some() {
            return Err(invalid("OpFunction without matching OpFunctionEnd"));
        }

        let memory_model = memory_model.ok_or_else(|| invalid("missing OpMemoryModel"))?;

        let mut module = Module::new(header, memory_model);
        module.capabilities = capabilities;
        module.extensions = extensions;
        module.ext_inst_imports = ext_inst_imports;
        module.entry_points = entry_points;
        module.execution_modes = execution_modes;
        module.debug = debug;
        module.annotations = annotations;
        module.globals = globals;
        module.funcs = funcs;
        Ok(module)
    }

    /// Whether the module declares `OpCapability` `cap`.
    pub fn has_capability(&self, cap: u32) -> bool {
        self.capabilities.iter().any(|inst| inst.nth_short_imm(0) == Some(cap))
    }

    /// The addressing model from `OpMemoryModel`.
    pub fn addressing_model(&self) -> u32 {
        self.memory_model.nth_short_imm(0).unwrap_or(0)
    }
}
