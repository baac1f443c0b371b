//! GPU-assisted validation for Vulkan: SPIR-V instrumentation, function
//! linking, and versioned descriptor-state snapshots.
//!
//! The pieces, leaf-first:
//! * [`Module`]: mutable, navigable SPIR-V (parsed by [`spv::lower`], serialized
//!   by [`spv::lift`])
//! * [`passes`]: instrumentation passes (each finding one kind of risky operation)
//!   and the [`passes::link`] function linker
//! * [`instrument`]: the instrumentation session tying passes, the [`library`]
//!   of validation functions, and the linker together
//! * [`bridge`]: per-call state carried across the four interception phases
//! * [`descriptor`]: descriptor sets and their GPU-readable snapshots
//! * [`layer`]: the device-level entry points used by the interception layer

use indexmap::{IndexMap, IndexSet};
use std::hash::BuildHasherDefault;

pub mod bridge;
pub mod config;
mod context;
pub mod descriptor;
pub mod diag;
pub mod gpu;
pub mod instrument;
pub mod interface;
pub mod layer;
pub mod library;
pub mod passes {
    // NOTE inline `mod` to avoid adding APIs here, it's just namespacing.

    pub mod descriptor;
    pub mod device_address;
    pub mod indexed_access;
    pub mod link;
    pub mod ray_query;
}
pub mod spv;

pub use context::{
    AccessPath, Context, Defs, IndexStep, IntType, LocalDefs, PointerInfo, SourceLoc,
};
pub use spv::read::ParseError;

pub type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
pub type FxIndexSet<V> = IndexSet<V, BuildHasherDefault<rustc_hash::FxHasher>>;

/// Largest ID bound accepted when parsing (the universal SPIR-V limit for
/// IDs is `0x3f_ffff`), which leaves the rest of the `u32` range for `alloc_id`.
pub const MAX_ID_BOUND: u32 = 0x40_0000;

// HACK this only serves to disallow modifying the ID bound of a `Module`
// other than through `alloc_id`.
mod sealed {
    use super::*;

    /// One SPIR-V module, grouped by logical layout sections.
    ///
    /// `OpLine`/`OpNoLine` in the global section are kept in `globals`, in their
    /// original position, and inside functions they're kept as instructions.
    #[derive(Clone)]
    pub struct Module {
        header: spv::Header,

        pub capabilities: Vec<spv::Inst>,
        pub extensions: Vec<spv::Inst>,
        pub ext_inst_imports: Vec<spv::Inst>,
        pub memory_model: spv::Inst,
        pub entry_points: Vec<spv::Inst>,
        pub execution_modes: Vec<spv::Inst>,

        /// Debug instructions (`OpString`, `OpSource*`, `OpName`, `OpMemberName`,
        /// `OpModuleProcessed`), in their original order.
        pub debug: Vec<spv::Inst>,
        pub annotations: Vec<spv::Inst>,

        /// Types, constants, global variables (and `OpUndef`/`OpLine`/`OpNoLine`).
        pub globals: Vec<spv::Inst>,

        pub funcs: Vec<Func>,
    }

    impl Module {
        pub fn new(header: spv::Header, memory_model: spv::Inst) -> Self {
            Self {
                header: spv::Header { bound: header.bound.max(1), ..header },

                capabilities: vec![],
                extensions: vec![],
                ext_inst_imports: vec![],
                memory_model,
                entry_points: vec![],
                execution_modes: vec![],
                debug: vec![],
                annotations: vec![],
                globals: vec![],
                funcs: vec![],
            }
        }

        pub fn header(&self) -> &spv::Header {
            &self.header
        }

        pub fn id_bound(&self) -> u32 {
            self.header.bound
        }

        /// Return a fresh ID, never used before in this module.
        pub fn alloc_id(&mut self) -> spv::Id {
            let id = spv::Id::new(self.header.bound).expect("`Module` ID bound starts at 1");
            self.header.bound =
                self.header.bound.checked_add(1).expect("`Module` ID space exhausted");
            id
        }
    }
}
pub use sealed::Module;

/// A function (definition or import declaration).
#[derive(Clone)]
pub struct Func {
    /// `OpFunction`.
    pub def: spv::Inst,

    /// `OpFunctionParameter`s (with any interleaved `OpLine`/`OpNoLine`).
    pub params: Vec<spv::Inst>,

    /// Empty for function declarations (imports).
    pub blocks: Vec<Block>,

    /// `OpFunctionEnd`.
    pub end: spv::Inst,
}

impl Func {
    pub fn id(&self) -> Option<spv::Id> {
        self.def.result_id
    }

    pub fn param_ids(&self) -> impl Iterator<Item = spv::Id> + '_ {
        let wk = &spv::spec::Spec::get().well_known;
        self.params
            .iter()
            .filter(|inst| inst.opcode == wk.OpFunctionParameter)
            .filter_map(|param| param.result_id)
    }

    /// Every instruction of the function, in module order.
    pub fn all_insts(&self) -> impl Iterator<Item = &spv::Inst> {
        std::iter::once(&self.def)
            .chain(&self.params)
            .chain(
                self.blocks
                    .iter()
                    .flat_map(|block| std::iter::once(&block.label).chain(&block.insts)),
            )
            .chain(std::iter::once(&self.end))
    }

    pub fn all_insts_mut(&mut self) -> impl Iterator<Item = &mut spv::Inst> {
        std::iter::once(&mut self.def)
            .chain(&mut self.params)
            .chain(
                self.blocks
                    .iter_mut()
                    .flat_map(|block| std::iter::once(&mut block.label).chain(&mut block.insts)),
            )
            .chain(std::iter::once(&mut self.end))
    }
}

/// A basic block: `OpLabel`, followed by instructions ending in a terminator.
#[derive(Clone)]
pub struct Block {
    /// `OpLabel`.
    pub label: spv::Inst,
    pub insts: Vec<spv::Inst>,
}

impl Block {
    pub fn new(label_id: spv::Id) -> Self {
        let wk = &spv::spec::Spec::get().well_known;
        Self { label: spv::Inst::from(wk.OpLabel).with_result(None, label_id), insts: vec![] }
    }

    pub fn label_id(&self) -> spv::Id {
        // NOTE lowering only ever builds blocks from `OpLabel`s.
        self.label.result_id.unwrap_or(spv::Id::MIN)
    }

    pub fn terminator(&self) -> Option<&spv::Inst> {
        self.insts.last().filter(|inst| inst.opcode.is_block_terminator())
    }

    /// The merge instruction (`OpSelectionMerge`/`OpLoopMerge`) right before
    /// the terminator, if any.
    pub fn merge(&self) -> Option<&spv::Inst> {
        let wk = &spv::spec::Spec::get().well_known;
        let [.., merge, _] = &self.insts[..] else { return None };
        [wk.OpSelectionMerge, wk.OpLoopMerge].contains(&merge.opcode).then_some(merge)
    }

    pub fn is_loop_header(&self) -> bool {
        let wk = &spv::spec::Spec::get().well_known;
        self.merge().is_some_and(|merge| merge.opcode == wk.OpLoopMerge)
    }

    /// Number of leading `OpPhi`s (with any interleaved `OpLine`/`OpNoLine`).
    pub fn phi_count(&self) -> usize {
        let wk = &spv::spec::Spec::get().well_known;
        let leading = self
            .insts
            .iter()
            .take_while(|inst| [wk.OpPhi, wk.OpLine, wk.OpNoLine].contains(&inst.opcode));
        leading
            .enumerate()
            .filter(|(_, inst)| inst.opcode == wk.OpPhi)
            .last()
            .map_or(0, |(i, _)| i + 1)
    }

    /// Labels of the blocks this block's terminator may branch to.
    pub fn successors(&self) -> impl Iterator<Item = spv::Id> + '_ {
        let wk = &spv::spec::Spec::get().well_known;
        self.terminator().into_iter().flat_map(move |inst| {
            let skip_selector =
                [wk.OpBranchConditional, wk.OpSwitch].contains(&inst.opcode) as usize;
            inst.ids().skip(skip_selector)
        })
    }
}

/// Position of an instruction inside a block (`inst` indexes [`Block::insts`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstLoc {
    pub func: usize,
    pub block: usize,
    pub inst: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockLoc {
    pub func: usize,
    pub block: usize,
}

impl InstLoc {
    pub fn block_loc(self) -> BlockLoc {
        BlockLoc { func: self.func, block: self.block }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    #[error("no block at {0:?}")]
    NoSuchBlock(BlockLoc),

    #[error("position {0:?} is past the block terminator")]
    AfterTerminator(InstLoc),

    #[error("position {0:?} is between a merge instruction and its branch")]
    AfterMerge(InstLoc),

    #[error("position {0:?} is among the block's `OpPhi`s")]
    AmongPhis(InstLoc),

    #[error("`OpPhi` at {0:?} would follow non-`OpPhi` instructions")]
    PhiAfterBody(InstLoc),

    #[error("`OpVariable` at {0:?} outside the entry block's variable prologue")]
    VariableOutsidePrologue(InstLoc),

    #[error("position {0:?} is inside the entry block's variable prologue")]
    InsidePrologue(InstLoc),

    #[error("{} cannot be inserted (it changes the block structure)", .0.name())]
    Structural(spv::spec::Opcode),

    #[error("block {0:?} is a loop header")]
    LoopHeader(BlockLoc),
}

impl Module {
    pub fn block(&self, loc: BlockLoc) -> Option<&Block> {
        self.funcs.get(loc.func)?.blocks.get(loc.block)
    }

    pub fn block_mut(&mut self, loc: BlockLoc) -> Option<&mut Block> {
        self.funcs.get_mut(loc.func)?.blocks.get_mut(loc.block)
    }

    pub fn inst(&self, loc: InstLoc) -> Option<&spv::Inst> {
        self.block(loc.block_loc())?.insts.get(loc.inst)
    }

    /// Find where `id` is defined as a function (returning its index in `funcs`).
    pub fn func_index(&self, id: spv::Id) -> Option<usize> {
        self.funcs.iter().position(|func| func.id() == Some(id))
    }

    fn check_insert_pos(&self, loc: InstLoc, opcode: spv::spec::Opcode) -> Result<(), InsertError> {
        let wk = &spv::spec::Spec::get().well_known;

        let block = self.block(loc.block_loc()).ok_or(InsertError::NoSuchBlock(loc.block_loc()))?;

        if opcode.is_block_terminator()
            || [wk.OpLabel, wk.OpSelectionMerge, wk.OpLoopMerge, wk.OpFunction, wk.OpFunctionEnd]
                .contains(&opcode)
        {
            return Err(InsertError::Structural(opcode));
        }

        let body_end = block.insts.len().saturating_sub(1);
        if loc.inst > body_end {
            return Err(InsertError::AfterTerminator(loc));
        }
        if block.merge().is_some() && loc.inst == body_end {
            return Err(InsertError::AfterMerge(loc));
        }

        let phi_count = block.phi_count();
        if opcode == wk.OpPhi {
            if loc.inst > phi_count {
                return Err(InsertError::PhiAfterBody(loc));
            }
        } else if loc.inst < phi_count {
            return Err(InsertError::AmongPhis(loc));
        }

        // Function-local variables must all be at the start of the entry block.
        let var_count = if loc.block == 0 {
            block.insts.iter().take_while(|inst| inst.opcode == wk.OpVariable).count()
        } else {
            0
        };
        if opcode == wk.OpVariable {
            if loc.block != 0 || loc.inst > var_count {
                return Err(InsertError::VariableOutsidePrologue(loc));
            }
        } else if loc.inst < var_count {
            return Err(InsertError::InsidePrologue(loc));
        }

        Ok(())
    }

    /// Insert `inst` before the instruction at `loc` (which must not move any
    /// merge instruction or terminator away from the end of its block).
    pub fn insert_inst(&mut self, loc: InstLoc, inst: spv::Inst) -> Result<(), InsertError> {
        self.check_insert_pos(loc, inst.opcode)?;
        if let Some(block) = self.block_mut(loc.block_loc()) {
            block.insts.insert(loc.inst, inst);
        }
        Ok(())
    }

    /// Split the block at `loc`, moving `insts[loc.inst..]` (including any merge
    /// instruction and the terminator) into a new block labeled `remainder_label`,
    /// placed right after the original block, which gets `head_tail` appended
    /// (typically a branch to `remainder_label`, or to blocks leading there).
    ///
    /// `OpPhi`s in the successors of the moved terminator are updated to name
    /// the new block as their predecessor.
    pub fn split_block(
        &mut self,
        loc: InstLoc,
        remainder_label: spv::Id,
        head_tail: impl IntoIterator<Item = spv::Inst>,
    ) -> Result<BlockLoc, InsertError> {
        let wk = &spv::spec::Spec::get().well_known;

        // Any non-structural, non-phi opcode checks the position itself.
        self.check_insert_pos(loc, wk.OpNop)?;
        let block = self.block(loc.block_loc()).ok_or(InsertError::NoSuchBlock(loc.block_loc()))?;
        if block.is_loop_header() {
            return Err(InsertError::LoopHeader(loc.block_loc()));
        }
        let head_label = block.label_id();
        let successors: Vec<_> = block.successors().collect();

        let func = &mut self.funcs[loc.func];
        let head = &mut func.blocks[loc.block];
        let mut remainder = Block::new(remainder_label);
        remainder.insts = head.insts.split_off(loc.inst);
        head.insts.extend(head_tail);
        func.blocks.insert(loc.block + 1, remainder);

        for block in &mut func.blocks {
            if !successors.contains(&block.label_id()) {
                continue;
            }
            for phi in block.insts.iter_mut().filter(|inst| inst.opcode == wk.OpPhi) {
                // `OpPhi` operands are `(value, parent)` pairs.
                for (i, operand) in phi.operands.iter_mut().enumerate() {
                    if i % 2 == 1 && *operand == spv::Operand::Id(head_label) {
                        *operand = spv::Operand::Id(remainder_label);
                    }
                }
            }
        }

        Ok(BlockLoc { func: loc.func, block: loc.block + 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spv::spec::Spec;

    fn id(x: u32) -> spv::Id {
        spv::Id::new(x).unwrap()
    }

    fn module_with_block(insts: Vec<spv::Inst>) -> Module {
        let wk = &Spec::get().well_known;
        let header = spv::Header { version_major: 1, version_minor: 3, generator: 0, bound: 100 };
        let mut module = Module::new(header, spv::Inst::from(wk.OpMemoryModel));
        let mut block = Block::new(id(10));
        block.insts = insts;
        module.funcs.push(Func {
            def: spv::Inst::from(wk.OpFunction).with_result(Some(id(1)), id(2)),
            params: vec![],
            blocks: vec![block],
            end: spv::Inst::from(wk.OpFunctionEnd),
        });
        module
    }

    #[test]
    fn alloc_id_never_repeats() {
        let wk = &Spec::get().well_known;
        let header = spv::Header { version_major: 1, version_minor: 0, generator: 0, bound: 5 };
        let mut module = Module::new(header, spv::Inst::from(wk.OpMemoryModel));
        let a = module.alloc_id();
        let b = module.alloc_id();
        assert_eq!((a.get(), b.get()), (5, 6));
        assert_eq!(module.id_bound(), 7);
    }

    #[test]
    fn insert_respects_merge_and_terminator() {
        let wk = &Spec::get().well_known;
        let mut module = module_with_block(vec![
            spv::Inst::from(wk.OpNop),
            spv::Inst::from(wk.OpSelectionMerge)
                .with_ids([id(11)])
                .with_imm(spv::spec::OperandKind::SelectionControl, 0),
            spv::Inst::from(wk.OpBranchConditional).with_ids([id(3), id(11), id(11)]),
        ]);
        let at = |inst| InstLoc { func: 0, block: 0, inst };

        assert!(matches!(
            module.insert_inst(at(3), spv::Inst::from(wk.OpNop)),
            Err(InsertError::AfterTerminator(_))
        ));
        assert!(matches!(
            module.insert_inst(at(2), spv::Inst::from(wk.OpNop)),
            Err(InsertError::AfterMerge(_))
        ));
        assert!(matches!(
            module.insert_inst(at(0), spv::Inst::from(wk.OpReturn)),
            Err(InsertError::Structural(_))
        ));
        module.insert_inst(at(1), spv::Inst::from(wk.OpNop)).unwrap();
        assert_eq!(module.funcs[0].blocks[0].insts.len(), 4);
    }

    #[test]
    fn split_block_moves_terminator_and_fixes_successor_phis() {
        let wk = &Spec::get().well_known;
        let mut module = module_with_block(vec![
            spv::Inst::from(wk.OpNop),
            spv::Inst::from(wk.OpBranch).with_ids([id(20)]),
        ]);
        let mut succ = Block::new(id(20));
        succ.insts = vec![
            spv::Inst::from(wk.OpPhi).with_result(Some(id(1)), id(21)).with_ids([id(4), id(10)]),
            spv::Inst::from(wk.OpReturn),
        ];
        module.funcs[0].blocks.push(succ);

        let remainder = module
            .split_block(
                InstLoc { func: 0, block: 0, inst: 1 },
                id(30),
                [spv::Inst::from(wk.OpBranch).with_ids([id(30)])],
            )
            .unwrap();
        assert_eq!(remainder, BlockLoc { func: 0, block: 1 });

        let blocks = &module.funcs[0].blocks;
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].successors().collect::<Vec<_>>(), [id(30)]);
        assert_eq!(blocks[1].label_id(), id(30));
        assert_eq!(blocks[2].insts[0].ids().collect::<Vec<_>>(), [id(4), id(30)]);
    }
}
