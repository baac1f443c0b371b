use crate::spv::{self, spec};
use crate::{Func, Module};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Context object for adding global definitions to one [`Module`].
///
/// Types and (non-specialization) constants without an identity are
/// deduplicated structurally, both against the module's original definitions,
/// and against those added later through `intern`. Decorated aggregates
/// (e.g. `Block` structs) have an identity, and are never deduplicated.
pub struct Context {
    interned: FxHashMap<GlobalKey, spv::Id>,
}

/// Everything but the result ID of a global definition.
type GlobalKey = (spec::Opcode, Option<spv::Id>, SmallVec<[spv::Operand; 4]>);

pub(crate) fn is_internable(opcode: spec::Opcode) -> bool {
    let wk = &spec::Spec::get().well_known;

    let spec_consts = [
        wk.OpSpecConstantTrue,
        wk.OpSpecConstantFalse,
        wk.OpSpecConstant,
        wk.OpSpecConstantComposite,
        wk.OpSpecConstantOp,
    ];
    match opcode.category() {
        spec::InstructionCategory::Type => opcode != wk.OpTypeForwardPointer,
        spec::InstructionCategory::Const => !spec_consts.contains(&opcode),
        _ => false,
    }
}

impl Context {
    pub fn for_module(module: &Module) -> Self {
        let decorated: FxHashSet<_> =
            module.annotations.iter().filter_map(|inst| inst.nth_id(0)).collect();

        let mut interned = FxHashMap::default();
        for inst in &module.globals {
            let Some(id) = inst.result_id else { continue };
            if is_internable(inst.opcode) && !decorated.contains(&id) {
                let key = (inst.opcode, inst.result_type_id, inst.operands.clone());
                // The first definition wins, later duplicates are only ever
                // referenced by their original users.
                interned.entry(key).or_insert(id);
            }
        }

        Self { interned }
    }

    /// Return the ID of a global equivalent to `inst` (whose `result_id` is
    /// ignored), appending `inst` to `module.globals` if there isn't one yet.
    pub fn intern(&mut self, module: &mut Module, mut inst: spv::Inst) -> spv::Id {
        debug_assert!(is_internable(inst.opcode));

        let key = (inst.opcode, inst.result_type_id, inst.operands.clone());
        if let Some(&id) = self.interned.get(&key) {
            return id;
        }
        let id = module.alloc_id();
        inst.result_id = Some(id);
        module.globals.push(inst);
        self.interned.insert(key, id);
        id
    }

    /// Append `inst` to `module.globals` with a fresh ID, without deduplication
    /// (for definitions about to be decorated, or global variables).
    pub fn define_fresh(&mut self, module: &mut Module, mut inst: spv::Inst) -> spv::Id {
        let id = module.alloc_id();
        inst.result_id = Some(id);
        module.globals.push(inst);
        id
    }

    pub fn type_void(&mut self, module: &mut Module) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        self.intern(module, wk.OpTypeVoid.into())
    }

    pub fn type_bool(&mut self, module: &mut Module) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        self.intern(module, wk.OpTypeBool.into())
    }

    pub fn type_int(&mut self, module: &mut Module, width: u32, signed: bool) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let inst = spv::Inst::from(wk.OpTypeInt)
            .with_imm(spec::OperandKind::LiteralInteger, width)
            .with_imm(spec::OperandKind::LiteralInteger, signed as u32);
        self.intern(module, inst)
    }

    pub fn type_u32(&mut self, module: &mut Module) -> spv::Id {
        self.type_int(module, 32, false)
    }

    pub fn type_float(&mut self, module: &mut Module, width: u32) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let inst =
            spv::Inst::from(wk.OpTypeFloat).with_imm(spec::OperandKind::LiteralInteger, width);
        self.intern(module, inst)
    }

    pub fn type_vector(&mut self, module: &mut Module, elem: spv::Id, count: u32) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let inst = spv::Inst::from(wk.OpTypeVector)
            .with_ids([elem])
            .with_imm(spec::OperandKind::LiteralInteger, count);
        self.intern(module, inst)
    }

    pub fn type_pointer(
        &mut self,
        module: &mut Module,
        storage_class: u32,
        pointee: spv::Id,
    ) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let inst = spv::Inst::from(wk.OpTypePointer)
            .with_imm(spec::OperandKind::StorageClass, storage_class)
            .with_ids([pointee]);
        self.intern(module, inst)
    }

    pub fn type_function(
        &mut self,
        module: &mut Module,
        ret: spv::Id,
        params: impl IntoIterator<Item = spv::Id>,
    ) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let inst = spv::Inst::from(wk.OpTypeFunction).with_ids([ret]).with_ids(params);
        self.intern(module, inst)
    }

    pub fn const_u32(&mut self, module: &mut Module, value: u32) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let ty = self.type_u32(module);
        let inst = spv::Inst::from(wk.OpConstant)
            .with_imm(spec::OperandKind::LiteralContextDependentNumber, value);
        self.intern(module, spv::Inst { result_type_id: Some(ty), ..inst })
    }

    pub fn const_u64(&mut self, module: &mut Module, value: u64) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let ty = self.type_int(module, 64, false);
        let kind = spec::OperandKind::LiteralContextDependentNumber;
        let inst = spv::Inst::from(wk.OpConstant).with_operands([
            spv::Operand::Imm(spv::Imm::LongStart(kind, value as u32)),
            spv::Operand::Imm(spv::Imm::LongCont(kind, (value >> 32) as u32)),
        ]);
        self.intern(module, spv::Inst { result_type_id: Some(ty), ..inst })
    }

    pub fn const_f32(&mut self, module: &mut Module, value: f32) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let ty = self.type_float(module, 32);
        let inst = spv::Inst::from(wk.OpConstant)
            .with_imm(spec::OperandKind::LiteralContextDependentNumber, value.to_bits());
        self.intern(module, spv::Inst { result_type_id: Some(ty), ..inst })
    }

    pub fn const_bool(&mut self, module: &mut Module, value: bool) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let ty = self.type_bool(module);
        let opcode = if value { wk.OpConstantTrue } else { wk.OpConstantFalse };
        self.intern(module, spv::Inst::from(opcode).with_result_type(ty))
    }

    pub fn const_null(&mut self, module: &mut Module, ty: spv::Id) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        self.intern(module, spv::Inst::from(wk.OpConstantNull).with_result_type(ty))
    }
}

/// Storage class and pointee type of an `OpTypePointer`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PointerInfo {
    pub storage_class: u32,
    pub pointee: spv::Id,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IntType {
    pub width: u32,
    pub signed: bool,
}

/// A pointer, flattened through any number of (non-`Ptr`) access chains.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPath {
    /// The base pointer (e.g. an `OpVariable`, or a function parameter).
    pub root: spv::Id,

    pub indices: SmallVec<[spv::Id; 4]>,
}

/// One step of indexing into a composite type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexStep {
    /// `OpTypeArray`, with its length (an integer constant ID).
    Array { index: spv::Id, len: spv::Id },
    RuntimeArray { index: spv::Id },
    Vector { index: spv::Id, count: u32 },
    Matrix { index: spv::Id, columns: u32 },
    Struct { member: u32 },
}

type DecorationList = SmallVec<[(u32, SmallVec<[u32; 2]>); 2]>;

/// Module-wide definitions, decorations and debug strings, indexed by ID.
///
/// This is a snapshot: definitions added to the module later are not seen.
#[derive(Default)]
pub struct Defs {
    globals: FxHashMap<spv::Id, spv::Inst>,
    decorations: FxHashMap<spv::Id, DecorationList>,
    member_decorations: FxHashMap<(spv::Id, u32), DecorationList>,
    strings: FxHashMap<spv::Id, String>,
    names: FxHashMap<spv::Id, String>,
}

impl Defs {
    pub fn new(module: &Module) -> Self {
        let wk = &spec::Spec::get().well_known;

        let mut defs = Defs::default();
        for inst in &module.globals {
            if let Some(id) = inst.result_id {
                defs.globals.insert(id, inst.clone());
            }
        }
        for inst in &module.annotations {
            let Some(target) = inst.nth_id(0) else { continue };
            let literals = |skip| -> SmallVec<[u32; 2]> {
                inst.imms().skip(skip).map(|imm| imm.word()).collect()
            };
            if inst.opcode == wk.OpDecorate {
                if let Some(decoration) = inst.nth_short_imm(0) {
                    defs.decorations.entry(target).or_default().push((decoration, literals(1)));
                }
            } else if inst.opcode == wk.OpMemberDecorate {
                if let (Some(member), Some(decoration)) =
                    (inst.nth_short_imm(0), inst.nth_short_imm(1))
                {
                    defs.member_decorations
                        .entry((target, member))
                        .or_default()
                        .push((decoration, literals(2)));
                }
            }
        }
        for inst in &module.debug {
            if inst.opcode == wk.OpString {
                if let (Some(id), Some(s)) = (inst.result_id, inst.literal_string()) {
                    defs.strings.insert(id, s);
                }
            } else if inst.opcode == wk.OpName {
                if let (Some(id), Some(s)) = (inst.nth_id(0), inst.literal_string()) {
                    defs.names.insert(id, s);
                }
            }
        }
        defs
    }

    pub fn global(&self, id: spv::Id) -> Option<&spv::Inst> {
        self.globals.get(&id)
    }

    /// The literal parameters of `decoration` on `id`, if present.
    pub fn decoration(&self, id: spv::Id, decoration: u32) -> Option<&[u32]> {
        let (_, params) = self.decorations.get(&id)?.iter().find(|(d, _)| *d == decoration)?;
        Some(params)
    }

    pub fn has_decoration(&self, id: spv::Id, decoration: u32) -> bool {
        self.decoration(id, decoration).is_some()
    }

    pub fn member_decoration(&self, id: spv::Id, member: u32, decoration: u32) -> Option<&[u32]> {
        let (_, params) =
            self.member_decorations.get(&(id, member))?.iter().find(|(d, _)| *d == decoration)?;
        Some(params)
    }

    pub fn string(&self, id: spv::Id) -> Option<&str> {
        self.strings.get(&id).map(|s| &s[..])
    }

    pub fn name(&self, id: spv::Id) -> Option<&str> {
        self.names.get(&id).map(|s| &s[..])
    }

    pub fn pointer_info(&self, ty: spv::Id) -> Option<PointerInfo> {
        let wk = &spec::Spec::get().well_known;
        let inst = self.global(ty).filter(|inst| inst.opcode == wk.OpTypePointer)?;
        Some(PointerInfo { storage_class: inst.nth_short_imm(0)?, pointee: inst.nth_id(0)? })
    }

    pub fn int_type(&self, ty: spv::Id) -> Option<IntType> {
        let wk = &spec::Spec::get().well_known;
        let inst = self.global(ty).filter(|inst| inst.opcode == wk.OpTypeInt)?;
        Some(IntType { width: inst.nth_short_imm(0)?, signed: inst.nth_short_imm(1)? != 0 })
    }

    /// The value of an integer `OpConstant` (zero-extended), if `id` is one.
    pub fn const_u64(&self, id: spv::Id) -> Option<u64> {
        let wk = &spec::Spec::get().well_known;
        let inst = self.global(id).filter(|inst| inst.opcode == wk.OpConstant)?;
        let ty = self.int_type(inst.result_type_id?)?;
        let mut words = inst.imms().map(|imm| imm.word());
        let lo = u64::from(words.next()?);
        let hi = u64::from(words.next().unwrap_or(0));
        let value = lo | (hi << 32);
        Some(if ty.width < 64 { value & ((1 << ty.width) - 1) } else { value })
    }

    /// `(set, binding)` of a descriptor variable.
    pub fn descriptor_binding(&self, var: spv::Id) -> Option<(u32, u32)> {
        let wk = &spec::Spec::get().well_known;
        let set = *self.decoration(var, wk.DescriptorSet)?.first()?;
        let binding = *self.decoration(var, wk.Binding)?.first()?;
        Some((set, binding))
    }

    /// Storage class of a global `OpVariable`.
    pub fn var_storage_class(&self, var: spv::Id) -> Option<u32> {
        let wk = &spec::Spec::get().well_known;
        let inst = self.global(var).filter(|inst| inst.opcode == wk.OpVariable)?;
        inst.nth_short_imm(0)
    }

    /// Type of a value, defined either globally or in `locals`.
    pub fn type_of(&self, locals: &LocalDefs<'_>, id: spv::Id) -> Option<spv::Id> {
        locals.get(id).or_else(|| self.global(id))?.result_type_id
    }

    /// The sequence of composite types indexed by `indices`, starting at `ty`.
    ///
    /// Returns `None` for shapes that can't be followed (e.g. a non-constant
    /// struct member index).
    pub fn index_steps(&self, mut ty: spv::Id, indices: &[spv::Id]) -> Option<Vec<IndexStep>> {
        let wk = &spec::Spec::get().well_known;

        let mut steps = Vec::with_capacity(indices.len());
        for &index in indices {
            let inst = self.global(ty)?;
            let (step, elem) = if inst.opcode == wk.OpTypeArray {
                (IndexStep::Array { index, len: inst.nth_id(1)? }, inst.nth_id(0)?)
            } else if inst.opcode == wk.OpTypeRuntimeArray {
                (IndexStep::RuntimeArray { index }, inst.nth_id(0)?)
            } else if inst.opcode == wk.OpTypeVector {
                (IndexStep::Vector { index, count: inst.nth_short_imm(0)? }, inst.nth_id(0)?)
            } else if inst.opcode == wk.OpTypeMatrix {
                (IndexStep::Matrix { index, columns: inst.nth_short_imm(0)? }, inst.nth_id(0)?)
            } else if inst.opcode == wk.OpTypeStruct {
                let member = u32::try_from(self.const_u64(index)?).ok()?;
                (IndexStep::Struct { member }, inst.nth_id(member as usize)?)
            } else {
                return None;
            };
            steps.push(step);
            ty = elem;
        }
        Some(steps)
    }

    /// Size in bytes of `ty`, as laid out in memory (explicit layout
    /// decorations are followed where present).
    pub fn size_of(&self, ty: spv::Id) -> Option<u32> {
        let wk = &spec::Spec::get().well_known;

        let inst = self.global(ty)?;
        let opcode = inst.opcode;
        if [wk.OpTypeInt, wk.OpTypeFloat].contains(&opcode) {
            Some(inst.nth_short_imm(0)? / 8)
        } else if [wk.OpTypeVector, wk.OpTypeMatrix].contains(&opcode) {
            self.size_of(inst.nth_id(0)?)?.checked_mul(inst.nth_short_imm(0)?)
        } else if opcode == wk.OpTypeArray {
            let len = u32::try_from(self.const_u64(inst.nth_id(1)?)?).ok()?;
            let stride = match self.decoration(ty, wk.ArrayStride) {
                Some(&[stride]) => stride,
                _ => self.size_of(inst.nth_id(0)?)?,
            };
            len.checked_mul(stride)
        } else if opcode == wk.OpTypeStruct {
            let mut end = 0u32;
            for (member, member_ty) in inst.ids().enumerate() {
                let offset = match self.member_decoration(ty, member as u32, wk.Offset) {
                    Some(&[offset]) => offset,
                    _ => end,
                };
                end = end.max(offset.checked_add(self.size_of(member_ty)?)?);
            }
            Some(end)
        } else if opcode == wk.OpTypePointer {
            let PointerInfo { storage_class, .. } = self.pointer_info(ty)?;
            (storage_class == wk.PhysicalStorageBuffer).then_some(8)
        } else {
            None
        }
    }

    /// Whether `OpConstantNull` can be used with `ty`.
    pub fn is_nullable(&self, ty: spv::Id) -> bool {
        let wk = &spec::Spec::get().well_known;

        let Some(inst) = self.global(ty) else { return false };
        let opcode = inst.opcode;
        if [wk.OpTypeBool, wk.OpTypeInt, wk.OpTypeFloat].contains(&opcode) {
            true
        } else if [wk.OpTypeVector, wk.OpTypeMatrix, wk.OpTypeArray].contains(&opcode) {
            inst.nth_id(0).is_some_and(|elem| self.is_nullable(elem))
        } else if opcode == wk.OpTypeStruct {
            inst.ids().all(|member| self.is_nullable(member))
        } else {
            false
        }
    }

    /// The source location of the last `OpLine` (not cancelled by an `OpNoLine`)
    /// in `insts`.
    pub fn source_loc<'a>(
        &self,
        insts: impl DoubleEndedIterator<Item = &'a spv::Inst>,
    ) -> Option<SourceLoc> {
        let wk = &spec::Spec::get().well_known;

        let line = insts.rev().find(|inst| [wk.OpLine, wk.OpNoLine].contains(&inst.opcode))?;
        if line.opcode != wk.OpLine {
            return None;
        }
        Some(SourceLoc {
            file: self.string(line.nth_id(0)?)?.to_string(),
            line: line.nth_short_imm(0)?,
            column: line.nth_short_imm(1)?,
        })
    }
}

/// Source location from `OpLine` debuginfo.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Definitions local to one function (parameters and instruction results).
pub struct LocalDefs<'a> {
    defs: FxHashMap<spv::Id, &'a spv::Inst>,
}

impl<'a> LocalDefs<'a> {
    pub fn new(func: &'a Func) -> Self {
        let defs = func
            .params
            .iter()
            .chain(func.blocks.iter().flat_map(|block| &block.insts))
            .filter_map(|inst| Some((inst.result_id?, inst)))
            .collect();
        Self { defs }
    }

    pub fn get(&self, id: spv::Id) -> Option<&'a spv::Inst> {
        self.defs.get(&id).copied()
    }

    /// Flatten `ptr` through `OpAccessChain`/`OpInBoundsAccessChain` (and
    /// `OpCopyObject`), down to its root pointer.
    pub fn access_path(&self, ptr: spv::Id) -> AccessPath {
        let wk = &spec::Spec::get().well_known;

        let mut root = ptr;
        let mut chains = SmallVec::<[&spv::Inst; 4]>::new();
        while let Some(inst) = self.get(root) {
            if [wk.OpAccessChain, wk.OpInBoundsAccessChain].contains(&inst.opcode) {
                chains.push(inst);
            } else if inst.opcode != wk.OpCopyObject {
                break;
            }
            match inst.nth_id(0) {
                Some(base) => root = base,
                None => break,
            }
        }
        let indices = chains.iter().rev().flat_map(|inst| inst.ids().skip(1)).collect();
        AccessPath { root, indices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spv::Header;

    fn empty_module() -> Module {
        let wk = &spec::Spec::get().well_known;
        let header = Header { version_major: 1, version_minor: 3, generator: 0, bound: 1 };
        Module::new(header, spv::Inst::from(wk.OpMemoryModel))
    }

    #[test]
    fn interning_deduplicates_structurally() {
        let mut module = empty_module();
        let mut cx = Context::for_module(&module);
        let a = cx.const_u32(&mut module, 7);
        let b = cx.const_u32(&mut module, 7);
        let c = cx.const_u32(&mut module, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // `uint`, `7`, `8`.
        assert_eq!(module.globals.len(), 3);

        let mut cx = Context::for_module(&module);
        assert_eq!(cx.const_u32(&mut module, 8), c);
        assert_eq!(module.globals.len(), 3);
    }

    #[test]
    fn sizes_follow_layout_decorations() {
        let wk = &spec::Spec::get().well_known;
        let mut module = empty_module();
        let mut cx = Context::for_module(&module);
        let uint = cx.type_u32(&mut module);
        let vec3 = cx.type_vector(&mut module, uint, 3);
        let four = cx.const_u32(&mut module, 4);
        let array =
            cx.define_fresh(&mut module, spv::Inst::from(wk.OpTypeArray).with_ids([vec3, four]));
        module.annotations.push(
            spv::Inst::from(wk.OpDecorate)
                .with_ids([array])
                .with_imm(spec::OperandKind::Decoration, wk.ArrayStride)
                .with_imm(spec::OperandKind::LiteralInteger, 16),
        );

        let defs = Defs::new(&module);
        assert_eq!(defs.size_of(vec3), Some(12));
        assert_eq!(defs.size_of(array), Some(64));
        assert!(defs.is_nullable(array));
    }
}
