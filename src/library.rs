//! The library of validation functions linked into instrumented shaders.
//!
//! The library is a SPIR-V module (built once, on first use), exporting each
//! function through `LinkageAttributes`, and declaring the two instrumentation
//! buffers (see [`interface`](crate::interface)) in descriptor set
//! [`interface::DEFAULT_RESERVED_SET`] (rewritten by the linker as needed).
//!
//! Every check function takes `(unique_shader_id, inst_index, ...)` first, and
//! reports failures through [`LOG_ERROR`] (shared by all of them).

use crate::context::Context;
use crate::interface::{self, ErrorCode};
use crate::spv::spec::{self, OperandKind};
use crate::spv::{self, write::EmitError};
use crate::{Block, Defs, FxIndexMap, Func, Module, ParseError};
use lazy_static::lazy_static;

/// `(unique_shader_id, inst_index, code, p0, p1, p2, p3)`.
pub const LOG_ERROR: &str = "inst_log_error";

/// `(unique_shader_id, inst_index, set, binding, index) -> bool`.
pub const BINDLESS_CHECK: &str = "inst_bindless_check";

/// `(unique_shader_id, inst_index, index, bound) -> bool`.
pub const INDEX_CHECK: &str = "inst_index_check";

/// `(unique_shader_id, inst_index, address: u64, size) -> bool`.
pub const BUFFER_ADDRESS_CHECK: &str = "inst_buffer_address_check";

/// `(unique_shader_id, inst_index, flags, origin: vec3, tmin: f32, direction: vec3, tmax: f32)`,
/// returning `bool` (like all the other checks).
pub const RAY_QUERY_CHECK: &str = "inst_ray_query_check";

/// Every function exported by the library.
pub const EXPORTS: [&str; 5] =
    [LOG_ERROR, BINDLESS_CHECK, INDEX_CHECK, BUFFER_ADDRESS_CHECK, RAY_QUERY_CHECK];

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("failed to serialize the validation library: {0}")]
    Emit(#[from] EmitError),

    #[error("failed to reparse the validation library: {0}")]
    Parse(#[from] ParseError),
}

/// One exported function of the [`Library`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Export {
    /// Index in the library module's `funcs`.
    pub func_index: usize,
    pub param_count: usize,
}

pub struct Library {
    pub module: Module,
    pub defs: Defs,
    exports: FxIndexMap<String, Export>,
}

impl Library {
    /// Return the lazily-built library.
    pub fn get() -> Result<&'static Library, &'static LibraryError> {
        lazy_static! {
            static ref LIBRARY: Result<Library, LibraryError> = Library::build();
        }
        LIBRARY.as_ref()
    }

    pub fn export(&self, name: &str) -> Option<Export> {
        self.exports.get(name).copied()
    }

    /// Name under which the function `func_id` is exported, if it is.
    pub fn export_name(&self, func_id: spv::Id) -> Option<&str> {
        let func_index = self.module.func_index(func_id)?;
        self.exports
            .iter()
            .find(|(_, export)| export.func_index == func_index)
            .map(|(name, _)| &name[..])
    }

    pub fn exports(&self) -> impl Iterator<Item = (&str, Export)> {
        self.exports.iter().map(|(name, &export)| (&name[..], export))
    }

    /// Wrap an existing module, collecting its `Export` linkage decorations.
    pub fn from_module(module: Module) -> Self {
        let wk = &spec::Spec::get().well_known;

        let mut exports = FxIndexMap::default();
        for inst in &module.annotations {
            if inst.opcode != wk.OpDecorate || inst.nth_short_imm(0) != Some(wk.LinkageAttributes) {
                continue;
            }
            let linkage_type = inst.imms().last().map(|imm| imm.word());
            let (Some(target), Some(name)) = (inst.nth_id(0), inst.literal_string()) else {
                continue;
            };
            if linkage_type != Some(wk.Export) {
                continue;
            }
            if let Some(func_index) = module.func_index(target) {
                let param_count = module.funcs[func_index].param_ids().count();
                exports.insert(name, Export { func_index, param_count });
            }
        }

        let defs = Defs::new(&module);
        Self { module, defs, exports }
    }

    fn build() -> Result<Self, LibraryError> {
        let wk = &spec::Spec::get().well_known;

        let header = spv::Header { version_major: 1, version_minor: 3, generator: 0, bound: 1 };
        let memory_model = spv::Inst::from(wk.OpMemoryModel)
            .with_imm(OperandKind::AddressingModel, wk.PhysicalStorageBuffer64)
            .with_imm(OperandKind::MemoryModel, wk.GLSL450);
        let mut module = Module::new(header, memory_model);
        for cap in [wk.Shader, wk.Int64, wk.PhysicalStorageBufferAddresses, wk.Linkage] {
            module
                .capabilities
                .push(spv::Inst::from(wk.OpCapability).with_imm(OperandKind::Capability, cap));
        }
        module.extensions.push(
            spv::Inst::from(wk.OpExtension).with_literal_string("SPV_KHR_physical_storage_buffer"),
        );

        let mut cx = Context::for_module(&module);
        let buffers = Buffers::declare(&mut module, &mut cx);

        let log_error = build_log_error(&mut module, &mut cx, &buffers);
        build_bindless_check(&mut module, &mut cx, &buffers, log_error);
        build_index_check(&mut module, &mut cx, log_error);
        build_buffer_address_check(&mut module, &mut cx, &buffers, log_error);
        build_ray_query_check(&mut module, &mut cx, log_error);

        // Round-tripping checks the whole library against the grammar, and
        // gives the linker exactly what it would see from a precompiled one.
        let words = module.serialize_to_spv_words()?;
        Ok(Self::from_module(Module::parse_spv_words(&words)?))
    }
}

fn decorate(module: &mut Module, target: spv::Id, decoration: u32, params: &[u32]) {
    let wk = &spec::Spec::get().well_known;
    module.annotations.push(
        spv::Inst::from(wk.OpDecorate)
            .with_ids([target])
            .with_imm(OperandKind::Decoration, decoration)
            .with_operands(params.iter().map(|&param| {
                spv::Operand::Imm(spv::Imm::Short(OperandKind::LiteralInteger, param))
            })),
    );
}

fn member_decorate(
    module: &mut Module,
    target: spv::Id,
    member: u32,
    decoration: u32,
    params: &[u32],
) {
    let wk = &spec::Spec::get().well_known;
    module.annotations.push(
        spv::Inst::from(wk.OpMemberDecorate)
            .with_ids([target])
            .with_imm(OperandKind::LiteralInteger, member)
            .with_imm(OperandKind::Decoration, decoration)
            .with_operands(params.iter().map(|&param| {
                spv::Operand::Imm(spv::Imm::Short(OperandKind::LiteralInteger, param))
            })),
    );
}

fn name(module: &mut Module, target: spv::Id, name: &str) {
    let wk = &spec::Spec::get().well_known;
    module.debug.push(spv::Inst::from(wk.OpName).with_ids([target]).with_literal_string(name));
}

/// The output and input buffer variables.
struct Buffers {
    output: spv::Id,
    input: spv::Id,
}

impl Buffers {
    fn declare(module: &mut Module, cx: &mut Context) -> Self {
        let wk = &spec::Spec::get().well_known;
        let set = interface::DEFAULT_RESERVED_SET;

        let u32_ty = cx.type_u32(module);
        let u64_ty = cx.type_int(module, 64, false);

        // struct { u32 written_words; u32 data[]; }
        let data_ty =
            cx.define_fresh(module, spv::Inst::from(wk.OpTypeRuntimeArray).with_ids([u32_ty]));
        decorate(module, data_ty, wk.ArrayStride, &[4]);
        let output_ty =
            cx.define_fresh(module, spv::Inst::from(wk.OpTypeStruct).with_ids([u32_ty, data_ty]));
        decorate(module, output_ty, wk.Block, &[]);
        member_decorate(module, output_ty, 0, wk.Offset, &[0]);
        member_decorate(module, output_ty, 1, wk.Offset, &[interface::OUTPUT_DATA_OFFSET as u32]);
        let output = Self::declare_var(module, cx, output_ty, set, interface::OUTPUT_BINDING);
        name(module, output, "inst_output_buffer");

        // struct { u64 address_table; u64 set_snapshots[MAX_SETS]; }
        let max_sets = cx.const_u32(module, interface::MAX_SETS);
        let snapshots_ty = cx
            .define_fresh(module, spv::Inst::from(wk.OpTypeArray).with_ids([u64_ty, max_sets]));
        decorate(module, snapshots_ty, wk.ArrayStride, &[8]);
        let input_ty = cx.define_fresh(
            module,
            spv::Inst::from(wk.OpTypeStruct).with_ids([u64_ty, snapshots_ty]),
        );
        decorate(module, input_ty, wk.Block, &[]);
        member_decorate(module, input_ty, 0, wk.Offset, &[0]);
        member_decorate(module, input_ty, 0, wk.NonWritable, &[]);
        member_decorate(
            module,
            input_ty,
            1,
            wk.Offset,
            &[interface::INPUT_SNAPSHOTS_OFFSET as u32],
        );
        member_decorate(module, input_ty, 1, wk.NonWritable, &[]);
        let input = Self::declare_var(module, cx, input_ty, set, interface::INPUT_BINDING);
        name(module, input, "inst_input_buffer");

        Self { output, input }
    }

    fn declare_var(
        module: &mut Module,
        cx: &mut Context,
        struct_ty: spv::Id,
        set: u32,
        binding: u32,
    ) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let ptr_ty = cx.type_pointer(module, wk.StorageBuffer, struct_ty);
        let var = cx.define_fresh(
            module,
            spv::Inst::from(wk.OpVariable)
                .with_result_type(ptr_ty)
                .with_imm(OperandKind::StorageClass, wk.StorageBuffer),
        );
        decorate(module, var, wk.DescriptorSet, &[set]);
        decorate(module, var, wk.Binding, &[binding]);
        var
    }
}

/// Incremental builder for one library function, kept in structured form
/// (every conditional is a selection construct with its own merge block).
struct FuncBuilder<'a> {
    module: &'a mut Module,
    cx: &'a mut Context,
    func: Func,

    /// `None` after a terminator, until the next block is started.
    block: Option<Block>,
}

impl<'a> FuncBuilder<'a> {
    fn new(
        module: &'a mut Module,
        cx: &'a mut Context,
        ret: spv::Id,
        param_tys: &[spv::Id],
    ) -> Self {
        let wk = &spec::Spec::get().well_known;

        let fn_ty = cx.type_function(module, ret, param_tys.iter().copied());
        let def = spv::Inst::from(wk.OpFunction)
            .with_result(Some(ret), module.alloc_id())
            .with_imm(OperandKind::FunctionControl, 0)
            .with_ids([fn_ty]);
        let params = param_tys
            .iter()
            .map(|&ty| {
                spv::Inst::from(wk.OpFunctionParameter).with_result(Some(ty), module.alloc_id())
            })
            .collect();
        let entry = Block::new(module.alloc_id());

        Self {
            module,
            cx,
            func: Func { def, params, blocks: vec![], end: spv::Inst::from(wk.OpFunctionEnd) },
            block: Some(entry),
        }
    }

    fn params<const N: usize>(&self) -> [spv::Id; N] {
        let mut params = [spv::Id::MIN; N];
        for (dst, src) in params.iter_mut().zip(self.func.param_ids()) {
            *dst = src;
        }
        params
    }

    fn push(&mut self, inst: spv::Inst) {
        let is_terminator = inst.opcode.is_block_terminator();
        // Anything following a terminator (in the same block) is unreachable.
        let Some(block) = &mut self.block else { return };
        block.insts.push(inst);
        if is_terminator {
            self.func.blocks.extend(self.block.take());
        }
    }

    fn op(
        &mut self,
        opcode: spec::Opcode,
        ty: spv::Id,
        ids: impl IntoIterator<Item = spv::Id>,
    ) -> spv::Id {
        let id = self.module.alloc_id();
        self.push(spv::Inst::from(opcode).with_result(Some(ty), id).with_ids(ids));
        id
    }

    fn start_block(&mut self, label: spv::Id) {
        debug_assert!(self.block.is_none());
        self.block = Some(Block::new(label));
    }

    fn u32(&mut self, value: u32) -> spv::Id {
        self.cx.const_u32(self.module, value)
    }

    fn u64(&mut self, value: u64) -> spv::Id {
        self.cx.const_u64(self.module, value)
    }

    fn u32_ty(&mut self) -> spv::Id {
        self.cx.type_u32(self.module)
    }

    fn u64_ty(&mut self) -> spv::Id {
        self.cx.type_int(self.module, 64, false)
    }

    fn bool_ty(&mut self) -> spv::Id {
        self.cx.type_bool(self.module)
    }

    fn branch(&mut self, target: spv::Id) {
        let wk = &spec::Spec::get().well_known;
        self.push(spv::Inst::from(wk.OpBranch).with_ids([target]));
    }

    fn ret(&mut self, value: Option<spv::Id>) {
        let wk = &spec::Spec::get().well_known;
        self.push(match value {
            Some(value) => spv::Inst::from(wk.OpReturnValue).with_ids([value]),
            None => spv::Inst::from(wk.OpReturn),
        });
    }

    /// `if cond { then }`, continuing in the merge block afterwards.
    fn if_then(&mut self, cond: spv::Id, then: impl FnOnce(&mut Self)) {
        let wk = &spec::Spec::get().well_known;

        let then_label = self.module.alloc_id();
        let merge_label = self.module.alloc_id();
        self.push(
            spv::Inst::from(wk.OpSelectionMerge)
                .with_ids([merge_label])
                .with_imm(OperandKind::SelectionControl, 0),
        );
        self.push(
            spv::Inst::from(wk.OpBranchConditional).with_ids([cond, then_label, merge_label]),
        );

        self.start_block(then_label);
        then(self);
        self.branch(merge_label);
        self.start_block(merge_label);
    }

    fn not(&mut self, cond: spv::Id) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let bool_ty = self.bool_ty();
        self.op(wk.OpLogicalNot, bool_ty, [cond])
    }

    fn load(&mut self, ty: spv::Id, ptr: spv::Id, align: Option<u32>) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let id = self.module.alloc_id();
        let mut inst = spv::Inst::from(wk.OpLoad).with_result(Some(ty), id).with_ids([ptr]);
        if let Some(align) = align {
            inst = inst
                .with_imm(OperandKind::MemoryAccess, wk.Aligned)
                .with_imm(OperandKind::LiteralInteger, align);
        }
        self.push(inst);
        id
    }

    /// Load a `ty` (of `size` bytes) from the device address `addr + size * index`.
    fn load_device(&mut self, ty: spv::Id, size: u32, addr: spv::Id, index: spv::Id) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let u64_ty = self.u64_ty();
        let size_const = self.u64(size.into());
        let index = self.op(wk.OpUConvert, u64_ty, [index]);
        let offset = self.op(wk.OpIMul, u64_ty, [index, size_const]);
        let addr = self.op(wk.OpIAdd, u64_ty, [addr, offset]);
        let ptr_ty = self.cx.type_pointer(self.module, wk.PhysicalStorageBuffer, ty);
        let ptr = self.op(wk.OpConvertUToPtr, ptr_ty, [addr]);
        self.load(ty, ptr, Some(size))
    }

    /// Load the `u32` at `base[index]`, for `base` a device address.
    fn load_device_u32(&mut self, base: spv::Id, index: spv::Id) -> spv::Id {
        let u32_ty = self.u32_ty();
        self.load_device(u32_ty, 4, base, index)
    }

    fn call(&mut self, func: spv::Id, args: impl IntoIterator<Item = spv::Id>) {
        let wk = &spec::Spec::get().well_known;
        let void = self.cx.type_void(self.module);
        self.op(wk.OpFunctionCall, void, [func].into_iter().chain(args));
    }

    /// Finish the function, exporting it as `export_name`.
    fn finish(self, export_name: &str) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        debug_assert!(self.block.is_none(), "`{export_name}` has an unterminated block");

        let func_id = self.func.def.result_id.unwrap_or(spv::Id::MIN);
        self.module.funcs.push(self.func);
        name(self.module, func_id, export_name);
        self.module.annotations.push(
            spv::Inst::from(wk.OpDecorate)
                .with_ids([func_id])
                .with_imm(OperandKind::Decoration, wk.LinkageAttributes)
                .with_literal_string(export_name)
                .with_imm(OperandKind::LinkageType, wk.Export),
        );
        func_id
    }
}

fn build_log_error(module: &mut Module, cx: &mut Context, buffers: &Buffers) -> spv::Id {
    let wk = &spec::Spec::get().well_known;

    let void = cx.type_void(module);
    let u32_ty = cx.type_u32(module);
    const RECORD_WORDS: usize = interface::ERROR_RECORD_WORDS as usize;
    let mut b = FuncBuilder::new(module, cx, void, &[u32_ty; RECORD_WORDS]);
    let record: [_; RECORD_WORDS] = b.params();

    let bool_ty = b.bool_ty();
    let ptr_ty = b.cx.type_pointer(b.module, wk.StorageBuffer, u32_ty);
    let [zero, one, record_words] = [0, 1, interface::ERROR_RECORD_WORDS].map(|x| b.u32(x));
    let [scope, semantics] = [wk.ScopeDevice, 0].map(|x| b.u32(x));

    let written_words = b.op(wk.OpAccessChain, ptr_ty, [buffers.output, zero]);
    let start = b.op(wk.OpAtomicIAdd, u32_ty, [written_words, scope, semantics, record_words]);
    let end = b.op(wk.OpIAdd, u32_ty, [start, record_words]);
    let data_len = b.module.alloc_id();
    b.push(
        spv::Inst::from(wk.OpArrayLength)
            .with_result(Some(u32_ty), data_len)
            .with_ids([buffers.output])
            .with_imm(OperandKind::LiteralInteger, 1),
    );
    // Records that don't fit are dropped, but `written_words` still counts them.
    let fits = b.op(wk.OpULessThanEqual, bool_ty, [end, data_len]);
    b.if_then(fits, |b| {
        for (i, &word) in record.iter().enumerate() {
            let i = b.u32(i as u32);
            let index = b.op(wk.OpIAdd, u32_ty, [start, i]);
            let ptr = b.op(wk.OpAccessChain, ptr_ty, [buffers.output, one, index]);
            b.push(spv::Inst::from(wk.OpStore).with_ids([ptr, word]));
        }
    });
    b.ret(None);

    b.finish(LOG_ERROR)
}

fn build_bindless_check(
    module: &mut Module,
    cx: &mut Context,
    buffers: &Buffers,
    log_error: spv::Id,
) {
    let wk = &spec::Spec::get().well_known;

    let bool_ty = cx.type_bool(module);
    let u32_ty = cx.type_u32(module);
    let mut b = FuncBuilder::new(module, cx, bool_ty, &[u32_ty; 5]);
    let [shader_id, inst_index, set, binding, index] = b.params();

    let u64_ty = b.u64_ty();
    let ptr_ty = b.cx.type_pointer(b.module, wk.StorageBuffer, u64_ty);
    let [zero, one, two] = [0, 1, 2].map(|x| b.u32(x));
    let zero_u64 = b.u64(0);
    let true_ = b.cx.const_bool(b.module, true);

    let snapshot_ptr = b.op(wk.OpAccessChain, ptr_ty, [buffers.input, one, set]);
    let snapshot = b.load(u64_ty, snapshot_ptr, None);
    // No snapshot for this set (validation degraded), nothing to check against.
    let missing = b.op(wk.OpIEqual, bool_ty, [snapshot, zero_u64]);
    b.if_then(missing, |b| b.ret(Some(true_)));

    // `[H, count[0..=H], offset[0..=H], status...]`, with every read kept in
    // bounds by clamping (to word `0`) whenever `binding > H`, or `index >= count`.
    let highest = b.load_device_u32(snapshot, zero);
    let known = b.op(wk.OpULessThanEqual, bool_ty, [binding, highest]);
    let safe_binding = b.op(wk.OpSelect, u32_ty, [known, binding, zero]);

    let count_index = b.op(wk.OpIAdd, u32_ty, [one, safe_binding]);
    let count = b.load_device_u32(snapshot, count_index);
    let count = b.op(wk.OpSelect, u32_ty, [known, count, zero]);
    let in_bounds = b.op(wk.OpULessThan, bool_ty, [index, count]);
    let out_of_bounds = b.not(in_bounds);
    let code = b.u32(ErrorCode::DescriptorIndexOutOfBounds as u32);
    b.if_then(out_of_bounds, |b| {
        b.call(log_error, [shader_id, inst_index, code, set, binding, index, count]);
    });

    let offsets_start = b.op(wk.OpIAdd, u32_ty, [two, highest]);
    let offset_index = b.op(wk.OpIAdd, u32_ty, [offsets_start, safe_binding]);
    let offset = b.load_device_u32(snapshot, offset_index);
    let status_index = b.op(wk.OpIAdd, u32_ty, [offset, index]);
    let status_index = b.op(wk.OpSelect, u32_ty, [in_bounds, status_index, zero]);
    let status = b.load_device_u32(snapshot, status_index);
    let unwritten = b.op(wk.OpIEqual, bool_ty, [status, zero]);
    let uninitialized = b.op(wk.OpLogicalAnd, bool_ty, [in_bounds, unwritten]);
    let code = b.u32(ErrorCode::DescriptorUninitialized as u32);
    b.if_then(uninitialized, |b| {
        b.call(log_error, [shader_id, inst_index, code, set, binding, index, zero]);
    });

    // Null descriptors (`STATUS_NULL`) are valid to access.
    let written = b.not(unwritten);
    let ok = b.op(wk.OpLogicalAnd, bool_ty, [in_bounds, written]);
    b.ret(Some(ok));

    b.finish(BINDLESS_CHECK);
}

fn build_index_check(module: &mut Module, cx: &mut Context, log_error: spv::Id) {
    let wk = &spec::Spec::get().well_known;

    let bool_ty = cx.type_bool(module);
    let u32_ty = cx.type_u32(module);
    let mut b = FuncBuilder::new(module, cx, bool_ty, &[u32_ty; 4]);
    let [shader_id, inst_index, index, bound] = b.params();

    let zero = b.u32(0);
    let code = b.u32(ErrorCode::IndexOutOfBounds as u32);
    let in_bounds = b.op(wk.OpULessThan, bool_ty, [index, bound]);
    let out_of_bounds = b.not(in_bounds);
    b.if_then(out_of_bounds, |b| {
        b.call(log_error, [shader_id, inst_index, code, index, bound, zero, zero]);
    });
    b.ret(Some(in_bounds));

    b.finish(INDEX_CHECK);
}

fn build_buffer_address_check(
    module: &mut Module,
    cx: &mut Context,
    buffers: &Buffers,
    log_error: spv::Id,
) {
    let wk = &spec::Spec::get().well_known;

    let bool_ty = cx.type_bool(module);
    let u32_ty = cx.type_u32(module);
    let u64_ty = cx.type_int(module, 64, false);
    let mut b = FuncBuilder::new(module, cx, bool_ty, &[u32_ty, u32_ty, u64_ty, u32_ty]);
    let [shader_id, inst_index, addr, size] = b.params();

    let ptr_ty = b.cx.type_pointer(b.module, wk.StorageBuffer, u64_ty);
    let [zero, one, two] = [0, 1, 2].map(|x| b.u32(x));
    let [zero_u64, eight, thirty_two] = [0, 8, 32].map(|x| b.u64(x));
    let true_ = b.cx.const_bool(b.module, true);
    let false_ = b.cx.const_bool(b.module, false);

    let table_ptr = b.op(wk.OpAccessChain, ptr_ty, [buffers.input, zero]);
    let table = b.load(u64_ty, table_ptr, None);
    let missing = b.op(wk.OpIEqual, bool_ty, [table, zero_u64]);
    b.if_then(missing, |b| b.ret(Some(true_)));

    // `{ u32 count; u32 pad; u64 ranges[2 * count]; }`
    let count = b.load_device_u32(table, zero);
    let ranges = b.op(wk.OpIAdd, u64_ty, [table, eight]);
    let size_u64 = b.op(wk.OpUConvert, u64_ty, [size]);
    let end = b.op(wk.OpIAdd, u64_ty, [addr, size_u64]);
    // An access wrapping around the address space is never in bounds.
    let wrapped = b.op(wk.OpULessThan, bool_ty, [end, addr]);

    let preheader = b.block.as_ref().map_or(spv::Id::MIN, |block| block.label_id());
    let [header, body, continue_target, merge] = [(); 4].map(|()| b.module.alloc_id());
    let (i, next_i) = (b.module.alloc_id(), b.module.alloc_id());
    b.branch(header);

    b.start_block(header);
    b.push(
        spv::Inst::from(wk.OpPhi)
            .with_result(Some(u32_ty), i)
            .with_ids([zero, preheader, next_i, continue_target]),
    );
    let more = b.op(wk.OpULessThan, bool_ty, [i, count]);
    b.push(
        spv::Inst::from(wk.OpLoopMerge)
            .with_ids([merge, continue_target])
            .with_imm(OperandKind::LoopControl, 0),
    );
    b.push(spv::Inst::from(wk.OpBranchConditional).with_ids([more, body, merge]));

    b.start_block(body);
    let start_index = b.op(wk.OpIMul, u32_ty, [i, two]);
    let end_index = b.op(wk.OpIAdd, u32_ty, [start_index, one]);
    let range_start = b.load_device(u64_ty, 8, ranges, start_index);
    let range_end = b.load_device(u64_ty, 8, ranges, end_index);
    let after_start = b.op(wk.OpUGreaterThanEqual, bool_ty, [addr, range_start]);
    let before_end = b.op(wk.OpULessThanEqual, bool_ty, [end, range_end]);
    let inside = b.op(wk.OpLogicalAnd, bool_ty, [after_start, before_end]);
    let no_wrap = b.not(wrapped);
    let inside = b.op(wk.OpLogicalAnd, bool_ty, [inside, no_wrap]);
    b.if_then(inside, |b| b.ret(Some(true_)));
    b.branch(continue_target);

    b.start_block(continue_target);
    b.push(spv::Inst::from(wk.OpIAdd).with_result(Some(u32_ty), next_i).with_ids([i, one]));
    b.branch(header);

    b.start_block(merge);
    let code = b.u32(ErrorCode::DeviceAddressOutOfBounds as u32);
    let addr_lo = b.op(wk.OpUConvert, u32_ty, [addr]);
    let addr_hi = b.op(wk.OpShiftRightLogical, u64_ty, [addr, thirty_two]);
    let addr_hi = b.op(wk.OpUConvert, u32_ty, [addr_hi]);
    b.call(log_error, [shader_id, inst_index, code, addr_lo, addr_hi, size, zero]);
    b.ret(Some(false_));

    b.finish(BUFFER_ADDRESS_CHECK);
}

fn build_ray_query_check(module: &mut Module, cx: &mut Context, log_error: spv::Id) {
    let wk = &spec::Spec::get().well_known;

    let bool_ty = cx.type_bool(module);
    let u32_ty = cx.type_u32(module);
    let f32_ty = cx.type_float(module, 32);
    let vec3_ty = cx.type_vector(module, f32_ty, 3);
    let bvec3_ty = cx.type_vector(module, bool_ty, 3);
    let mut b = FuncBuilder::new(
        module,
        cx,
        bool_ty,
        &[u32_ty, u32_ty, u32_ty, vec3_ty, f32_ty, vec3_ty, f32_ty],
    );
    let [shader_id, inst_index, flags, origin, tmin, direction, tmax] = b.params();

    let zero = b.u32(0);
    let zero_f32 = b.cx.const_f32(b.module, 0.0);
    let skip_both = b.u32(interface::RAY_FLAG_SKIP_TRIANGLES | interface::RAY_FLAG_SKIP_AABBS);

    let origin_nan = b.op(wk.OpIsNan, bvec3_ty, [origin]);
    let origin_nan = b.op(wk.OpAny, bool_ty, [origin_nan]);
    let direction_nan = b.op(wk.OpIsNan, bvec3_ty, [direction]);
    let direction_nan = b.op(wk.OpAny, bool_ty, [direction_nan]);
    let nan = b.op(wk.OpLogicalOr, bool_ty, [origin_nan, direction_nan]);
    let negative_tmin = b.op(wk.OpFOrdLessThan, bool_ty, [tmin, zero_f32]);
    let tmax_below_tmin = b.op(wk.OpFOrdLessThan, bool_ty, [tmax, tmin]);
    let skip_flags = b.op(wk.OpBitwiseAnd, u32_ty, [flags, skip_both]);
    let both_skip = b.op(wk.OpIEqual, bool_ty, [skip_flags, skip_both]);

    // Only the first failing check (in this order) is reported.
    let mut code = zero;
    for (failed, error) in [
        (both_skip, ErrorCode::RayQueryBothSkipFlags),
        (tmax_below_tmin, ErrorCode::RayQueryTMaxLessThanTMin),
        (negative_tmin, ErrorCode::RayQueryNegativeTMin),
        (nan, ErrorCode::RayQueryNanVector),
    ] {
        let error = b.u32(error as u32);
        code = b.op(wk.OpSelect, u32_ty, [failed, error, code]);
    }

    let invalid = b.op(wk.OpINotEqual, bool_ty, [code, zero]);
    let tmin_bits = b.op(wk.OpBitcast, u32_ty, [tmin]);
    let tmax_bits = b.op(wk.OpBitcast, u32_ty, [tmax]);
    b.if_then(invalid, |b| {
        b.call(log_error, [shader_id, inst_index, code, flags, tmin_bits, tmax_bits, zero]);
    });
    let valid = b.not(invalid);
    b.ret(Some(valid));

    b.finish(RAY_QUERY_CHECK);
}
