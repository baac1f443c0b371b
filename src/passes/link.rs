//! Function linker: merges the validation functions requested by the passes
//! (and, transitively, everything they use) from the [`Library`] into a shader.
//!
//! Undecorated types and constants are deduplicated against the shader's own,
//! while everything else (decorated types, the instrumentation buffers) gets
//! fresh IDs, with `DescriptorSet` decorations moved to the reserved set.

use crate::library::{self, Export, Library};
use crate::spv::{self, spec::{self, OperandKind}};
use crate::{context, Block, Context, Func, FxIndexMap, FxIndexSet, Module};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no function `{0}` is exported by the validation library")]
    MissingExport(String),

    #[error("`{name}` takes {expected} parameters, but was called with {found} arguments")]
    ArityMismatch { name: String, expected: usize, found: usize },

    #[error("validation library: {0}")]
    Library(String),
}

/// Validation functions called by an instrumented shader, which have yet
/// to be linked into it.
#[derive(Default)]
pub struct LinkRequests {
    /// The ID every call to a validation function uses (which is also the
    /// function's own ID, once linked).
    ids: FxIndexMap<String, spv::Id>,

    /// `(name, argument count)` of every distinct call, not yet linked.
    pending: FxIndexSet<(String, usize)>,
}

impl LinkRequests {
    /// Return the ID to call `name` through, without requesting it yet.
    ///
    /// If `module` already has a function named `name` (from a previous round
    /// of linking), it's reused instead of being linked again.
    pub fn id_for(&mut self, module: &mut Module, name: &str) -> spv::Id {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = existing_func_named(module, name).unwrap_or_else(|| module.alloc_id());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Record a call to `name` (with `arg_count` arguments), and return the ID
    /// to call it through (see [`LinkRequests::id_for`]).
    pub fn request(&mut self, module: &mut Module, name: &str, arg_count: usize) -> spv::Id {
        self.pending.insert((name.to_string(), arg_count));
        self.id_for(module, name)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Indices (in `module.funcs`) of the validation functions linked into
/// `module` by a previous round of instrumentation.
pub fn linked_func_indices(module: &Module) -> FxHashSet<usize> {
    library::EXPORTS
        .iter()
        .filter_map(|name| existing_func_named(module, name))
        .filter_map(|id| module.func_index(id))
        .collect()
}

fn existing_func_named(module: &Module, name: &str) -> Option<spv::Id> {
    let wk = &spec::Spec::get().well_known;
    module
        .debug
        .iter()
        .filter(|inst| inst.opcode == wk.OpName)
        .filter(|inst| inst.literal_string().as_deref() == Some(name))
        .filter_map(|inst| inst.nth_id(0))
        .find(|&id| module.func_index(id).is_some())
}

/// Link every pending request into `module`, returning the names of the
/// functions that were merged (in the order they were merged).
///
/// Linking is idempotent: functions already present in `module` (see
/// [`LinkRequests::request`]) are left alone.
pub fn link(
    module: &mut Module,
    cx: &mut Context,
    requests: &mut LinkRequests,
    reserved_set: u32,
) -> Result<Vec<String>, LinkError> {
    let library = Library::get().map_err(|e| LinkError::Library(e.to_string()))?;

    let globals_start = module.globals.len();
    let mut linker = Linker {
        library,
        module,
        cx,
        reserved_set,
        globals: FxHashMap::default(),
        new_vars: vec![],
    };

    let mut linked = vec![];
    let mut next = 0;
    while let Some((name, arg_count)) = requests.pending.get_index(next).cloned() {
        next += 1;

        let export = library.export(&name).ok_or_else(|| LinkError::MissingExport(name.clone()))?;
        if arg_count != export.param_count {
            return Err(LinkError::ArityMismatch {
                name,
                expected: export.param_count,
                found: arg_count,
            });
        }

        let target = requests.ids[&name];
        if linker.module.func_index(target).is_some() || linked.contains(&name) {
            continue;
        }
        linker.merge_func(export, target, requests)?;
        name_func(linker.module, target, &name);
        tracing::trace!(func = %name, "linked validation function");
        linked.push(name);
    }
    requests.pending.clear();

    linker.add_requirements(globals_start);
    Ok(linked)
}

fn name_func(module: &mut Module, target: spv::Id, name: &str) {
    let wk = &spec::Spec::get().well_known;
    module.debug.push(spv::Inst::from(wk.OpName).with_ids([target]).with_literal_string(name));
}

struct Linker<'a> {
    library: &'static Library,
    module: &'a mut Module,
    cx: &'a mut Context,
    reserved_set: u32,

    /// Library global IDs, mapped to their equivalents in `module`.
    globals: FxHashMap<spv::Id, spv::Id>,

    /// Global variables added to `module`.
    new_vars: Vec<spv::Id>,
}

impl Linker<'_> {
    fn map_global(&mut self, lib_id: spv::Id) -> Result<spv::Id, LinkError> {
        let wk = &spec::Spec::get().well_known;

        if let Some(&id) = self.globals.get(&lib_id) {
            return Ok(id);
        }
        let library = self.library;
        let lib_inst = library.defs.global(lib_id).ok_or_else(|| {
            LinkError::Library(format!("%{lib_id} is used but not defined as a global"))
        })?;

        if lib_inst.opcode == wk.OpVariable {
            if let Some(id) = self.existing_reserved_var(lib_id) {
                self.globals.insert(lib_id, id);
                return Ok(id);
            }
        }

        let mut inst = lib_inst.clone();
        if let Some(ty) = inst.result_type_id {
            inst.result_type_id = Some(self.map_global(ty)?);
        }
        for operand in &mut inst.operands {
            if let spv::Operand::Id(id) = operand {
                *id = self.map_global(*id)?;
            }
        }

        let is_decorated = library.module.annotations.iter().any(|a| a.nth_id(0) == Some(lib_id));
        let id = if context::is_internable(inst.opcode) && !is_decorated {
            self.cx.intern(self.module, inst)
        } else {
            let is_var = inst.opcode == wk.OpVariable;
            let id = self.cx.define_fresh(self.module, inst);
            self.copy_annotations(lib_id, id);
            if is_var {
                self.new_vars.push(id);
            }
            id
        };
        self.globals.insert(lib_id, id);
        Ok(id)
    }

    /// An instrumentation buffer variable added by a previous round of linking.
    fn existing_reserved_var(&self, lib_var: spv::Id) -> Option<spv::Id> {
        let wk = &spec::Spec::get().well_known;

        let name = self.library.defs.name(lib_var)?;
        let in_reserved_set = |id| {
            self.module.annotations.iter().any(|inst| {
                inst.opcode == wk.OpDecorate
                    && inst.nth_id(0) == Some(id)
                    && inst.nth_short_imm(0) == Some(wk.DescriptorSet)
                    && inst.nth_short_imm(1) == Some(self.reserved_set)
            })
        };
        self.module
            .debug
            .iter()
            .filter(|inst| inst.opcode == wk.OpName)
            .filter(|inst| inst.literal_string().as_deref() == Some(name))
            .filter_map(|inst| inst.nth_id(0))
            .find(|&id| in_reserved_set(id))
    }

    /// Copy decorations and debug names from `lib_id` to `id`.
    fn copy_annotations(&mut self, lib_id: spv::Id, id: spv::Id) {
        let wk = &spec::Spec::get().well_known;

        let library = self.library;
        for inst in &library.module.annotations {
            if inst.nth_id(0) != Some(lib_id) {
                continue;
            }
            let decoration =
                if inst.opcode == wk.OpDecorate { inst.nth_short_imm(0) } else { None };
            if decoration == Some(wk.LinkageAttributes) {
                continue;
            }
            let mut inst = inst.clone();
            inst.operands[0] = spv::Operand::Id(id);
            if decoration == Some(wk.DescriptorSet) {
                inst.operands.truncate(2);
                inst.operands.push(spv::Operand::Imm(spv::Imm::Short(
                    OperandKind::LiteralInteger,
                    self.reserved_set,
                )));
            }
            self.module.annotations.push(inst);
        }
        for inst in &library.module.debug {
            let is_name = [wk.OpName, wk.OpMemberName].contains(&inst.opcode);
            if is_name && inst.nth_id(0) == Some(lib_id) {
                let mut inst = inst.clone();
                inst.operands[0] = spv::Operand::Id(id);
                self.module.debug.push(inst);
            }
        }
    }

    /// Copy the function `export` into `module`, with the ID `target`.
    fn merge_func(
        &mut self,
        export: Export,
        target: spv::Id,
        requests: &mut LinkRequests,
    ) -> Result<(), LinkError> {
        let library = self.library;
        let lib_func = &library.module.funcs[export.func_index];

        let mut locals = FxHashMap::default();
        for inst in lib_func.all_insts() {
            if let Some(id) = inst.result_id {
                locals.insert(id, self.module.alloc_id());
            }
        }
        if let Some(id) = lib_func.id() {
            locals.insert(id, target);
        }

        let mut func = Func {
            def: self.map_local_inst(&lib_func.def, &locals, requests)?,
            params: Vec::with_capacity(lib_func.params.len()),
            blocks: Vec::with_capacity(lib_func.blocks.len()),
            end: lib_func.end.clone(),
        };
        for param in &lib_func.params {
            func.params.push(self.map_local_inst(param, &locals, requests)?);
        }
        for lib_block in &lib_func.blocks {
            let mut block = Block {
                label: self.map_local_inst(&lib_block.label, &locals, requests)?,
                insts: Vec::with_capacity(lib_block.insts.len()),
            };
            for inst in &lib_block.insts {
                block.insts.push(self.map_local_inst(inst, &locals, requests)?);
            }
            func.blocks.push(block);
        }
        self.module.funcs.push(func);
        Ok(())
    }

    fn map_local_inst(
        &mut self,
        inst: &spv::Inst,
        locals: &FxHashMap<spv::Id, spv::Id>,
        requests: &mut LinkRequests,
    ) -> Result<spv::Inst, LinkError> {
        let wk = &spec::Spec::get().well_known;

        let mut inst = inst.clone();
        inst.result_id = inst.result_id.map(|id| locals.get(&id).copied().unwrap_or(id));
        if let Some(ty) = inst.result_type_id {
            inst.result_type_id = Some(self.map_global(ty)?);
        }

        let callee = if inst.opcode == wk.OpFunctionCall { inst.nth_id(0) } else { None };
        let arg_count = inst.ids().count().saturating_sub(1);
        for operand in &mut inst.operands {
            let spv::Operand::Id(id) = operand else { continue };
            *id = if let Some(&local) = locals.get(id) {
                local
            } else if Some(*id) == callee {
                let name = self.library.export_name(*id).ok_or_else(|| {
                    LinkError::Library(format!("call to the non-exported function %{id}"))
                })?;
                requests.request(self.module, name, arg_count)
            } else {
                self.map_global(*id)?
            };
        }
        Ok(inst)
    }

    /// Add the capabilities, extensions and addressing model needed by the
    /// globals added since `globals_start`, and list new variables in the
    /// interface of every entry point (as required since SPIR-V 1.4).
    fn add_requirements(&mut self, globals_start: usize) {
        let wk = &spec::Spec::get().well_known;

        let new_globals = &self.module.globals[globals_start..];
        let has_pointer_to = |storage_class| {
            new_globals.iter().any(|inst| {
                inst.opcode == wk.OpTypePointer && inst.nth_short_imm(0) == Some(storage_class)
            })
        };
        let needs_int64 = new_globals
            .iter()
            .any(|inst| inst.opcode == wk.OpTypeInt && inst.nth_short_imm(0) == Some(64));
        let needs_psb = has_pointer_to(wk.PhysicalStorageBuffer);
        let header = self.module.header();
        let needs_storage_buffer_ext = (header.version_major, header.version_minor) < (1, 3)
            && has_pointer_to(wk.StorageBuffer);

        if needs_int64 {
            self.ensure_capability(wk.Int64);
        }
        if needs_psb {
            self.ensure_capability(wk.PhysicalStorageBufferAddresses);
            self.ensure_extension("SPV_KHR_physical_storage_buffer");
            if self.module.addressing_model() == wk.Logical {
                self.module.memory_model.operands[0] = spv::Operand::Imm(spv::Imm::Short(
                    OperandKind::AddressingModel,
                    wk.PhysicalStorageBuffer64,
                ));
            }
        }
        if needs_storage_buffer_ext {
            self.ensure_extension("SPV_KHR_storage_buffer_storage_class");
        }

        let header = self.module.header();
        if (header.version_major, header.version_minor) >= (1, 4) {
            for entry_point in &mut self.module.entry_points {
                entry_point.operands.extend(self.new_vars.iter().map(|&var| var.into()));
            }
        }
    }

    fn ensure_capability(&mut self, cap: u32) {
        let wk = &spec::Spec::get().well_known;
        if !self.module.has_capability(cap) {
            self.module
                .capabilities
                .push(spv::Inst::from(wk.OpCapability).with_imm(OperandKind::Capability, cap));
        }
    }

    fn ensure_extension(&mut self, ext: &str) {
        let wk = &spec::Spec::get().well_known;
        let exts = &self.module.extensions;
        if !exts.iter().any(|inst| inst.literal_string().as_deref() == Some(ext)) {
            self.module
                .extensions
                .push(spv::Inst::from(wk.OpExtension).with_literal_string(ext));
        }
    }
}
