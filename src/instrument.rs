//! Instrumentation sessions: running passes over one [`Module`], turning the
//! sites they find into guarded calls to validation functions, and linking.
//!
//! A guarded site (e.g. an `OpLoad`) is split out of its block like this:
//!
//! ```text
//! head:      ...  %ok = OpFunctionCall %bool %check ...
//!                 OpSelectionMerge %rest None
//!                 OpBranchConditional %ok %valid %rest
//! valid:     %new = OpLoad ...                  ; the original instruction
//!                 OpBranch %rest
//! rest:      %orig = OpPhi %T %new %valid %null %head
//!                 ...                           ; the rest of the original block
//! ```
//!
//! so a failed check both reports the error and replaces the result with zero,
//! instead of performing the out-of-bounds access.

use crate::config::{DeviceFeatures, Options};
use crate::context::{Context, Defs, IntType, LocalDefs, SourceLoc};
use crate::passes::link::{self, LinkError, LinkRequests};
use crate::spv::spec::{self, OperandKind};
use crate::spv::{self, write::EmitError};
use crate::{Block, InsertError, InstLoc, Module};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::time::Instant;

/// Kind of check (and of the pass finding sites for it).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum CheckKind {
    Descriptor,
    IndexedAccess,
    DeviceAddress,
    RayQuery,
}

impl CheckKind {
    /// All kinds, in the order their passes are run.
    pub const ALL: [CheckKind; 4] = [
        CheckKind::Descriptor,
        CheckKind::IndexedAccess,
        CheckKind::DeviceAddress,
        CheckKind::RayQuery,
    ];
}

/// Argument to a validation function, as found by a pass (and converted to
/// the parameter type of the validation function when the site is guarded).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    /// Passed unchanged.
    Value(spv::Id),

    U32(u32),

    /// Integer of any (supported) type, converted to `u32` (saturating, with
    /// negative values becoming large unsigned ones).
    Index(spv::Id, IntType),

    /// `PhysicalStorageBuffer` pointer, converted to its `u64` address.
    PtrToU64(spv::Id),
}

impl Arg {
    /// `Arg::Index` for the integer `value`, if its type is supported.
    pub fn index(defs: &Defs, locals: &LocalDefs<'_>, value: spv::Id) -> Option<Self> {
        let ty = defs.int_type(defs.type_of(locals, value)?)?;
        matches!(ty.width, 8 | 16 | 32 | 64).then_some(Arg::Index(value, ty))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckCall {
    /// Name of the library function (see [`crate::library`]).
    pub func: &'static str,

    /// Arguments after `(unique_shader_id, inst_index)`, which are implied.
    pub args: SmallVec<[Arg; 6]>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Guard {
    /// Only perform the instruction if all checks pass (otherwise its result,
    /// if any, is replaced by `OpConstantNull`).
    Conditional,

    /// Always perform the instruction, the checks only report errors.
    ReportOnly,
}

/// One risky instruction, found by a pass.
#[derive(Clone, Debug)]
pub struct Site {
    pub loc: InstLoc,
    pub kind: CheckKind,
    pub guard: Guard,
    pub calls: SmallVec<[CheckCall; 2]>,
}

/// One risky instruction that couldn't be instrumented.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SkippedSite {
    pub kind: CheckKind,
    pub function: Option<u32>,
    pub block: u32,
    pub inst: String,
    pub reason: String,
}

/// Call `f` for every instruction inside a block of a function in `module`,
/// except for validation functions linked in by a previous instrumentation.
pub fn walk_insts<'a>(
    module: &'a Module,
    mut f: impl FnMut(InstLoc, &LocalDefs<'a>, &'a Block, &'a spv::Inst),
) {
    let linked = link::linked_func_indices(module);
    for (func_index, func) in module.funcs.iter().enumerate() {
        if linked.contains(&func_index) {
            continue;
        }
        let locals = LocalDefs::new(func);
        for (block_index, block) in func.blocks.iter().enumerate() {
            for (inst_index, inst) in block.insts.iter().enumerate() {
                let loc = InstLoc { func: func_index, block: block_index, inst: inst_index };
                f(loc, &locals, block, inst);
            }
        }
    }
}

/// Check that `inst` (in `block`) can be made conditional with [`Guard::Conditional`].
pub fn check_guardable(defs: &Defs, block: &Block, inst: &spv::Inst) -> Result<(), String> {
    if block.is_loop_header() {
        // Splitting the block would move the `OpLoopMerge` away from the
        // loop header, changing the loop's structure.
        return Err("it's in a loop header block".to_string());
    }
    if let Some(ty) = inst.result_type_id {
        if !defs.is_nullable(ty) {
            return Err(format!("its result type (%{ty}) has no null value"));
        }
    }
    Ok(())
}

/// Output of one pass.
#[derive(Default)]
pub struct Sites {
    pub sites: Vec<Site>,
    pub skipped: Vec<(InstLoc, String)>,
}

impl Sites {
    pub fn skip(&mut self, loc: InstLoc, reason: impl Into<String>) {
        self.skipped.push((loc, reason.into()));
    }
}

/// Description of one instrumented instruction, kept on the CPU side to give
/// context to the errors reported by its checks.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct InstrumentationRecord {
    pub unique_shader_id: u32,
    pub inst_index: u32,
    pub kind: CheckKind,

    /// ID of the enclosing function.
    pub function: Option<u32>,

    /// Label ID of the enclosing block (in the original module).
    pub block: u32,

    /// Disassembly of the original instruction.
    pub inst: String,

    pub source: Option<SourceLoc>,
}

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("the {0:?} pass was already run in this session")]
    PassAlreadyRun(CheckKind),

    #[error("linking failed: {0}")]
    Link(#[from] LinkError),

    #[error("serialization failed: {0}")]
    Emit(#[from] EmitError),
}

/// An instrumented (and serialized) shader.
#[derive(Clone, Debug)]
pub struct InstrumentedShader {
    pub words: Vec<u32>,
    pub records: Vec<InstrumentationRecord>,
    pub skipped: Vec<SkippedSite>,

    /// Library functions merged into the shader.
    pub linked: Vec<String>,
}

impl InstrumentedShader {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// All the passes run on one module, followed by linking.
///
/// A session owns its module exclusively, and every pass may run at most once.
pub struct Session {
    module: Module,
    cx: Context,
    options: Options,
    features: DeviceFeatures,
    unique_shader_id: u32,

    requests: LinkRequests,
    records: Vec<InstrumentationRecord>,
    skipped: Vec<SkippedSite>,
    passes_run: SmallVec<[CheckKind; 4]>,
}

impl Session {
    pub fn new(
        module: Module,
        options: &Options,
        features: DeviceFeatures,
        unique_shader_id: u32,
    ) -> Self {
        Self {
            cx: Context::for_module(&module),
            module,
            options: options.clone(),
            features,
            unique_shader_id,

            requests: LinkRequests::default(),
            records: vec![],
            skipped: vec![],
            passes_run: SmallVec::new(),
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn records(&self) -> &[InstrumentationRecord] {
        &self.records
    }

    /// Whether the `kind` pass is both enabled, and applicable to this module
    /// (on this device).
    pub fn is_pass_enabled(&self, kind: CheckKind) -> bool {
        let wk = &spec::Spec::get().well_known;

        match kind {
            CheckKind::Descriptor => {
                self.options.descriptors && self.features.buffer_device_address
            }
            CheckKind::IndexedAccess => self.options.indexing,
            CheckKind::DeviceAddress => {
                self.options.buffer_device_address
                    && self.features.buffer_device_address
                    && self.module.has_capability(wk.PhysicalStorageBufferAddresses)
            }
            CheckKind::RayQuery => {
                self.options.ray_query
                    && self.features.ray_query
                    && self.module.has_capability(wk.RayQueryKHR)
            }
        }
    }

    /// Run every enabled (and applicable) pass, in [`CheckKind::ALL`] order.
    pub fn run_enabled_passes(&mut self) -> Result<(), InstrumentError> {
        for kind in CheckKind::ALL {
            if self.is_pass_enabled(kind) && !self.passes_run.contains(&kind) {
                self.run_pass(kind)?;
            }
        }
        Ok(())
    }

    /// Run one pass (regardless of whether it's enabled), returning the number
    /// of instrumented sites.
    pub fn run_pass(&mut self, kind: CheckKind) -> Result<usize, InstrumentError> {
        if self.passes_run.contains(&kind) {
            return Err(InstrumentError::PassAlreadyRun(kind));
        }
        self.passes_run.push(kind);

        let verbose = self.options.verbose;
        let defs = Defs::new(&self.module);
        let reserved_set = self.options.reserved_set;
        let module = &self.module;
        let Sites { sites, skipped } = timed_pass(verbose, &format!("{kind:?}::find_sites"), || {
            match kind {
                CheckKind::Descriptor => {
                    crate::passes::descriptor::find_sites(module, &defs, reserved_set)
                }
                CheckKind::IndexedAccess => {
                    crate::passes::indexed_access::find_sites(module, &defs, reserved_set)
                }
                CheckKind::DeviceAddress => {
                    crate::passes::device_address::find_sites(module, &defs)
                }
                CheckKind::RayQuery => crate::passes::ray_query::find_sites(module, &defs),
            }
        });

        for (loc, reason) in skipped {
            self.skip(loc, kind, reason);
        }
        let count = timed_pass(verbose, &format!("{kind:?}::apply"), || {
            self.apply_sites(&defs, sites)
        });
        Ok(count)
    }

    fn skip(&mut self, loc: InstLoc, kind: CheckKind, reason: String) {
        let (function, block, inst) = self.describe_loc(loc);
        tracing::warn!(
            unique_shader_id = self.unique_shader_id,
            ?kind,
            "not instrumenting `{inst}`: {reason}"
        );
        self.skipped.push(SkippedSite { kind, function, block, inst, reason });
    }

    fn describe_loc(&self, loc: InstLoc) -> (Option<u32>, u32, String) {
        let function =
            self.module.funcs.get(loc.func).and_then(|func| func.id()).map(|id| id.get());
        let block = self.module.block(loc.block_loc()).map_or(0, |block| block.label_id().get());
        let inst = self.module.inst(loc).map_or_else(String::new, |inst| inst.to_string());
        (function, block, inst)
    }

    fn apply_sites(&mut self, defs: &Defs, mut sites: Vec<Site>) -> usize {
        sites.sort_by_key(|site| site.loc);

        // Indices are assigned in module order, but sites are instrumented
        // last-to-first, so that splitting blocks never moves earlier sites.
        let first_index = self.records.len();
        let mut records: Vec<_> = sites
            .iter()
            .enumerate()
            .map(|(i, site)| {
                let (function, block, inst) = self.describe_loc(site.loc);
                let source = self.module.block(site.loc.block_loc()).and_then(|b| {
                    defs.source_loc(b.insts[..site.loc.inst.min(b.insts.len())].iter())
                });
                Some(InstrumentationRecord {
                    unique_shader_id: self.unique_shader_id,
                    inst_index: u32::try_from(first_index + i).unwrap_or(u32::MAX),
                    kind: site.kind,
                    function,
                    block,
                    inst,
                    source,
                })
            })
            .collect();

        for (site, record) in sites.iter().zip(&mut records).rev() {
            let Some(inst_index) = record.as_ref().map(|record| record.inst_index) else {
                continue;
            };
            tracing::trace!(
                unique_shader_id = self.unique_shader_id,
                inst_index,
                kind = ?site.kind,
                loc = ?site.loc,
                "instrumenting site"
            );
            if let Err(e) = self.apply_site(site, inst_index) {
                self.skip(site.loc, site.kind, e.to_string());
                *record = None;
            }
        }

        let applied: Vec<_> = records.into_iter().flatten().collect();
        let count = applied.len();
        self.records.extend(applied);
        count
    }

    fn apply_site(&mut self, site: &Site, inst_index: u32) -> Result<(), InsertError> {
        let wk = &spec::Spec::get().well_known;

        let mut prelude = vec![];
        let mut results = SmallVec::<[spv::Id; 2]>::new();
        let mut requests = SmallVec::<[(&str, usize); 2]>::new();
        for call in &site.calls {
            let bool_ty = self.cx.type_bool(&mut self.module);
            let mut args: SmallVec<[spv::Id; 8]> = [self.unique_shader_id, inst_index]
                .into_iter()
                .map(|x| self.cx.const_u32(&mut self.module, x))
                .collect();
            for &arg in &call.args {
                args.push(self.lower_arg(arg, &mut prelude));
            }
            let func = self.requests.id_for(&mut self.module, call.func);
            requests.push((call.func, args.len()));
            let result = self.module.alloc_id();
            prelude.push(
                spv::Inst::from(wk.OpFunctionCall)
                    .with_result(Some(bool_ty), result)
                    .with_ids([func])
                    .with_ids(args),
            );
            results.push(result);
        }

        match site.guard {
            Guard::ReportOnly => {
                for (i, inst) in prelude.into_iter().enumerate() {
                    let loc = InstLoc { inst: site.loc.inst + i, ..site.loc };
                    self.module.insert_inst(loc, inst)?;
                }
            }
            Guard::Conditional => {
                let mut ok = results[0];
                for &result in &results[1..] {
                    let bool_ty = self.cx.type_bool(&mut self.module);
                    let both = self.module.alloc_id();
                    prelude.push(
                        spv::Inst::from(wk.OpLogicalAnd)
                            .with_result(Some(bool_ty), both)
                            .with_ids([ok, result]),
                    );
                    ok = both;
                }
                self.guard(site.loc, prelude, ok)?;
            }
        }

        // Only functions actually called get linked.
        for (name, arg_count) in requests {
            self.requests.request(&mut self.module, name, arg_count);
        }
        Ok(())
    }

    /// Convert `arg` to the parameter type used by validation functions.
    fn lower_arg(&mut self, arg: Arg, prelude: &mut Vec<spv::Inst>) -> spv::Id {
        let wk = &spec::Spec::get().well_known;
        let (module, cx) = (&mut self.module, &mut self.cx);

        let mut push = |module: &mut Module, opcode, ty, ids: &[spv::Id]| {
            let id = module.alloc_id();
            prelude.push(
                spv::Inst::from(opcode).with_result(Some(ty), id).with_ids(ids.iter().copied()),
            );
            id
        };

        match arg {
            Arg::Value(id) => id,
            Arg::U32(x) => cx.const_u32(module, x),
            Arg::Index(id, IntType { width: 32, signed: false }) => id,
            Arg::Index(id, IntType { width, signed }) if width < 32 => {
                let u32_ty = cx.type_u32(module);
                push(module, if signed { wk.OpSConvert } else { wk.OpUConvert }, u32_ty, &[id])
            }
            Arg::Index(id, IntType { width: 32, signed: true }) => {
                let u32_ty = cx.type_u32(module);
                push(module, wk.OpBitcast, u32_ty, &[id])
            }
            Arg::Index(id, IntType { signed, .. }) => {
                let u32_ty = cx.type_u32(module);
                let u64_ty = cx.type_int(module, 64, false);
                let bool_ty = cx.type_bool(module);
                let [zero, thirty_two] = [0, 32].map(|x| cx.const_u64(module, x));
                let max = cx.const_u32(module, u32::MAX);

                let value = if signed { push(module, wk.OpBitcast, u64_ty, &[id]) } else { id };
                let high = push(module, wk.OpShiftRightLogical, u64_ty, &[value, thirty_two]);
                let too_big = push(module, wk.OpINotEqual, bool_ty, &[high, zero]);
                let low = push(module, wk.OpUConvert, u32_ty, &[value]);
                push(module, wk.OpSelect, u32_ty, &[too_big, max, low])
            }
            Arg::PtrToU64(ptr) => {
                let u64_ty = cx.type_int(module, 64, false);
                push(module, wk.OpConvertPtrToU, u64_ty, &[ptr])
            }
        }
    }

    /// Make the instruction at `loc` conditional on `ok` (computed by `prelude`).
    fn guard(
        &mut self,
        loc: InstLoc,
        prelude: Vec<spv::Inst>,
        ok: spv::Id,
    ) -> Result<(), InsertError> {
        let wk = &spec::Spec::get().well_known;

        let block =
            self.module.block(loc.block_loc()).ok_or(InsertError::NoSuchBlock(loc.block_loc()))?;
        let head_label = block.label_id();
        let Some(site_inst) = block.insts.get(loc.inst).cloned() else {
            return Err(InsertError::AfterTerminator(loc));
        };

        // `OpSampledImage`/`OpImage` results can only be used in the block
        // defining them, so they need to be cloned into any new block using them.
        let clone_for_site = same_block_image_defs(&block.insts[..loc.inst], site_inst.ids());
        let clone_for_rest = same_block_image_defs(
            &block.insts[..loc.inst],
            block.insts[loc.inst + 1..].iter().flat_map(|inst| inst.ids()),
        );

        let (valid_label, rest_label) = (self.module.alloc_id(), self.module.alloc_id());
        let head_tail = prelude.into_iter().chain([
            spv::Inst::from(wk.OpSelectionMerge)
                .with_ids([rest_label])
                .with_imm(OperandKind::SelectionControl, 0),
            spv::Inst::from(wk.OpBranchConditional).with_ids([ok, valid_label, rest_label]),
        ]);
        let rest = self.module.split_block(loc, rest_label, head_tail)?;

        let mut valid = Block::new(valid_label);
        let mut renames = FxHashMap::default();
        for inst in clone_for_site {
            let inst = self.clone_renamed(inst, &mut renames);
            valid.insts.push(inst);
        }
        let mut guarded = site_inst.clone();
        guarded.map_ids(|id| renames.get(&id).copied().unwrap_or(id));
        let new_result = site_inst.result_id.map(|_| self.module.alloc_id());
        guarded.result_id = new_result;
        valid.insts.push(guarded);
        valid.insts.push(spv::Inst::from(wk.OpBranch).with_ids([rest_label]));

        let mut rest_prefix = vec![];
        if let (Some(orig), Some(new), Some(ty)) =
            (site_inst.result_id, new_result, site_inst.result_type_id)
        {
            let null = self.cx.const_null(&mut self.module, ty);
            rest_prefix.push(
                spv::Inst::from(wk.OpPhi)
                    .with_result(Some(ty), orig)
                    .with_ids([new, valid_label, null, head_label]),
            );
            self.copy_decorations(orig, new);
        }
        let mut renames = FxHashMap::default();
        for inst in clone_for_rest {
            let inst = self.clone_renamed(inst, &mut renames);
            rest_prefix.push(inst);
        }

        let func = &mut self.module.funcs[rest.func];
        let rest_block = &mut func.blocks[rest.block];
        // The site itself is now only in the `valid` block.
        rest_block.insts.remove(0);
        for inst in &mut rest_block.insts {
            inst.map_ids(|id| renames.get(&id).copied().unwrap_or(id));
        }
        rest_block.insts.splice(0..0, rest_prefix);
        func.blocks.insert(rest.block, valid);

        Ok(())
    }

    fn clone_renamed(
        &mut self,
        inst: spv::Inst,
        renames: &mut FxHashMap<spv::Id, spv::Id>,
    ) -> spv::Inst {
        let mut inst = inst;
        let old = inst.result_id;
        inst.map_ids(|id| renames.get(&id).copied().unwrap_or(id));
        if let Some(old) = old {
            let new = self.module.alloc_id();
            renames.insert(old, new);
            inst.result_id = Some(new);
        }
        inst
    }

    fn copy_decorations(&mut self, from: spv::Id, to: spv::Id) {
        let wk = &spec::Spec::get().well_known;
        let copies: Vec<_> = self
            .module
            .annotations
            .iter()
            .filter(|inst| inst.opcode == wk.OpDecorate && inst.nth_id(0) == Some(from))
            .map(|inst| {
                let mut copy = inst.clone();
                copy.operands[0] = spv::Operand::Id(to);
                copy
            })
            .collect();
        self.module.annotations.extend(copies);
    }

    /// Link all requested validation functions, and serialize the module.
    pub fn finish(mut self) -> Result<InstrumentedShader, InstrumentError> {
        let linked = if self.requests.is_empty() {
            vec![]
        } else {
            let (module, cx, requests) = (&mut self.module, &mut self.cx, &mut self.requests);
            let reserved_set = self.options.reserved_set;
            timed_pass(self.options.verbose, "link", || {
                link::link(module, cx, requests, reserved_set)
            })?
        };
        let module = &self.module;
        let words =
            timed_pass(self.options.verbose, "serialize", || module.serialize_to_spv_words())?;
        Ok(InstrumentedShader { words, records: self.records, skipped: self.skipped, linked })
    }
}

fn timed_pass<R>(verbose: bool, name: &str, f: impl FnOnce() -> R) -> R {
    if !verbose {
        return f();
    }

    let start = Instant::now();
    let r = f();
    tracing::debug!("[{:8.3}ms] {name}", start.elapsed().as_secs_f64() * 1000.0);
    r
}

/// Instructions of `insts` defining `OpSampledImage`/`OpImage` results used
/// (directly, or through other such instructions) by `uses`, in order.
fn same_block_image_defs(
    insts: &[spv::Inst],
    uses: impl IntoIterator<Item = spv::Id>,
) -> Vec<spv::Inst> {
    let wk = &spec::Spec::get().well_known;

    let defs: FxHashMap<_, _> = insts
        .iter()
        .enumerate()
        .filter(|(_, inst)| [wk.OpSampledImage, wk.OpImage].contains(&inst.opcode))
        .filter_map(|(i, inst)| Some((inst.result_id?, i)))
        .collect();

    let mut needed = FxHashSet::default();
    let mut worklist: Vec<_> = uses.into_iter().collect();
    while let Some(id) = worklist.pop() {
        if let Some(&i) = defs.get(&id) {
            if needed.insert(i) {
                worklist.extend(insts[i].ids());
            }
        }
    }

    let mut needed: Vec<_> = needed.into_iter().collect();
    needed.sort_unstable();
    needed.into_iter().map(|i| insts[i].clone()).collect()
}

/// Instrument a copy of `original`, running all enabled passes.
pub fn instrument_module(
    original: &Module,
    options: &Options,
    features: DeviceFeatures,
    unique_shader_id: u32,
) -> Result<InstrumentedShader, InstrumentError> {
    let mut session = Session::new(original.clone(), options, features, unique_shader_id);
    session.run_enabled_passes()?;
    session.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{library, Func};

    fn single_block_module() -> Module {
        let wk = &spec::Spec::get().well_known;
        let header = spv::Header { version_major: 1, version_minor: 3, generator: 0, bound: 100 };
        let mut module = Module::new(header, spv::Inst::from(wk.OpMemoryModel));
        let id = |x| spv::Id::new(x).unwrap();
        let mut block = Block::new(id(10));
        block.insts.push(spv::Inst::from(wk.OpReturn));
        module.funcs.push(Func {
            def: spv::Inst::from(wk.OpFunction).with_result(Some(id(1)), id(2)),
            params: vec![],
            blocks: vec![block],
            end: spv::Inst::from(wk.OpFunctionEnd),
        });
        module
    }

    fn index_check_site(inst: usize, guard: Guard) -> Site {
        Site {
            loc: InstLoc { func: 0, block: 0, inst },
            kind: CheckKind::IndexedAccess,
            guard,
            calls: [CheckCall {
                func: library::INDEX_CHECK,
                args: [Arg::U32(1), Arg::U32(2)].into_iter().collect(),
            }]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn skipped_sites_request_no_functions() {
        let module = single_block_module();
        let mut session = Session::new(module, &Options::default(), DeviceFeatures::default(), 1);
        let defs = Defs::new(&session.module);

        let applied = session.apply_sites(&defs, vec![index_check_site(5, Guard::Conditional)]);
        assert_eq!(applied, 0);
        assert_eq!(session.skipped.len(), 1);
        assert!(session.requests.is_empty());

        let applied = session.apply_sites(&defs, vec![index_check_site(0, Guard::ReportOnly)]);
        assert_eq!(applied, 1);
        assert!(!session.requests.is_empty());
    }
}
