//! Index checks: every dynamic index into a fixed-size array, vector or matrix
//! (through an access chain, or `OpVector{Extract,Insert}Dynamic`) is checked
//! against the length of the indexed composite.

use crate::instrument::{self, Arg, CheckCall, CheckKind, Guard, Site, Sites};
use crate::library;
use crate::spv::{self, spec};
use crate::{Defs, IndexStep, LocalDefs, Module};
use smallvec::{smallvec, SmallVec};

pub fn find_sites(module: &Module, defs: &Defs, reserved_set: u32) -> Sites {
    let wk = &spec::Spec::get().well_known;

    let mut sites = Sites::default();
    instrument::walk_insts(module, |loc, locals, block, inst| {
        let checks = if [wk.OpLoad, wk.OpStore].contains(&inst.opcode) {
            let Some(ptr) = inst.nth_id(0) else { return };
            access_chain_checks(defs, locals, ptr, reserved_set)
        } else if inst.opcode == wk.OpVectorExtractDynamic {
            let (Some(vector), Some(index)) = (inst.nth_id(0), inst.nth_id(1)) else { return };
            vector_checks(defs, locals, vector, index)
        } else if inst.opcode == wk.OpVectorInsertDynamic {
            let (Some(vector), Some(index)) = (inst.nth_id(0), inst.nth_id(2)) else { return };
            vector_checks(defs, locals, vector, index)
        } else {
            return;
        };

        let checks = match checks {
            Ok(checks) if checks.is_empty() => return,
            Ok(checks) => checks,
            Err(reason) => return sites.skip(loc, reason),
        };
        if let Err(reason) = instrument::check_guardable(defs, block, inst) {
            return sites.skip(loc, reason);
        }
        let calls = checks
            .into_iter()
            .map(|(index, bound)| CheckCall {
                func: library::INDEX_CHECK,
                args: smallvec![index, bound],
            })
            .collect();
        let kind = CheckKind::IndexedAccess;
        sites.sites.push(Site { loc, kind, guard: Guard::Conditional, calls });
    });
    sites
}

type Checks = SmallVec<[(Arg, Arg); 2]>;

fn index_arg(defs: &Defs, locals: &LocalDefs<'_>, index: spv::Id) -> Result<Arg, String> {
    Arg::index(defs, locals, index).ok_or_else(|| format!("unsupported index type for %{index}"))
}

/// Whether the constant `index` is statically known to be less than `bound`.
fn statically_in_bounds(defs: &Defs, index: spv::Id, bound: u64) -> bool {
    defs.const_u64(index).is_some_and(|index| index < bound)
}

fn access_chain_checks(
    defs: &Defs,
    locals: &LocalDefs<'_>,
    ptr: spv::Id,
    reserved_set: u32,
) -> Result<Checks, String> {
    let wk = &spec::Spec::get().well_known;

    let path = locals.access_path(ptr);
    if path.indices.is_empty() {
        return Ok(Checks::new());
    }
    let Some(root_ty) = defs.type_of(locals, path.root).and_then(|ty| defs.pointer_info(ty))
    else {
        return Ok(Checks::new());
    };

    // Indices into arrays of descriptors are checked by the descriptor pass
    // (against the bound descriptor count), not here.
    let mut indices = &path.indices[..];
    let mut ty = root_ty.pointee;
    if let Some((set, _)) = defs.descriptor_binding(path.root) {
        if set == reserved_set {
            return Ok(Checks::new());
        }
        let is_array = defs
            .global(ty)
            .is_some_and(|inst| [wk.OpTypeArray, wk.OpTypeRuntimeArray].contains(&inst.opcode));
        if is_array {
            let elem = defs.global(ty).and_then(|inst| inst.nth_id(0));
            match elem {
                Some(elem) => ty = elem,
                None => return Ok(Checks::new()),
            }
            indices = &indices[1..];
        }
    }

    let steps = defs
        .index_steps(ty, indices)
        .ok_or_else(|| format!("can't follow the access chain into %{}", path.root))?;

    let mut checks = Checks::new();
    for step in steps {
        let (index, bound) = match step {
            // Runtime arrays are bounded by their buffer, i.e. by robust
            // buffer access (or the device address checks).
            IndexStep::RuntimeArray { .. } | IndexStep::Struct { .. } => continue,
            IndexStep::Array { index, len } => match defs.const_u64(len) {
                Some(len) if statically_in_bounds(defs, index, len) => continue,
                Some(len) => (index, Arg::U32(u32::try_from(len).unwrap_or(u32::MAX))),
                None => (index, index_arg(defs, locals, len)?),
            },
            IndexStep::Vector { index, count: bound }
            | IndexStep::Matrix { index, columns: bound } => {
                if statically_in_bounds(defs, index, bound.into()) {
                    continue;
                }
                (index, Arg::U32(bound))
            }
        };
        checks.push((index_arg(defs, locals, index)?, bound));
    }
    Ok(checks)
}

fn vector_checks(
    defs: &Defs,
    locals: &LocalDefs<'_>,
    vector: spv::Id,
    index: spv::Id,
) -> Result<Checks, String> {
    let wk = &spec::Spec::get().well_known;

    let count = defs
        .type_of(locals, vector)
        .and_then(|ty| defs.global(ty))
        .filter(|ty| ty.opcode == wk.OpTypeVector)
        .and_then(|ty| ty.nth_short_imm(0))
        .ok_or_else(|| format!("%{vector} is not a vector"))?;
    if statically_in_bounds(defs, index, count.into()) {
        return Ok(Checks::new());
    }
    Ok(smallvec![(index_arg(defs, locals, index)?, Arg::U32(count))])
}
