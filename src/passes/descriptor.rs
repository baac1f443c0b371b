//! Descriptor checks: every buffer access (through a `Uniform`/`StorageBuffer`
//! variable), and every image operation, is checked against the snapshot of
//! the descriptor set it uses (index in bounds, descriptor written).

use crate::instrument::{self, Arg, CheckCall, CheckKind, Guard, Site, Sites};
use crate::interface;
use crate::library;
use crate::spv::{self, spec};
use crate::{Defs, LocalDefs, Module};
use smallvec::{smallvec, SmallVec};

/// One descriptor used by an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct DescriptorUse {
    set: u32,
    binding: u32,
    index: Arg,
}

fn is_image_op(opcode: spec::Opcode) -> bool {
    let wk = &spec::Spec::get().well_known;
    [
        wk.OpImageSampleImplicitLod,
        wk.OpImageSampleExplicitLod,
        wk.OpImageSampleDrefImplicitLod,
        wk.OpImageSampleDrefExplicitLod,
        wk.OpImageSampleProjImplicitLod,
        wk.OpImageSampleProjExplicitLod,
        wk.OpImageSampleProjDrefImplicitLod,
        wk.OpImageSampleProjDrefExplicitLod,
        wk.OpImageFetch,
        wk.OpImageGather,
        wk.OpImageDrefGather,
        wk.OpImageRead,
        wk.OpImageWrite,
        wk.OpImageQueryFormat,
        wk.OpImageQueryOrder,
        wk.OpImageQuerySizeLod,
        wk.OpImageQuerySize,
        wk.OpImageQueryLod,
        wk.OpImageQueryLevels,
        wk.OpImageQuerySamples,
    ]
    .contains(&opcode)
}

pub fn find_sites(module: &Module, defs: &Defs, reserved_set: u32) -> Sites {
    let wk = &spec::Spec::get().well_known;

    let mut sites = Sites::default();
    instrument::walk_insts(module, |loc, locals, block, inst| {
        let descriptors = if [wk.OpLoad, wk.OpStore].contains(&inst.opcode) {
            let Some(ptr) = inst.nth_id(0) else { return };
            match buffer_descriptor(defs, locals, ptr, reserved_set) {
                Ok(Some(desc)) => smallvec![desc],
                Ok(None) => return,
                Err(reason) => return sites.skip(loc, reason),
            }
        } else if is_image_op(inst.opcode) {
            let Some(image) = inst.nth_id(0) else { return };
            let mut descriptors = SmallVec::<[_; 2]>::new();
            match trace_image(defs, locals, image, reserved_set, &mut descriptors) {
                Ok(()) => descriptors,
                Err(reason) => return sites.skip(loc, reason),
            }
        } else {
            return;
        };
        if descriptors.is_empty() {
            return;
        }

        if let Err(reason) = instrument::check_guardable(defs, block, inst) {
            return sites.skip(loc, reason);
        }
        let calls = descriptors
            .into_iter()
            .map(|DescriptorUse { set, binding, index }| CheckCall {
                func: library::BINDLESS_CHECK,
                args: smallvec![Arg::U32(set), Arg::U32(binding), index],
            })
            .collect();
        let kind = CheckKind::Descriptor;
        sites.sites.push(Site { loc, kind, guard: Guard::Conditional, calls });
    });
    sites
}

/// The descriptor accessed through `var`, given the access chain indices
/// applied to it (the first of which selects an element of descriptor arrays).
fn descriptor_of_var(
    defs: &Defs,
    locals: &LocalDefs<'_>,
    var: spv::Id,
    indices: &[spv::Id],
    reserved_set: u32,
) -> Result<Option<DescriptorUse>, String> {
    let wk = &spec::Spec::get().well_known;

    let Some((set, binding)) = defs.descriptor_binding(var) else { return Ok(None) };
    if set == reserved_set {
        return Ok(None);
    }
    if set >= interface::MAX_SETS {
        return Err(format!("descriptor set {set} is beyond the highest one with snapshots"));
    }

    let pointee = defs
        .global(var)
        .and_then(|var| defs.pointer_info(var.result_type_id?))
        .map(|ptr| ptr.pointee)
        .ok_or_else(|| format!("%{var} is not a pointer variable"))?;
    let is_array = defs
        .global(pointee)
        .is_some_and(|ty| [wk.OpTypeArray, wk.OpTypeRuntimeArray].contains(&ty.opcode));

    let index = if is_array {
        let &index = indices
            .first()
            .ok_or_else(|| format!("the whole descriptor array %{var} is accessed at once"))?;
        Arg::index(defs, locals, index)
            .ok_or_else(|| format!("unsupported descriptor index type for %{index}"))?
    } else {
        Arg::U32(0)
    };
    Ok(Some(DescriptorUse { set, binding, index }))
}

fn buffer_descriptor(
    defs: &Defs,
    locals: &LocalDefs<'_>,
    ptr: spv::Id,
    reserved_set: u32,
) -> Result<Option<DescriptorUse>, String> {
    let wk = &spec::Spec::get().well_known;

    let path = locals.access_path(ptr);
    let storage_class = defs.var_storage_class(path.root);
    if ![Some(wk.Uniform), Some(wk.StorageBuffer)].contains(&storage_class) {
        return Ok(None);
    }
    descriptor_of_var(defs, locals, path.root, &path.indices, reserved_set)
}

/// Find the descriptors (images and samplers) that `id` was loaded from.
fn trace_image(
    defs: &Defs,
    locals: &LocalDefs<'_>,
    id: spv::Id,
    reserved_set: u32,
    descriptors: &mut SmallVec<[DescriptorUse; 2]>,
) -> Result<(), String> {
    let wk = &spec::Spec::get().well_known;

    let inst = locals
        .get(id)
        .ok_or_else(|| format!("image operand %{id} is not defined in the function"))?;
    let operand = |n| inst.nth_id(n).ok_or_else(|| format!("malformed {:?}", inst.opcode));

    if inst.opcode == wk.OpSampledImage {
        trace_image(defs, locals, operand(0)?, reserved_set, descriptors)?;
        trace_image(defs, locals, operand(1)?, reserved_set, descriptors)
    } else if [wk.OpImage, wk.OpCopyObject].contains(&inst.opcode) {
        trace_image(defs, locals, operand(0)?, reserved_set, descriptors)
    } else if inst.opcode == wk.OpLoad {
        let path = locals.access_path(operand(0)?);
        if defs.var_storage_class(path.root) != Some(wk.UniformConstant) {
            return Err(format!("image operand %{id} is not loaded from a descriptor"));
        }
        let desc = descriptor_of_var(defs, locals, path.root, &path.indices, reserved_set)?;
        descriptors.extend(desc);
        Ok(())
    } else {
        Err(format!("can't trace image operand %{id} (defined by {:?})", inst.opcode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ops_include_queries_but_not_texel_pointers() {
        let wk = &spec::Spec::get().well_known;
        assert!(is_image_op(wk.OpImageSampleImplicitLod));
        assert!(is_image_op(wk.OpImageQuerySize));
        assert!(!is_image_op(wk.OpImageTexelPointer));
        assert!(!is_image_op(wk.OpSampledImage));
    }
}
