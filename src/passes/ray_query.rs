//! Ray query checks: the parameters of `OpRayQueryInitializeKHR` (flags, and
//! the ray's origin, direction, and `[tmin, tmax]` interval) are validated
//! before the ray query is initialized.

use crate::instrument::{self, Arg, CheckCall, CheckKind, Guard, Site, Sites};
use crate::library;
use crate::spv::{self, spec};
use crate::{Defs, LocalDefs, Module};
use smallvec::{smallvec, SmallVec};

pub fn find_sites(module: &Module, defs: &Defs) -> Sites {
    let wk = &spec::Spec::get().well_known;

    let mut sites = Sites::default();
    instrument::walk_insts(module, |loc, locals, _, inst| {
        if inst.opcode != wk.OpRayQueryInitializeKHR {
            return;
        }
        let ids: SmallVec<[spv::Id; 8]> = inst.ids().collect();
        let &[_ray_query, _accel, flags, _cull_mask, origin, tmin, direction, tmax] = &ids[..]
        else {
            return sites.skip(loc, "malformed OpRayQueryInitializeKHR");
        };

        let checks = [
            (flags, ValueShape::U32),
            (origin, ValueShape::Vec3),
            (tmin, ValueShape::F32),
            (direction, ValueShape::Vec3),
            (tmax, ValueShape::F32),
        ];
        for (id, shape) in checks {
            if !shape.matches(defs, locals, id) {
                return sites.skip(loc, format!("%{id} is not a {shape:?}"));
            }
        }

        // The ray query is always initialized (invalid parameters are only
        // reported), as there is no null ray query to fall back to.
        let calls = smallvec![CheckCall {
            func: library::RAY_QUERY_CHECK,
            args: smallvec![
                Arg::Value(flags),
                Arg::Value(origin),
                Arg::Value(tmin),
                Arg::Value(direction),
                Arg::Value(tmax),
            ],
        }];
        sites.sites.push(Site { loc, kind: CheckKind::RayQuery, guard: Guard::ReportOnly, calls });
    });
    sites
}

/// Type expected of a `OpRayQueryInitializeKHR` operand.
#[derive(Copy, Clone, Debug)]
enum ValueShape {
    U32,
    F32,
    Vec3,
}

impl ValueShape {
    fn matches(self, defs: &Defs, locals: &LocalDefs<'_>, id: spv::Id) -> bool {
        let wk = &spec::Spec::get().well_known;

        let is_scalar = |ty: spv::Id, opcode| {
            defs.global(ty)
                .filter(|inst| inst.opcode == opcode)
                .and_then(|inst| inst.nth_short_imm(0))
                == Some(32)
        };
        let Some(ty) = defs.type_of(locals, id) else { return false };
        match self {
            ValueShape::U32 => is_scalar(ty, wk.OpTypeInt),
            ValueShape::F32 => is_scalar(ty, wk.OpTypeFloat),
            ValueShape::Vec3 => defs
                .global(ty)
                .filter(|inst| inst.opcode == wk.OpTypeVector)
                .filter(|inst| inst.nth_short_imm(0) == Some(3))
                .and_then(|inst| inst.nth_id(0))
                .is_some_and(|elem| is_scalar(elem, wk.OpTypeFloat)),
        }
    }
}
