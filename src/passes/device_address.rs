//! Buffer device address checks: every load/store through a
//! `PhysicalStorageBuffer` pointer is checked against the ranges of the
//! buffers alive when the command was recorded.

use crate::instrument::{self, Arg, CheckCall, CheckKind, Guard, Site, Sites};
use crate::library;
use crate::spv::spec;
use crate::{Defs, Module};
use smallvec::smallvec;

pub fn find_sites(module: &Module, defs: &Defs) -> Sites {
    let wk = &spec::Spec::get().well_known;

    let mut sites = Sites::default();
    instrument::walk_insts(module, |loc, locals, block, inst| {
        if ![wk.OpLoad, wk.OpStore].contains(&inst.opcode) {
            return;
        }
        let Some(ptr) = inst.nth_id(0) else { return };
        let Some(ptr_ty) = defs.type_of(locals, ptr).and_then(|ty| defs.pointer_info(ty)) else {
            return;
        };
        if ptr_ty.storage_class != wk.PhysicalStorageBuffer {
            return;
        }

        let pointee = ptr_ty.pointee;
        let Some(size) = defs.size_of(pointee) else {
            return sites.skip(loc, format!("unknown size for the pointee type %{pointee}"));
        };
        if let Err(reason) = instrument::check_guardable(defs, block, inst) {
            return sites.skip(loc, reason);
        }
        let calls = smallvec![CheckCall {
            func: library::BUFFER_ADDRESS_CHECK,
            args: smallvec![Arg::PtrToU64(ptr), Arg::U32(size)],
        }];
        let kind = CheckKind::DeviceAddress;
        sites.sites.push(Site { loc, kind, guard: Guard::Conditional, calls });
    });
    sites
}
