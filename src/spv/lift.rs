//! [`Module`] to SPIR-V lifting (serialization).

use crate::spv::write::{EmitError, ModuleEmitter};
use crate::spv;
use crate::Module;
use std::iter;

impl Module {
    /// All instructions of the module, in logical layout order.
    pub fn all_insts(&self) -> impl Iterator<Item = &spv::Inst> {
        self.capabilities
            .iter()
            .chain(&self.extensions)
            .chain(&self.ext_inst_imports)
            .chain(iter::once(&self.memory_model))
            .chain(&self.entry_points)
            .chain(&self.execution_modes)
            .chain(&self.debug)
            .chain(&self.annotations)
            .chain(&self.globals)
            .chain(self.funcs.iter().flat_map(|func| func.all_insts()))
    }

    fn emit(&self) -> Result<ModuleEmitter, EmitError> {
        let mut emitter = ModuleEmitter::with_header(self.header());
        for inst in self.all_insts() {
            emitter.push_inst(inst)?;
        }
        emitter.set_bound(self.id_bound());
        Ok(emitter)
    }

    pub fn serialize_to_spv_words(&self) -> Result<Vec<u32>, EmitError> {
        Ok(self.emit()?.words)
    }

    pub fn serialize_to_spv_bytes(&self) -> Result<Vec<u8>, EmitError> {
        Ok(self.emit()?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use crate::spv::spec::{OperandKind, Spec};
    use crate::spv::{self, Header};
    use crate::{Block, Func, Module};

    fn id(x: u32) -> spv::Id {
        spv::Id::new(x).unwrap()
    }

    #[test]
    fn built_module_reparses() {
        let wk = &Spec::get().well_known;
        let header = Header { version_major: 1, version_minor: 3, generator: 0, bound: 1 };
        let memory_model = spv::Inst::from(wk.OpMemoryModel)
            .with_imm(OperandKind::AddressingModel, wk.Logical)
            .with_imm(OperandKind::MemoryModel, wk.GLSL450);
        let mut module = Module::new(header, memory_model);
        module.capabilities.push(
            spv::Inst::from(wk.OpCapability).with_imm(OperandKind::Capability, wk.Shader),
        );

        let void = module.alloc_id();
        let fn_ty = module.alloc_id();
        module.globals.push(spv::Inst::from(wk.OpTypeVoid).with_result(None, void));
        module
            .globals
            .push(spv::Inst::from(wk.OpTypeFunction).with_result(None, fn_ty).with_ids([void]));

        let func_id = module.alloc_id();
        let mut block = Block::new(module.alloc_id());
        block.insts.push(spv::Inst::from(wk.OpReturn));
        module.funcs.push(Func {
            def: spv::Inst::from(wk.OpFunction)
                .with_result(Some(void), func_id)
                .with_imm(OperandKind::FunctionControl, 0)
                .with_ids([fn_ty]),
            params: vec![],
            blocks: vec![block],
            end: spv::Inst::from(wk.OpFunctionEnd),
        });
        module.entry_points.push(
            spv::Inst::from(wk.OpEntryPoint)
                .with_imm(OperandKind::ExecutionModel, 5)
                .with_ids([func_id])
                .with_literal_string("main"),
        );

        let words = module.serialize_to_spv_words().unwrap();
        assert_eq!(words[3], 5);
        let reparsed = Module::parse_spv_words(&words).unwrap();
        assert_eq!(reparsed.serialize_to_spv_words().unwrap(), words);
        assert_eq!(reparsed.funcs[0].id(), Some(id(3)));
    }

    #[test]
    fn mismatched_operands_are_rejected() {
        let wk = &Spec::get().well_known;
        let header = Header { version_major: 1, version_minor: 0, generator: 0, bound: 10 };
        let mut module = Module::new(header, spv::Inst::from(wk.OpMemoryModel));
        // `OpMemoryModel` with no operands at all.
        assert!(module.serialize_to_spv_words().is_err());

        module.memory_model = spv::Inst::from(wk.OpMemoryModel)
            .with_imm(OperandKind::AddressingModel, 0)
            .with_ids([id(3)]);
        assert!(module.serialize_to_spv_words().is_err());
    }
}
