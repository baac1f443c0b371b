mod common;

use spirt_gpuav::config::{DeviceFeatures, Options};
use spirt_gpuav::instrument::{self, CheckKind, InstrumentedShader, Session};
use spirt_gpuav::library;
use spirt_gpuav::spv::spec::Spec;
use spirt_gpuav::Module;

fn only(kind: CheckKind) -> Options {
    Options {
        descriptors: kind == CheckKind::Descriptor,
        indexing: kind == CheckKind::IndexedAccess,
        buffer_device_address: kind == CheckKind::DeviceAddress,
        ray_query: kind == CheckKind::RayQuery,
        ..Options::default()
    }
}

fn all_features() -> DeviceFeatures {
    DeviceFeatures { buffer_device_address: true, ray_query: true }
}

fn instrument(src: &str, options: &Options, unique_shader_id: u32) -> InstrumentedShader {
    let module = Module::parse_spv_words(&common::assemble(src)).unwrap();
    instrument::instrument_module(&module, options, all_features(), unique_shader_id).unwrap()
}

fn reparse(shader: &InstrumentedShader) -> Module {
    Module::parse_spv_words(&shader.words).unwrap()
}

#[test]
fn dynamic_array_indices_are_guarded() {
    let wk = &Spec::get().well_known;

    let shader = instrument(common::INDEXED_ARRAY, &only(CheckKind::IndexedAccess), 3);
    assert_eq!(shader.records.len(), 1);
    let record = &shader.records[0];
    assert_eq!((record.unique_shader_id, record.inst_index), (3, 0));
    assert_eq!(record.kind, CheckKind::IndexedAccess);
    assert!(record.inst.contains("OpLoad"), "{}", record.inst);
    assert_eq!(shader.linked, [library::INDEX_CHECK, library::LOG_ERROR]);
    assert!(!shader.is_partial());

    let module = reparse(&shader);
    assert_eq!(module.funcs.len(), 3);
    let main = &module.funcs[0];
    // The load now only happens in its own block, when the check passes.
    assert_eq!(main.blocks.len(), 3);
    assert_eq!(main.blocks[0].merge().map(|inst| inst.opcode), Some(wk.OpSelectionMerge));
    assert_eq!(main.blocks[2].insts[0].opcode, wk.OpPhi);
    assert!(main.blocks[0].insts.iter().any(|inst| inst.opcode == wk.OpFunctionCall));
}

#[test]
fn descriptor_checks_cover_buffers_and_images() {
    let shader = instrument(common::SAMPLED_TEXTURES, &only(CheckKind::Descriptor), 1);
    assert_eq!(shader.records.len(), 2);
    assert!(shader.records.iter().all(|record| record.kind == CheckKind::Descriptor));
    assert!(shader.records[1].inst.contains("OpImageSampleImplicitLod"));

    // Both sites share one copy of the check.
    assert_eq!(shader.linked, [library::BINDLESS_CHECK, library::LOG_ERROR]);
    let module = reparse(&shader);
    assert_eq!(module.funcs.len(), 3);
    assert!(module.has_capability(Spec::get().well_known.PhysicalStorageBufferAddresses));
}

#[test]
fn descriptor_checks_need_buffer_device_address() {
    let module = Module::parse_spv_words(&common::assemble(common::SAMPLED_TEXTURES)).unwrap();
    let features = DeviceFeatures { buffer_device_address: false, ..all_features() };
    let shader =
        instrument::instrument_module(&module, &only(CheckKind::Descriptor), features, 1).unwrap();
    assert!(shader.records.is_empty());
    assert!(shader.linked.is_empty());
}

#[test]
fn device_address_accesses_are_checked() {
    let shader = instrument(common::DEVICE_ADDRESS, &only(CheckKind::DeviceAddress), 9);
    assert_eq!(shader.records.len(), 2);
    assert_eq!(shader.linked, [library::BUFFER_ADDRESS_CHECK, library::LOG_ERROR]);
    reparse(&shader);

    // Modules without device addresses are left alone.
    let trivial = instrument(common::TRIVIAL, &only(CheckKind::DeviceAddress), 9);
    assert!(trivial.records.is_empty());
}

#[test]
fn ray_queries_are_checked_without_guards() {
    let wk = &Spec::get().well_known;

    let original = Module::parse_spv_words(&common::assemble(common::RAY_QUERY)).unwrap();
    let shader = instrument(common::RAY_QUERY, &only(CheckKind::RayQuery), 2);
    assert_eq!(shader.records.len(), 1);
    assert_eq!(shader.records[0].kind, CheckKind::RayQuery);

    let module = reparse(&shader);
    // Still a single block: the ray query is always initialized.
    assert_eq!(module.funcs[0].blocks.len(), 1);
    // SPIR-V 1.4 entry points list every global variable they use.
    let interface_len = |module: &Module| module.entry_points[0].ids().count();
    assert!(interface_len(&module) > interface_len(&original));
    assert!(module.funcs[0].blocks[0].insts.iter().any(|inst| inst.opcode == wk.OpFunctionCall));
}

#[test]
fn instrumentation_is_deterministic() {
    let options = Options::default();
    for src in [common::INDEXED_ARRAY, common::SAMPLED_TEXTURES, common::DEVICE_ADDRESS] {
        let a = instrument(src, &options, 7);
        let b = instrument(src, &options, 7);
        assert_eq!(a.words, b.words);
        assert_eq!(a.records, b.records);

        let c = instrument(src, &options, 8);
        assert_ne!(a.words, c.words);
    }
}

#[test]
fn reinstrumenting_links_nothing_new() {
    let options = only(CheckKind::IndexedAccess);
    let first = instrument(common::INDEXED_ARRAY, &options, 1);
    let module = reparse(&first);
    let second = instrument::instrument_module(&module, &options, all_features(), 1).unwrap();

    assert!(second.linked.is_empty());
    assert_eq!(reparse(&second).funcs.len(), module.funcs.len());
}

#[test]
fn reinstrumenting_leaves_linked_functions_alone() {
    let options = Options { indexing: false, ray_query: false, ..Options::default() };
    for src in [common::DEVICE_ADDRESS, common::SAMPLED_TEXTURES] {
        let first = instrument(src, &options, 1);
        let module = reparse(&first);
        let main = module.funcs[0].id().map(|id| id.get());
        let second = instrument::instrument_module(&module, &options, all_features(), 1).unwrap();

        // Only the shader's own code is instrumented again.
        assert!(!second.records.is_empty());
        assert!(second.records.iter().all(|record| record.function == main));
        assert!(second.linked.is_empty());
        assert_eq!(reparse(&second).funcs.len(), module.funcs.len());
    }

    let options = only(CheckKind::DeviceAddress);
    let first = instrument(common::DEVICE_ADDRESS, &options, 1);
    let second = instrument::instrument_module(&reparse(&first), &options, all_features(), 1);
    assert_eq!(second.unwrap().records.len(), first.records.len());
}

#[test]
fn ray_queries_need_the_ray_query_feature() {
    let module = Module::parse_spv_words(&common::assemble(common::RAY_QUERY)).unwrap();
    let features = DeviceFeatures { ray_query: false, ..all_features() };
    let session = Session::new(module.clone(), &only(CheckKind::RayQuery), features, 2);
    assert!(!session.is_pass_enabled(CheckKind::RayQuery));
    let shader =
        instrument::instrument_module(&module, &only(CheckKind::RayQuery), features, 2).unwrap();
    assert!(shader.records.is_empty());
    assert!(shader.linked.is_empty());

    let session = Session::new(module, &only(CheckKind::RayQuery), all_features(), 2);
    assert!(session.is_pass_enabled(CheckKind::RayQuery));
}

#[test]
fn passes_only_run_once_per_session() {
    let module = Module::parse_spv_words(&common::assemble(common::INDEXED_ARRAY)).unwrap();
    let mut session = Session::new(module, &Options::default(), all_features(), 1);
    assert_eq!(session.run_pass(CheckKind::IndexedAccess).unwrap(), 1);
    assert!(session.run_pass(CheckKind::IndexedAccess).is_err());
    assert_eq!(session.records().len(), 1);
    assert!(session.finish().is_ok());
}

#[test]
fn loop_headers_are_only_partially_instrumented() {
    let shader = instrument(common::LOOP_HEADER_ACCESS, &only(CheckKind::IndexedAccess), 1);
    assert!(shader.records.is_empty());
    assert!(shader.is_partial());
    assert_eq!(shader.skipped.len(), 1);
    assert_eq!(shader.skipped[0].kind, CheckKind::IndexedAccess);
    assert!(shader.skipped[0].reason.contains("loop header"));
}

#[test]
fn verbose_sessions_produce_the_same_shader() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();

    let quiet = instrument(common::SAMPLED_TEXTURES, &Options::default(), 4);
    let options = Options { verbose: true, ..Options::default() };
    let verbose = instrument(common::SAMPLED_TEXTURES, &options, 4);
    assert_eq!(quiet.words, verbose.words);
}
