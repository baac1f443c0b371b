mod common;

use ash::vk::{self, Handle};
use spirt_gpuav::config::{DeviceFeatures, Options};
use spirt_gpuav::descriptor::{Descriptor, DescriptorSet, DescriptorSetLayout, LayoutBinding};
use spirt_gpuav::diag::{DiagnosticKind, RecordingSink, Severity};
use spirt_gpuav::gpu::HostAllocator;
use spirt_gpuav::instrument::CheckKind;
use spirt_gpuav::interface::{self, ErrorCode};
use spirt_gpuav::layer::{BoundState, GpuAv};
use spirt_gpuav::Module;
use std::borrow::Cow;
use std::sync::Arc;

struct Harness {
    host: Arc<HostAllocator>,
    sink: Arc<RecordingSink>,
    gpuav: GpuAv,
}

fn harness(options: Options) -> Harness {
    let host = HostAllocator::new();
    let sink = Arc::new(RecordingSink::default());
    let features = DeviceFeatures { buffer_device_address: true, ray_query: true };
    let gpuav = GpuAv::new(options, features, host.clone(), sink.clone());
    Harness { host, sink, gpuav }
}

fn indexing_only() -> Options {
    Options {
        descriptors: false,
        buffer_device_address: false,
        ray_query: false,
        ..Options::default()
    }
}

fn storage_set() -> Arc<DescriptorSet> {
    let bindings =
        [LayoutBinding { binding: 0, ty: vk::DescriptorType::STORAGE_BUFFER, count: 1 }];
    let layout = Arc::new(DescriptorSetLayout::new(bindings, false).unwrap());
    let set = DescriptorSet::new(layout, None);
    let descriptor = Descriptor::Buffer {
        buffer: vk::Buffer::from_raw(0x77),
        buffer_size: 20,
        offset: 0,
        range: vk::WHOLE_SIZE,
    };
    set.write(0, 0, &[descriptor]).unwrap();
    Arc::new(set)
}

fn output_words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Record one dispatch using `shader_id`, returning the handle of its output
/// buffer and the address of its input buffer (unless it was skipped).
fn dispatch(
    h: &Harness,
    cmd: vk::CommandBuffer,
    sets: &[Option<Arc<DescriptorSet>>],
    shader_id: u32,
) -> Option<(vk::Buffer, vk::DeviceAddress)> {
    let bound = BoundState { sets, shader_ids: &[shader_id] };
    h.gpuav
        .cmd_dispatch(cmd, bound, |resources| {
            resources.map(|r| (r.output.handle(), r.input.device_address()))
        })
        .expect("dispatch with a bound pipeline is never rejected")
}

#[test]
fn unparseable_shaders_are_used_unchanged() {
    let h = harness(Options::default());
    let code = [1, 2, 3];
    let (id, out) = h.gpuav.create_shader_module(&code);
    assert!(matches!(out, Cow::Borrowed(out) if out == code));

    let diags = h.sink.take();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, DiagnosticKind::ShaderParse);
    assert_eq!(diags[0].severity, Severity::Warning);
    assert_eq!(diags[0].unique_shader_id, Some(id));
}

#[test]
fn shaders_get_unique_ids_and_instrumented_code() {
    let h = harness(Options::default());
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (first, out) = h.gpuav.create_shader_module(&code);
    let Cow::Owned(out) = out else { panic!("shader wasn't instrumented") };
    assert_ne!(out, code);
    assert!(Module::parse_spv_bytes(&out).is_ok());
    assert!(h.gpuav.shader(first).is_some_and(|shader| shader.is_instrumented()));

    // Nothing to check, so the original code is kept.
    let trivial = common::to_bytes(&common::assemble(common::TRIVIAL));
    let (second, out) = h.gpuav.create_shader_module(&trivial);
    assert_ne!(first, second);
    assert!(matches!(out, Cow::Borrowed(_)));
    assert!(h.gpuav.shader(second).is_some_and(|shader| !shader.is_instrumented()));
    assert!(h.sink.is_empty());
}

#[test]
fn disabled_validation_leaves_shaders_alone() {
    let options = Options { indexing: false, ..indexing_only() };
    let h = harness(options);
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, out) = h.gpuav.create_shader_module(&code);
    assert!(matches!(out, Cow::Borrowed(_)));
    assert!(h.gpuav.shader(id).is_none());
}

#[test]
fn gpu_errors_are_reported_with_context() {
    let h = harness(Options { descriptors: true, ..indexing_only() });
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, _) = h.gpuav.create_shader_module(&code);
    let info = h.gpuav.shader(id).unwrap();
    let index_check = info.records.iter().find(|r| r.kind == CheckKind::IndexedAccess).unwrap();

    let cmd = vk::CommandBuffer::from_raw(1);
    let set = storage_set();
    let (output, input) = dispatch(&h, cmd, &[Some(set.clone())], id).unwrap();
    assert_eq!(h.gpuav.command_resource_count(cmd), 1);

    // No address table, and a snapshot for set 0 only.
    let input_words = h.host.read_words_at(input, 2 + 2 * interface::MAX_SETS as usize).unwrap();
    assert_eq!(input_words[..2], [0, 0]);
    let snapshot = u64::from(input_words[2]) | (u64::from(input_words[3]) << 32);
    assert!(input_words[4..].iter().all(|&w| w == 0));
    let expected = set.encode_snapshot().unwrap();
    assert_eq!(h.host.read_words_at(snapshot, expected.len()), Some(expected));

    // What `inst_log_error` would write for an out-of-bounds index.
    let code = ErrorCode::IndexOutOfBounds as u32;
    let record = [interface::ERROR_RECORD_WORDS, id, index_check.inst_index, code, 9, 4, 0, 0];
    assert!(h.host.device_write(output, 0, &output_words(&record)));

    // The shader module can be destroyed before the command completes.
    h.gpuav.destroy_shader_module(id);
    assert_eq!(h.gpuav.process_output(cmd), 1);
    assert_eq!(h.gpuav.command_resource_count(cmd), 0);

    let diags = h.sink.take();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, DiagnosticKind::Gpu(ErrorCode::IndexOutOfBounds));
    assert_eq!(diags[0].severity, Severity::Error);
    assert_eq!(diags[0].unique_shader_id, Some(id));
    assert!(diags[0].message.contains("index 9 is out of bounds"), "{}", diags[0].message);
    assert!(diags[0].message.contains("OpLoad"), "{}", diags[0].message);

    // Only the (cached) snapshot outlives the command.
    assert_eq!(h.host.live_buffers(), 1);
}

#[test]
fn overflowing_and_malformed_output_is_reported() {
    let h = harness(Options { max_records: 1, ..indexing_only() });
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, _) = h.gpuav.create_shader_module(&code);

    let cmd = vk::CommandBuffer::from_raw(2);
    let (output, _) = dispatch(&h, cmd, &[], id).unwrap();

    // Two records written, one with an unknown code, the other didn't fit.
    let record = [2 * interface::ERROR_RECORD_WORDS, id, 0, 99, 0, 0, 0, 0];
    assert!(h.host.device_write(output, 0, &output_words(&record)));
    assert_eq!(h.gpuav.process_output(cmd), 0);

    let kinds: Vec<_> = h.sink.take().into_iter().map(|diag| diag.kind).collect();
    assert_eq!(kinds, [DiagnosticKind::MalformedRecord, DiagnosticKind::OutputOverflow]);
}

#[test]
fn commands_using_the_reserved_set_are_not_validated() {
    let h = harness(indexing_only());
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, _) = h.gpuav.create_shader_module(&code);

    let mut sets = vec![None; interface::DEFAULT_RESERVED_SET as usize + 1];
    sets[interface::DEFAULT_RESERVED_SET as usize] = Some(storage_set());
    let cmd = vk::CommandBuffer::from_raw(3);
    assert_eq!(dispatch(&h, cmd, &sets, id), None);
    assert_eq!(h.gpuav.command_resource_count(cmd), 0);

    let diags = h.sink.take();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, DiagnosticKind::ReservedSetInUse);
}

#[test]
fn allocation_failures_fall_back_to_the_original_command() {
    let h = harness(indexing_only());
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, _) = h.gpuav.create_shader_module(&code);

    h.host.fail_next_creates(1);
    let cmd = vk::CommandBuffer::from_raw(4);
    assert_eq!(dispatch(&h, cmd, &[], id), None);
    assert_eq!(h.gpuav.command_resource_count(cmd), 0);
    assert_eq!(h.host.live_buffers(), 0);

    let diags = h.sink.take();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, DiagnosticKind::ResourceAllocation);

    // The next command is validated again.
    assert!(dispatch(&h, cmd, &[], id).is_some());
    assert_eq!(h.gpuav.command_resource_count(cmd), 1);
    h.gpuav.reset_command_buffer(cmd);
    assert_eq!(h.host.live_buffers(), 0);
}

#[test]
fn commands_without_instrumented_shaders_are_forwarded_unchanged() {
    let h = harness(indexing_only());
    let code = common::to_bytes(&common::assemble(common::TRIVIAL));
    let (id, _) = h.gpuav.create_shader_module(&code);

    let cmd = vk::CommandBuffer::from_raw(5);
    assert_eq!(dispatch(&h, cmd, &[], id), None);
    assert_eq!(h.host.buffers_created(), 0);

    // Without a bound pipeline, the command is rejected outright.
    let mut forwarded = false;
    let rejected = h.gpuav.cmd_draw(cmd, BoundState::default(), |_| forwarded = true);
    assert_eq!(rejected, None);
    assert!(!forwarded);
}

#[test]
fn address_table_tracks_live_buffers() {
    let h = harness(Options::default());
    let (a, b) = (vk::Buffer::from_raw(10), vk::Buffer::from_raw(11));
    h.gpuav.register_buffer_address(b, 0x2_0000, 0x100);
    h.gpuav.register_buffer_address(a, 0x1_0000, 0x40);

    let table = h.gpuav.prepare_address_table().unwrap().device_address();
    let again = h.gpuav.prepare_address_table().map(|table| table.device_address());
    assert_eq!(again, Some(table));
    assert_eq!(h.gpuav.address_table_rebuild_count(), 1);
    assert_eq!(
        h.host.read_words_at(table, 10),
        Some(vec![2, 0, 0x1_0000, 0, 0x1_0040, 0, 0x2_0000, 0, 0x2_0100, 0])
    );

    h.gpuav.unregister_buffer(a);
    let table = h.gpuav.prepare_address_table().unwrap().device_address();
    assert_eq!(h.gpuav.address_table_rebuild_count(), 2);
    assert_eq!(h.host.read_words_at(table, 6), Some(vec![1, 0, 0x2_0000, 0, 0x2_0100, 0]));
}

/// Address in slot `slot` of the input buffer (`0` for the address table,
/// `1 + set` for descriptor set snapshots).
fn input_address(h: &Harness, input: vk::DeviceAddress, slot: usize) -> vk::DeviceAddress {
    let words = h.host.read_words_at(input, 2 + 2 * interface::MAX_SETS as usize).unwrap();
    u64::from(words[2 * slot]) | (u64::from(words[2 * slot + 1]) << 32)
}

#[test]
fn snapshots_outlive_set_updates_until_the_command_completes() {
    let h = harness(Options { descriptors: true, ..indexing_only() });
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, _) = h.gpuav.create_shader_module(&code);
    let set = storage_set();
    let (first, second) = (vk::CommandBuffer::from_raw(6), vk::CommandBuffer::from_raw(7));

    let (_, input) = dispatch(&h, first, &[Some(set.clone())], id).unwrap();
    let old = input_address(&h, input, 1);
    let old_words = set.encode_snapshot().unwrap();

    // Updating the set before `first` completes gets `second` a new snapshot.
    set.write(0, 0, &[Descriptor::Null]).unwrap();
    let (_, input) = dispatch(&h, second, &[Some(set.clone())], id).unwrap();
    let new = input_address(&h, input, 1);
    assert_ne!(old, new);
    assert_eq!(set.snapshot_rebuild_count(), 2);

    assert_eq!(h.host.read_words_at(old, old_words.len()), Some(old_words));
    assert_eq!(h.gpuav.process_output(first), 0);
    assert_eq!(h.host.read_words_at(old, 1), None);

    let new_words = set.encode_snapshot().unwrap();
    assert_eq!(h.host.read_words_at(new, new_words.len()), Some(new_words));
    h.gpuav.reset_command_buffer(second);
    assert_eq!(h.host.live_buffers(), 1);
}

#[test]
fn address_tables_outlive_buffer_changes_until_the_command_completes() {
    let h = harness(Options { buffer_device_address: true, ..indexing_only() });
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, _) = h.gpuav.create_shader_module(&code);
    h.gpuav.register_buffer_address(vk::Buffer::from_raw(10), 0x1_0000, 0x40);

    let cmd = vk::CommandBuffer::from_raw(8);
    let (_, input) = dispatch(&h, cmd, &[], id).unwrap();
    let table = input_address(&h, input, 0);
    assert_ne!(table, 0);

    h.gpuav.unregister_buffer(vk::Buffer::from_raw(10));
    let rebuilt = h.gpuav.prepare_address_table().unwrap();
    assert_ne!(rebuilt.device_address(), table);
    assert_eq!(h.host.read_words_at(table, 2), Some(vec![1, 0]));

    h.gpuav.reset_command_buffer(cmd);
    assert_eq!(h.host.read_words_at(table, 2), None);
}

#[test]
fn partially_instrumented_shaders_are_reported_once() {
    let h = harness(indexing_only());
    let code = common::to_bytes(&common::assemble(common::LOOP_HEADER_ACCESS));
    let (first, out) = h.gpuav.create_shader_module(&code);
    assert!(matches!(out, Cow::Borrowed(_)));
    let (second, _) = h.gpuav.create_shader_module(&code);

    let diags = h.sink.take();
    assert_eq!(diags.len(), 2);
    for (diag, id) in diags.iter().zip([first, second]) {
        assert_eq!(diag.kind, DiagnosticKind::PartialInstrumentation);
        assert_eq!(diag.severity, Severity::Warning);
        assert_eq!(diag.unique_shader_id, Some(id));
        assert!(diag.message.contains("loop header"), "{}", diag.message);
    }
    assert!(h.gpuav.shader(first).is_some_and(|shader| shader.skipped.len() == 1));
}

#[test]
fn failed_instrumentation_falls_back_to_the_original_shader() {
    // Linking adds the instrumentation buffers to the entry point interface,
    // which then no longer fits in one instruction.
    let interface = " %buf".repeat(usize::from(u16::MAX) - 5);
    let src = common::INDEXED_ARRAY.replace(
        r#"OpEntryPoint GLCompute %main "main""#,
        &format!(r#"OpEntryPoint GLCompute %main "main"{interface}"#),
    );
    let code = common::to_bytes(&common::assemble(&format!("; version 1.4\n{src}")));
    assert!(Module::parse_spv_bytes(&code).is_ok());

    let h = harness(indexing_only());
    let (id, out) = h.gpuav.create_shader_module(&code);
    assert!(matches!(out, Cow::Borrowed(out) if out == code));
    assert!(h.gpuav.shader(id).is_none());

    let diags = h.sink.take();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, DiagnosticKind::InstrumentationFailed);
    assert_eq!(diags[0].severity, Severity::Error);
    assert_eq!(diags[0].unique_shader_id, Some(id));
}

#[test]
fn unavailable_snapshots_only_disable_descriptor_checks() {
    let h = harness(Options { descriptors: true, ..indexing_only() });
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, _) = h.gpuav.create_shader_module(&code);

    // The snapshot is the first buffer created for the command.
    h.host.fail_next_creates(1);
    let cmd = vk::CommandBuffer::from_raw(9);
    let (_, input) = dispatch(&h, cmd, &[Some(storage_set())], id).unwrap();
    assert_eq!(input_address(&h, input, 1), 0);
    assert_eq!(h.gpuav.command_resource_count(cmd), 1);

    let diags = h.sink.take();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, DiagnosticKind::SnapshotUnavailable);
    assert_eq!(diags[0].severity, Severity::Warning);
}

#[test]
fn oversized_snapshots_are_reported_as_unavailable() {
    let h = harness(Options { descriptors: true, ..indexing_only() });
    let code = common::to_bytes(&common::assemble(common::INDEXED_ARRAY));
    let (id, _) = h.gpuav.create_shader_module(&code);

    let bindings =
        [LayoutBinding { binding: u32::MAX, ty: vk::DescriptorType::STORAGE_BUFFER, count: 1 }];
    let layout = Arc::new(DescriptorSetLayout::new(bindings, false).unwrap());
    let set = Arc::new(DescriptorSet::new(layout, None));

    let cmd = vk::CommandBuffer::from_raw(10);
    let (_, input) = dispatch(&h, cmd, &[Some(set)], id).unwrap();
    assert_eq!(input_address(&h, input, 1), 0);

    let diags = h.sink.take();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind, DiagnosticKind::SnapshotUnavailable);
    assert!(diags[0].message.contains("words"), "{}", diags[0].message);
}
