//! The device-level entry points of GPU-assisted validation, called by the
//! interception layer (which owns the actual Vulkan dispatch).

use crate::bridge::{self, Call, Hooks, Phase, Slot};
use crate::config::{DeviceFeatures, Options};
use crate::descriptor::DescriptorSet;
use crate::diag::{Diagnostic, DiagnosticKind, ErrorRecord, ReportSink, Severity};
use crate::gpu::{
    AllocError, GpuAllocator, GpuBuffer, VersionedBuffer, INSTRUMENTATION_BUFFER_USAGE,
};
use crate::instrument::{self, InstrumentationRecord, SkippedSite};
use crate::interface;
use crate::{FxIndexMap, Module};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// What's known about one (instrumented) shader, shared by every command
/// using it.
pub struct ShaderInfo {
    pub unique_shader_id: u32,

    /// The original (uninstrumented) module.
    pub module: Arc<Module>,

    /// Indexed by instrumentation index.
    pub records: Vec<InstrumentationRecord>,

    pub skipped: Vec<SkippedSite>,
}

impl ShaderInfo {
    pub fn is_instrumented(&self) -> bool {
        !self.records.is_empty()
    }

    fn record(&self, inst_index: u32) -> Option<&InstrumentationRecord> {
        self.records.get(inst_index as usize).filter(|record| record.inst_index == inst_index)
    }
}

/// The instrumentation buffers used by one recorded command.
pub struct CommandResources {
    pub output: GpuBuffer,
    pub input: GpuBuffer,

    /// The address table and descriptor set snapshots referenced by `input`,
    /// kept alive even if newer versions are built before the command completes.
    pub snapshots: SmallVec<[Arc<GpuBuffer>; 4]>,

    /// The instrumented shaders used by the command (kept alive until its
    /// output is processed, even if their modules are destroyed first).
    pub shaders: SmallVec<[Arc<ShaderInfo>; 4]>,
}

impl CommandResources {
    fn shader(&self, unique_shader_id: u32) -> Option<&ShaderInfo> {
        let mut shaders = self.shaders.iter().map(|shader| &**shader);
        shaders.find(|shader| shader.unique_shader_id == unique_shader_id)
    }
}

/// State bound when a command is recorded, as tracked by the state tracker.
#[derive(Copy, Clone, Default)]
pub struct BoundState<'a> {
    /// Bound descriptor sets, indexed by set number.
    pub sets: &'a [Option<Arc<DescriptorSet>>],

    /// Unique IDs of the shaders in the bound pipeline.
    pub shader_ids: &'a [u32],
}

#[derive(Default)]
struct CommandBufferState {
    resources: Vec<CommandResources>,
}

#[derive(Default)]
struct AddressTable {
    version: u64,
    ranges: FxIndexMap<vk::Buffer, (vk::DeviceAddress, vk::DeviceAddress)>,
    cache: VersionedBuffer,
}

/// Encode the address table (see [`interface`]), with ranges sorted by address.
fn encode_address_table(
    ranges: &FxIndexMap<vk::Buffer, (vk::DeviceAddress, vk::DeviceAddress)>,
) -> Vec<u32> {
    let mut ranges: Vec<_> = ranges.values().copied().collect();
    ranges.sort_unstable();

    let count = u32::try_from(ranges.len()).unwrap_or(u32::MAX);
    let mut words = vec![count, 0];
    for (start, end) in ranges {
        words.extend(split_u64(start));
        words.extend(split_u64(end));
    }
    words
}

fn split_u64(x: u64) -> [u32; 2] {
    [x as u32, (x >> 32) as u32]
}

/// GPU-assisted validation state for one device.
pub struct GpuAv {
    options: Options,
    features: DeviceFeatures,
    allocator: Arc<dyn GpuAllocator>,
    sink: Arc<dyn ReportSink>,

    shaders: RwLock<FxHashMap<u32, Arc<ShaderInfo>>>,
    next_shader_id: AtomicU32,

    addresses: Mutex<AddressTable>,
    command_buffers: Mutex<FxHashMap<vk::CommandBuffer, CommandBufferState>>,
}

impl GpuAv {
    pub fn new(
        options: Options,
        features: DeviceFeatures,
        allocator: Arc<dyn GpuAllocator>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            options,
            features,
            allocator,
            sink,
            shaders: Default::default(),
            next_shader_id: AtomicU32::new(1),
            addresses: Default::default(),
            command_buffers: Default::default(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn report(&self, diag: Diagnostic) {
        self.sink.report(diag);
    }

    /// Intercepted `vkCreateShaderModule`: assign a unique ID to the shader,
    /// and instrument it.
    pub fn create_shader_module<'a>(&self, code: &'a [u8]) -> (u32, Cow<'a, [u8]>) {
        let unique_shader_id = self.next_shader_id.fetch_add(1, Ordering::Relaxed);
        (unique_shader_id, self.instrument_shader_module(code, unique_shader_id))
    }

    /// Instrument `code`, returning either the instrumented shader, or (after
    /// reporting why) `code` itself.
    pub fn instrument_shader_module<'a>(
        &self,
        code: &'a [u8],
        unique_shader_id: u32,
    ) -> Cow<'a, [u8]> {
        if !self.options.any_pass_enabled() {
            return Cow::Borrowed(code);
        }

        let module = match Module::parse_spv_bytes(code) {
            Ok(module) => module,
            Err(e) => {
                self.report(
                    Diagnostic::new(
                        Severity::Warning,
                        DiagnosticKind::ShaderParse,
                        format!("shader can't be instrumented: {e}"),
                    )
                    .with_shader(unique_shader_id),
                );
                return Cow::Borrowed(code);
            }
        };

        let shader = match instrument::instrument_module(
            &module,
            &self.options,
            self.features,
            unique_shader_id,
        ) {
            Ok(shader) => shader,
            Err(e) => {
                tracing::error!(unique_shader_id, "instrumentation failed: {e}");
                self.report(
                    Diagnostic::new(
                        Severity::Error,
                        DiagnosticKind::InstrumentationFailed,
                        format!("using the original shader, as instrumenting it failed: {e}"),
                    )
                    .with_shader(unique_shader_id),
                );
                return Cow::Borrowed(code);
            }
        };

        if let Some(first) = shader.skipped.first() {
            self.report(
                Diagnostic::new(
                    Severity::Warning,
                    DiagnosticKind::PartialInstrumentation,
                    format!(
                        "{} operation(s) couldn't be instrumented (first: `{}`: {})",
                        shader.skipped.len(),
                        first.inst,
                        first.reason
                    ),
                )
                .with_shader(unique_shader_id),
            );
        }
        tracing::debug!(
            unique_shader_id,
            sites = shader.records.len(),
            skipped = shader.skipped.len(),
            linked = ?shader.linked,
            "instrumented shader"
        );

        let instrumented = !shader.records.is_empty();
        let info = ShaderInfo {
            unique_shader_id,
            module: Arc::new(module),
            records: shader.records,
            skipped: shader.skipped,
        };
        self.shaders.write().insert(unique_shader_id, Arc::new(info));

        if instrumented {
            Cow::Owned(bytemuck::cast_slice::<u32, u8>(&shader.words[..]).to_vec())
        } else {
            Cow::Borrowed(code)
        }
    }

    pub fn shader(&self, unique_shader_id: u32) -> Option<Arc<ShaderInfo>> {
        self.shaders.read().get(&unique_shader_id).cloned()
    }

    /// Intercepted `vkDestroyShaderModule` (the shader's records stay alive
    /// as long as recorded commands using it do).
    pub fn destroy_shader_module(&self, unique_shader_id: u32) {
        self.shaders.write().remove(&unique_shader_id);
    }

    /// Get `set`'s snapshot, or `None` (after reporting why) if it couldn't be built.
    pub fn prepare_descriptor_snapshot(&self, set: &DescriptorSet) -> Option<Arc<GpuBuffer>> {
        match set.prepare_snapshot(&self.allocator) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("descriptor checks disabled for one command: {e}");
                self.report(Diagnostic::new(
                    Severity::Warning,
                    DiagnosticKind::SnapshotUnavailable,
                    format!("descriptor set snapshot unavailable: {e}"),
                ));
                None
            }
        }
    }

    /// Track the device address range of a newly bound buffer.
    pub fn register_buffer_address(
        &self,
        buffer: vk::Buffer,
        address: vk::DeviceAddress,
        size: u64,
    ) {
        let mut table = self.addresses.lock();
        table.ranges.insert(buffer, (address, address.saturating_add(size)));
        table.version += 1;
    }

    /// Intercepted `vkDestroyBuffer`.
    pub fn unregister_buffer(&self, buffer: vk::Buffer) {
        let mut table = self.addresses.lock();
        if table.ranges.swap_remove(&buffer).is_some() {
            table.version += 1;
        }
    }

    /// Get the table of live buffer address ranges, or `None` (after reporting
    /// why) if it couldn't be built.
    pub fn prepare_address_table(&self) -> Option<Arc<GpuBuffer>> {
        let mut table = self.addresses.lock();
        let AddressTable { version, ranges, cache } = &mut *table;
        let encode = || Ok::<_, AllocError>(encode_address_table(ranges));
        match cache.get_or_rebuild(*version, &self.allocator, encode) {
            Ok(table) => Some(table),
            Err(e) => {
                tracing::warn!("device address checks disabled for one command: {e}");
                self.report(Diagnostic::new(
                    Severity::Warning,
                    DiagnosticKind::SnapshotUnavailable,
                    format!("buffer address table unavailable: {e}"),
                ));
                None
            }
        }
    }

    /// How many times the address table was (re)built.
    pub fn address_table_rebuild_count(&self) -> u64 {
        self.addresses.lock().cache.rebuild_count()
    }

    /// Intercepted `vkCmdDispatch*`, with `forward` recording the actual
    /// command (given the instrumentation buffers to bind, unless skipped).
    ///
    /// Returns `None` if the command was rejected (and not forwarded at all).
    pub fn cmd_dispatch<R>(
        &self,
        cmd: vk::CommandBuffer,
        bound: BoundState<'_>,
        forward: impl FnOnce(Option<&CommandResources>) -> R,
    ) -> Option<R> {
        self.instrumented_command(cmd, bound, forward)
    }

    /// Intercepted `vkCmdDraw*` (see [`GpuAv::cmd_dispatch`]).
    pub fn cmd_draw<R>(
        &self,
        cmd: vk::CommandBuffer,
        bound: BoundState<'_>,
        forward: impl FnOnce(Option<&CommandResources>) -> R,
    ) -> Option<R> {
        self.instrumented_command(cmd, bound, forward)
    }

    fn instrumented_command<R>(
        &self,
        cmd: vk::CommandBuffer,
        bound: BoundState<'_>,
        forward: impl FnOnce(Option<&CommandResources>) -> R,
    ) -> Option<R> {
        bridge::run_call(&mut CommandHooks {
            layer: self,
            cmd,
            bound,
            forward: Some(forward),
            _output: PhantomData,
        })
    }

    /// Number of instrumentation buffer sets held by `cmd`.
    pub fn command_resource_count(&self, cmd: vk::CommandBuffer) -> usize {
        self.command_buffers.lock().get(&cmd).map_or(0, |state| state.resources.len())
    }

    /// Intercepted `vkResetCommandBuffer`/`vkFreeCommandBuffers`.
    pub fn reset_command_buffer(&self, cmd: vk::CommandBuffer) {
        self.command_buffers.lock().remove(&cmd);
    }

    /// Analyze the output buffers of `cmd` (once its execution completed),
    /// reporting every error found by instrumented shaders, and releasing the
    /// buffers. Returns the number of errors reported.
    pub fn process_output(&self, cmd: vk::CommandBuffer) -> usize {
        let Some(state) = self.command_buffers.lock().remove(&cmd) else { return 0 };

        let mut reported = 0;
        for resources in &state.resources {
            let words = match resources.output.read_words() {
                Ok(words) => words,
                Err(e) => {
                    self.report(Diagnostic::new(
                        Severity::Warning,
                        DiagnosticKind::ResourceAllocation,
                        format!("couldn't read instrumentation output: {e}"),
                    ));
                    continue;
                }
            };

            let output = ErrorRecord::decode_output(&words);
            for record in &output.records {
                if self.report_gpu_error(resources, record) {
                    reported += 1;
                }
            }
            if output.dropped > 0 {
                self.report(Diagnostic::new(
                    Severity::Warning,
                    DiagnosticKind::OutputOverflow,
                    format!(
                        "{} more error(s) were detected, but didn't fit in the output buffer \
                         (see `max_records`)",
                        output.dropped
                    ),
                ));
            }
        }
        reported
    }

    fn report_gpu_error(&self, resources: &CommandResources, record: &ErrorRecord) -> bool {
        let shader = resources.shader(record.unique_shader_id);
        let context = shader.and_then(|shader| shader.record(record.inst_index));
        let (Some(code), Some(context)) = (record.error_code(), context) else {
            self.report(Diagnostic::new(
                Severity::Warning,
                DiagnosticKind::MalformedRecord,
                format!("unrecognized error record {record:?}"),
            ));
            return false;
        };

        let mut message = format!("{}, in `{}`", record.describe(), context.inst);
        if let Some(func) = context.function {
            message += &format!(" (function %{func}, block %{})", context.block);
        }
        if let Some(source) = &context.source {
            message += &format!(" at {}:{}:{}", source.file, source.line, source.column);
        }
        self.report(
            Diagnostic::new(Severity::Error, DiagnosticKind::Gpu(code), message)
                .with_shader(record.unique_shader_id),
        );
        true
    }
}

struct CommandHooks<'a, F, R> {
    layer: &'a GpuAv,
    cmd: vk::CommandBuffer,
    bound: BoundState<'a>,
    forward: Option<F>,
    _output: PhantomData<fn() -> R>,
}

struct CommandState {
    shaders: Slot<SmallVec<[Arc<ShaderInfo>; 4]>>,
    input_words: Slot<Vec<u32>>,
    snapshots: Slot<SmallVec<[Arc<GpuBuffer>; 4]>>,
    resources: Slot<CommandResources>,
}

impl Default for CommandState {
    fn default() -> Self {
        Self {
            shaders: Slot::new(Phase::Record),
            input_words: Slot::new(Phase::Record),
            snapshots: Slot::new(Phase::Record),
            resources: Slot::new(Phase::Dispatch),
        }
    }
}

impl<F, R> Hooks for CommandHooks<'_, F, R>
where
    F: FnOnce(Option<&CommandResources>) -> R,
{
    type State = CommandState;
    type Output = R;

    fn validate(&mut self, _: &Call<CommandState>) -> bool {
        if self.bound.shader_ids.is_empty() {
            tracing::warn!(cmd = ?self.cmd, "command recorded without a bound pipeline");
            return false;
        }
        true
    }

    fn record(&mut self, call: &mut Call<CommandState>) {
        let layer = self.layer;
        let reserved_set = layer.options.reserved_set;

        let shaders: SmallVec<[_; 4]> = self
            .bound
            .shader_ids
            .iter()
            .filter_map(|&id| layer.shader(id))
            .filter(|shader| shader.is_instrumented())
            .collect();
        if shaders.is_empty() {
            call.skip();
            return;
        }

        if let Some(Some(_)) = self.bound.sets.get(reserved_set as usize) {
            layer.report(Diagnostic::new(
                Severity::Warning,
                DiagnosticKind::ReservedSetInUse,
                format!(
                    "descriptor set {reserved_set} is bound by the application, so this command \
                     can't be validated (see `reserved_set`)"
                ),
            ));
            call.skip();
            return;
        }

        // Address `0` (in the input buffer) disables the checks using it.
        let mut snapshots = SmallVec::<[Arc<GpuBuffer>; 4]>::new();
        let mut pin = |buffer: Option<Arc<GpuBuffer>>| {
            let address = buffer.as_ref().map_or(0, |buffer| buffer.device_address());
            snapshots.extend(buffer);
            split_u64(address)
        };

        let check_addresses =
            layer.options.buffer_device_address && layer.features.buffer_device_address;
        let table = if check_addresses { layer.prepare_address_table() } else { None };
        let mut words = pin(table).to_vec();
        for set in 0..interface::MAX_SETS as usize {
            let snapshot = match self.bound.sets.get(set) {
                Some(Some(set)) if layer.options.descriptors => {
                    layer.prepare_descriptor_snapshot(set)
                }
                _ => None,
            };
            words.extend(pin(snapshot));
        }

        call.put(|s| &mut s.shaders, shaders);
        call.put(|s| &mut s.input_words, words);
        call.put(|s| &mut s.snapshots, snapshots);
    }

    fn dispatch(&mut self, call: &mut Call<CommandState>) -> R {
        let Some(forward) = self.forward.take() else {
            unreachable!("command dispatched twice");
        };
        if call.is_skipped() {
            return forward(None);
        }

        let snapshots = call.take(|s| &mut s.snapshots).unwrap_or_default();
        let resources = call
            .take(|s| &mut s.input_words)
            .zip(call.take(|s| &mut s.shaders))
            .map(|(input_words, shaders)| self.allocate(&input_words, shaders, snapshots));
        match resources {
            Some(Ok(resources)) => {
                let output = forward(Some(&resources));
                call.put(|s| &mut s.resources, resources);
                output
            }
            Some(Err(e)) => {
                self.layer.report(Diagnostic::new(
                    Severity::Warning,
                    DiagnosticKind::ResourceAllocation,
                    format!("command not validated, as allocating its buffers failed: {e}"),
                ));
                call.skip();
                forward(None)
            }
            None => {
                call.skip();
                forward(None)
            }
        }
    }

    fn post_record(&mut self, call: &mut Call<CommandState>) {
        if let Some(resources) = call.take(|s| &mut s.resources) {
            let mut command_buffers = self.layer.command_buffers.lock();
            command_buffers.entry(self.cmd).or_default().resources.push(resources);
        }
    }
}

impl<F, R> CommandHooks<'_, F, R> {
    fn allocate(
        &self,
        input_words: &[u32],
        shaders: SmallVec<[Arc<ShaderInfo>; 4]>,
        snapshots: SmallVec<[Arc<GpuBuffer>; 4]>,
    ) -> Result<CommandResources, AllocError> {
        let allocator = &self.layer.allocator;
        let max_records = self.layer.options.max_records as usize;
        let output_words = vec![0; 1 + max_records * interface::ERROR_RECORD_WORDS as usize];
        let usage = INSTRUMENTATION_BUFFER_USAGE;
        let output = GpuBuffer::with_words(allocator, &output_words, usage)?;
        let input = GpuBuffer::with_words(allocator, input_words, usage)?;
        Ok(CommandResources { output, input, snapshots, shaders })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn address_table_is_sorted_by_address() {
        let mut ranges = FxIndexMap::default();
        ranges.insert(vk::Buffer::from_raw(1), (0x3_0000_0010, 0x3_0000_0020));
        ranges.insert(vk::Buffer::from_raw(2), (0x1000, 0x1100));
        assert_eq!(
            encode_address_table(&ranges),
            [2, 0, 0x1000, 0, 0x1100, 0, 0x10, 3, 0x20, 3]
        );
        assert_eq!(encode_address_table(&FxIndexMap::default()), [0, 0]);
    }
}
