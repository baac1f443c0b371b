//! GPU memory used for instrumentation: buffers allocated through a
//! [`GpuAllocator`], owned by RAII [`GpuBuffer`]s, and the [`VersionedBuffer`]
//! cache shared by descriptor set snapshots and the buffer address table.

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Usage of every buffer read by instrumented shaders.
pub const INSTRUMENTATION_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("out of device memory (allocating {size} bytes)")]
    OutOfMemory { size: u64 },

    #[error("failed to map buffer memory: {0}")]
    Map(vk::Result),

    #[error("unknown buffer {0:?}")]
    UnknownBuffer(vk::Buffer),

    #[error("access of {len} bytes at offset {offset} is outside of a {size}-byte buffer")]
    OutOfRange { offset: u64, len: u64, size: u64 },
}

/// Host-visible, device-addressable buffer memory (e.g. backed by VMA, or by
/// plain host memory in [`HostAllocator`]).
pub trait GpuAllocator: Send + Sync {
    /// Create a zero-initialized buffer of `size` bytes.
    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer, AllocError>;

    /// Write `data` at `offset`, flushing it to make it visible to the device.
    fn write(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<(), AllocError>;

    /// Read `len` bytes at `offset` (after invalidating any host caches).
    fn read(&self, buffer: vk::Buffer, offset: u64, len: u64) -> Result<Vec<u8>, AllocError>;

    fn device_address(&self, buffer: vk::Buffer) -> Result<vk::DeviceAddress, AllocError>;

    fn destroy_buffer(&self, buffer: vk::Buffer);
}

/// An allocated buffer, destroyed on drop.
pub struct GpuBuffer {
    allocator: Arc<dyn GpuAllocator>,
    buffer: vk::Buffer,
    size: u64,
    address: vk::DeviceAddress,
}

impl GpuBuffer {
    pub fn new(
        allocator: &Arc<dyn GpuAllocator>,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, AllocError> {
        let buffer = allocator.create_buffer(size, usage)?;
        let address = match allocator.device_address(buffer) {
            Ok(address) => address,
            Err(e) => {
                allocator.destroy_buffer(buffer);
                return Err(e);
            }
        };
        Ok(Self { allocator: allocator.clone(), buffer, size, address })
    }

    /// Create a buffer holding exactly `words`.
    pub fn with_words(
        allocator: &Arc<dyn GpuAllocator>,
        words: &[u32],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self, AllocError> {
        let bytes: &[u8] = bytemuck::cast_slice(words);
        let buffer = Self::new(allocator, bytes.len() as u64, usage)?;
        buffer.write(0, bytes)?;
        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), AllocError> {
        self.allocator.write(self.buffer, offset, data)
    }

    pub fn read_words(&self) -> Result<Vec<u32>, AllocError> {
        let bytes = self.allocator.read(self.buffer, 0, self.size)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.allocator.destroy_buffer(self.buffer);
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

/// A buffer built from some versioned state, and only rebuilt when the
/// version it was built for is no longer the current one.
///
/// Buffers are handed out as `Arc`s: a rebuild only drops the cache's
/// reference, and the old buffer lives on until every command using it is done.
#[derive(Default)]
pub struct VersionedBuffer {
    built: Option<(u64, Arc<GpuBuffer>)>,
    rebuilds: u64,
}

impl VersionedBuffer {
    /// Return the buffer for `version`, first building it (with the words
    /// returned by `build`) if the cached one is for another version.
    ///
    /// On failure, the previously cached buffer (if any) is kept, but it will
    /// not be returned for `version`.
    pub fn get_or_rebuild<E: From<AllocError>>(
        &mut self,
        version: u64,
        allocator: &Arc<dyn GpuAllocator>,
        build: impl FnOnce() -> Result<Vec<u32>, E>,
    ) -> Result<Arc<GpuBuffer>, E> {
        if let Some((built_version, buffer)) = &self.built {
            if *built_version == version {
                return Ok(buffer.clone());
            }
        }

        let words = build()?;
        let buffer = GpuBuffer::with_words(allocator, &words, INSTRUMENTATION_BUFFER_USAGE)?;
        let buffer = Arc::new(buffer);
        self.built = Some((version, buffer.clone()));
        self.rebuilds += 1;
        Ok(buffer)
    }

    /// The cached buffer, with the version it was built for.
    pub fn cached(&self) -> Option<(u64, &GpuBuffer)> {
        self.built.as_ref().map(|(version, buffer)| (*version, &**buffer))
    }

    /// How many times the buffer was (re)built.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }
}

/// [`GpuAllocator`] backed by host memory, with device addresses assigned
/// from a fake (never reused) address space.
///
/// Failures can be injected, to exercise the degraded paths.
#[derive(Default)]
pub struct HostAllocator {
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    buffers: FxHashMap<vk::Buffer, HostBuffer>,
    next_handle: u64,
    next_address: vk::DeviceAddress,

    fail_creates: usize,
    fail_writes: bool,

    created: usize,
    destroyed: usize,
}

struct HostBuffer {
    data: Vec<u8>,
    address: vk::DeviceAddress,
}

impl HostAllocator {
    const ADDRESS_BASE: vk::DeviceAddress = 0x1_0000_0000;
    const ADDRESS_ALIGN: vk::DeviceAddress = 256;

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` buffer creations fail.
    pub fn fail_next_creates(&self, count: usize) {
        self.state.lock().fail_creates = count;
    }

    /// Make all writes fail (as if mapping the memory failed), or succeed again.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn buffers_created(&self) -> usize {
        self.state.lock().created
    }

    pub fn buffers_destroyed(&self) -> usize {
        self.state.lock().destroyed
    }

    /// Read `len` words at the device address `address` (as a shader would).
    pub fn read_words_at(&self, address: vk::DeviceAddress, len: usize) -> Option<Vec<u32>> {
        let state = self.state.lock();
        let buffer = state.buffers.values().find(|buffer| {
            (buffer.address..buffer.address + buffer.data.len() as u64).contains(&address)
        })?;
        let start = usize::try_from(address - buffer.address).ok()?;
        let bytes = buffer.data.get(start..start.checked_add(len.checked_mul(4)?)?)?;
        Some(
            bytes
                .chunks_exact(4)
                .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
                .collect(),
        )
    }

    /// Write `data` at `offset` in `buffer` (as a shader would, so never failing
    /// because of [`HostAllocator::fail_writes`]).
    pub fn device_write(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        let Some(buffer) = state.buffers.get_mut(&buffer) else { return false };
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(data.len())?));
        match range.and_then(|range| buffer.data.get_mut(range)) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

impl GpuAllocator for HostAllocator {
    fn create_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer, AllocError> {
        let mut state = self.state.lock();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(AllocError::OutOfMemory { size });
        }
        let len = usize::try_from(size).map_err(|_| AllocError::OutOfMemory { size })?;

        state.next_handle += 1;
        let buffer = vk::Buffer::from_raw(state.next_handle);
        let address = Self::ADDRESS_BASE + state.next_address;
        let align = Self::ADDRESS_ALIGN;
        let reserved = (size.max(1) + align - 1) / align * align;
        state.next_address += reserved;
        state.buffers.insert(buffer, HostBuffer { data: vec![0; len], address });
        state.created += 1;
        Ok(buffer)
    }

    fn write(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<(), AllocError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(AllocError::Map(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let host = state.buffers.get_mut(&buffer).ok_or(AllocError::UnknownBuffer(buffer))?;
        let size = host.data.len() as u64;
        let len = data.len() as u64;
        let out_of_range = AllocError::OutOfRange { offset, len, size };
        let end = offset.checked_add(len).filter(|&end| end <= size).ok_or(out_of_range)?;
        host.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, buffer: vk::Buffer, offset: u64, len: u64) -> Result<Vec<u8>, AllocError> {
        let state = self.state.lock();
        let host = state.buffers.get(&buffer).ok_or(AllocError::UnknownBuffer(buffer))?;
        let size = host.data.len() as u64;
        let out_of_range = AllocError::OutOfRange { offset, len, size };
        let end = offset.checked_add(len).filter(|&end| end <= size).ok_or(out_of_range)?;
        Ok(host.data[offset as usize..end as usize].to_vec())
    }

    fn device_address(&self, buffer: vk::Buffer) -> Result<vk::DeviceAddress, AllocError> {
        let state = self.state.lock();
        state.buffers.get(&buffer).map(|host| host.address).ok_or(AllocError::UnknownBuffer(buffer))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_some() {
            state.destroyed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> (Arc<HostAllocator>, Arc<dyn GpuAllocator>) {
        let host = HostAllocator::new();
        let dyn_host: Arc<dyn GpuAllocator> = host.clone();
        (host, dyn_host)
    }

    #[test]
    fn buffers_are_destroyed_on_drop() {
        let (host, allocator) = allocator();
        let buffer = GpuBuffer::with_words(&allocator, &[1, 2, 3], INSTRUMENTATION_BUFFER_USAGE)
            .unwrap();
        assert_eq!(buffer.read_words().unwrap(), [1, 2, 3]);
        assert_eq!(host.read_words_at(buffer.device_address() + 4, 2), Some(vec![2, 3]));
        assert_eq!(host.live_buffers(), 1);
        drop(buffer);
        assert_eq!(host.live_buffers(), 0);
        assert_eq!(host.buffers_destroyed(), 1);
    }

    #[test]
    fn failed_writes_leak_nothing() {
        let (host, allocator) = allocator();
        host.fail_writes(true);
        let result = GpuBuffer::with_words(&allocator, &[7], INSTRUMENTATION_BUFFER_USAGE);
        assert!(matches!(result, Err(AllocError::Map(_))));
        assert_eq!(host.live_buffers(), 0);
    }

    #[test]
    fn versioned_buffer_rebuilds_once_per_version() {
        let (host, allocator) = allocator();
        let mut cache = VersionedBuffer::default();
        let words = |w: u32| move || Ok::<_, AllocError>(vec![w]);

        let first = cache.get_or_rebuild(1, &allocator, words(1)).unwrap();
        let again = cache.get_or_rebuild(1, &allocator, || -> Result<_, AllocError> {
            unreachable!()
        });
        let again = again.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cache.rebuild_count(), 1);

        let second = cache.get_or_rebuild(2, &allocator, words(2)).unwrap();
        assert_ne!(first.device_address(), second.device_address());
        assert_eq!(cache.rebuild_count(), 2);
        // Still in use, so the buffer for version 1 isn't released yet.
        assert_eq!(host.live_buffers(), 2);
        assert_eq!(host.read_words_at(first.device_address(), 1), Some(vec![1]));
        drop((first, again));
        assert_eq!(host.live_buffers(), 1);

        host.fail_next_creates(1);
        assert!(cache.get_or_rebuild(3, &allocator, words(3)).is_err());
        assert_eq!(cache.cached().map(|(version, _)| version), Some(2));
        assert_eq!(cache.rebuild_count(), 2);
        drop(second);
        assert_eq!(host.live_buffers(), 1);
    }

    #[test]
    fn versioned_buffer_build_errors_are_propagated() {
        #[derive(Debug)]
        enum BuildError {
            TooLarge,
            Alloc,
        }
        impl From<AllocError> for BuildError {
            fn from(_: AllocError) -> Self {
                Self::Alloc
            }
        }

        let (host, allocator) = allocator();
        let mut cache = VersionedBuffer::default();
        let result = cache.get_or_rebuild(1, &allocator, || Err(BuildError::TooLarge));
        assert!(matches!(result, Err(BuildError::TooLarge)));
        assert_eq!(host.buffers_created(), 0);

        host.fail_next_creates(1);
        let result = cache.get_or_rebuild(1, &allocator, || Ok::<_, BuildError>(vec![1]));
        assert!(matches!(result, Err(BuildError::Alloc)));
        assert_eq!(cache.rebuild_count(), 0);
    }
}
