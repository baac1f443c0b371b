//! Descriptor sets, as tracked on the CPU side, and their snapshots (the
//! per-element status tables read by descriptor checks, see [`interface`]).
//!
//! Every binding-mutating operation (write, copy, push) bumps the set's
//! version, and snapshots are only rebuilt when the version changed since the
//! last one was built. Each set has its own lock, which serializes both its
//! updates and its snapshot rebuilds.

use crate::gpu::{AllocError, GpuAllocator, GpuBuffer, VersionedBuffer};
use crate::interface;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("binding {0} is not in the descriptor set layout")]
    NoSuchBinding(u32),

    #[error("binding {0} appears more than once in the descriptor set layout")]
    DuplicateBinding(u32),

    #[error("element {element} is past the end of binding {binding} (and the ones after it)")]
    OutOfRange { binding: u32, element: u32 },

    #[error("descriptor doesn't match binding {binding} (of type {ty:?})")]
    TypeMismatch { binding: u32, ty: vk::DescriptorType },
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot would take {words} words (more than {})", interface::MAX_SNAPSHOT_WORDS)]
    TooLarge { words: u64 },

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct DescriptorSetLayout {
    /// Sorted by binding number.
    bindings: Vec<LayoutBinding>,

    /// Whether the last binding has a variable descriptor count (with its
    /// `count` being the upper bound).
    variable_count_last: bool,
}

impl DescriptorSetLayout {
    pub fn new(
        bindings: impl IntoIterator<Item = LayoutBinding>,
        variable_count_last: bool,
    ) -> Result<Self, UpdateError> {
        let mut bindings: Vec<_> = bindings.into_iter().collect();
        bindings.sort_by_key(|b| b.binding);
        if let Some(pair) = bindings.windows(2).find(|pair| pair[0].binding == pair[1].binding) {
            return Err(UpdateError::DuplicateBinding(pair[0].binding));
        }
        Ok(Self { bindings, variable_count_last })
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    fn index_of(&self, binding: u32) -> Option<usize> {
        self.bindings.binary_search_by_key(&binding, |b| b.binding).ok()
    }
}

/// Descriptor types grouped by how their snapshot status is computed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Buffer,
    TexelBuffer,
    Mutable,
    Other,
}

impl BindingKind {
    pub fn of(ty: vk::DescriptorType) -> Self {
        match ty {
            vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => BindingKind::Buffer,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                BindingKind::TexelBuffer
            }
            vk::DescriptorType::MUTABLE_EXT => BindingKind::Mutable,
            _ => BindingKind::Other,
        }
    }
}

/// A descriptor, as written by the application.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Buffer {
        buffer: vk::Buffer,
        /// Size of the whole buffer, to resolve `vk::WHOLE_SIZE` ranges.
        buffer_size: u64,
        offset: u64,
        range: u64,
    },
    TexelBuffer {
        view: vk::BufferView,
        /// Size of the view, in bytes.
        size: u64,
    },
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
    Sampler(vk::Sampler),
    AccelerationStructure(vk::AccelerationStructureKHR),

    /// Written with `VK_NULL_HANDLE` (requires the `nullDescriptor` feature).
    Null,
}

/// The state of one descriptor array element.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Element<T> {
    #[default]
    Unwritten,
    Null,
    Written(T),
}

impl<T> Element<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Element<U> {
        match self {
            Element::Unwritten => Element::Unwritten,
            Element::Null => Element::Null,
            Element::Written(x) => Element::Written(f(x)),
        }
    }

    fn status(&self, written: impl FnOnce(&T) -> u32) -> u32 {
        match self {
            Element::Unwritten => interface::STATUS_UNWRITTEN,
            Element::Null => interface::STATUS_NULL,
            Element::Written(x) => written(x),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TexelView {
    pub view: vk::BufferView,
    pub size: u64,
}

fn size_status(size: u64) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX).clamp(1, interface::STATUS_MAX_SIZE)
}

impl Descriptor {
    fn buffer_range(self) -> Option<Element<BufferRange>> {
        match self {
            Descriptor::Null => Some(Element::Null),
            Descriptor::Buffer { buffer, .. } if buffer == vk::Buffer::null() => {
                Some(Element::Null)
            }
            Descriptor::Buffer { buffer, buffer_size, offset, range } => {
                let whole = range == vk::WHOLE_SIZE;
                let size = if whole { buffer_size.saturating_sub(offset) } else { range };
                Some(Element::Written(BufferRange { buffer, offset, size }))
            }
            _ => None,
        }
    }

    fn texel_view(self) -> Option<Element<TexelView>> {
        match self {
            Descriptor::Null => Some(Element::Null),
            Descriptor::TexelBuffer { view, .. } if view == vk::BufferView::null() => {
                Some(Element::Null)
            }
            Descriptor::TexelBuffer { view, size } => {
                Some(Element::Written(TexelView { view, size }))
            }
            _ => None,
        }
    }

    fn status(&self) -> u32 {
        match *self {
            Descriptor::Buffer { .. } => match self.buffer_range() {
                Some(range) => range.status(|range| size_status(range.size)),
                None => interface::STATUS_NULL,
            },
            Descriptor::TexelBuffer { view, size } => {
                if view == vk::BufferView::null() {
                    interface::STATUS_NULL
                } else {
                    size_status(size)
                }
            }
            Descriptor::Null => interface::STATUS_NULL,
            Descriptor::Image { .. }
            | Descriptor::Sampler(_)
            | Descriptor::AccelerationStructure(_) => 1,
        }
    }
}

impl From<BufferRange> for Descriptor {
    fn from(range: BufferRange) -> Self {
        let BufferRange { buffer, offset, size } = range;
        Descriptor::Buffer { buffer, buffer_size: offset.saturating_add(size), offset, range: size }
    }
}

impl From<TexelView> for Descriptor {
    fn from(view: TexelView) -> Self {
        Descriptor::TexelBuffer { view: view.view, size: view.size }
    }
}

/// The elements of one binding, typed by the binding's [`BindingKind`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindingState {
    Buffer(Vec<Element<BufferRange>>),
    TexelBuffer(Vec<Element<TexelView>>),
    Mutable(Vec<Element<Descriptor>>),
    Other(Vec<Element<Descriptor>>),
}

impl BindingState {
    fn new(kind: BindingKind, count: usize) -> Self {
        match kind {
            BindingKind::Buffer => BindingState::Buffer(vec![Element::Unwritten; count]),
            BindingKind::TexelBuffer => BindingState::TexelBuffer(vec![Element::Unwritten; count]),
            BindingKind::Mutable => BindingState::Mutable(vec![Element::Unwritten; count]),
            BindingKind::Other => BindingState::Other(vec![Element::Unwritten; count]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BindingState::Buffer(elems) => elems.len(),
            BindingState::TexelBuffer(elems) => elems.len(),
            BindingState::Mutable(elems) | BindingState::Other(elems) => elems.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) {
        match self {
            BindingState::Buffer(elems) => elems.fill(Element::Unwritten),
            BindingState::TexelBuffer(elems) => elems.fill(Element::Unwritten),
            BindingState::Mutable(elems) | BindingState::Other(elems) => {
                elems.fill(Element::Unwritten);
            }
        }
    }

    pub fn get(&self, i: usize) -> Option<Element<Descriptor>> {
        match self {
            BindingState::Buffer(elems) => Some(elems.get(i)?.map(Descriptor::from)),
            BindingState::TexelBuffer(elems) => Some(elems.get(i)?.map(Descriptor::from)),
            BindingState::Mutable(elems) | BindingState::Other(elems) => elems.get(i).copied(),
        }
    }

    /// Convert `elem` to this binding's element type (`None` if it doesn't fit).
    fn accept(&self, elem: Element<Descriptor>) -> Option<Accepted> {
        let elem = match elem {
            Element::Unwritten => return Some(Accepted::Unwritten),
            Element::Null => Descriptor::Null,
            Element::Written(descriptor) => descriptor,
        };
        match self {
            BindingState::Buffer(_) => elem.buffer_range().map(Accepted::Buffer),
            BindingState::TexelBuffer(_) => elem.texel_view().map(Accepted::TexelBuffer),
            BindingState::Mutable(_) => Some(Accepted::Descriptor(elem)),
            BindingState::Other(_) => match elem {
                Descriptor::Buffer { .. } | Descriptor::TexelBuffer { .. } => None,
                _ => Some(Accepted::Descriptor(elem)),
            },
        }
    }

    fn set(&mut self, i: usize, accepted: Accepted) {
        let to_descriptor_elem = |descriptor| match descriptor {
            Descriptor::Null => Element::Null,
            descriptor => Element::Written(descriptor),
        };
        match (self, accepted) {
            (BindingState::Buffer(elems), Accepted::Buffer(elem)) => elems[i] = elem,
            (BindingState::TexelBuffer(elems), Accepted::TexelBuffer(elem)) => elems[i] = elem,
            (
                BindingState::Mutable(elems) | BindingState::Other(elems),
                Accepted::Descriptor(descriptor),
            ) => elems[i] = to_descriptor_elem(descriptor),
            (BindingState::Buffer(elems), Accepted::Unwritten) => elems[i] = Element::Unwritten,
            (BindingState::TexelBuffer(elems), Accepted::Unwritten) => {
                elems[i] = Element::Unwritten;
            }
            (BindingState::Mutable(elems) | BindingState::Other(elems), Accepted::Unwritten) => {
                elems[i] = Element::Unwritten;
            }
            // `accept` only produces values matching the binding.
            _ => {}
        }
    }

    /// Append the snapshot status of every element to `out`.
    fn encode_statuses(&self, out: &mut Vec<u32>) {
        match self {
            BindingState::Buffer(elems) => {
                out.extend(elems.iter().map(|e| e.status(|range| size_status(range.size))));
            }
            BindingState::TexelBuffer(elems) => {
                out.extend(elems.iter().map(|e| e.status(|view| size_status(view.size))));
            }
            BindingState::Mutable(elems) => {
                out.extend(elems.iter().map(|e| e.status(Descriptor::status)));
            }
            BindingState::Other(elems) => out.extend(elems.iter().map(|e| e.status(|_| 1))),
        }
    }
}

/// An element already converted by [`BindingState::accept`].
enum Accepted {
    Unwritten,
    Buffer(Element<BufferRange>),
    TexelBuffer(Element<TexelView>),
    Descriptor(Descriptor),
}

/// One write of consecutive descriptors (which may roll over into the
/// following bindings, as in `VkWriteDescriptorSet`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub first_element: u32,
    pub descriptors: Vec<Descriptor>,
}

pub struct DescriptorSet {
    id: u64,
    layout: Arc<DescriptorSetLayout>,
    state: Mutex<SetState>,
}

struct SetState {
    version: u64,

    /// Parallel to `layout.bindings`.
    bindings: Vec<BindingState>,

    snapshot: VersionedBuffer,
}

impl DescriptorSet {
    pub fn new(layout: Arc<DescriptorSetLayout>, variable_count: Option<u32>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        let last = layout.bindings.len().checked_sub(1);
        let bindings = layout
            .bindings
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let count = match variable_count {
                    Some(n) if layout.variable_count_last && Some(i) == last => n.min(b.count),
                    _ => b.count,
                };
                BindingState::new(BindingKind::of(b.ty), count as usize)
            })
            .collect();

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            layout,
            state: Mutex::new(SetState { version: 0, bindings, snapshot: Default::default() }),
        }
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Incremented by every write, copy, or push.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn element(&self, binding: u32, element: u32) -> Option<Element<Descriptor>> {
        let i = self.layout.index_of(binding)?;
        self.state.lock().bindings[i].get(element as usize)
    }

    /// Write `descriptors`, starting at `element` of `binding`.
    ///
    /// Nothing is written if any descriptor doesn't fit.
    pub fn write(
        &self,
        binding: u32,
        element: u32,
        descriptors: &[Descriptor],
    ) -> Result<(), UpdateError> {
        let mut state = self.state.lock();
        let elems = descriptors.iter().map(|&d| Element::Written(d));
        apply(&self.layout, &mut state.bindings, binding, element, elems)?;
        state.version += 1;
        Ok(())
    }

    /// Copy `count` elements from `src` (which may be `self`), as with
    /// `VkCopyDescriptorSet`.
    pub fn copy_from(
        &self,
        binding: u32,
        element: u32,
        src: &DescriptorSet,
        src_binding: u32,
        src_element: u32,
        count: u32,
    ) -> Result<(), UpdateError> {
        if std::ptr::eq(self, src) {
            let mut state = self.state.lock();
            let elems = read_elems(&self.layout, &state.bindings, src_binding, src_element, count)?;
            apply(&self.layout, &mut state.bindings, binding, element, elems.into_iter())?;
            state.version += 1;
            return Ok(());
        }

        // Always lock in the same (global) order, so that concurrent copies
        // in opposite directions can't deadlock.
        let (mut dst_state, src_state) = if self.id < src.id {
            let dst_state = self.state.lock();
            (dst_state, src.state.lock())
        } else {
            let src_state = src.state.lock();
            (self.state.lock(), src_state)
        };
        let elems = read_elems(&src.layout, &src_state.bindings, src_binding, src_element, count)?;
        drop(src_state);
        apply(&self.layout, &mut dst_state.bindings, binding, element, elems.into_iter())?;
        dst_state.version += 1;
        Ok(())
    }

    /// Replace the whole contents of the set with `writes` (push descriptors),
    /// leaving every element not written by them unwritten.
    pub fn push_descriptors(&self, writes: &[DescriptorWrite]) -> Result<(), UpdateError> {
        let mut state = self.state.lock();
        let mut bindings = state.bindings.clone();
        for binding in &mut bindings {
            binding.clear();
        }
        for write in writes {
            let elems = write.descriptors.iter().map(|&d| Element::Written(d));
            apply(&self.layout, &mut bindings, write.binding, write.first_element, elems)?;
        }
        state.bindings = bindings;
        state.version += 1;
        Ok(())
    }

    /// Encode the snapshot of the current state (see [`interface`]).
    pub fn encode_snapshot(&self) -> Result<Vec<u32>, SnapshotError> {
        encode_snapshot(&self.layout, &self.state.lock().bindings)
    }

    /// Get a snapshot of the current state, only rebuilding it if the set
    /// changed since the last snapshot.
    pub fn prepare_snapshot(
        &self,
        allocator: &Arc<dyn GpuAllocator>,
    ) -> Result<Arc<GpuBuffer>, SnapshotError> {
        let mut state = self.state.lock();
        let SetState { version, bindings, snapshot } = &mut *state;
        let layout = &self.layout;
        snapshot.get_or_rebuild(*version, allocator, || encode_snapshot(layout, bindings))
    }

    /// How many times a snapshot was built for this set.
    pub fn snapshot_rebuild_count(&self) -> u64 {
        self.state.lock().snapshot.rebuild_count()
    }
}

/// Positions (`(binding index, element)`) of `count` consecutive elements
/// starting at `element` of `binding`, rolling over into the following bindings.
fn consecutive_elements(
    layout: &DescriptorSetLayout,
    bindings: &[BindingState],
    binding: u32,
    element: u32,
    count: usize,
) -> Result<Vec<(usize, usize)>, UpdateError> {
    let mut i = layout.index_of(binding).ok_or(UpdateError::NoSuchBinding(binding))?;
    let mut elem = element as usize;
    let mut positions = Vec::with_capacity(count);
    for n in 0..count {
        while elem >= bindings[i].len() {
            elem -= bindings[i].len();
            i += 1;
            if i >= bindings.len() {
                let element = element.saturating_add(u32::try_from(n).unwrap_or(u32::MAX));
                return Err(UpdateError::OutOfRange { binding, element });
            }
        }
        positions.push((i, elem));
        elem += 1;
    }
    Ok(positions)
}

fn read_elems(
    layout: &DescriptorSetLayout,
    bindings: &[BindingState],
    binding: u32,
    element: u32,
    count: u32,
) -> Result<Vec<Element<Descriptor>>, UpdateError> {
    Ok(consecutive_elements(layout, bindings, binding, element, count as usize)?
        .into_iter()
        .filter_map(|(i, elem)| bindings[i].get(elem))
        .collect())
}

/// Validate, then store, `elems`.
fn apply(
    layout: &DescriptorSetLayout,
    bindings: &mut [BindingState],
    binding: u32,
    element: u32,
    elems: impl ExactSizeIterator<Item = Element<Descriptor>>,
) -> Result<(), UpdateError> {
    let positions = consecutive_elements(layout, bindings, binding, element, elems.len())?;
    let accepted = positions
        .iter()
        .zip(elems)
        .map(|(&(i, elem), descriptor)| {
            let accepted = bindings[i].accept(descriptor).ok_or(UpdateError::TypeMismatch {
                binding: layout.bindings[i].binding,
                ty: layout.bindings[i].ty,
            })?;
            Ok((i, elem, accepted))
        })
        .collect::<Result<Vec<_>, _>>()?;
    for (i, elem, accepted) in accepted {
        bindings[i].set(elem, accepted);
    }
    Ok(())
}

fn encode_snapshot(
    layout: &DescriptorSetLayout,
    bindings: &[BindingState],
) -> Result<Vec<u32>, SnapshotError> {
    let highest = layout.bindings.last().map_or(0, |b| b.binding);

    // Sized before anything is allocated, as binding numbers can be sparse.
    let descriptors: u64 = bindings.iter().map(|state| state.len() as u64).sum();
    let size = 1 + 2 * (u64::from(highest) + 1) + descriptors;
    if size > interface::MAX_SNAPSHOT_WORDS {
        return Err(SnapshotError::TooLarge { words: size });
    }

    let mut counts = vec![0; highest as usize + 1];
    for (b, state) in layout.bindings.iter().zip(bindings) {
        counts[b.binding as usize] = state.len() as u32;
    }

    let mut words = Vec::with_capacity(size as usize);
    words.push(highest);
    words.extend_from_slice(&counts);
    let mut offset = 1 + 2 * counts.len() as u32;
    for &count in &counts {
        words.push(offset);
        offset += count;
    }
    for state in bindings {
        state.encode_statuses(&mut words);
    }
    Ok(words)
}
