//! Layout of the data shared between the CPU side and instrumented shaders.
//!
//! The reserved descriptor set holds two storage buffers:
//! * [`OUTPUT_BINDING`]: `{ u32 written_words; u32 data[]; }`, where shaders
//!   append [`ERROR_RECORD_WORDS`]-sized error records (using an atomic add on
//!   `written_words`, records past the end of `data` are dropped, but counted)
//! * [`INPUT_BINDING`]: `{ u64 address_table; u64 set_snapshots[MAX_SETS]; }`,
//!   with device addresses of the buffer address table and of each bound
//!   descriptor set's snapshot (`0` meaning "no data, skip the check")
//!
//! A descriptor set snapshot is a `u32` array:
//! `[H, count[0..=H], offset[0..=H], status...]`, where `H` is the highest
//! binding number, `count[b]` the number of descriptors in binding `b` (`0` for
//! missing bindings), `offset[b]` the (absolute) word index of binding `b`'s
//! first status word, and each status word one of [`STATUS_UNWRITTEN`],
//! [`STATUS_NULL`], or the size in bytes (buffers, clamped to
//! `1..=`[`STATUS_MAX_SIZE`]) / `1` (other descriptors) of a written descriptor.
//!
//! The address table is `{ u32 count; u32 pad; u64 ranges[2 * count]; }`,
//! with `[start, end)` pairs of live buffer device address ranges.

/// Default descriptor set used for the instrumentation buffers.
pub const DEFAULT_RESERVED_SET: u32 = 7;

/// Highest number of descriptor sets with snapshots (set numbers `0..MAX_SETS`).
pub const MAX_SETS: u32 = 32;

pub const OUTPUT_BINDING: u32 = 0;
pub const INPUT_BINDING: u32 = 1;

/// Byte offset of `data` in the output buffer.
pub const OUTPUT_DATA_OFFSET: u64 = 4;

/// Byte offset of `set_snapshots` in the input buffer.
pub const INPUT_SNAPSHOTS_OFFSET: u64 = 8;

/// Size in bytes of the input buffer.
pub const INPUT_BUFFER_SIZE: u64 = INPUT_SNAPSHOTS_OFFSET + 8 * MAX_SETS as u64;

/// `[shader_id, inst_index, error_code, p0, p1, p2, p3]`.
pub const ERROR_RECORD_WORDS: u32 = 7;

pub const STATUS_UNWRITTEN: u32 = 0;
pub const STATUS_NULL: u32 = 0xffff_ffff;
pub const STATUS_MAX_SIZE: u32 = 0xffff_fffe;

/// Ray flags that can't be combined (`SkipTrianglesKHR | SkipAABBsKHR`).
pub const RAY_FLAG_SKIP_TRIANGLES: u32 = 0x100;
pub const RAY_FLAG_SKIP_AABBS: u32 = 0x200;

/// Error codes written by the validation functions (with their parameters).
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[repr(u32)]
pub enum ErrorCode {
    /// `(set, binding, index, count)`.
    DescriptorIndexOutOfBounds = 1,

    /// `(set, binding, index)`.
    DescriptorUninitialized = 2,

    /// `(index, bound)`.
    IndexOutOfBounds = 3,

    /// `(address low bits, address high bits, size)`.
    DeviceAddressOutOfBounds = 4,

    // NOTE all the ray query errors have `(flags, tmin bits, tmax bits)`.
    RayQueryNegativeTMin = 5,
    RayQueryTMaxLessThanTMin = 6,
    RayQueryNanVector = 7,
    RayQueryBothSkipFlags = 8,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::DescriptorIndexOutOfBounds,
            2 => Self::DescriptorUninitialized,
            3 => Self::IndexOutOfBounds,
            4 => Self::DeviceAddressOutOfBounds,
            5 => Self::RayQueryNegativeTMin,
            6 => Self::RayQueryTMaxLessThanTMin,
            7 => Self::RayQueryNanVector,
            8 => Self::RayQueryBothSkipFlags,
            _ => return None,
        })
    }
}

/// Largest snapshot (in `u32` words) built for one descriptor set.
pub const MAX_SNAPSHOT_WORDS: u64 = 1 << 24;

/// Size (in `u32` words) of a snapshot with `binding_counts[b]` descriptors in binding `b`.
pub fn snapshot_words(binding_counts: &[u32]) -> u64 {
    let bindings = binding_counts.len().max(1) as u64;
    1 + 2 * bindings + binding_counts.iter().map(|&count| u64::from(count)).sum::<u64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip() {
        for code in 1..=8 {
            assert_eq!(ErrorCode::from_u32(code).map(|c| c as u32), Some(code));
        }
        assert_eq!(ErrorCode::from_u32(0), None);
        assert_eq!(ErrorCode::from_u32(9), None);
    }

    #[test]
    fn empty_layouts_still_have_a_header() {
        assert_eq!(snapshot_words(&[]), 3);
        assert_eq!(snapshot_words(&[3, 1, 0, 2]), 1 + 8 + 6);
    }
}
