pub mod convert;
pub mod pipeline;
pub mod reduce;
pub mod sigma;
pub mod source;

/// Width of one data-parallel lane group. All chunk buffers are laid out as
/// whole groups of this many `f32` values.
pub const LANES: usize = 8;

/// Largest number of input arrays a stack may hold.
pub const MAX_ARRAY_COUNT: usize = 10_000_000;

/// Largest group size for which an `f32` per-lane count stays exact.
pub const MAX_GROUP_SIZE: usize = 0xFF_FFFF;

/// Round `n` up to the next multiple of the lane width.
#[inline(always)]
pub const fn align_up_lanes(n: usize) -> usize {
    (n + LANES - 1) & !(LANES - 1)
}
