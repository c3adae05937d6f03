//! Polymorphic chunk loaders.
//!
//! The pipeline never touches the caller's arrays directly; it asks a
//! [`DataSource`] to materialize a contiguous bin range into a float
//! working buffer. The two built-in adapters cover stacks of `u16` and
//! `f32` slices; callers with other element types implement the trait
//! themselves.

use crate::stacking::convert::{convert_f32_groups_strided, convert_u16_groups_strided};
use crate::stacking::{align_up_lanes, LANES};
use thiserror::Error;

/// Loader failure surfaced through the pipeline. The code is chosen by the
/// source; the pipeline aborts the whole call on the first failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("source: load failed with status {code}")]
pub struct SourceError {
    pub code: i32,
}

impl SourceError {
    pub fn new(code: i32) -> Self {
        SourceError { code }
    }
}

/// A stack of `array_count` equal-length arrays, readable one bin range at
/// a time.
pub trait DataSource {
    /// Number of arrays in the stack (the group size of every bin).
    fn array_count(&self) -> usize;

    /// Length of each array, and of the output.
    fn bin_count(&self) -> usize;

    /// Fill `dst` with the stack's values for bins `start..start + len`.
    ///
    /// Layout contract: for lane group `j` in `0..ceil(len / 8)`, array `a`,
    /// and lane `l`, slot `dst[(j * array_count + a) * 8 + l]` holds array
    /// `a`'s value at bin `start + j * 8 + l`. Lanes past `len` in the last
    /// group must be written with a harmless filler (zero); they are
    /// computed over but never read back.
    ///
    /// `dst` holds exactly `ceil(len / 8) * array_count * 8` floats. The
    /// pipeline may call this concurrently for disjoint chunks.
    fn fill(&self, dst: &mut [f32], start: usize, len: usize) -> Result<(), SourceError>;
}

/// Adapter over a stack of borrowed `u16` arrays; converts on load.
pub struct U16Source<'a> {
    arrays: &'a [&'a [u16]],
}

impl<'a> U16Source<'a> {
    pub fn new(arrays: &'a [&'a [u16]]) -> Self {
        U16Source { arrays }
    }
}

impl DataSource for U16Source<'_> {
    fn array_count(&self) -> usize {
        self.arrays.len()
    }

    fn bin_count(&self) -> usize {
        self.arrays.first().map_or(0, |a| a.len())
    }

    fn fill(&self, dst: &mut [f32], start: usize, len: usize) -> Result<(), SourceError> {
        debug_assert_eq!(dst.len(), align_up_lanes(len) * self.arrays.len());
        let stride = self.arrays.len();
        for (a, arr) in self.arrays.iter().enumerate() {
            convert_u16_groups_strided(dst, &arr[start..start + len], a, stride);
        }
        Ok(())
    }
}

/// Adapter over a stack of borrowed `f32` arrays; no conversion on load.
pub struct F32Source<'a> {
    arrays: &'a [&'a [f32]],
}

impl<'a> F32Source<'a> {
    pub fn new(arrays: &'a [&'a [f32]]) -> Self {
        F32Source { arrays }
    }
}

impl DataSource for F32Source<'_> {
    fn array_count(&self) -> usize {
        self.arrays.len()
    }

    fn bin_count(&self) -> usize {
        self.arrays.first().map_or(0, |a| a.len())
    }

    fn fill(&self, dst: &mut [f32], start: usize, len: usize) -> Result<(), SourceError> {
        debug_assert_eq!(dst.len(), align_up_lanes(len) * self.arrays.len());
        let stride = self.arrays.len();
        for (a, arr) in self.arrays.iter().enumerate() {
            convert_f32_groups_strided(dst, &arr[start..start + len], a, stride);
        }
        Ok(())
    }
}
