//! Chunked stacking pipeline.
//!
//! Splits the bin range into fixed-size chunks, has the data source fill a
//! bounded float working buffer per chunk, runs the clipped reduction over
//! it, and writes the converted results into the caller's output. Chunks
//! own disjoint output slices, so they are dispatched to the rayon worker
//! pool; within one chunk the load always completes before the reduction
//! starts.

use crate::stacking::convert::convert_f32_to_u16_with_kernel;
use crate::stacking::reduce::{clipped_mean_chunk, clipped_median_chunk};
use crate::stacking::source::{DataSource, F32Source, SourceError, U16Source};
use crate::stacking::{align_up_lanes, LANES, MAX_ARRAY_COUNT};
use crate::utilities::enums::Kernel;
use aligned_vec::{AVec, CACHELINE_ALIGN};
use rayon::prelude::*;
use thiserror::Error;

/// Working-buffer budget per chunk, in floats. The chunk width is derived
/// from it so memory stays bounded no matter how large the stack is.
const CHUNK_BUDGET_FLOATS: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct StackParams {
    pub sigma_lower: Option<f64>,
    pub sigma_upper: Option<f64>,
    pub max_iter: Option<usize>,
    /// Bins per pipeline chunk. Rounded up to a whole number of lane
    /// groups; the default is sized from the working-buffer budget. Output
    /// is bit-identical for every setting.
    pub chunk_bins: Option<usize>,
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            sigma_lower: Some(3.0),
            sigma_upper: Some(3.0),
            max_iter: Some(5),
            chunk_bins: None,
        }
    }
}

#[derive(Clone, Copy)]
pub enum StackData<'a> {
    U16 { arrays: &'a [&'a [u16]] },
    F32 { arrays: &'a [&'a [f32]] },
    Source(&'a (dyn DataSource + Sync)),
}

pub struct StackInput<'a> {
    pub data: StackData<'a>,
    pub params: StackParams,
}

impl<'a> StackInput<'a> {
    pub fn from_u16(arrays: &'a [&'a [u16]], params: StackParams) -> Self {
        Self {
            data: StackData::U16 { arrays },
            params,
        }
    }

    pub fn from_f32(arrays: &'a [&'a [f32]], params: StackParams) -> Self {
        Self {
            data: StackData::F32 { arrays },
            params,
        }
    }

    pub fn from_source(source: &'a (dyn DataSource + Sync), params: StackParams) -> Self {
        Self {
            data: StackData::Source(source),
            params,
        }
    }

    pub fn with_default_params(data: StackData<'a>) -> Self {
        Self {
            data,
            params: StackParams::default(),
        }
    }

    fn get_sigma_lower(&self) -> f64 {
        self.params
            .sigma_lower
            .unwrap_or_else(|| StackParams::default().sigma_lower.unwrap())
    }

    fn get_sigma_upper(&self) -> f64 {
        self.params
            .sigma_upper
            .unwrap_or_else(|| StackParams::default().sigma_upper.unwrap())
    }

    fn get_max_iter(&self) -> usize {
        self.params
            .max_iter
            .unwrap_or_else(|| StackParams::default().max_iter.unwrap())
    }
}

/// Caller-owned destination, tagged with its element type. Resolved once
/// into a writer; there is no per-element type dispatch.
pub enum OutputSink<'a> {
    U16(&'a mut [u16]),
    F32(&'a mut [f32]),
}

impl OutputSink<'_> {
    fn len(&self) -> usize {
        match self {
            OutputSink::U16(s) => s.len(),
            OutputSink::F32(s) => s.len(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("combine: empty input stack.")]
    EmptyStack,
    #[error("combine: input arrays have mismatched lengths.")]
    MismatchedArrayLengths,
    #[error("combine: output length {actual} does not match bin count {expected}.")]
    OutputLengthMismatch { expected: usize, actual: usize },
    #[error("combine: array count {count} exceeds the supported maximum.")]
    TooManyArrays { count: usize },
    #[error("combine: sigma multipliers must be positive and finite, got ({lower}, {upper}).")]
    InvalidSigma { lower: f64, upper: f64 },
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Clone, Copy)]
enum Statistic {
    Mean,
    Median,
}

/// Per-bin sigma-clipped mean of the stack, written to `out` in the
/// output's native type.
#[inline]
pub fn clipped_mean(out: OutputSink, input: &StackInput) -> Result<(), StackError> {
    clipped_mean_with_kernel(out, input, Kernel::Auto)
}

pub fn clipped_mean_with_kernel(
    out: OutputSink,
    input: &StackInput,
    kernel: Kernel,
) -> Result<(), StackError> {
    combine(out, input, Statistic::Mean, kernel)
}

/// Per-bin sigma-clipped median of the stack; same contract as
/// [`clipped_mean`] with the median as the per-iteration statistic.
#[inline]
pub fn clipped_median(out: OutputSink, input: &StackInput) -> Result<(), StackError> {
    clipped_median_with_kernel(out, input, Kernel::Auto)
}

pub fn clipped_median_with_kernel(
    out: OutputSink,
    input: &StackInput,
    kernel: Kernel,
) -> Result<(), StackError> {
    combine(out, input, Statistic::Median, kernel)
}

/// Convenience wrapper for the common u16-in, u16-out stacking call.
pub fn clipped_mean_u16(
    out: &mut [u16],
    arrays: &[&[u16]],
    sigma_lower: f64,
    sigma_upper: f64,
    max_iter: usize,
) -> Result<(), StackError> {
    let input = StackInput::from_u16(
        arrays,
        StackParams {
            sigma_lower: Some(sigma_lower),
            sigma_upper: Some(sigma_upper),
            max_iter: Some(max_iter),
            chunk_bins: None,
        },
    );
    clipped_mean(OutputSink::U16(out), &input)
}

/// Convenience wrapper for the common u16-in, u16-out median call.
pub fn clipped_median_u16(
    out: &mut [u16],
    arrays: &[&[u16]],
    sigma_lower: f64,
    sigma_upper: f64,
    max_iter: usize,
) -> Result<(), StackError> {
    let input = StackInput::from_u16(
        arrays,
        StackParams {
            sigma_lower: Some(sigma_lower),
            sigma_upper: Some(sigma_upper),
            max_iter: Some(max_iter),
            chunk_bins: None,
        },
    );
    clipped_median(OutputSink::U16(out), &input)
}

fn combine(
    out: OutputSink,
    input: &StackInput,
    statistic: Statistic,
    kernel: Kernel,
) -> Result<(), StackError> {
    let sigma_lower = input.get_sigma_lower();
    let sigma_upper = input.get_sigma_upper();
    if !(sigma_lower.is_finite() && sigma_lower > 0.0 && sigma_upper.is_finite() && sigma_upper > 0.0)
    {
        return Err(StackError::InvalidSigma {
            lower: sigma_lower,
            upper: sigma_upper,
        });
    }
    let max_iter = input.get_max_iter();

    match input.data {
        StackData::U16 { arrays } => {
            validate_slice_stack(arrays.len(), arrays.iter().map(|a| a.len()))?;
            let source = U16Source::new(arrays);
            run_pipeline(out, &source, input, statistic, kernel, sigma_lower, sigma_upper, max_iter)
        }
        StackData::F32 { arrays } => {
            validate_slice_stack(arrays.len(), arrays.iter().map(|a| a.len()))?;
            let source = F32Source::new(arrays);
            run_pipeline(out, &source, input, statistic, kernel, sigma_lower, sigma_upper, max_iter)
        }
        StackData::Source(source) => run_pipeline(
            out, source, input, statistic, kernel, sigma_lower, sigma_upper, max_iter,
        ),
    }
}

fn validate_slice_stack(
    array_count: usize,
    mut lengths: impl Iterator<Item = usize>,
) -> Result<(), StackError> {
    if array_count == 0 {
        return Err(StackError::EmptyStack);
    }
    let first = lengths.next().unwrap_or(0);
    if first == 0 {
        return Err(StackError::EmptyStack);
    }
    if lengths.any(|l| l != first) {
        return Err(StackError::MismatchedArrayLengths);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_pipeline(
    out: OutputSink,
    source: &(dyn DataSource + Sync),
    input: &StackInput,
    statistic: Statistic,
    kernel: Kernel,
    sigma_lower: f64,
    sigma_upper: f64,
    max_iter: usize,
) -> Result<(), StackError> {
    let group_size = source.array_count();
    let bin_count = source.bin_count();
    if group_size == 0 || bin_count == 0 {
        return Err(StackError::EmptyStack);
    }
    if group_size > MAX_ARRAY_COUNT {
        return Err(StackError::TooManyArrays { count: group_size });
    }
    if out.len() != bin_count {
        return Err(StackError::OutputLengthMismatch {
            expected: bin_count,
            actual: out.len(),
        });
    }

    let chunk_bins = resolve_chunk_bins(input.params.chunk_bins, group_size);

    let reduce_one = |chunk_index: usize, chunk_len: usize| -> Result<AVec<f32>, StackError> {
        let start = chunk_index * chunk_bins;
        let groups = align_up_lanes(chunk_len) / LANES;
        let mut buf: AVec<f32> = AVec::with_capacity(CACHELINE_ALIGN, groups * group_size * LANES);
        buf.resize(groups * group_size * LANES, 0.0);
        source.fill(&mut buf, start, chunk_len)?;
        // The load above is complete before the reduction touches the
        // buffer; that ordering is the per-chunk barrier.
        let mut stats: AVec<f32> = AVec::with_capacity(CACHELINE_ALIGN, groups * LANES);
        stats.resize(groups * LANES, 0.0);
        match statistic {
            Statistic::Mean => clipped_mean_chunk(
                &mut stats, &buf, group_size, groups, sigma_lower, sigma_upper, max_iter, kernel,
            ),
            Statistic::Median => clipped_median_chunk(
                &mut stats, &buf, group_size, groups, sigma_lower, sigma_upper, max_iter, kernel,
            ),
        }
        Ok(stats)
    };

    match out {
        OutputSink::F32(dst) => {
            dst.par_chunks_mut(chunk_bins)
                .enumerate()
                .try_for_each(|(ci, chunk)| {
                    let stats = reduce_one(ci, chunk.len())?;
                    chunk.copy_from_slice(&stats[..chunk.len()]);
                    Ok(())
                })
        }
        OutputSink::U16(dst) => {
            dst.par_chunks_mut(chunk_bins)
                .enumerate()
                .try_for_each(|(ci, chunk)| {
                    let stats = reduce_one(ci, chunk.len())?;
                    // Degenerate lanes carry NaN; the conversion flags them
                    // out of range but the call still succeeds for the rest
                    // of the output.
                    let _ = convert_f32_to_u16_with_kernel(chunk, &stats[..chunk.len()], kernel);
                    Ok(())
                })
        }
    }
}

fn resolve_chunk_bins(requested: Option<usize>, group_size: usize) -> usize {
    let raw = requested.unwrap_or(CHUNK_BUDGET_FLOATS / group_size.max(1));
    align_up_lanes(raw.max(1))
}
