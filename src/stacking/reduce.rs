//! Lane-parallel iterative sigma-clipped reduction.
//!
//! A chunk is `subarray_count` lane groups of `group_size` 8-wide rows (see
//! the layout contract on [`crate::stacking::source::DataSource::fill`]).
//! Each lane group runs its own convergence loop: accumulate per-lane sum
//! and count over the values inside the current bounds, derive the
//! statistic, and stop once no lane's included count shrinks or the
//! iteration cap is reached. Lane groups are mutually independent, so a
//! chunk can be handed to any worker thread as a whole.

use crate::stacking::sigma::{clip_bounds, ClipBounds};
use crate::stacking::{LANES, MAX_GROUP_SIZE};
use crate::utilities::enums::Kernel;
use crate::utilities::helpers::detect_best_kernel;

/// Sigma-clipped mean of every lane group in the chunk. `out` receives one
/// `f32` per lane; lanes whose count reaches zero produce NaN.
pub(crate) fn clipped_mean_chunk(
    out: &mut [f32],
    data: &[f32],
    group_size: usize,
    subarray_count: usize,
    sigma_lower: f64,
    sigma_upper: f64,
    max_iter: usize,
    kernel: Kernel,
) {
    assert!(group_size >= 1);
    assert!(
        group_size <= MAX_GROUP_SIZE,
        "reduce: group size {group_size} exceeds the exact f32 count range"
    );
    assert_eq!(data.len(), subarray_count * group_size * LANES);
    assert_eq!(out.len(), subarray_count * LANES);

    let kernel = match kernel {
        Kernel::Auto => detect_best_kernel(),
        k => k,
    };
    for g in 0..subarray_count {
        let group = &data[g * group_size * LANES..(g + 1) * group_size * LANES];
        let dst = &mut out[g * LANES..(g + 1) * LANES];
        match kernel {
            #[cfg(target_arch = "x86_64")]
            Kernel::Avx2 => unsafe {
                clipped_mean_group_avx2(dst, group, group_size, sigma_lower, sigma_upper, max_iter)
            },
            _ => clipped_mean_group_scalar(dst, group, group_size, sigma_lower, sigma_upper, max_iter),
        }
    }
}

/// Sigma-clipped median of every lane group in the chunk. Same convergence
/// and bounds protocol as the mean; only the per-iteration statistic
/// differs. The gather-and-select step is lane-serial, so there is no
/// vectorized variant.
pub(crate) fn clipped_median_chunk(
    out: &mut [f32],
    data: &[f32],
    group_size: usize,
    subarray_count: usize,
    sigma_lower: f64,
    sigma_upper: f64,
    max_iter: usize,
    _kernel: Kernel,
) {
    assert!(group_size >= 1);
    assert!(
        group_size <= MAX_GROUP_SIZE,
        "reduce: group size {group_size} exceeds the exact f32 count range"
    );
    assert_eq!(data.len(), subarray_count * group_size * LANES);
    assert_eq!(out.len(), subarray_count * LANES);

    let mut gathered: Vec<f32> = Vec::with_capacity(group_size);
    for g in 0..subarray_count {
        let group = &data[g * group_size * LANES..(g + 1) * group_size * LANES];
        let dst = &mut out[g * LANES..(g + 1) * LANES];
        clipped_median_group(dst, group, group_size, sigma_lower, sigma_upper, max_iter, &mut gathered);
    }
}

fn clipped_mean_group_scalar(
    out: &mut [f32],
    group: &[f32],
    group_size: usize,
    sigma_lower: f64,
    sigma_upper: f64,
    max_iter: usize,
) {
    let mut bounds = ClipBounds::open();
    // Sentinel one above any possible count so the first iteration always
    // looks like a shrink.
    let mut previous_count = [(group_size + 1) as f32; LANES];
    let mut mean = [0.0f32; LANES];

    let mut iter = 0usize;
    loop {
        let mut sum = [0.0f32; LANES];
        let mut count = [0.0f32; LANES];
        for i in 0..group_size {
            let row = &group[i * LANES..(i + 1) * LANES];
            for l in 0..LANES {
                let x = row[l];
                if bounds.contains(l, x) {
                    sum[l] += x;
                    count[l] += 1.0;
                }
            }
        }
        for l in 0..LANES {
            mean[l] = sum[l] / count[l];
        }

        let shrinking = (0..LANES).any(|l| count[l] < previous_count[l]);
        if iter == max_iter || !shrinking {
            break;
        }
        previous_count = count;
        bounds = clip_bounds(group, group_size, &bounds, &mean, &count, sigma_lower, sigma_upper);
        iter += 1;
    }
    out.copy_from_slice(&mean);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn clipped_mean_group_avx2(
    out: &mut [f32],
    group: &[f32],
    group_size: usize,
    sigma_lower: f64,
    sigma_upper: f64,
    max_iter: usize,
) {
    use core::arch::x86_64::*;

    let zero = _mm256_setzero_ps();
    let one = _mm256_set1_ps(1.0);

    let mut bounds = ClipBounds::open();
    let mut lower = _mm256_loadu_ps(bounds.lower.as_ptr());
    let mut upper = _mm256_loadu_ps(bounds.upper.as_ptr());
    let mut previous_count = _mm256_set1_ps((group_size + 1) as f32);
    let mut mean = zero;

    let base = group.as_ptr();
    let mut iter = 0usize;
    loop {
        let mut sum = zero;
        let mut count = zero;
        for i in 0..group_size {
            let v = _mm256_loadu_ps(base.add(i * LANES));
            // Closed-interval inclusion mask; NaN bounds compare false and
            // exclude the lane's values entirely.
            let ge = _mm256_cmp_ps::<_CMP_GE_OQ>(v, lower);
            let le = _mm256_cmp_ps::<_CMP_LE_OQ>(v, upper);
            let keep = _mm256_and_ps(ge, le);
            sum = _mm256_add_ps(sum, _mm256_blendv_ps(zero, v, keep));
            count = _mm256_add_ps(count, _mm256_blendv_ps(zero, one, keep));
        }
        mean = _mm256_div_ps(sum, count);

        // Counts never grow while clipping makes progress; a clear sign bit
        // in every lane of the difference means no lane shrank.
        let diff = _mm256_sub_ps(count, previous_count);
        if iter == max_iter || _mm256_movemask_ps(diff) == 0 {
            break;
        }
        previous_count = count;

        let mut center = [0.0f32; LANES];
        let mut count_arr = [0.0f32; LANES];
        _mm256_storeu_ps(center.as_mut_ptr(), mean);
        _mm256_storeu_ps(count_arr.as_mut_ptr(), count);
        bounds = clip_bounds(group, group_size, &bounds, &center, &count_arr, sigma_lower, sigma_upper);
        lower = _mm256_loadu_ps(bounds.lower.as_ptr());
        upper = _mm256_loadu_ps(bounds.upper.as_ptr());
        iter += 1;
    }
    _mm256_storeu_ps(out.as_mut_ptr(), mean);
}

fn clipped_median_group(
    out: &mut [f32],
    group: &[f32],
    group_size: usize,
    sigma_lower: f64,
    sigma_upper: f64,
    max_iter: usize,
    gathered: &mut Vec<f32>,
) {
    let mut bounds = ClipBounds::open();
    let mut previous_count = [(group_size + 1) as f32; LANES];
    let mut median = [0.0f32; LANES];

    let mut iter = 0usize;
    loop {
        let mut count = [0.0f32; LANES];
        for l in 0..LANES {
            gathered.clear();
            for i in 0..group_size {
                let x = group[i * LANES + l];
                if bounds.contains(l, x) {
                    gathered.push(x);
                }
            }
            count[l] = gathered.len() as f32;
            median[l] = select_median(gathered);
        }

        let shrinking = (0..LANES).any(|l| count[l] < previous_count[l]);
        if iter == max_iter || !shrinking {
            break;
        }
        previous_count = count;
        bounds = clip_bounds(group, group_size, &bounds, &median, &count, sigma_lower, sigma_upper);
        iter += 1;
    }
    out.copy_from_slice(&median);
}

#[inline]
fn select_median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
