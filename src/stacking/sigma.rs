//! Per-lane sigma-clip acceptance bounds.

use crate::stacking::LANES;

/// One lane group's acceptance interval. Values equal to a bound are
/// included (the mask test is a closed interval).
#[derive(Debug, Clone, Copy)]
pub struct ClipBounds {
    pub lower: [f32; LANES],
    pub upper: [f32; LANES],
}

impl ClipBounds {
    /// Least restrictive bounds, the starting state of every lane group.
    #[inline]
    pub fn open() -> Self {
        ClipBounds {
            lower: [f32::NEG_INFINITY; LANES],
            upper: [f32::INFINITY; LANES],
        }
    }

    #[inline(always)]
    pub fn contains(&self, lane: usize, value: f32) -> bool {
        value >= self.lower[lane] && value <= self.upper[lane]
    }
}

/// Computes the next iteration's bounds, `center ± sigma * stddev`, for one
/// lane group of `group_size` values laid out as consecutive 8-wide rows.
///
/// The deviation sum only covers values inside the current `bounds`; their
/// exclusion is already reflected in `count`. The variance convention is
/// population variance (divide by `count`), and sigma is applied in `f64`
/// before narrowing the bounds back to `f32`.
///
/// Lanes with `count == 0` have a NaN `center`, so their new bounds are NaN.
/// NaN bounds exclude every value, which keeps the lane's count at zero and
/// lets the reduction loop converge on the next iteration instead of
/// spinning.
pub(crate) fn clip_bounds(
    values: &[f32],
    group_size: usize,
    bounds: &ClipBounds,
    center: &[f32; LANES],
    count: &[f32; LANES],
    sigma_lower: f64,
    sigma_upper: f64,
) -> ClipBounds {
    debug_assert_eq!(values.len(), group_size * LANES);

    let mut ssd = [0.0f64; LANES];
    for i in 0..group_size {
        let row = &values[i * LANES..(i + 1) * LANES];
        for l in 0..LANES {
            let x = row[l];
            if bounds.contains(l, x) {
                let dev = f64::from(x) - f64::from(center[l]);
                ssd[l] += dev * dev;
            }
        }
    }

    let mut next = ClipBounds::open();
    for l in 0..LANES {
        let stddev = (ssd[l] / f64::from(count[l])).sqrt();
        next.lower[l] = (f64::from(center[l]) - sigma_lower * stddev) as f32;
        next.upper[l] = (f64::from(center[l]) + sigma_upper * stddev) as f32;
    }
    next
}
