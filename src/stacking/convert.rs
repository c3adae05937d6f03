//! Bulk conversion between 16-bit unsigned samples and `f32` lanes.
//!
//! Both directions process whole lane groups of [`LANES`] values. Lengths
//! that are not a multiple of the lane width are handled by converting the
//! aligned prefix directly and routing the tail through a guarded
//! thread-local scratch group, so the lane kernels only ever see whole
//! groups.
//!
//! The float-to-integer direction uses the `2^23` bias trick: adding the
//! bias to an in-range float forces the exponent field to a known constant
//! while the low mantissa bits hold the rounded integer. Rust never changes
//! the IEEE default rounding mode, so the addition is guaranteed to round
//! half to even.

use crate::stacking::{align_up_lanes, LANES};
use crate::utilities::enums::Kernel;
use crate::utilities::helpers::detect_best_kernel;
use std::cell::{Cell, UnsafeCell};

/// `2^23`. Adding this to a float in `[0, 65535.5)` pins the exponent field
/// so the low 16 bits of the sum are the rounded integer.
const MAGIC_BIAS: f32 = 8_388_608.0;

/// High 16 bits of `MAGIC_BIAS + n` for every in-range `n`.
const MAGIC_HIGH_WORD: u16 = 0x4B00;

#[repr(align(32))]
struct Scratch {
    f32s: [f32; LANES],
    u16s: [u16; LANES],
}

thread_local! {
    static SCRATCH: UnsafeCell<Scratch> = const {
        UnsafeCell::new(Scratch { f32s: [0.0; LANES], u16s: [0; LANES] })
    };
    static SCRATCH_IN_USE: Cell<bool> = const { Cell::new(false) };
}

struct ScratchGuard;

impl ScratchGuard {
    fn acquire() -> Self {
        SCRATCH_IN_USE.with(|flag| {
            assert!(
                !flag.replace(true),
                "convert: remainder scratch is already in use on this thread"
            );
        });
        ScratchGuard
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        SCRATCH_IN_USE.with(|flag| flag.set(false));
    }
}

/// Runs `f` with exclusive access to this thread's remainder scratch.
/// Reentrant use is a programming error and panics; the guard is released
/// on every exit path, including unwinds out of `f`.
fn with_scratch<R>(f: impl FnOnce(&mut Scratch) -> R) -> R {
    let _guard = ScratchGuard::acquire();
    SCRATCH.with(|s| f(unsafe { &mut *s.get() }))
}

/// Convert `src.len()` 16-bit samples to floats. Every value converts
/// exactly. `dst` must be `src.len()` rounded up to the lane width; the pad
/// slots past `src.len()` are written but their values are unspecified.
#[inline]
pub fn convert_u16_to_f32(dst: &mut [f32], src: &[u16]) {
    convert_u16_to_f32_with_kernel(dst, src, Kernel::Auto)
}

pub fn convert_u16_to_f32_with_kernel(dst: &mut [f32], src: &[u16], kernel: Kernel) {
    assert_eq!(
        dst.len(),
        align_up_lanes(src.len()),
        "convert: destination must be the source length rounded up to {} lanes",
        LANES
    );
    let kernel = resolve(kernel);
    let rem = src.len() % LANES;
    let main = src.len() - rem;
    convert_whole_groups_u16_to_f32(&mut dst[..main], &src[..main], kernel);
    if rem != 0 {
        with_scratch(|scratch| {
            scratch.u16s = [0; LANES];
            scratch.u16s[..rem].copy_from_slice(&src[main..]);
            let padded = scratch.u16s;
            convert_whole_groups_u16_to_f32(&mut dst[main..main + LANES], &padded, kernel);
        });
    }
}

/// Convert `src.len()` floats to 16-bit samples, rounding half to even.
/// Returns `true` iff every input was inside `[0, 65535.5)`. Out-of-range
/// inputs leave an unspecified value in their slot but never trap or write
/// outside `dst`.
#[inline]
pub fn convert_f32_to_u16(dst: &mut [u16], src: &[f32]) -> bool {
    convert_f32_to_u16_with_kernel(dst, src, Kernel::Auto)
}

pub fn convert_f32_to_u16_with_kernel(dst: &mut [u16], src: &[f32], kernel: Kernel) -> bool {
    assert_eq!(
        dst.len(),
        src.len(),
        "convert: destination and source lengths must match"
    );
    let kernel = resolve(kernel);
    let rem = src.len() % LANES;
    let main = src.len() - rem;
    let main_ok = convert_whole_groups_f32_to_u16(&mut dst[..main], &src[..main], kernel);
    let mut tail_ok = true;
    if rem != 0 {
        tail_ok = with_scratch(|scratch| {
            // Zero padding keeps the pad lanes in range so they cannot
            // raise a false overflow alarm.
            scratch.f32s = [0.0; LANES];
            scratch.f32s[..rem].copy_from_slice(&src[main..]);
            let padded = scratch.f32s;
            let ok = convert_whole_groups_f32_to_u16(&mut scratch.u16s, &padded, kernel);
            dst[main..].copy_from_slice(&scratch.u16s[..rem]);
            ok
        });
    }
    main_ok & tail_ok
}

/// Strided group conversion used by the chunk loaders: lane group `j` of
/// `src` lands at group index `j * stride + offset` of `dst`. Bins past
/// `src.len()` inside the final group are filled with zero.
pub(crate) fn convert_u16_groups_strided(dst: &mut [f32], src: &[u16], offset: usize, stride: usize) {
    let groups = align_up_lanes(src.len()) / LANES;
    for j in 0..groups {
        let base = (j * stride + offset) * LANES;
        let bin = j * LANES;
        let take = LANES.min(src.len() - bin);
        for l in 0..take {
            dst[base + l] = src[bin + l] as f32;
        }
        for l in take..LANES {
            dst[base + l] = 0.0;
        }
    }
}

/// `f32` twin of [`convert_u16_groups_strided`]; no numeric conversion.
pub(crate) fn convert_f32_groups_strided(dst: &mut [f32], src: &[f32], offset: usize, stride: usize) {
    let groups = align_up_lanes(src.len()) / LANES;
    for j in 0..groups {
        let base = (j * stride + offset) * LANES;
        let bin = j * LANES;
        let take = LANES.min(src.len() - bin);
        dst[base..base + take].copy_from_slice(&src[bin..bin + take]);
        for l in take..LANES {
            dst[base + l] = 0.0;
        }
    }
}

#[inline]
fn resolve(kernel: Kernel) -> Kernel {
    match kernel {
        Kernel::Auto => detect_best_kernel(),
        k => k,
    }
}

fn convert_whole_groups_u16_to_f32(dst: &mut [f32], src: &[u16], kernel: Kernel) {
    debug_assert_eq!(src.len() % LANES, 0);
    debug_assert_eq!(dst.len(), src.len());
    match kernel {
        #[cfg(target_arch = "x86_64")]
        Kernel::Avx2 => unsafe { u16_to_f32_avx2(dst, src) },
        _ => u16_to_f32_scalar(dst, src),
    }
}

fn convert_whole_groups_f32_to_u16(dst: &mut [u16], src: &[f32], kernel: Kernel) -> bool {
    debug_assert_eq!(src.len() % LANES, 0);
    debug_assert_eq!(dst.len(), src.len());
    match kernel {
        #[cfg(target_arch = "x86_64")]
        Kernel::Avx2 => unsafe { f32_to_u16_avx2(dst, src) },
        _ => f32_to_u16_scalar(dst, src),
    }
}

#[inline]
fn u16_to_f32_scalar(dst: &mut [f32], src: &[u16]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d = s as f32;
    }
}

#[inline]
fn f32_to_u16_scalar(dst: &mut [u16], src: &[f32]) -> bool {
    let mut high_bits_diff: u32 = 0;
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        let bits = (s + MAGIC_BIAS).to_bits();
        *d = bits as u16;
        high_bits_diff |= (bits >> 16) ^ u32::from(MAGIC_HIGH_WORD);
    }
    high_bits_diff == 0
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn u16_to_f32_avx2(dst: &mut [f32], src: &[u16]) {
    use core::arch::x86_64::*;

    let zero = _mm_setzero_si128();
    let mut s = src.as_ptr();
    let mut d = dst.as_mut_ptr();
    let mut left = src.len();
    while left != 0 {
        let v_u16 = _mm_loadu_si128(s as *const __m128i);
        let lo_u32 = _mm_unpacklo_epi16(v_u16, zero);
        let hi_u32 = _mm_unpackhi_epi16(v_u16, zero);
        let lo = _mm_cvtepi32_ps(lo_u32);
        let hi = _mm_cvtepi32_ps(hi_u32);
        let v = _mm256_insertf128_ps::<1>(_mm256_castps128_ps256(lo), hi);
        _mm256_storeu_ps(d, v);
        s = s.add(LANES);
        d = d.add(LANES);
        left -= LANES;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn f32_to_u16_avx2(dst: &mut [u16], src: &[f32]) -> bool {
    use core::arch::x86_64::*;

    let magic = _mm256_set1_ps(MAGIC_BIAS);
    let expected = _mm256_set1_ps(MAGIC_BIAS);
    let mut overflow = _mm256_setzero_ps();

    const Z: i8 = -0x80;
    // Pulls the low 16 bits of each 32-bit float into a packed half of the
    // destination register, zeroing the other half.
    let high_shuffle = _mm_set_epi8(13, 12, 9, 8, 5, 4, 1, 0, Z, Z, Z, Z, Z, Z, Z, Z);
    let low_shuffle = _mm_set_epi8(Z, Z, Z, Z, Z, Z, Z, Z, 13, 12, 9, 8, 5, 4, 1, 0);

    let mut s = src.as_ptr();
    let mut d = dst.as_mut_ptr();
    let mut left = src.len();
    while left != 0 {
        let biased = _mm256_add_ps(_mm256_loadu_ps(s), magic);
        // Any deviation of the exponent field from the expected constant
        // accumulates a nonzero high word in `overflow`.
        overflow = _mm256_or_ps(overflow, _mm256_xor_ps(biased, expected));

        let hi = _mm_castps_si128(_mm256_extractf128_ps::<1>(biased));
        let lo = _mm_castps_si128(_mm256_castps256_ps128(biased));
        let hi_words = _mm_shuffle_epi8(hi, high_shuffle);
        let lo_words = _mm_shuffle_epi8(lo, low_shuffle);
        _mm_storeu_si128(d as *mut __m128i, _mm_or_si128(lo_words, hi_words));

        s = s.add(LANES);
        d = d.add(LANES);
        left -= LANES;
    }

    let mut words = [0u32; LANES];
    _mm256_storeu_ps(words.as_mut_ptr() as *mut f32, overflow);
    words.iter().all(|&w| w >> 16 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::helpers::kernel_supported;
    use paste::paste;
    use proptest::prelude::*;

    macro_rules! gen_kernel_tests {
        ($check:ident) => {
            paste! {
                #[test]
                fn [<$check _scalar>]() {
                    $check(Kernel::Scalar);
                }
                #[test]
                fn [<$check _avx2>]() {
                    if kernel_supported(Kernel::Avx2) {
                        $check(Kernel::Avx2);
                    } else {
                        eprintln!(concat!(stringify!($check), ": skipping, no AVX2"));
                    }
                }
            }
        };
    }

    fn check_u16_roundtrip_full_range(kernel: Kernel) {
        let src: Vec<u16> = (0..=u16::MAX).collect();
        let mut floats = vec![0.0f32; align_up_lanes(src.len())];
        convert_u16_to_f32_with_kernel(&mut floats, &src, kernel);
        for (i, &v) in src.iter().enumerate() {
            assert_eq!(floats[i], v as f32);
        }

        let mut back = vec![0u16; src.len()];
        let ok = convert_f32_to_u16_with_kernel(&mut back, &floats[..src.len()], kernel);
        assert!(ok);
        assert_eq!(back, src);
    }
    gen_kernel_tests!(check_u16_roundtrip_full_range);

    fn check_round_half_to_even(kernel: Kernel) {
        let src = [0.5f32, 1.5, 2.5, 3.5, 65534.5, 65535.4, 0.49999997, 100.5];
        let mut dst = [0u16; 8];
        let ok = convert_f32_to_u16_with_kernel(&mut dst, &src, kernel);
        assert!(ok);
        assert_eq!(dst, [0, 2, 2, 4, 65534, 65535, 0, 100]);
    }
    gen_kernel_tests!(check_round_half_to_even);

    fn check_overflow_detection(kernel: Kernel) {
        for bad in [65535.5f32, 65536.0, 1.0e9, -1.0, -65536.0, f32::NAN, f32::INFINITY] {
            let mut src = [1.0f32; 9];
            src[4] = bad;
            let mut dst = [0u16; 9];
            let ok = convert_f32_to_u16_with_kernel(&mut dst, &src, kernel);
            assert!(!ok, "value {bad} must be flagged out of range");
            // In-range slots still convert correctly.
            assert_eq!(dst[0], 1);
            assert_eq!(dst[8], 1);
        }

        let good = [0.0f32, 0.25, 65535.0, 65535.25, 12345.5];
        let mut dst = [0u16; 5];
        assert!(convert_f32_to_u16_with_kernel(&mut dst, &good, kernel));
    }
    gen_kernel_tests!(check_overflow_detection);

    fn check_remainder_matches_aligned(kernel: Kernel) {
        // For every length from 1 to 23 the unaligned conversion must agree
        // with the aligned computation on zero-padded copies of the data.
        for count in 1usize..=23 {
            let src_u16: Vec<u16> = (0..count as u16).map(|i| i * 2749 + 11).collect();
            let mut floats = vec![f32::NAN; align_up_lanes(count)];
            convert_u16_to_f32_with_kernel(&mut floats, &src_u16, kernel);

            let mut padded_src = src_u16.clone();
            padded_src.resize(align_up_lanes(count), 0);
            let mut reference = vec![0.0f32; padded_src.len()];
            convert_u16_to_f32_with_kernel(&mut reference, &padded_src, kernel);
            assert_eq!(&floats[..count], &reference[..count], "count={count}");

            let mut back = vec![0u16; count];
            let ok = convert_f32_to_u16_with_kernel(&mut back, &floats[..count], kernel);
            assert!(ok);
            assert_eq!(back, src_u16, "count={count}");
        }
    }
    gen_kernel_tests!(check_remainder_matches_aligned);

    fn check_kernels_agree(reference: Kernel, other: Kernel) {
        let src: Vec<f32> = (0..1003).map(|i| (i as f32 * 65.41) % 65535.0).collect();
        let mut a = vec![0u16; src.len()];
        let mut b = vec![0u16; src.len()];
        let ok_a = convert_f32_to_u16_with_kernel(&mut a, &src, reference);
        let ok_b = convert_f32_to_u16_with_kernel(&mut b, &src, other);
        assert_eq!(ok_a, ok_b);
        assert_eq!(a, b);
    }

    #[test]
    fn scalar_and_avx2_agree() {
        if kernel_supported(Kernel::Avx2) {
            check_kernels_agree(Kernel::Scalar, Kernel::Avx2);
        }
    }

    #[test]
    #[should_panic(expected = "remainder scratch is already in use")]
    fn scratch_reentry_panics() {
        with_scratch(|_| with_scratch(|_| ()));
    }

    #[test]
    #[should_panic(expected = "destination must be the source length rounded up")]
    fn short_destination_panics() {
        let src = [1u16, 2, 3];
        let mut dst = [0.0f32; 3];
        convert_u16_to_f32(&mut dst, &src);
    }

    #[test]
    fn strided_layout_places_groups() {
        // Two arrays of 11 bins: array 1, group 1 must land at group index
        // 1 * stride + 1, with the tail lanes zeroed.
        let src: Vec<u16> = (100..111).collect();
        let stride = 2;
        let mut dst = vec![f32::NAN; 2 * stride * LANES];
        convert_u16_groups_strided(&mut dst, &src, 1, stride);
        assert_eq!(dst[LANES], 100.0);
        assert_eq!(dst[LANES + 7], 107.0);
        let tail_base = (stride + 1) * LANES;
        assert_eq!(dst[tail_base], 108.0);
        assert_eq!(dst[tail_base + 2], 110.0);
        assert_eq!(dst[tail_base + 3], 0.0);
        assert_eq!(dst[tail_base + 7], 0.0);
    }

    proptest! {
        #[test]
        fn prop_in_range_floats_round_trip(values in prop::collection::vec(0.0f32..65535.0, 1..200)) {
            let mut dst = vec![0u16; values.len()];
            let ok = convert_f32_to_u16(&mut dst, &values);
            prop_assert!(ok);
            for (&v, &d) in values.iter().zip(dst.iter()) {
                let expected = (v + MAGIC_BIAS).to_bits() as u16;
                prop_assert_eq!(d, expected);
                // Never off by more than the rounding step.
                prop_assert!((d as f32 - v).abs() <= 0.5);
            }
        }

        #[test]
        fn prop_u16_conversion_is_exact(values in prop::collection::vec(0u16..=u16::MAX, 1..200)) {
            let mut floats = vec![0.0f32; align_up_lanes(values.len())];
            convert_u16_to_f32(&mut floats, &values);
            for (i, &v) in values.iter().enumerate() {
                prop_assert_eq!(floats[i] as u32, v as u32);
            }
        }
    }
}
