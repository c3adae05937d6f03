use crate::utilities::enums::Kernel;
use std::sync::OnceLock;

static BEST_KERNEL: OnceLock<Kernel> = OnceLock::new();

#[inline(always)]
pub fn detect_best_kernel() -> Kernel {
    *BEST_KERNEL.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx2") {
                return Kernel::Avx2;
            }
        }
        Kernel::Scalar
    })
}

/// Whether the given kernel can run on this machine. Used by tests to skip
/// kernel variants the CPU cannot execute.
#[inline]
pub fn kernel_supported(kernel: Kernel) -> bool {
    match kernel {
        Kernel::Avx2 => {
            #[cfg(target_arch = "x86_64")]
            {
                std::arch::is_x86_feature_detected!("avx2")
            }
            #[cfg(not(target_arch = "x86_64"))]
            {
                false
            }
        }
        _ => true,
    }
}
