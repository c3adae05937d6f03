pub mod stacking;
pub mod utilities;

pub use stacking::pipeline::{
    clipped_mean, clipped_mean_u16, clipped_mean_with_kernel, clipped_median, clipped_median_u16,
    clipped_median_with_kernel, OutputSink, StackData, StackError, StackInput, StackParams,
};
pub use stacking::convert::{
    convert_f32_to_u16, convert_f32_to_u16_with_kernel, convert_u16_to_f32,
    convert_u16_to_f32_with_kernel,
};
pub use stacking::source::{DataSource, F32Source, SourceError, U16Source};
pub use utilities::enums::Kernel;
