//! Pure shape arithmetic for the lowering pass.
//!
//! All functions take concrete integer shapes and parameters and have no
//! side effects. Padding values are totals (sum over both sides of a
//! dimension), matching the IR's `padding_values` convention.

use crate::{tvec, TVec};
use num_integer::Integer;

/// 4D tensor layout convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// batch, height, width, channel — filters are HWOI
    NHWC,
    /// batch, channel, height, width — filters are OIHW
    NCHW,
}

impl DataFormat {
    pub fn channel_axis(&self) -> usize {
        match self {
            DataFormat::NHWC => 3,
            DataFormat::NCHW => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Floor,
    Ceil,
}

pub type Shape = TVec<i64>;

fn round_div(num: i64, den: i64, round: Rounding) -> i64 {
    match round {
        Rounding::Floor => Integer::div_floor(&num, &den),
        Rounding::Ceil => Integer::div_ceil(&num, &den),
    }
}

fn spatial_dim(input: i64, kernel: i64, pad: i64, stride: i64, dilation: i64, round: Rounding) -> i64 {
    round_div(input + pad - kernel - (kernel - 1) * (dilation - 1), stride, round) + 1
}

/// Output shape of a convolution or pooling. Convolutions round down,
/// pooling rounds up. The filter shape follows the layout's filter
/// convention (HWOI for NHWC, OIHW for NCHW).
pub fn conv_pool_shape(
    input: &[i64],
    filter: &[i64],
    paddings: &[i64],
    strides: &[i64],
    dilations: &[i64],
    round: Rounding,
    format: DataFormat,
) -> Shape {
    match format {
        DataFormat::NHWC => tvec![
            input[0],
            spatial_dim(input[1], filter[0], paddings[0], strides[0], dilations[0], round),
            spatial_dim(input[2], filter[1], paddings[1], strides[1], dilations[1], round),
            filter[2],
        ],
        DataFormat::NCHW => tvec![
            input[0],
            filter[0],
            spatial_dim(input[2], filter[2], paddings[0], strides[0], dilations[0], round),
            spatial_dim(input[3], filter[3], paddings[1], strides[1], dilations[1], round),
        ],
    }
}

/// Batch preserved, one dimension set to the weight matrix's output-feature
/// count, spatial dimensions collapsed to 1.
pub fn fully_connected_shape(input: &[i64], weight: &[i64], format: DataFormat) -> Shape {
    match format {
        DataFormat::NHWC => tvec![input[0], 1, 1, weight[0]],
        DataFormat::NCHW => tvec![input[0], weight[0], 1, 1],
    }
}

/// All input shapes identical except along `axis`, which sums.
pub fn concat_shape(input_shapes: &[Shape], axis: usize) -> Shape {
    let mut output = input_shapes[0].clone();
    for shape in &input_shapes[1..] {
        output[axis] += shape[axis];
    }
    output
}

/// The channel axis divided by the number of outputs. Divisibility is
/// validated by the caller.
pub fn slice_shape(input: &[i64], num_output: i64, format: DataFormat) -> Shape {
    let mut output: Shape = input.iter().copied().collect();
    let axis = format.channel_axis();
    output[axis] = input[axis] / num_output;
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn conv_224_stride_2() {
        let out = conv_pool_shape(
            &[1, 3, 224, 224],
            &[64, 3, 3, 3],
            &[2, 2],
            &[2, 2],
            &[1, 1],
            Rounding::Floor,
            DataFormat::NCHW,
        );
        assert_eq!(&*out, &[1, 64, 112, 112]);
    }

    #[test]
    fn pooling_rounds_up() {
        // 7x7 input, 3x3 kernel, stride 2, no pad: conv gives 3, pooling 3
        // 8x8 makes them differ
        let floor = conv_pool_shape(
            &[1, 16, 8, 8],
            &[16, 16, 3, 3],
            &[0, 0],
            &[2, 2],
            &[1, 1],
            Rounding::Floor,
            DataFormat::NCHW,
        );
        let ceil = conv_pool_shape(
            &[1, 16, 8, 8],
            &[16, 16, 3, 3],
            &[0, 0],
            &[2, 2],
            &[1, 1],
            Rounding::Ceil,
            DataFormat::NCHW,
        );
        assert_eq!(&floor[2..], &[3, 3]);
        assert_eq!(&ceil[2..], &[4, 4]);
    }

    #[test]
    fn dilation_shrinks_output() {
        let out = conv_pool_shape(
            &[1, 8, 16, 16],
            &[8, 8, 3, 3],
            &[0, 0],
            &[1, 1],
            &[2, 2],
            Rounding::Floor,
            DataFormat::NCHW,
        );
        assert_eq!(&out[2..], &[12, 12]);
    }

    #[test]
    fn fc_shape_per_format() {
        assert_eq!(
            &*fully_connected_shape(&[2, 512, 7, 7], &[1000, 25088], DataFormat::NCHW),
            &[2, 1000, 1, 1]
        );
        assert_eq!(
            &*fully_connected_shape(&[2, 7, 7, 512], &[1000, 25088], DataFormat::NHWC),
            &[2, 1, 1, 1000]
        );
    }

    #[test]
    fn concat_sums_axis() {
        let shapes = [tvec![1i64, 8, 14, 14], tvec![1i64, 24, 14, 14]];
        assert_eq!(&*concat_shape(&shapes, 1), &[1, 32, 14, 14]);
    }

    #[test]
    fn slice_divides_channels() {
        assert_eq!(&*slice_shape(&[1, 16, 7, 7], 4, DataFormat::NCHW), &[1, 4, 7, 7]);
        assert_eq!(&*slice_shape(&[1, 7, 7, 16], 4, DataFormat::NHWC), &[1, 7, 7, 4]);
    }

    proptest! {
        #[test]
        fn conv_shape_agrees_across_formats(
            n in 1i64..4,
            c in 1i64..16,
            h in 4i64..64,
            w in 4i64..64,
            o in 1i64..16,
            k in 1i64..5,
            s in 1i64..4,
            p in 0i64..3,
        ) {
            prop_assume!(k <= h && k <= w);
            let nchw = conv_pool_shape(
                &[n, c, h, w], &[o, c, k, k], &[2 * p, 2 * p], &[s, s], &[1, 1],
                Rounding::Floor, DataFormat::NCHW,
            );
            let nhwc = conv_pool_shape(
                &[n, h, w, c], &[k, k, o, c], &[2 * p, 2 * p], &[s, s], &[1, 1],
                Rounding::Floor, DataFormat::NHWC,
            );
            prop_assert_eq!(nchw[0], nhwc[0]);
            prop_assert_eq!(nchw[1], nhwc[3]);
            prop_assert_eq!(nchw[2], nhwc[1]);
            prop_assert_eq!(nchw[3], nhwc[2]);
        }
    }
}
