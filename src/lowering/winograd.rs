//! Winograd rewrite of 3x3 stride-1 convolutions.
//!
//! On CPU the convolution keeps its operator but receives a pre-transformed
//! filter tensor. On GPU the convolution is replaced by an explicit
//! transform / matmul / inverse-transform triple.

use crate::internal::*;
use crate::lowering::{add_tensor, cnn, Lowering, GPU_IMAGE_MAX_SIZE};
use ndarray::{arr2, Array2, Array3, ArrayD, Ix4};

/// Decides whether a convolution node qualifies for the Winograd rewrite on
/// the active target. Always false when the rewrite is disabled.
pub(crate) fn eligible(cx: &Lowering, id: usize) -> MobirResult<bool> {
    if !cx.winograd {
        return Ok(false);
    }
    let node = &cx.graph.nodes[id];
    let param = node
        .layer
        .as_ref()
        .and_then(|l| l.convolution_param.clone())
        .unwrap_or_default();
    let filter = node
        .blobs
        .first()
        .with_context(|| format!("convolution {} has no filter weights", node.name))?;
    ensure!(filter.ndim() == 4, "convolution {} filter must be rank 4", node.name);
    if cnn::is_depthwise(&param, filter.shape())? {
        return Ok(false);
    }
    let dilations = cnn::dilations(&param);
    let (paddings, strides, _) = cx.stride_pad_kernel(&param.kernel, None, false)?;
    if dilations[0] != 1 || dilations[0] != dilations[1] || strides[0] != 1 || strides[0] != strides[1]
    {
        return Ok(false);
    }
    // source filter is OIHW
    let (o, i, h, w) = (
        filter.shape()[0] as i64,
        filter.shape()[1] as i64,
        filter.shape()[2] as i64,
        filter.shape()[3] as i64,
    );
    match cx.device {
        Device::Cpu => Ok(h == 3 && h == w && o >= 8 && i >= 8),
        Device::Gpu => {
            let input_shape = cx.graph.parent_shape(id)?;
            let output_shape = conv_pool_shape(
                &input_shape,
                &[h, w, o, i],
                &paddings,
                &strides,
                &dilations,
                Rounding::Floor,
                DataFormat::NHWC,
            );
            let tile_count =
                output_shape[0] * ((output_shape[1] + 1) / 2) * ((output_shape[2] + 1) / 2);
            Ok(h == 3
                && h == w
                && 16 * o < GPU_IMAGE_MAX_SIZE
                && 16 * i < GPU_IMAGE_MAX_SIZE
                && tile_count < GPU_IMAGE_MAX_SIZE)
        }
    }
}

// F(6x6, 3x3) transform matrix, used when the input is large enough to
// amortize the wider tile.
fn g_matrix_8() -> Array2<f32> {
    arr2(&[
        [1.0, 0.0, 0.0],
        [-2.0 / 9.0, -2.0 / 9.0, -2.0 / 9.0],
        [-2.0 / 9.0, 2.0 / 9.0, -2.0 / 9.0],
        [1.0 / 90.0, 1.0 / 45.0, 2.0 / 45.0],
        [1.0 / 90.0, -1.0 / 45.0, 2.0 / 45.0],
        [1.0 / 45.0, 1.0 / 90.0, 1.0 / 180.0],
        [1.0 / 45.0, -1.0 / 90.0, 1.0 / 180.0],
        [0.0, 0.0, 1.0],
    ])
}

// F(2x2, 3x3)
fn g_matrix_4() -> Array2<f32> {
    arr2(&[[1.0, 0.0, 0.0], [0.5, 0.5, 0.5], [0.5, -0.5, 0.5], [0.0, 0.0, 1.0]])
}

/// G.W.Gt over every (output, input) channel pair of an OIHW 3x3 filter,
/// laid out as [tile*tile, out_channels, in_channels].
fn transform_filter(weight: &ArrayD<f32>, g: &Array2<f32>) -> MobirResult<Array3<f32>> {
    let w = weight.view().into_dimensionality::<Ix4>()?;
    ensure!(w.shape()[2] == 3 && w.shape()[3] == 3, "winograd transform needs a 3x3 filter");
    let (o, i) = (w.shape()[0], w.shape()[1]);
    let a = g.shape()[0];
    let mut out = Array3::<f32>::zeros((a * a, o, i));
    for s in 0..a {
        for t in 0..a {
            for oo in 0..o {
                for ii in 0..i {
                    let mut acc = 0.0f32;
                    for k in 0..3 {
                        for l in 0..3 {
                            acc += g[(s, k)] * w[(oo, ii, k, l)] * g[(t, l)];
                        }
                    }
                    out[(s * a + t, oo, ii)] = acc;
                }
            }
        }
    }
    Ok(out)
}

/// CPU path: replaces the filter input by its Winograd-domain transform and
/// flags the operator so the runtime skips its own filter transform. The
/// tile size follows the input's spatial extent.
pub(crate) fn transform_filter_cpu(
    cx: &mut Lowering,
    id: usize,
    def: &mut OperatorDef,
    filter: &ArrayD<f32>,
) -> MobirResult<()> {
    let name = cx.graph.nodes[id].name.clone();
    let input_shape = cx.graph.parent_shape(id)?;
    let g = if input_shape[2] > 16 && input_shape[3] > 16 { g_matrix_8() } else { g_matrix_4() };
    let transformed = transform_filter(filter, &g)?;
    let weight_tensor_name = format!("{name}_weight:0");
    add_tensor(&mut cx.net, &weight_tensor_name, &transformed.into_dyn());
    def.inputs.push(weight_tensor_name);
    def.int_arg("is_filter_transformed", 1);
    Ok(())
}

/// GPU path: emits the WinogradTransform / MatMul / WinogradInverseTransform
/// triple in place of the convolution. Bias and activation fold into the
/// inverse transform.
pub(crate) fn conv_gpu(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let name = node.name.clone();
    ensure!(!node.blobs.is_empty(), "convolution {} has no filter weights", name);
    let filter = node.blobs[0].clone();
    let bias = node.blobs.get(1).cloned();
    let param = node
        .layer
        .as_ref()
        .and_then(|l| l.convolution_param.clone())
        .unwrap_or_default();

    let weight_tensor_name = format!("{name}_weight:0");
    add_tensor(&mut cx.net, &weight_tensor_name, &filter);
    let filter_image_name = cx.add_buffer_to_image(&weight_tensor_name, BufferType::WinogradFilter);

    let (paddings, strides, _) = cx.stride_pad_kernel(&param.kernel, None, false)?;
    // OIHW -> HWOI
    let (o, i, h, w) = (
        filter.shape()[0] as i64,
        filter.shape()[1] as i64,
        filter.shape()[2] as i64,
        filter.shape()[3] as i64,
    );
    let input_shape = cx.graph.parent_shape(id)?;
    let output_shape = conv_pool_shape(
        &input_shape,
        &[h, w, o, i],
        &paddings,
        &strides,
        &[1, 1],
        Rounding::Floor,
        DataFormat::NHWC,
    );
    let tile_count = output_shape[0] * ((output_shape[1] + 1) / 2) * ((output_shape[2] + 1) / 2);

    let mut wt_def = OperatorDef::new(format!("{name}_input_transform"), OpType::WinogradTransform);
    wt_def.int_arg("T", cx.dt as i64);
    wt_def.ints_arg("padding_values", &paddings);
    let inputs = cx
        .inputs_map
        .get(&name)
        .with_context(|| format!("no recorded inputs for operator {name}"))?;
    wt_def.inputs = inputs.iter().map(|n| format!("{n}:0")).collect();
    let wt_output_name = format!("{}:0", wt_def.name);
    wt_def.outputs.push(wt_output_name.clone());
    wt_def.add_output_shape(tvec![16, i, tile_count, 1]);

    let mut matmul_def = OperatorDef::new(format!("{name}_matmul"), OpType::MatMul);
    matmul_def.int_arg("T", cx.dt as i64);
    matmul_def.inputs = vec![filter_image_name, wt_output_name];
    let matmul_output_name = format!("{}:0", matmul_def.name);
    matmul_def.outputs.push(matmul_output_name.clone());
    matmul_def.add_output_shape(tvec![16, o, tile_count, 1]);

    let mut iwt_def =
        OperatorDef::new(format!("{name}_inverse_transform"), OpType::WinogradInverseTransform);
    iwt_def.int_arg("T", cx.dt as i64);
    iwt_def.int_arg("batch", output_shape[0]);
    iwt_def.int_arg("height", output_shape[1]);
    iwt_def.int_arg("width", output_shape[2]);
    iwt_def.inputs.push(matmul_output_name);
    if let Some(bias) = bias {
        cnn::add_bias(cx, &name, &bias, &mut iwt_def);
    }

    let top = cx.graph.nodes[id].first_top().to_string();
    cx.graph.nodes[id].output_shapes.insert(top, output_shape.clone());
    cx.resolved.insert(name);

    let final_id = cx.fuse_single_activation(id, &mut iwt_def, &output_shape)?;
    cx.net.add_op(wt_def);
    cx.net.add_op(matmul_def);
    cx.finish_op(iwt_def, final_id, output_shape);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    #[test]
    fn center_tap_filter_transforms_to_outer_product() {
        // a filter with only the center tap set transforms to the outer
        // product of G's middle column with itself
        let mut w = Array4::<f32>::zeros((2, 3, 3, 3));
        w[(0, 0, 1, 1)] = 1.0;
        let g = g_matrix_4();
        let out = transform_filter(&w.into_dyn(), &g).unwrap();
        assert_eq!(out.shape(), &[16, 2, 3]);
        for s in 0..4 {
            for t in 0..4 {
                assert_abs_diff_eq!(out[(s * 4 + t, 0, 0)], g[(s, 1)] * g[(t, 1)], epsilon = 1e-6);
                assert_abs_diff_eq!(out[(s * 4 + t, 1, 0)], 0.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn eight_point_transform_shape() {
        let w = Array4::<f32>::from_elem((8, 8, 3, 3), 0.5);
        let out = transform_filter(&w.into_dyn(), &g_matrix_8()).unwrap();
        assert_eq!(out.shape(), &[64, 8, 8]);
    }

    #[test]
    fn transform_rejects_non_3x3() {
        let w = Array4::<f32>::zeros((4, 4, 5, 5));
        assert!(transform_filter(&w.into_dyn(), &g_matrix_4()).is_err());
    }
}
