//! Convolution and pooling conversion.

use crate::internal::*;
use crate::lowering::{add_tensor, winograd, Lowering};
use ndarray::{Array1, ArrayD};

/// Depthwise iff the group count equals the output channel count and the
/// filter has a single input channel. A grouped convolution that is not
/// depthwise has no runtime kernel.
pub(crate) fn is_depthwise(param: &ConvolutionParam, filter_shape: &[usize]) -> MobirResult<bool> {
    match param.group {
        None | Some(1) => Ok(false),
        Some(g) if g == filter_shape[0] as i64 && filter_shape[1] == 1 => Ok(true),
        Some(g) => bail!("group convolution (group={}) is not supported", g),
    }
}

pub(crate) fn dilations(param: &ConvolutionParam) -> TVec<i64> {
    match *param.dilation.as_slice() {
        [] => tvec![1, 1],
        [d] => tvec![d, d],
        [d0, d1, ..] => tvec![d0, d1],
    }
}

pub(crate) fn conv2d(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let name = node.name.clone();
    let param = node
        .layer
        .as_ref()
        .and_then(|l| l.convolution_param.clone())
        .unwrap_or_default();
    ensure!(!node.blobs.is_empty(), "convolution {} has no filter weights", name);
    let filter: ArrayD<f32> = node.blobs[0].clone();
    let bias = node.blobs.get(1).cloned();
    ensure!(filter.ndim() == 4, "convolution {} filter must be rank 4", name);

    let is_depthwise = is_depthwise(&param, filter.shape())?;
    let use_winograd = cx.device == Device::Cpu && winograd::eligible(cx, id)?;

    let op_type = if is_depthwise { OpType::DepthwiseConv2d } else { OpType::Conv2D };
    let mut def = cx.common_def(id, op_type)?;

    let weight_tensor_name = format!("{name}_weight:0");
    // source filters are OIHW; the texture path wants HWOI
    let weight_data = match cx.device {
        Device::Cpu => filter.clone(),
        Device::Gpu => filter.clone().permuted_axes(vec![2, 3, 0, 1]),
    };
    if use_winograd {
        winograd::transform_filter_cpu(cx, id, &mut def, &filter)?;
    } else if cx.device == Device::Gpu {
        add_tensor(&mut cx.net, &weight_tensor_name, &weight_data);
        let buffer_type =
            if is_depthwise { BufferType::DwConvFilter } else { BufferType::ConvFilter };
        let image_name = cx.add_buffer_to_image(&weight_tensor_name, buffer_type);
        def.inputs.push(image_name);
    } else {
        add_tensor(&mut cx.net, &weight_tensor_name, &weight_data);
        def.inputs.push(weight_tensor_name);
    }

    if let Some(bias) = bias {
        add_bias(cx, &name, &bias, &mut def);
    }

    let (paddings, strides, _) = cx.stride_pad_kernel(&param.kernel, Some(&mut def), false)?;
    let dilations = dilations(&param);
    if !param.dilation.is_empty() {
        def.ints_arg("dilations", &dilations);
    }

    let input_shape = cx.graph.parent_shape(id)?;
    let filter_dims: Shape = weight_data.shape().iter().map(|&d| d as i64).collect();
    let output_shape = conv_pool_shape(
        &input_shape,
        &filter_dims,
        &paddings,
        &strides,
        &dilations,
        Rounding::Floor,
        cx.data_format(),
    );
    let top = cx.graph.nodes[id].first_top().to_string();
    cx.graph.nodes[id].output_shapes.insert(top, output_shape.clone());
    cx.resolved.insert(name);

    let final_id = cx.fuse_single_activation(id, &mut def, &output_shape)?;
    if final_id != id && !is_depthwise {
        def.op_type = OpType::FusedConv2D;
    }
    cx.finish_op(def, final_id, output_shape);
    Ok(())
}

/// Materializes a flattened bias vector and wires it as an extra input,
/// through an argument texture on GPU.
pub(crate) fn add_bias(cx: &mut Lowering, name: &str, bias: &ArrayD<f32>, def: &mut OperatorDef) {
    let bias_tensor_name = format!("{name}_bias:0");
    let flat: Array1<f32> = bias.iter().cloned().collect();
    add_tensor(&mut cx.net, &bias_tensor_name, &flat.into_dyn());
    if cx.device == Device::Gpu {
        let image_name = cx.add_buffer_to_image(&bias_tensor_name, BufferType::Argument);
        def.inputs.push(image_name);
    } else {
        def.inputs.push(bias_tensor_name);
    }
}

pub(crate) fn pooling(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let name = node.name.clone();
    let param = node
        .layer
        .as_ref()
        .and_then(|l| l.pooling_param.clone())
        .unwrap_or_default();

    let mut def = cx.common_def(id, OpType::Pooling)?;
    let (paddings, strides, mut kernels) =
        cx.stride_pad_kernel(&param.kernel, Some(&mut def), true)?;
    let mode = match param.pool {
        PoolMethod::Max => PoolingMode::Max,
        PoolMethod::Ave => PoolingMode::Avg,
    };
    def.int_arg("pooling_type", mode as i64);

    let input_shape = cx.graph.parent_shape(id)?;
    if param.global_pooling {
        kernels = match cx.device {
            Device::Cpu => tvec![input_shape[2], input_shape[3]],
            Device::Gpu => tvec![input_shape[1], input_shape[2]],
        };
    }
    def.ints_arg("kernels", &kernels);

    // synthetic channel-preserving filter shape for the shape arithmetic
    let filter_shape: Shape = match cx.device {
        Device::Cpu => tvec![input_shape[1], input_shape[1], kernels[0], kernels[1]],
        Device::Gpu => tvec![kernels[0], kernels[1], input_shape[3], input_shape[3]],
    };
    let output_shape = conv_pool_shape(
        &input_shape,
        &filter_shape,
        &paddings,
        &strides,
        &[1, 1],
        Rounding::Ceil,
        cx.data_format(),
    );
    let top = cx.graph.nodes[id].first_top().to_string();
    cx.graph.nodes[id].output_shapes.insert(top, output_shape.clone());
    cx.resolved.insert(name);
    cx.finish_op(def, id, output_shape);
    Ok(())
}
