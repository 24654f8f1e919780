//! Tensor shuffling: concatenation, channel slicing and reshape.

use crate::internal::*;
use crate::lowering::Lowering;

pub(crate) fn concat(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let name = node.name.clone();
    let parent_count = node.parents.len();
    let param = node.layer.as_ref().and_then(|l| l.concat_param.clone()).unwrap_or_default();
    let mut def = cx.common_def(id, OpType::Concat)?;
    let axis = param
        .axis
        .or(param.concat_dim)
        .unwrap_or(cx.data_format().channel_axis() as i64);
    ensure!(
        (0..4).contains(&axis),
        "concat {} axis {} out of range for rank-4 tensors",
        name,
        axis
    );
    def.int_arg("axis", axis);

    let input_shapes = (0..parent_count)
        .map(|ix| cx.graph.bottom_shape(id, ix))
        .collect::<MobirResult<Vec<Shape>>>()?;
    ensure!(!input_shapes.is_empty(), "concat {} has no inputs", name);
    let output_shape = concat_shape(&input_shapes, axis as usize);
    let top = cx.graph.nodes[id].first_top().to_string();
    cx.graph.nodes[id].output_shapes.insert(top, output_shape.clone());
    cx.resolved.insert(name);
    cx.finish_op(def, id, output_shape);
    Ok(())
}

/// Splits the channel axis evenly across the declared outputs. Each output
/// blob gets an indexed tensor name.
pub(crate) fn slice(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let name = node.name.clone();
    let tops: Vec<String> =
        node.layer.as_ref().map(|l| l.tops.clone()).unwrap_or_default();
    if let Some(param) = node.layer.as_ref().and_then(|l| l.slice_param.clone()) {
        if let Some(axis) = param.axis {
            ensure!(axis == 1, "slice {} with axis {} is not supported", name, axis);
        }
        ensure!(
            param.slice_point.is_empty(),
            "slice {} with explicit slice points is not supported",
            name
        );
    }

    let mut def = cx.common_def(id, OpType::Slice)?;
    let axis = cx.data_format().channel_axis();
    def.int_arg("axis", axis as i64);

    let input_shape = cx.graph.bottom_shape(id, 0)?;
    let num_outputs = tops.len() as i64;
    ensure!(num_outputs > 0, "slice {} declares no outputs", name);
    let channels = input_shape[axis];
    ensure!(
        channels % num_outputs == 0,
        "slice {} cannot split {} channels into {} outputs",
        name,
        channels,
        num_outputs
    );
    if cx.device == Device::Gpu {
        ensure!(
            (channels / num_outputs) % 4 == 0,
            "slice {} per-output channel count {} is not a multiple of 4",
            name,
            channels / num_outputs
        );
    }
    let output_shape = slice_shape(&input_shape, num_outputs, cx.data_format());
    for (ix, top) in tops.iter().enumerate() {
        cx.graph.nodes[id].output_shapes.insert(top.clone(), output_shape.clone());
        def.add_output_shape(output_shape.clone());
        def.outputs.push(format!("{name}_{ix}:0"));
    }
    cx.resolved.insert(name);
    cx.net.add_op(def);
    Ok(())
}

/// CPU reshapes in place; GPU re-organizes texture storage, with the target
/// shape re-expressed from NHWC to the texture layout's axis order. Zero
/// entries in the requested shape keep the input's extent.
pub(crate) fn reshape(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let param = node.layer.as_ref().and_then(|l| l.reshape_param.clone()).unwrap_or_default();
    let op_type = match cx.device {
        Device::Cpu => OpType::Reshape,
        Device::Gpu => OpType::ReOrganize,
    };
    let mut def = cx.common_def(id, op_type)?;
    let input_shape = cx.graph.bottom_shape(id, 0)?;
    let requested: Shape = match cx.device {
        Device::Cpu => {
            ensure!(
                param.shape.len() <= input_shape.len(),
                "reshape {} wants rank {}, input has rank {}",
                node.name,
                param.shape.len(),
                input_shape.len()
            );
            param.shape.iter().copied().collect()
        }
        Device::Gpu => {
            ensure!(
                param.shape.len() == 4,
                "reshape {} on gpu needs a rank-4 target shape",
                node.name
            );
            [0usize, 3, 1, 2].iter().map(|&ix| param.shape[ix]).collect()
        }
    };
    let mut output_shape = input_shape;
    for (ix, &dim) in requested.iter().enumerate() {
        if dim != 0 {
            output_shape[ix] = dim;
        }
    }
    def.ints_arg("shape", &output_shape);
    let top = cx.graph.nodes[id].first_top().to_string();
    cx.graph.nodes[id].output_shapes.insert(top, output_shape.clone());
    let name = cx.graph.nodes[id].name.clone();
    cx.resolved.insert(name);
    cx.finish_op(def, id, output_shape);
    Ok(())
}
