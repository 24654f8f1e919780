//! BatchNorm folding, fully connected layers and activations.

use crate::internal::*;
use crate::lowering::{add_tensor, cnn, Lowering, GPU_IMAGE_MAX_SIZE};
use ndarray::{Array1, Array2, Array4, ArrayD, Zip};

/// Folds a BatchNorm and its mandatory trailing Scale into a single
/// scale/offset pair:
///
///   scale  = gamma / sqrt(var / count + eps)
///   offset = beta - mean / count * scale
pub(crate) fn batch_norm(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let name = node.name.clone();
    ensure!(
        node.children.len() == 1 && cx.graph.nodes[node.children[0]].kind == LayerKind::Scale,
        "batch norm {} must be followed by exactly one Scale layer",
        name
    );
    let scale_id = node.children[0];
    ensure!(
        node.blobs.len() == 3,
        "batch norm {} needs mean, variance and count blobs",
        name
    );
    let eps = node
        .layer
        .as_ref()
        .and_then(|l| l.batch_norm_param)
        .unwrap_or_default()
        .eps;
    let mean = node.blobs[0].clone();
    let var = node.blobs[1].clone();
    let count = *node.blobs[2].iter().next().with_context(|| {
        format!("batch norm {} count blob is empty", name)
    })?;
    ensure!(count != 0.0, "batch norm {} has a zero count blob", name);

    let scale_node = &cx.graph.nodes[scale_id];
    let scale_name = scale_node.name.clone();
    ensure!(!scale_node.blobs.is_empty(), "scale {} has no gamma blob", scale_name);
    let gamma = scale_node.blobs[0].clone();
    let beta = scale_node
        .blobs
        .get(1)
        .cloned()
        .unwrap_or_else(|| ArrayD::zeros(mean.raw_dim()));
    ensure!(
        gamma.shape() == mean.shape() && var.shape() == mean.shape() && beta.shape() == mean.shape(),
        "batch norm {} statistics and scale blobs disagree on shape",
        name
    );

    let mean = mean.mapv(|m| m / count);
    let var = var.mapv(|v| v / count);
    let scale_value = Zip::from(&var).and(&gamma).map_collect(|&v, &g| g / (v + eps).sqrt());
    let offset_value =
        Zip::from(&mean).and(&scale_value).and(&beta).map_collect(|&m, &s, &b| -m * s + b);

    let mut def = cx.common_def(id, OpType::FoldedBatchNorm)?;
    let tensor_names = [format!("{name}_scale:0"), format!("{name}_offset:0")];
    add_tensor(&mut cx.net, &tensor_names[0], &flatten(&scale_value));
    add_tensor(&mut cx.net, &tensor_names[1], &flatten(&offset_value));
    for tensor_name in &tensor_names {
        if cx.device == Device::Gpu {
            let image_name = cx.add_buffer_to_image(tensor_name, BufferType::Argument);
            def.inputs.push(image_name);
        } else {
            def.inputs.push(tensor_name.clone());
        }
    }

    let output_shape = cx.graph.parent_shape(id)?;
    cx.resolved.insert(name);
    cx.resolved.insert(scale_name);
    let top = cx.graph.nodes[scale_id].first_top().to_string();
    cx.graph.nodes[scale_id].output_shapes.insert(top, output_shape.clone());

    let final_id = cx.fuse_single_activation(scale_id, &mut def, &output_shape)?;
    cx.finish_op(def, final_id, output_shape);
    Ok(())
}

fn flatten(array: &ArrayD<f32>) -> ArrayD<f32> {
    array.iter().cloned().collect::<Array1<f32>>().into_dyn()
}

pub(crate) fn inner_product(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let name = node.name.clone();
    let param = node
        .layer
        .as_ref()
        .and_then(|l| l.inner_product_param)
        .unwrap_or_default();
    ensure!(
        param.axis == 1 && !param.transpose,
        "inner product {} with non-default axis or transpose is not supported",
        name
    );
    ensure!(!node.blobs.is_empty(), "inner product {} has no weight blob", name);
    let weight = node.blobs[0].clone();
    let bias = node.blobs.get(1).cloned();
    ensure!(
        weight.ndim() == 2 || weight.ndim() == 4,
        "inner product {} weight must be rank 2 or 4",
        name
    );
    if weight.ndim() == 4 {
        ensure!(
            weight.shape()[0] == 1 && weight.shape()[1] == 1,
            "inner product {} rank-4 weight must be [1, 1, *, *]",
            name
        );
    }

    let mut def = cx.common_def(id, OpType::FC)?;
    let input_shape = cx.graph.parent_shape(id)?;
    let cols = *weight.shape().last().unwrap_or(&0);
    ensure!(
        cols as i64 == input_shape[1] * input_shape[2] * input_shape[3],
        "inner product {} weight width {} does not match its flattened input",
        name,
        cols
    );
    let rows = weight.len() / cols;
    // caffe weights flatten the input as C,H,W; the texture path wants H,W,C
    let flat: Vec<f32> = weight.iter().cloned().collect();
    let weight_data: Array2<f32> = match cx.device {
        Device::Cpu => Array2::from_shape_vec((rows, cols), flat)?,
        Device::Gpu => {
            let (h, w, c) =
                (input_shape[1] as usize, input_shape[2] as usize, input_shape[3] as usize);
            let nchw = Array4::from_shape_vec((rows, c, h, w), flat)?;
            let nhwc = nchw.permuted_axes([0, 2, 3, 1]);
            Array2::from_shape_vec((rows, cols), nhwc.iter().cloned().collect())?
        }
    };

    let weight_tensor_name = format!("{name}_weight:0");
    add_tensor(&mut cx.net, &weight_tensor_name, &weight_data.clone().into_dyn());
    if cx.device == Device::Gpu {
        let (rows, cols) = (rows as i64, cols as i64);
        ensure!(
            (rows + 3) / 4 <= GPU_IMAGE_MAX_SIZE || (cols + 3) / 4 <= GPU_IMAGE_MAX_SIZE,
            "inner product {} weight [{} x {}] exceeds the texture size limit",
            name,
            rows,
            cols
        );
        let buffer_type = if input_shape[3] % 4 == 0 {
            BufferType::WeightWidth
        } else {
            def.int_arg("weight_type", BufferType::WeightHeight as i64);
            BufferType::WeightHeight
        };
        if buffer_type == BufferType::WeightHeight {
            ensure!(
                (rows + 3) / 4 <= GPU_IMAGE_MAX_SIZE,
                "inner product {} weight [{} x {}] exceeds the texture size limit",
                name,
                rows,
                cols
            );
        }
        let image_name = cx.add_buffer_to_image(&weight_tensor_name, buffer_type);
        def.inputs.push(image_name);
    } else {
        def.inputs.push(weight_tensor_name);
    }

    if let Some(bias) = bias {
        cnn::add_bias(cx, &name, &bias, &mut def);
    }

    cx.resolved.insert(name);
    let weight_dims = [rows as i64, cols as i64];
    let output_shape = fully_connected_shape(&input_shape, &weight_dims, cx.data_format());
    let top = cx.graph.nodes[id].first_top().to_string();
    cx.graph.nodes[id].output_shapes.insert(top, output_shape.clone());

    let final_id = cx.fuse_single_activation(id, &mut def, &output_shape)?;
    cx.finish_op(def, final_id, output_shape);
    Ok(())
}

/// Standalone activation, emitted when the producer could not absorb it.
pub(crate) fn activation(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let kind = cx.graph.nodes[id].kind;
    let act = ActivationKind::fusable_from_layer(kind)
        .with_context(|| format!("layer kind {:?} is not an activation", kind))?;
    let mut def = cx.common_def(id, OpType::Activation)?;
    def.str_arg("activation", act.ir_name());
    passthrough_finish(cx, id, def)
}

pub(crate) fn prelu(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let node = &cx.graph.nodes[id];
    let name = node.name.clone();
    ensure!(!node.blobs.is_empty(), "prelu {} has no slope blob", name);
    let alpha = node.blobs[0].clone();
    let mut def = cx.common_def(id, OpType::Activation)?;
    def.str_arg("activation", ActivationKind::Prelu.ir_name());
    let alpha_tensor_name = format!("{name}_alpha:0");
    add_tensor(&mut cx.net, &alpha_tensor_name, &flatten(&alpha));
    if cx.device == Device::Gpu {
        let image_name = cx.add_buffer_to_image(&alpha_tensor_name, BufferType::Argument);
        def.inputs.push(image_name);
    } else {
        def.inputs.push(alpha_tensor_name);
    }
    passthrough_finish(cx, id, def)
}

/// Shape-preserving one-to-one operator with no extra attributes.
pub(crate) fn passthrough(cx: &mut Lowering, id: usize, op_type: OpType) -> MobirResult<()> {
    let def = cx.common_def(id, op_type)?;
    passthrough_finish(cx, id, def)
}

pub(crate) fn passthrough_finish(
    cx: &mut Lowering,
    id: usize,
    def: OperatorDef,
) -> MobirResult<()> {
    let output_shape = cx.graph.bottom_shape(id, 0)?;
    let top = cx.graph.nodes[id].first_top().to_string();
    cx.graph.nodes[id].output_shapes.insert(top, output_shape.clone());
    let name = cx.graph.nodes[id].name.clone();
    cx.resolved.insert(name);
    cx.finish_op(def, id, output_shape);
    Ok(())
}
