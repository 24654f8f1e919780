//! Graph lowering: walks the topologically sorted operator graph and emits
//! one or more IR operator definitions per node, rewriting tensor layouts
//! for the target, fusing single-consumer activations into their producers
//! and rewriting eligible convolutions through the Winograd decomposition.

use crate::internal::*;
use derive_new::new;
use ndarray::ArrayD;
use std::collections::{HashMap, HashSet};

mod array;
mod cnn;
mod math;
mod nn;
mod vision;
mod winograd;

/// Prefix labeling the raw graph-input tensors, so execution code can locate
/// entry tensors independent of internal naming.
pub const INPUT_NODE_PREFIX: &str = "mobir_input_node";
/// Same for graph outputs.
pub const OUTPUT_NODE_PREFIX: &str = "mobir_output_node";

/// Hard ceiling on either dimension of a GPU texture allocation.
pub const GPU_IMAGE_MAX_SIZE: i64 = 16384;

#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    pub data_type: DataType,
    pub device: Device,
    /// Enables the Winograd rewrite of eligible convolutions.
    pub winograd: bool,
    /// Fail instead of warn when an operator is left unresolved at the end
    /// of conversion.
    pub strict: bool,
}

impl Default for ConvertOptions {
    fn default() -> ConvertOptions {
        ConvertOptions {
            data_type: DataType::Float,
            device: Device::Cpu,
            winograd: false,
            strict: false,
        }
    }
}

/// A declared graph input and its concrete shape, always given in NHWC
/// order regardless of target.
#[derive(Debug, Clone, new)]
pub struct InputSpec {
    pub name: String,
    pub shape: TVec<i64>,
}

/// Converts a parsed model and its weights into the target IR graph.
///
/// The returned graph is ready for a downstream memory-planning pass: every
/// tensor reference resolves to a prior producer in emission order.
pub fn convert(
    net: &NetRecord,
    weights: &WeightsRecord,
    inputs: &[InputSpec],
    output_names: &[String],
    options: ConvertOptions,
) -> MobirResult<NetDef> {
    let BuiltGraph { graph, inputs_map } = build_graph(net, weights)?;
    let order = toposort(&graph)?;
    let lowering = Lowering {
        graph,
        inputs_map,
        net: NetDef::default(),
        dt: options.data_type,
        device: options.device,
        winograd: options.winograd,
        resolved: HashSet::new(),
    };
    lowering.run(inputs, output_names, &order, options.strict)
}

pub(crate) struct Lowering {
    pub graph: OpGraph,
    pub inputs_map: HashMap<String, Vec<String>>,
    pub net: NetDef,
    pub dt: DataType,
    pub device: Device,
    pub winograd: bool,
    pub resolved: HashSet<String>,
}

impl Lowering {
    pub fn data_format(&self) -> DataFormat {
        match self.device {
            Device::Cpu => DataFormat::NCHW,
            Device::Gpu => DataFormat::NHWC,
        }
    }

    fn run(
        mut self,
        inputs: &[InputSpec],
        output_names: &[String],
        order: &[usize],
        strict: bool,
    ) -> MobirResult<NetDef> {
        self.seed_input_shapes(inputs)?;
        match self.device {
            Device::Gpu => self.add_gpu_input_transforms(inputs)?,
            Device::Cpu => self.add_cpu_input_transforms(inputs)?,
        }
        for &id in order {
            if self.resolved.contains(&self.graph.nodes[id].name) {
                continue;
            }
            let (name, kind) = (self.graph.nodes[id].name.clone(), self.graph.nodes[id].kind);
            self.lower_node(id)
                .with_context(|| format!("lowering operator {} ({:?})", name, kind))?;
        }
        match self.device {
            Device::Gpu => self.add_gpu_output_transforms(output_names)?,
            Device::Cpu => self.add_cpu_output_transforms(output_names)?,
        }
        for &id in order {
            let node = &self.graph.nodes[id];
            if !self.resolved.contains(&node.name) {
                if strict {
                    bail!("operator {} ({:?}) was never resolved", node.name, node.kind);
                }
                warn!("unresolved operator {} ({:?})", node.name, node.kind);
            }
        }
        Ok(self.net)
    }

    fn lower_node(&mut self, id: usize) -> MobirResult<()> {
        let kind = self.graph.nodes[id].kind;
        debug!("lowering {} as {:?}", self.graph.nodes[id].name, kind);
        match kind {
            LayerKind::Input => {
                let name = self.graph.nodes[id].name.clone();
                self.resolved.insert(name);
                Ok(())
            }
            LayerKind::Convolution => {
                if self.device == Device::Gpu && winograd::eligible(self, id)? {
                    winograd::conv_gpu(self, id)
                } else {
                    cnn::conv2d(self, id)
                }
            }
            LayerKind::BatchNorm => nn::batch_norm(self, id),
            LayerKind::Scale => bail!(
                "standalone Scale {} is unsupported, it must directly follow a BatchNorm",
                self.graph.nodes[id].name
            ),
            LayerKind::InnerProduct => nn::inner_product(self, id),
            LayerKind::Pooling => cnn::pooling(self, id),
            LayerKind::ReLU | LayerKind::Sigmoid | LayerKind::TanH => nn::activation(self, id),
            LayerKind::PReLU => nn::prelu(self, id),
            LayerKind::Add => math::add_n(self, id),
            LayerKind::Concat => array::concat(self, id),
            LayerKind::Eltwise => math::eltwise(self, id),
            LayerKind::Slice => array::slice(self, id),
            LayerKind::Reshape => array::reshape(self, id),
            LayerKind::Proposal => vision::proposal(self, id),
            LayerKind::PSROIAlign => vision::psroi_align(self, id),
            LayerKind::Softmax => nn::passthrough(self, id, OpType::Softmax),
            LayerKind::Dropout => {
                bail!("dropout {} survived graph construction", self.graph.nodes[id].name)
            }
        }
    }

    /// Common preamble of every per-kind conversion routine: dtype and
    /// layout attributes for the active target, inputs wired to the
    /// producing nodes' output tensors.
    pub fn common_def(&self, id: usize, op_type: OpType) -> MobirResult<OperatorDef> {
        let node = &self.graph.nodes[id];
        let mut def = OperatorDef::new(&node.name, op_type);
        def.int_arg("T", self.dt as i64);
        def.str_arg(
            "data_format",
            match self.device {
                Device::Cpu => "NCHW",
                Device::Gpu => "NHWC",
            },
        );
        let inputs = self
            .inputs_map
            .get(&node.name)
            .with_context(|| format!("no recorded inputs for operator {}", node.name))?;
        def.inputs = inputs.iter().map(|n| format!("{n}:0")).collect();
        Ok(def)
    }

    /// Repeated stride/kernel/pad fields resolved to per-axis pairs; pad
    /// values are doubled into totals. When a definition is given, emits the
    /// `strides` and `padding_values` arguments on it. Returns
    /// (paddings, strides, kernels).
    pub fn stride_pad_kernel(
        &self,
        kp: &KernelParam,
        def: Option<&mut OperatorDef>,
        pooling: bool,
    ) -> MobirResult<(TVec<i64>, TVec<i64>, TVec<i64>)> {
        ensure!(
            kp.stride.len() <= 1 && kp.kernel_size.len() <= 1 && kp.pad.len() <= 1,
            "multiple stride/kernel_size/pad values are not supported"
        );
        let mut stride = kp.stride.first().map(|&s| tvec![s, s]).unwrap_or_else(|| tvec![1, 1]);
        let mut pad = kp.pad.first().map(|&p| tvec![p * 2, p * 2]).unwrap_or_else(|| tvec![0, 0]);
        let mut kernel =
            kp.kernel_size.first().map(|&k| tvec![k, k]).unwrap_or_else(|| tvec![0, 0]);
        if kp.stride_h.is_some() || kp.stride_w.is_some() {
            stride = tvec![kp.stride_h.unwrap_or_default(), kp.stride_w.unwrap_or_default()];
        }
        if kp.pad_h.is_some() || kp.pad_w.is_some() {
            pad = tvec![kp.pad_h.unwrap_or_default() * 2, kp.pad_w.unwrap_or_default() * 2];
        }
        if let Some(def) = def {
            def.ints_arg("strides", &stride);
            def.ints_arg("padding_values", &pad);
            if pooling && (kp.kernel_h.is_some() || kp.kernel_w.is_some()) {
                kernel = tvec![kp.kernel_h.unwrap_or_default(), kp.kernel_w.unwrap_or_default()];
            }
        }
        Ok((pad, stride, kernel))
    }

    /// Wraps a materialized tensor in an explicit buffer-to-texture
    /// conversion and returns the texture-side tensor name. Derived names
    /// keep the `:0` suffix so downstream references stay uniform.
    pub fn add_buffer_to_image(&mut self, input_name: &str, buffer_type: BufferType) -> String {
        let base = input_name.strip_suffix(":0").unwrap_or(input_name);
        let output_name = format!("{base}_b2i:0");
        let mut def = OperatorDef::new(format!("{base}_b2i"), OpType::BufferToImage);
        def.inputs.push(input_name.to_string());
        def.outputs.push(output_name.clone());
        def.int_arg("buffer_type", buffer_type as i64);
        def.int_arg("mode", 0);
        def.int_arg("T", self.dt as i64);
        self.net.add_op(def);
        output_name
    }

    /// Folds a sole-consumer activation into `def`: the activation becomes
    /// an attribute, its node takes over output naming and is marked
    /// resolved. Returns the node whose name labels the IR output.
    pub fn fuse_single_activation(
        &mut self,
        id: usize,
        def: &mut OperatorDef,
        output_shape: &Shape,
    ) -> MobirResult<usize> {
        let node = &self.graph.nodes[id];
        if node.children.len() == 1 {
            let child = node.children[0];
            if let Some(act) = ActivationKind::fusable_from_layer(self.graph.nodes[child].kind) {
                debug!(
                    "fusing activation {} into {}",
                    self.graph.nodes[child].name, self.graph.nodes[id].name
                );
                def.str_arg("activation", act.ir_name());
                let top = self.graph.nodes[child].first_top().to_string();
                let child_node = &mut self.graph.nodes[child];
                child_node.output_shapes.insert(top, output_shape.clone());
                let child_name = child_node.name.clone();
                self.resolved.insert(child_name);
                return Ok(child);
            }
        }
        Ok(id)
    }

    /// Labels the definition's output with `final_id`'s name, records the
    /// output shape and appends it to the IR graph.
    pub fn finish_op(&mut self, mut def: OperatorDef, final_id: usize, output_shape: Shape) {
        def.outputs.push(format!("{}:0", self.graph.nodes[final_id].name));
        def.add_output_shape(output_shape);
        self.net.add_op(def);
    }

    fn seed_input_shapes(&mut self, inputs: &[InputSpec]) -> MobirResult<()> {
        for spec in inputs {
            ensure!(spec.shape.len() == 4, "input {} needs a rank-4 NHWC shape", spec.name);
            let id = self
                .graph
                .node_by_name(&spec.name)
                .with_context(|| format!("declared input {} is not in the graph", spec.name))?;
            ensure!(
                self.graph.nodes[id].kind == LayerKind::Input,
                "declared input {} is not an Input node",
                spec.name
            );
            let s = &spec.shape;
            let shape: Shape = match self.device {
                Device::Cpu => tvec![s[0], s[3], s[1], s[2]],
                Device::Gpu => s.clone(),
            };
            let top = self.graph.nodes[id].first_top().to_string();
            self.graph.nodes[id].output_shapes.insert(top, shape);
        }
        Ok(())
    }

    fn boundary_shape(&self, name: &str) -> MobirResult<Shape> {
        let id = self
            .graph
            .node_by_name(name)
            .with_context(|| format!("boundary node {} is not in the graph", name))?;
        let node = &self.graph.nodes[id];
        node.output_shapes
            .get(node.first_top())
            .cloned()
            .with_context(|| format!("no inferred shape for boundary node {}", name))
    }

    fn add_cpu_input_transforms(&mut self, inputs: &[InputSpec]) -> MobirResult<()> {
        for spec in inputs {
            let mut def = OperatorDef::new(&spec.name, OpType::Transpose);
            def.inputs.push(format!("{INPUT_NODE_PREFIX}_{}:0", spec.name));
            def.outputs.push(format!("{}:0", spec.name));
            def.ints_arg("dims", &[0, 3, 1, 2]);
            def.int_arg("T", self.dt as i64);
            def.add_output_shape(self.boundary_shape(&spec.name)?);
            self.net.add_op(def);
        }
        Ok(())
    }

    fn add_gpu_input_transforms(&mut self, inputs: &[InputSpec]) -> MobirResult<()> {
        for spec in inputs {
            let mut def = OperatorDef::new(&spec.name, OpType::BufferToImage);
            def.inputs.push(format!("{INPUT_NODE_PREFIX}_{}:0", spec.name));
            def.outputs.push(format!("{}:0", spec.name));
            def.int_arg("buffer_type", BufferType::InOutChannel as i64);
            def.int_arg("T", self.dt as i64);
            def.add_output_shape(self.boundary_shape(&spec.name)?);
            self.net.add_op(def);
        }
        Ok(())
    }

    fn add_cpu_output_transforms(&mut self, output_names: &[String]) -> MobirResult<()> {
        for name in output_names {
            let shape = self.boundary_shape(name)?;
            let mut def =
                OperatorDef::new(format!("{OUTPUT_NODE_PREFIX}_{name}"), OpType::Transpose);
            def.inputs.push(format!("{name}:0"));
            def.outputs.push(format!("{OUTPUT_NODE_PREFIX}_{name}:0"));
            def.ints_arg("dims", &[0, 2, 3, 1]);
            def.add_output_shape(tvec![shape[0], shape[2], shape[3], shape[1]]);
            self.net.add_op(def);
        }
        Ok(())
    }

    fn add_gpu_output_transforms(&mut self, output_names: &[String]) -> MobirResult<()> {
        for name in output_names {
            let mut def =
                OperatorDef::new(format!("{OUTPUT_NODE_PREFIX}_{name}"), OpType::ImageToBuffer);
            def.inputs.push(format!("{name}:0"));
            def.outputs.push(format!("{OUTPUT_NODE_PREFIX}_{name}:0"));
            def.int_arg("buffer_type", BufferType::InOutChannel as i64);
            self.net.add_op(def);
        }
        Ok(())
    }
}

/// Rewrites tensor references matching a declared input or output name to
/// the prefixed boundary naming scheme. Already-prefixed names no longer
/// match, so the pass is idempotent.
pub fn rename_boundary_tensors(net: &mut NetDef, input_names: &[String], output_names: &[String]) {
    let in_names: HashSet<String> = input_names.iter().map(|n| format!("{n}:0")).collect();
    let out_names: HashSet<String> = output_names.iter().map(|n| format!("{n}:0")).collect();
    let rename = |name: &mut String| {
        if in_names.contains(name.as_str()) {
            *name = format!("{INPUT_NODE_PREFIX}_{name}");
        } else if out_names.contains(name.as_str()) {
            *name = format!("{OUTPUT_NODE_PREFIX}_{name}");
        }
    };
    for op in &mut net.ops {
        op.inputs.iter_mut().for_each(rename);
        op.outputs.iter_mut().for_each(rename);
    }
}

/// Materializes a weight tensor into the IR graph, always as f32.
pub(crate) fn add_tensor(net: &mut NetDef, name: impl Into<String>, value: &ArrayD<f32>) {
    net.add_tensor(TensorDef::from_array(name, value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_renaming_is_idempotent() {
        let mut net = NetDef::default();
        let mut def = OperatorDef::new("prob", OpType::Softmax);
        def.inputs.push("data:0".to_string());
        def.outputs.push("prob:0".to_string());
        net.add_op(def);

        let inputs = vec!["data".to_string()];
        let outputs = vec!["prob".to_string()];
        rename_boundary_tensors(&mut net, &inputs, &outputs);
        let once = net.clone();
        rename_boundary_tensors(&mut net, &inputs, &outputs);
        assert_eq!(net, once);
        assert_eq!(once.ops[0].inputs[0], format!("{INPUT_NODE_PREFIX}_data:0"));
        assert_eq!(once.ops[0].outputs[0], format!("{OUTPUT_NODE_PREFIX}_prob:0"));
    }

    #[test]
    fn buffer_to_image_derives_suffixed_names() {
        let mut lowering = Lowering {
            graph: OpGraph::default(),
            inputs_map: HashMap::new(),
            net: NetDef::default(),
            dt: DataType::Float,
            device: Device::Gpu,
            winograd: false,
            resolved: HashSet::new(),
        };
        let out = lowering.add_buffer_to_image("conv1_weight:0", BufferType::ConvFilter);
        assert_eq!(out, "conv1_weight_b2i:0");
        let op = lowering.net.op("conv1_weight_b2i").unwrap();
        assert_eq!(op.op_type, OpType::BufferToImage);
        assert_eq!(op.arg("buffer_type"), Some(&ArgValue::Int(BufferType::ConvFilter as i64)));
    }
}
