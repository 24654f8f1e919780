//! The target IR: a flat, append-only graph of operator definitions and
//! materialized tensors, plus the typed code enumerations shared with the
//! runtime.

use crate::caffe::{EltwiseOp, LayerKind};
use crate::TVec;
use ndarray::{ArrayBase, Data, Dimension};
use std::fmt;

/// Runtime compute datatype, recorded as the `T` argument on every emitted
/// operator. Tensor payloads remain f32 regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float = 1,
    Half = 2,
}

/// Execution target the graph is specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

/// The closed set of IR operator types the converter emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    BufferToImage,
    ImageToBuffer,
    Transpose,
    Conv2D,
    DepthwiseConv2d,
    FusedConv2D,
    FoldedBatchNorm,
    FC,
    Pooling,
    Activation,
    AddN,
    Concat,
    Eltwise,
    Slice,
    Reshape,
    ReOrganize,
    WinogradTransform,
    MatMul,
    WinogradInverseTransform,
    Proposal,
    PSROIAlign,
    Softmax,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::BufferToImage => "BufferToImage",
            OpType::ImageToBuffer => "ImageToBuffer",
            OpType::Transpose => "Transpose",
            OpType::Conv2D => "Conv2D",
            OpType::DepthwiseConv2d => "DepthwiseConv2d",
            OpType::FusedConv2D => "FusedConv2D",
            OpType::FoldedBatchNorm => "FoldedBatchNorm",
            OpType::FC => "FC",
            OpType::Pooling => "Pooling",
            OpType::Activation => "Activation",
            OpType::AddN => "AddN",
            OpType::Concat => "Concat",
            OpType::Eltwise => "Eltwise",
            OpType::Slice => "Slice",
            OpType::Reshape => "Reshape",
            OpType::ReOrganize => "ReOrganize",
            OpType::WinogradTransform => "WinogradTransform",
            OpType::MatMul => "MatMul",
            OpType::WinogradInverseTransform => "WinogradInverseTransform",
            OpType::Proposal => "Proposal",
            OpType::PSROIAlign => "PSROIAlign",
            OpType::Softmax => "Softmax",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage classes of the GPU buffer-to-texture repacking operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    ConvFilter = 0,
    InOutChannel = 1,
    Argument = 2,
    InOutHeight = 3,
    InOutWidth = 4,
    WinogradFilter = 5,
    DwConvFilter = 6,
    WeightHeight = 7,
    WeightWidth = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingMode {
    Avg = 1,
    Max = 2,
}

/// Runtime codes for the elementwise reduction selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseMode {
    Sum = 0,
    Prod = 2,
    Max = 5,
}

impl From<EltwiseOp> for EltwiseMode {
    fn from(op: EltwiseOp) -> EltwiseMode {
        match op {
            EltwiseOp::Prod => EltwiseMode::Prod,
            EltwiseOp::Sum => EltwiseMode::Sum,
            EltwiseOp::Max => EltwiseMode::Max,
        }
    }
}

/// Activations the runtime can evaluate fused into a producing operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    Prelu,
}

impl ActivationKind {
    pub fn ir_name(&self) -> &'static str {
        match self {
            ActivationKind::Relu => "RELU",
            ActivationKind::Sigmoid => "SIGMOID",
            ActivationKind::Tanh => "TANH",
            ActivationKind::Prelu => "PRELU",
        }
    }

    /// The fusable subset: PReLU carries a slope tensor and is never folded
    /// into a producer.
    pub fn fusable_from_layer(kind: LayerKind) -> Option<ActivationKind> {
        match kind {
            LayerKind::ReLU => Some(ActivationKind::Relu),
            LayerKind::Sigmoid => Some(ActivationKind::Sigmoid),
            LayerKind::TanH => Some(ActivationKind::Tanh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Int(i64),
    Float(f32),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
}

/// One emitted operator: type tag, ordered tensor references and named
/// attributes, plus the inferred shape of each output.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorDef {
    pub name: String,
    pub op_type: OpType,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub args: Vec<Argument>,
    pub output_shapes: Vec<TVec<i64>>,
}

impl OperatorDef {
    pub fn new(name: impl Into<String>, op_type: OpType) -> OperatorDef {
        OperatorDef {
            name: name.into(),
            op_type,
            inputs: vec![],
            outputs: vec![],
            args: vec![],
            output_shapes: vec![],
        }
    }

    fn push_arg(&mut self, name: &str, value: ArgValue) {
        self.args.push(Argument { name: name.to_string(), value });
    }

    pub fn int_arg(&mut self, name: &str, v: i64) {
        self.push_arg(name, ArgValue::Int(v));
    }

    pub fn float_arg(&mut self, name: &str, v: f32) {
        self.push_arg(name, ArgValue::Float(v));
    }

    pub fn str_arg(&mut self, name: &str, v: impl Into<String>) {
        self.push_arg(name, ArgValue::Str(v.into()));
    }

    pub fn ints_arg(&mut self, name: &str, v: &[i64]) {
        self.push_arg(name, ArgValue::Ints(v.to_vec()));
    }

    pub fn floats_arg(&mut self, name: &str, v: &[f32]) {
        self.push_arg(name, ArgValue::Floats(v.to_vec()));
    }

    pub fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    pub fn add_output_shape(&mut self, shape: TVec<i64>) {
        self.output_shapes.push(shape);
    }
}

/// A materialized weight tensor. Immutable once added to the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDef {
    pub name: String,
    pub dims: Vec<i64>,
    pub data_type: DataType,
    pub data: Vec<f32>,
}

impl TensorDef {
    pub fn from_array<S, D>(name: impl Into<String>, array: &ArrayBase<S, D>) -> TensorDef
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        TensorDef {
            name: name.into(),
            dims: array.shape().iter().map(|&d| d as i64).collect(),
            data_type: DataType::Float,
            data: array.iter().cloned().collect(),
        }
    }
}

/// The output IR graph. Operators and tensors are appended in emission order
/// and never mutated or removed afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetDef {
    pub ops: Vec<OperatorDef>,
    pub tensors: Vec<TensorDef>,
}

impl NetDef {
    pub fn add_op(&mut self, op: OperatorDef) {
        self.ops.push(op);
    }

    pub fn add_tensor(&mut self, tensor: TensorDef) {
        self.tensors.push(tensor);
    }

    pub fn op(&self, name: &str) -> Option<&OperatorDef> {
        self.ops.iter().find(|o| o.name == name)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorDef> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_lookup_finds_last_pushed_by_name() {
        let mut def = OperatorDef::new("op", OpType::Conv2D);
        def.int_arg("T", 1);
        def.ints_arg("strides", &[2, 2]);
        assert_eq!(def.arg("strides"), Some(&ArgValue::Ints(vec![2, 2])));
        assert_eq!(def.arg("padding_values"), None);
    }

    #[test]
    fn eltwise_codes_match_runtime() {
        assert_eq!(EltwiseMode::from(EltwiseOp::Prod) as i64, 2);
        assert_eq!(EltwiseMode::from(EltwiseOp::Sum) as i64, 0);
        assert_eq!(EltwiseMode::from(EltwiseOp::Max) as i64, 5);
    }
}
