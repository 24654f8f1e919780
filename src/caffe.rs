//! In-memory records for a parsed Caffe-style source model.
//!
//! Deserializing the prototxt/binary encodings is an external concern; this
//! module is the contract the deserializer fills in. Only the parameters the
//! converter consumes are modeled.

use crate::internal::*;
use derive_new::new;
use ndarray::{ArrayD, IxDyn};

/// The closed set of source layer kinds the converter understands.
///
/// `Scale` only occurs as `BatchNorm`'s folding partner, `Dropout` only to be
/// filtered out of the inference graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Input,
    Convolution,
    BatchNorm,
    Scale,
    InnerProduct,
    Pooling,
    ReLU,
    Sigmoid,
    TanH,
    PReLU,
    Add,
    Concat,
    Eltwise,
    Slice,
    Reshape,
    Proposal,
    PSROIAlign,
    Softmax,
    Dropout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Test,
}

/// Spatial kernel geometry shared by convolution and pooling parameters:
/// the repeated single-value form plus the explicit `_h`/`_w` overrides.
#[derive(Debug, Clone, Default)]
pub struct KernelParam {
    pub stride: Vec<i64>,
    pub pad: Vec<i64>,
    pub kernel_size: Vec<i64>,
    pub stride_h: Option<i64>,
    pub stride_w: Option<i64>,
    pub pad_h: Option<i64>,
    pub pad_w: Option<i64>,
    pub kernel_h: Option<i64>,
    pub kernel_w: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ConvolutionParam {
    pub kernel: KernelParam,
    pub dilation: Vec<i64>,
    pub group: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMethod {
    Max,
    Ave,
}

#[derive(Debug, Clone)]
pub struct PoolingParam {
    pub kernel: KernelParam,
    pub pool: PoolMethod,
    pub global_pooling: bool,
}

impl Default for PoolingParam {
    fn default() -> PoolingParam {
        PoolingParam { kernel: KernelParam::default(), pool: PoolMethod::Max, global_pooling: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchNormParam {
    pub eps: f32,
}

impl Default for BatchNormParam {
    fn default() -> BatchNormParam {
        BatchNormParam { eps: 1e-5 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InnerProductParam {
    pub axis: i64,
    pub transpose: bool,
}

impl Default for InnerProductParam {
    fn default() -> InnerProductParam {
        InnerProductParam { axis: 1, transpose: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseOp {
    Prod,
    Sum,
    Max,
}

#[derive(Debug, Clone)]
pub struct EltwiseParam {
    pub operation: EltwiseOp,
    pub coeff: Vec<f32>,
}

impl Default for EltwiseParam {
    fn default() -> EltwiseParam {
        EltwiseParam { operation: EltwiseOp::Sum, coeff: vec![] }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SliceParam {
    pub axis: Option<i64>,
    pub slice_point: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ConcatParam {
    pub axis: Option<i64>,
    pub concat_dim: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ReshapeParam {
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ProposalParam {
    pub feat_stride: i64,
    pub scales: Vec<i64>,
    pub ratios: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct PsRoiAlignParam {
    pub spatial_scale: f32,
    pub output_dim: i64,
    pub group_size: i64,
}

/// One computation step of the source model, with its declared input
/// ("bottom") and output ("top") blob names and type-specific parameters.
#[derive(Debug, Clone)]
pub struct LayerRecord {
    pub name: String,
    pub kind: LayerKind,
    pub bottoms: Vec<String>,
    pub tops: Vec<String>,
    pub include: Option<Phase>,
    pub exclude: Option<Phase>,
    pub convolution_param: Option<ConvolutionParam>,
    pub pooling_param: Option<PoolingParam>,
    pub batch_norm_param: Option<BatchNormParam>,
    pub inner_product_param: Option<InnerProductParam>,
    pub eltwise_param: Option<EltwiseParam>,
    pub slice_param: Option<SliceParam>,
    pub concat_param: Option<ConcatParam>,
    pub reshape_param: Option<ReshapeParam>,
    pub proposal_param: Option<ProposalParam>,
    pub psroi_align_param: Option<PsRoiAlignParam>,
}

impl LayerRecord {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> LayerRecord {
        LayerRecord {
            name: name.into(),
            kind,
            bottoms: vec![],
            tops: vec![],
            include: None,
            exclude: None,
            convolution_param: None,
            pooling_param: None,
            batch_norm_param: None,
            inner_product_param: None,
            eltwise_param: None,
            slice_param: None,
            concat_param: None,
            reshape_param: None,
            proposal_param: None,
            psroi_align_param: None,
        }
    }

    pub fn bottom(mut self, name: impl Into<String>) -> LayerRecord {
        self.bottoms.push(name.into());
        self
    }

    pub fn top(mut self, name: impl Into<String>) -> LayerRecord {
        self.tops.push(name.into());
        self
    }

    /// Effective phase of the layer. An `exclude` tag wins over an `include`
    /// tag, absence of both means inference.
    pub fn phase(&self) -> Phase {
        self.exclude.or(self.include).unwrap_or(Phase::Test)
    }
}

/// The parsed layer graph: declared graph inputs plus layer records in file
/// order.
#[derive(Debug, Clone, Default)]
pub struct NetRecord {
    pub name: String,
    pub inputs: Vec<String>,
    pub layers: Vec<LayerRecord>,
}

/// A raw weight tensor. Legacy blobs carry explicit
/// `num`/`channels`/`height`/`width` fields (all-zero when unused), newer
/// ones a generic `shape` vector.
#[derive(Debug, Clone, Default)]
pub struct BlobRecord {
    pub num: i64,
    pub channels: i64,
    pub height: i64,
    pub width: i64,
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

impl BlobRecord {
    pub fn from_shape(shape: Vec<i64>, data: Vec<f32>) -> BlobRecord {
        BlobRecord { shape, data, ..BlobRecord::default() }
    }

    /// Materializes the blob as a dense array, reconstructing the shape from
    /// the legacy fields when `num` is set.
    pub fn to_array(&self) -> MobirResult<ArrayD<f32>> {
        let dims: Vec<usize> = if self.num != 0 {
            vec![self.num as usize, self.channels as usize, self.height as usize, self.width as usize]
        } else {
            self.shape.iter().map(|&d| d as usize).collect()
        };
        let len: usize = dims.iter().product();
        ensure!(
            len == self.data.len(),
            "blob shape {:?} does not match its {} data values",
            dims,
            self.data.len()
        );
        Ok(ArrayD::from_shape_vec(IxDyn(&dims), self.data.clone())?)
    }
}

/// Weight blobs of one layer, keyed by the layer name.
#[derive(Debug, Clone, new)]
pub struct WeightsLayer {
    pub name: String,
    pub blobs: Vec<BlobRecord>,
}

/// The parsed weights structure, parallel to [NetRecord].
#[derive(Debug, Clone, Default)]
pub struct WeightsRecord {
    pub layers: Vec<WeightsLayer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_blob_shape_wins_over_generic() {
        let blob = BlobRecord {
            num: 2,
            channels: 3,
            height: 1,
            width: 1,
            shape: vec![6],
            data: vec![0.; 6],
        };
        assert_eq!(blob.to_array().unwrap().shape(), &[2, 3, 1, 1]);
    }

    #[test]
    fn generic_blob_shape() {
        let blob = BlobRecord::from_shape(vec![4, 2], vec![0.; 8]);
        assert_eq!(blob.to_array().unwrap().shape(), &[4, 2]);
    }

    #[test]
    fn blob_data_length_mismatch_fails() {
        let blob = BlobRecord::from_shape(vec![4, 2], vec![0.; 7]);
        assert!(blob.to_array().is_err());
    }

    #[test]
    fn exclude_tag_overrides_include() {
        let mut layer = LayerRecord::new("l", LayerKind::ReLU);
        layer.include = Some(Phase::Test);
        layer.exclude = Some(Phase::Train);
        assert_eq!(layer.phase(), Phase::Train);
    }
}
