//! # Mobir
//!
//! Offline graph compiler turning a parsed Caffe-style model (layer records
//! plus raw weight blobs) into a static IR graph consumable by a mobile
//! inference runtime, specialized for one execution target (`cpu` or
//! texture-backed `gpu`).
//!
//! The pipeline is build → sort → lower → emit: the [model] module builds a
//! DAG of operators from flat layer records and orders it topologically, the
//! [lowering] module walks the ordered nodes and emits IR operator
//! definitions, rewriting tensor layouts for the target, fusing adjacent
//! operators and optionally replacing small-kernel convolutions with their
//! Winograd decomposition.
//!
//! ```
//! use mobir::prelude::*;
//!
//! let mut conv = LayerRecord::new("conv1", LayerKind::Convolution)
//!     .bottom("data")
//!     .top("conv1");
//! let mut kernel = KernelParam::default();
//! kernel.kernel_size = vec![3];
//! kernel.pad = vec![1];
//! conv.convolution_param = Some(ConvolutionParam { kernel, ..Default::default() });
//!
//! let net = NetRecord {
//!     name: "demo".to_string(),
//!     inputs: vec!["data".to_string()],
//!     layers: vec![conv],
//! };
//! let weights = WeightsRecord {
//!     layers: vec![WeightsLayer::new(
//!         "conv1".to_string(),
//!         vec![BlobRecord { num: 4, channels: 3, height: 3, width: 3, data: vec![0.; 108], ..Default::default() }],
//!     )],
//! };
//!
//! let ir = convert(
//!     &net,
//!     &weights,
//!     &[InputSpec::new("data".to_string(), tvec![1, 8, 8, 3])],
//!     &["conv1".to_string()],
//!     ConvertOptions::default(),
//! ).unwrap();
//!
//! // boundary transpose in, the convolution itself, boundary transpose out
//! assert_eq!(ir.ops.len(), 3);
//! ```

pub mod caffe;
pub mod lowering;
pub mod mir;
pub mod model;
pub mod shape;

pub use anyhow;

pub type MobirError = anyhow::Error;
pub type MobirResult<T> = anyhow::Result<T>;

/// A SmallVec instantiation with 4 embeddable values.
///
/// Used for shapes (always rank 4 here) and small parameter lists.
pub type TVec<T> = smallvec::SmallVec<[T; 4]>;

#[macro_export]
macro_rules! tvec {
    ($elem:expr; $n:expr) => ($crate::TVec::from_elem($elem, $n));
    ($($x:expr),*$(,)*) => ($crate::TVec::from_vec(vec![$($x,)*]));
}

pub mod prelude {
    pub use crate::caffe::{
        BlobRecord, ConvolutionParam, KernelParam, LayerKind, LayerRecord, NetRecord,
        WeightsLayer, WeightsRecord,
    };
    pub use crate::lowering::{convert, ConvertOptions, InputSpec};
    pub use crate::mir::{DataType, Device, NetDef, OpType};
    pub use crate::tvec;
    pub use crate::{MobirError, MobirResult, TVec};
}

pub(crate) mod internal {
    pub use crate::caffe::*;
    pub use crate::mir::*;
    pub use crate::model::*;
    pub use crate::shape::*;
    pub use crate::{tvec, MobirResult, TVec};
    pub use anyhow::{bail, ensure, Context};
    #[allow(unused_imports)]
    pub use log::{debug, trace, warn};
}
