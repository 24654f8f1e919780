//! Detection-model operators. CPU only: neither has a texture kernel.

use crate::internal::*;
use crate::lowering::{nn, Lowering};

pub(crate) fn proposal(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    ensure!(
        cx.device == Device::Cpu,
        "proposal {} is only supported on cpu",
        cx.graph.nodes[id].name
    );
    let param = cx.graph.nodes[id].layer.as_ref().and_then(|l| l.proposal_param.clone());
    let mut def = cx.common_def(id, OpType::Proposal)?;
    if let Some(param) = param {
        def.int_arg("feat_stride", param.feat_stride);
        def.ints_arg("scales", &param.scales);
        def.floats_arg("ratios", &param.ratios);
    }
    nn::passthrough_finish(cx, id, def)
}

pub(crate) fn psroi_align(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    ensure!(
        cx.device == Device::Cpu,
        "psroi align {} is only supported on cpu",
        cx.graph.nodes[id].name
    );
    let param = cx.graph.nodes[id].layer.as_ref().and_then(|l| l.psroi_align_param.clone());
    let mut def = cx.common_def(id, OpType::PSROIAlign)?;
    if let Some(param) = param {
        def.float_arg("spatial_scale", param.spatial_scale);
        def.int_arg("output_dim", param.output_dim);
        def.int_arg("group_size", param.group_size);
    }
    nn::passthrough_finish(cx, id, def)
}
