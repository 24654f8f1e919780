//! N-ary arithmetic over same-shaped tensors.

use crate::internal::*;
use crate::lowering::{nn, Lowering};

pub(crate) fn add_n(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let def = cx.common_def(id, OpType::AddN)?;
    nn::passthrough_finish(cx, id, def)
}

pub(crate) fn eltwise(cx: &mut Lowering, id: usize) -> MobirResult<()> {
    let param = cx.graph.nodes[id]
        .layer
        .as_ref()
        .and_then(|l| l.eltwise_param.clone())
        .unwrap_or_default();
    let mut def = cx.common_def(id, OpType::Eltwise)?;
    def.int_arg("type", EltwiseMode::from(param.operation) as i64);
    if !param.coeff.is_empty() {
        def.floats_arg("coeff", &param.coeff);
    }
    nn::passthrough_finish(cx, id, def)
}
