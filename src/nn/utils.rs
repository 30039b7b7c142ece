use candle_core::{DType, IndexOp, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// Number of incoming messages per node, as a `(num_nodes,)` tensor of
/// `dtype`.
pub fn in_degree(edge_index: &Tensor, num_nodes: usize, dtype: DType) -> Result<Tensor> {
    let target = edge_index.i((1, ..))?;
    Tensor::zeros(num_nodes, dtype, edge_index.device())?.index_add(
        &target,
        &target.ones_like()?.to_dtype(dtype)?,
        0,
    )
}

/// Mean of the source rows over each node's incoming edges. Nodes without
/// incoming edges get a zero row.
pub fn mean_agg(xs: &Tensor, edge_index: &Tensor) -> Result<Tensor> {
    let num_nodes = xs.dim(0)?;
    let source = edge_index.i((0, ..))?;
    let target = edge_index.i((1, ..))?;
    let degree = in_degree(edge_index, num_nodes, xs.dtype())?
        .maximum(1f64)?
        .reshape((num_nodes, 1))?;
    xs.zeros_like()?
        .index_add(&target, &xs.i(&source)?, 0)?
        .broadcast_div(&degree)
}

//
// Linear layer with torch-equivalent initialisation
//
//   torch.nn.Linear is initialised by Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)).
//   see https://github.com/pytorch/pytorch/issues/57109
//
pub(crate) fn linear(in_dim: usize, out_dim: usize, vs: VarBuilder) -> Result<Linear> {
    let bound = 1.0 / (in_dim as f64).sqrt();
    let init_ws = Init::Uniform { lo: -bound, up: bound };
    let init_bs = Init::Uniform { lo: -bound, up: bound };
    let ws = vs.get_with_hints((out_dim, in_dim), "weight", init_ws)?;
    let bs = vs.get_with_hints(out_dim, "bias", init_bs)?;
    Ok(Linear::new(ws, Some(bs)))
}

pub(crate) fn linear_no_bias(in_dim: usize, out_dim: usize, vs: VarBuilder) -> Result<Linear> {
    let bound = 1.0 / (in_dim as f64).sqrt();
    let ws = vs.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    Ok(Linear::new(ws, None))
}
