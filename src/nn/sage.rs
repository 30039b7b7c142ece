use std::path::Path;

use candle_core::{bail, DType, Device, Result, Tensor, Var};
use candle_nn::{Activation, Dropout, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::{
    traits::GnnModule,
    utils::{linear, linear_no_bias, mean_agg},
};

/// https://arxiv.org/abs/1706.02216 with mean aggregation:
///   h_i' = W_neigh · mean_{j -> i} h_j + W_root · h_i + b
pub struct SageConv {
    lin_neigh: Linear,
    lin_root: Linear,
}
impl SageConv {
    pub fn new(in_dim: usize, out_dim: usize, vs: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin_neigh: linear(in_dim, out_dim, vs.pp("lin_l"))?,
            lin_root: linear_no_bias(in_dim, out_dim, vs.pp("lin_r"))?,
        })
    }
}
impl GnnModule for SageConv {
    fn forward_t(&self, xs: &Tensor, edge_index: &Tensor, _train: bool) -> Result<Tensor> {
        let neigh = self.lin_neigh.forward(&mean_agg(xs, edge_index)?)?;
        neigh + self.lin_root.forward(xs)?
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SageParams {
    pub hidden_dim: usize,
    pub num_layers: usize,
    /// Applied after every convolution, in training mode only.
    pub dropout_rate: f32,
    /// Adds the first layer's output to the last layer's.
    pub residual: bool,
    /// `Some(h)` puts a hidden layer of width `h` in the classification head.
    pub head_hidden: Option<usize>,
    pub head_dropout: f32,
}
impl Default for SageParams {
    fn default() -> Self {
        Self {
            hidden_dim: 64,
            num_layers: 2,
            dropout_rate: 0.5,
            residual: false,
            head_hidden: None,
            head_dropout: 0.2,
        }
    }
}

enum Head {
    Linear(Linear),
    Mlp {
        fc1: Linear,
        dropout: Dropout,
        fc2: Linear,
    },
}
impl Head {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Linear(lin) => lin.forward(xs),
            Self::Mlp { fc1, dropout, fc2 } => {
                let h = fc1.forward(xs)?.relu()?;
                fc2.forward(&dropout.forward(&h, train)?)
            }
        }
    }
}

/// Stacked SAGE convolutions followed by a classification head. Owns its
/// parameters.
pub struct GraphSage {
    convs: Vec<SageConv>,
    head: Head,
    dropout: Dropout,
    activation_fn: Activation,
    residual: bool,
    varmap: VarMap,
}
impl GraphSage {
    pub fn with_params(
        in_dim: usize,
        num_classes: usize,
        params: &SageParams,
        device: &Device,
    ) -> Result<Self> {
        if params.num_layers == 0 || params.hidden_dim == 0 {
            bail!("GraphSage needs at least one layer of non-zero width: {params:?}")
        }
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut convs = Vec::new();
        let mut dim = in_dim;
        for i in 0..params.num_layers {
            convs.push(SageConv::new(dim, params.hidden_dim, vs.pp(format!("conv_{i}")))?);
            dim = params.hidden_dim;
        }
        let vs = vs.pp("head");
        let head = match params.head_hidden {
            Some(h) => Head::Mlp {
                fc1: linear(dim, h, vs.pp("fc1"))?,
                dropout: Dropout::new(params.head_dropout),
                fc2: linear(h, num_classes, vs.pp("fc2"))?,
            },
            None => Head::Linear(linear(dim, num_classes, vs.pp("lin"))?),
        };
        Ok(Self {
            convs,
            head,
            dropout: Dropout::new(params.dropout_rate),
            activation_fn: Activation::Relu,
            residual: params.residual,
            varmap,
        })
    }
    pub fn new(in_dim: usize, num_classes: usize, device: &Device) -> Result<Self> {
        Self::with_params(in_dim, num_classes, &SageParams::default(), device)
    }
    pub fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|v| v.elem_count()).sum()
    }
    /// Writes the parameters as safetensors.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.varmap.save(path)
    }
}
impl GnnModule for GraphSage {
    fn forward_t(&self, xs: &Tensor, edge_index: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = xs.clone();
        let mut first = None;
        for conv in &self.convs {
            h = conv.forward_t(&h, edge_index, train)?;
            h = self.activation_fn.forward(&h)?;
            h = self.dropout.forward(&h, train)?;
            first.get_or_insert_with(|| h.clone());
        }
        match first {
            Some(first) if self.residual && self.convs.len() > 1 => h = (h + first)?,
            _ => {}
        }
        self.head.forward_t(&h, train)
    }
}
