//! Dense SAKE regressor: species embedding -> message-passing layers -> head.
//!
//! All molecules in a batch have the same atom count, so every layer works on
//! dense `[batch, atoms, atoms, ...]` pair tensors without padding.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::ModelConfig;

const EPS: f64 = 1e-8;
const SELF_MASK: f64 = -1e9;

/// Apply a linear layer over the trailing axis of an N-d tensor.
fn linear_nd(layer: &Linear, x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let (lead, last) = dims.split_at(dims.len() - 1);
    let rows: usize = lead.iter().product();
    let y = layer.forward(&x.reshape((rows, last[0]))?)?;
    let mut out = lead.to_vec();
    out.push(y.dim(1)?);
    y.reshape(out)
}

/// Pairwise displacements `x_i - x_j` `[B, N, N, 3]` and distances `[B, N, N]`.
pub fn pairwise(coords: &Tensor) -> Result<(Tensor, Tensor)> {
    let delta = coords.unsqueeze(2)?.broadcast_sub(&coords.unsqueeze(1)?)?;
    // eps keeps the sqrt gradient finite on the diagonal
    let dist = (delta.sqr()?.sum(D::Minus1)? + EPS)?.sqrt()?;
    Ok((delta, dist))
}

/// Gaussian expansion of distances onto evenly spaced centres in `[0, cutoff]`.
struct RadialBasis {
    centres: Tensor,
    gamma: f64,
}

impl RadialBasis {
    fn new(n_rbf: usize, cutoff: f64, device: &Device) -> Result<Self> {
        let step = cutoff / (n_rbf - 1) as f64;
        let centres: Vec<f32> = (0..n_rbf).map(|k| (k as f64 * step) as f32).collect();
        Ok(Self {
            centres: Tensor::from_vec(centres, n_rbf, device)?,
            gamma: 1.0 / (step * step),
        })
    }

    fn forward(&self, dist: &Tensor) -> Result<Tensor> {
        dist.unsqueeze(D::Minus1)?
            .broadcast_sub(&self.centres)?
            .sqr()?
            .affine(-self.gamma, 0.0)?
            .exp()
    }
}

/// One message-passing layer.
pub struct SakeLayer {
    edge_in: Linear,
    edge_out: Linear,
    semantic_attention: Linear,
    coefficients: Linear,
    node_in: Linear,
    node_out: Linear,
}

impl SakeLayer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_features;
        let c = config.n_coefficients;
        Ok(Self {
            edge_in: linear(2 * h + config.n_rbf, h, vb.pp("edge_mlp.0"))?,
            edge_out: linear(h, h, vb.pp("edge_mlp.1"))?,
            semantic_attention: linear(h, 1, vb.pp("semantic_attention"))?,
            coefficients: linear(h, c, vb.pp("coefficients"))?,
            node_in: linear(2 * h + c, h, vb.pp("node_mlp.0"))?,
            node_out: linear(h, h, vb.pp("node_mlp.1"))?,
        })
    }

    /// h `[B, N, H]`, delta `[B, N, N, 3]`, rbf `[B, N, N, R]`, mask `[N, N]`.
    pub fn forward(&self, h: &Tensor, delta: &Tensor, rbf: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, n, hidden) = h.dims3()?;

        let h_i = h.unsqueeze(2)?.broadcast_as((b, n, n, hidden))?.contiguous()?;
        let h_j = h.unsqueeze(1)?.broadcast_as((b, n, n, hidden))?.contiguous()?;
        let edge = Tensor::cat(&[&h_i, &h_j, rbf], D::Minus1)?;
        let edge = linear_nd(&self.edge_in, &edge)?.silu()?;
        let edge = linear_nd(&self.edge_out, &edge)?.silu()?; // [B, N, N, H]

        // attention over neighbours j, never attending to self
        let logits = linear_nd(&self.semantic_attention, &edge)?
            .squeeze(D::Minus1)?
            .broadcast_add(mask)?;
        let alpha = candle_nn::ops::softmax(&logits, D::Minus1)?.unsqueeze(D::Minus1)?; // [B, N, N, 1]

        let message = edge.broadcast_mul(&alpha)?.sum(2)?; // [B, N, H]

        // spatial attention: weighted displacement sums, reduced to norms
        let coeff = linear_nd(&self.coefficients, &edge)?.broadcast_mul(&alpha)?; // [B, N, N, C]
        let spatial = delta
            .unsqueeze(D::Minus1)? // [B, N, N, 3, 1]
            .broadcast_mul(&coeff.unsqueeze(3)?)? // [B, N, N, 3, C]
            .sum(2)?; // [B, N, 3, C]
        let spatial = (spatial.sqr()?.sum(2)? + EPS)?.sqrt()?; // [B, N, C]

        let update = Tensor::cat(&[h, &message, &spatial], D::Minus1)?;
        let update = linear_nd(&self.node_in, &update)?.silu()?;
        let update = linear_nd(&self.node_out, &update)?;
        h + update
    }
}

/// Dense SAKE model.
pub struct DenseSakeModel {
    pub config: ModelConfig,
    embed: Linear,
    layers: Vec<SakeLayer>,
    head_in: Linear,
    head_out: Linear,
    rbf: RadialBasis,
}

impl DenseSakeModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_features;
        let embed = linear(config.n_species, h, vb.pp("embed"))?;
        let layers = (0..config.depth)
            .map(|i| SakeLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let head_in = linear(h, h, vb.pp("head.0"))?;
        let head_out = linear(h, config.out_features, vb.pp("head.1"))?;
        let rbf = RadialBasis::new(config.n_rbf, config.cutoff, vb.device())?;

        Ok(Self {
            config: config.clone(),
            embed,
            layers,
            head_in,
            head_out,
            rbf,
        })
    }

    /// species `[B, N, n_species]` one-hot, coords `[B, N, 3]`
    /// -> per-atom outputs `[B, N, out_features]` and the unchanged coordinates.
    pub fn forward(&self, species: &Tensor, coords: &Tensor) -> Result<(Tensor, Tensor)> {
        let n = coords.dim(1)?;
        let (delta, dist) = pairwise(coords)?;
        let rbf = self.rbf.forward(&dist)?;
        let mask = Tensor::eye(n, DType::F32, coords.device())?.affine(SELF_MASK, 0.0)?;

        let mut h = linear_nd(&self.embed, species)?;
        for layer in &self.layers {
            h = layer.forward(&h, &delta, &rbf, &mask)?;
        }
        let h = linear_nd(&self.head_in, &h)?.silu()?;
        let h = linear_nd(&self.head_out, &h)?;
        Ok((h, coords.clone()))
    }

    /// Molecule-level prediction `[B, out_features]`: per-atom outputs summed,
    /// then mapped back to target units as `y * std + mean`.
    pub fn predict(&self, species: &Tensor, coords: &Tensor, mean: f64, std: f64) -> Result<Tensor> {
        let (h, _) = self.forward(species, coords)?;
        h.sum(1)?.affine(std, mean)
    }
}

/// Mean absolute error.
pub fn mae_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    (pred - target)?.abs()?.mean_all()
}
