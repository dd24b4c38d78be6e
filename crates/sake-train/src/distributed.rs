//! Data-parallel glue between candle parameters and a [`Communicator`].
//!
//! Parameters are packed in name order so every rank lays out the flat buffer
//! identically regardless of `HashMap` iteration order.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::VarMap;
use sake_comm::Communicator;
use tracing::debug;

use crate::error::{TrainError, TrainResult};

/// All trainable variables, sorted by name.
pub fn sorted_vars(varmap: &VarMap) -> TrainResult<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainError::Candle("parameter map lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn append_flat(buf: &mut Vec<f32>, t: &Tensor) -> TrainResult<()> {
    buf.extend(t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
    Ok(())
}

fn unflatten(values: &[f32], like: &Var) -> TrainResult<Tensor> {
    Ok(Tensor::from_slice(values, like.shape(), like.device())?.to_dtype(like.dtype())?)
}

/// Replace every gradient with its mean over all ranks.
///
/// A parameter without a local gradient contributes zeros, and afterwards
/// holds the averaged gradient like every other leaf.
pub fn average_gradients(
    comm: &mut dyn Communicator,
    varmap: &VarMap,
    grads: &mut GradStore,
) -> TrainResult<()> {
    let world_size = comm.world_size();
    if world_size == 1 {
        return Ok(());
    }

    let vars = sorted_vars(varmap)?;
    let total: usize = vars.iter().map(|(_, v)| v.elem_count()).sum();
    let mut buf = Vec::with_capacity(total);
    for (_, var) in &vars {
        match grads.get(var.as_tensor()) {
            Some(g) => append_flat(&mut buf, g)?,
            None => buf.resize(buf.len() + var.elem_count(), 0.0),
        }
    }

    comm.all_reduce_sum(&mut buf)?;
    let n = world_size as f32;
    buf.iter_mut().for_each(|v| *v /= n);

    let mut offset = 0;
    for (_, var) in &vars {
        let n = var.elem_count();
        let averaged = unflatten(&buf[offset..offset + n], var)?;
        grads.insert(var.as_tensor(), averaged);
        offset += n;
    }

    debug!(
        rank = comm.rank(),
        params = vars.len(),
        elements = total,
        "Averaged gradients"
    );
    Ok(())
}

/// Overwrite local parameters with rank 0's values.
pub fn sync_parameters(comm: &mut dyn Communicator, varmap: &VarMap) -> TrainResult<()> {
    if comm.world_size() == 1 {
        return Ok(());
    }

    let vars = sorted_vars(varmap)?;
    let mut buf = Vec::new();
    for (_, var) in &vars {
        append_flat(&mut buf, var.as_tensor())?;
    }

    comm.broadcast(&mut buf, 0)?;

    let mut offset = 0;
    for (_, var) in &vars {
        let n = var.elem_count();
        var.set(&unflatten(&buf[offset..offset + n], var)?)?;
        offset += n;
    }
    Ok(())
}

/// Mean of a scalar across ranks.
pub fn global_mean(comm: &mut dyn Communicator, value: f64) -> TrainResult<f64> {
    let mut buf = [value as f32];
    comm.all_reduce_mean(&mut buf)?;
    Ok(buf[0] as f64)
}

/// Send integers from `root` to every rank without rounding.
///
/// Each value travels as four 16-bit limbs, which `f32` holds exactly.
pub fn broadcast_u64s(comm: &mut dyn Communicator, values: &[u64], root: usize) -> TrainResult<Vec<u64>> {
    let mut buf: Vec<f32> = values
        .iter()
        .flat_map(|&v| (0..4).map(move |i| ((v >> (16 * i)) & 0xffff) as f32))
        .collect();
    comm.broadcast(&mut buf, root)?;
    Ok(buf
        .chunks_exact(4)
        .map(|limbs| {
            limbs
                .iter()
                .enumerate()
                .fold(0u64, |acc, (i, &limb)| acc | ((limb as u64) << (16 * i)))
        })
        .collect())
}

/// L2 norm over all gradients present in `grads`.
pub fn gradient_norm(varmap: &VarMap, grads: &GradStore) -> TrainResult<f64> {
    let mut sum_sq = 0.0f64;
    for (_, var) in sorted_vars(varmap)? {
        if let Some(g) = grads.get(var.as_tensor()) {
            sum_sq += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    Ok(sum_sq.sqrt())
}
