//! Element-wise gradient transforms applied before the Adam update.

use candle_core::{Result, Tensor};

/// Rewrites one parameter's gradient.
pub trait GradientTransform: Send {
    fn name(&self) -> &'static str;

    fn apply(&self, param: &Tensor, grad: &Tensor) -> Result<Tensor>;
}

/// `g + weight_decay * p`
#[derive(Debug, Clone, Copy)]
pub struct AddDecayedWeights {
    pub weight_decay: f64,
}

impl GradientTransform for AddDecayedWeights {
    fn name(&self) -> &'static str {
        "add_decayed_weights"
    }

    fn apply(&self, param: &Tensor, grad: &Tensor) -> Result<Tensor> {
        if self.weight_decay == 0.0 {
            return Ok(grad.clone());
        }
        grad + param.detach().affine(self.weight_decay, 0.0)?
    }
}

/// Clamp each element to `[-max_delta, max_delta]`.
#[derive(Debug, Clone, Copy)]
pub struct ClipByValue {
    pub max_delta: f64,
}

impl GradientTransform for ClipByValue {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn apply(&self, _param: &Tensor, grad: &Tensor) -> Result<Tensor> {
        grad.clamp(-self.max_delta, self.max_delta)
    }
}

/// Replace NaN entries with zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroNans;

impl GradientTransform for ZeroNans {
    fn name(&self) -> &'static str {
        "zero_nans"
    }

    fn apply(&self, _param: &Tensor, grad: &Tensor) -> Result<Tensor> {
        // NaN is the only value not equal to itself
        let is_nan = grad.ne(grad)?;
        is_nan.where_cond(&grad.zeros_like()?, grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_add_decayed_weights() -> Result<()> {
        let device = Device::Cpu;
        let p = Tensor::new(&[2.0f32, -4.0], &device)?;
        let g = Tensor::new(&[1.0f32, 1.0], &device)?;
        let out = AddDecayedWeights { weight_decay: 0.5 }.apply(&p, &g)?.to_vec1::<f32>()?;
        assert_eq!(out, vec![2.0, -1.0]);
        Ok(())
    }

    #[test]
    fn test_clip_by_value() -> Result<()> {
        let device = Device::Cpu;
        let g = Tensor::new(&[-3.0f32, -0.5, 0.0, 0.25, 7.0], &device)?;
        let out = ClipByValue { max_delta: 1.0 }.apply(&g, &g)?.to_vec1::<f32>()?;
        assert_eq!(out, vec![-1.0, -0.5, 0.0, 0.25, 1.0]);
        Ok(())
    }

    #[test]
    fn test_zero_nans_keeps_finite_values() -> Result<()> {
        let device = Device::Cpu;
        let g = Tensor::new(&[f32::NAN, 1.5, f32::NAN, -2.0], &device)?;
        let out = ZeroNans.apply(&g, &g)?.to_vec1::<f32>()?;
        assert_eq!(out, vec![0.0, 1.5, 0.0, -2.0]);
        Ok(())
    }
}
