//! Gradient transform chain in front of Adam.

use candle_core::{backprop::GradStore, Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use super::transform::{AddDecayedWeights, ClipByValue, GradientTransform, ZeroNans};
use crate::config::TrainConfig;

/// Runs each transform over every gradient, then takes an Adam step.
///
/// Decay lives in the chain, so the wrapped AdamW always has `weight_decay = 0`.
pub struct OptimizerChain {
    vars: Vec<Var>,
    transforms: Vec<Box<dyn GradientTransform>>,
    adam: AdamW,
}

impl OptimizerChain {
    pub fn new(
        vars: Vec<Var>,
        transforms: Vec<Box<dyn GradientTransform>>,
        lr: f64,
        betas: (f64, f64),
        eps: f64,
    ) -> Result<Self> {
        let params = ParamsAdamW {
            lr,
            beta1: betas.0,
            beta2: betas.1,
            eps,
            weight_decay: 0.0,
        };
        let adam = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            vars,
            transforms,
            adam,
        })
    }

    /// additive weight decay -> clip -> zero NaNs -> Adam
    pub fn from_config(vars: Vec<Var>, config: &TrainConfig) -> Result<Self> {
        let transforms: Vec<Box<dyn GradientTransform>> = vec![
            Box::new(AddDecayedWeights {
                weight_decay: config.weight_decay,
            }),
            Box::new(ClipByValue {
                max_delta: config.grad_clip,
            }),
            Box::new(ZeroNans),
        ];
        Self::new(vars, transforms, config.lr, config.adam_betas, config.adam_eps)
    }

    /// Names of the transforms, in application order.
    pub fn transform_names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Transform gradients in place, then update parameters.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        for var in &self.vars {
            let param = var.as_tensor();
            let Some(grad) = grads.get(param) else {
                continue;
            };
            let mut grad = grad.clone();
            for transform in &self.transforms {
                grad = transform.apply(param, &grad)?;
            }
            grads.insert(param, grad);
        }
        self.adam.step(grads)
    }

    pub fn learning_rate(&self) -> f64 {
        self.adam.learning_rate()
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.adam.set_learning_rate(lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_chain_order() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _w = vb.get_with_hints(4, "w", candle_nn::Init::Const(1.0))?;

        let opt = OptimizerChain::from_config(varmap.all_vars(), &TrainConfig::tiny_cpu())?;
        assert_eq!(opt.transform_names(), vec!["add_decayed_weights", "clip", "zero_nans"]);
        Ok(())
    }

    #[test]
    fn test_nan_gradient_leaves_parameter_unchanged() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints(2, "w", candle_nn::Init::Const(1.0))?;

        let mut opt = OptimizerChain::new(
            varmap.all_vars(),
            vec![Box::new(ZeroNans)],
            1e-3,
            (0.9, 0.999),
            1e-8,
        )?;

        let nan = Tensor::new(&[f32::NAN, 0.0], &device)?;
        let loss = w.mul(&nan)?.sum_all()?;
        let mut grads = loss.backward()?;
        opt.step(&mut grads)?;

        let after = w.to_vec1::<f32>()?;
        // zeroed gradient -> Adam update of exactly zero
        assert_eq!(after, vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_step_moves_against_gradient() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let w = vb.get_with_hints(3, "w", candle_nn::Init::Const(0.0))?;

        let mut opt = OptimizerChain::from_config(varmap.all_vars(), &TrainConfig::tiny_cpu())?;
        // huge gradient is clipped, Adam normalizes it to ~lr per step
        let scale = Tensor::new(&[1000.0f32, -1000.0, 0.5], &device)?;
        let loss = w.mul(&scale)?.sum_all()?;
        let mut grads = loss.backward()?;
        opt.step(&mut grads)?;

        let after = w.to_vec1::<f32>()?;
        assert!(after[0] < 0.0 && after[0] > -2e-3);
        assert!(after[1] > 0.0 && after[1] < 2e-3);
        assert!(after[2] < 0.0);
        Ok(())
    }

    #[test]
    fn test_set_lr() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _w = vb.get_with_hints(1, "w", candle_nn::Init::Const(0.0))?;

        let mut opt = OptimizerChain::from_config(varmap.all_vars(), &TrainConfig::tiny_cpu())?;
        assert!((opt.learning_rate() - 1e-3).abs() < 1e-12);
        opt.set_lr(5e-4);
        assert!((opt.learning_rate() - 5e-4).abs() < 1e-12);
        Ok(())
    }
}
