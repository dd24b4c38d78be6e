pub mod chain;
pub mod transform;

pub use chain::OptimizerChain;
pub use transform::{AddDecayedWeights, ClipByValue, GradientTransform, ZeroNans};
