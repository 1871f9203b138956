//! WGAN gradient penalty.
//!
//! The penalty is `mean((|grad D(x_hat)| - 1)^2)` at random interpolates
//! `x_hat = a * real + (1 - a) * fake`. Gradients of the critic parameters
//! through an input-gradient norm would need a second backward pass, so the
//! norm is measured as the slope of the critic along its own (detached)
//! gradient direction with a forward finite difference. For a critic that is
//! locally linear around `x_hat` this is exactly the gradient norm.

use candle_core::{Result, Tensor, Var};
use rand::Rng;

/// Step along the gradient direction used for the slope estimate
pub const DEFAULT_STEP: f64 = 1e-2;

/// Per-sample mean critic score, (B,)
fn critic_scores<F>(critic: &F, x: &Tensor) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    critic(x)?.flatten_from(1)?.mean(1)
}

/// Weighted gradient penalty; differentiable with respect to the critic parameters
pub fn gradient_penalty<F, R>(
    critic: F,
    real: &Tensor,
    fake: &Tensor,
    weight: f64,
    step: f64,
    rng: &mut R,
) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
    R: Rng + ?Sized,
{
    let b = real.dim(0)?;
    let mut shape = vec![1usize; real.rank()];
    shape[0] = b;

    let alpha: Vec<f32> = (0..b).map(|_| rng.gen::<f32>()).collect();
    let alpha = Tensor::from_vec(alpha, shape.as_slice(), real.device())?.to_dtype(real.dtype())?;
    let x_hat = (real.detach().broadcast_mul(&alpha)? + fake.detach().broadcast_mul(&alpha.affine(-1.0, 1.0)?)?)?;

    // gradient direction of the critic at x_hat
    let leaf = Var::from_tensor(&x_hat)?;
    let grads = critic_scores(&critic, leaf.as_tensor())?.sum_all()?.backward()?;
    let grad = grads
        .get(leaf.as_tensor())
        .ok_or_else(|| candle_core::Error::Msg("critic does not depend on its input".into()))?
        .detach();
    let norm = grad.sqr()?.flatten_from(1)?.sum(1)?.sqrt()?;
    let norm = norm.affine(1.0, 1e-12)?.reshape(shape.as_slice())?;
    let direction = grad.broadcast_div(&norm)?;

    let base = critic_scores(&critic, &x_hat)?;
    let shifted = critic_scores(&critic, &(&x_hat + (direction * step)?)?)?;
    let slope = ((shifted - base)? / step)?;

    let penalty = slope.affine(1.0, -1.0)?.sqr()?.mean_all()?;
    penalty * weight
}
