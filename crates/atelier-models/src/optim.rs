//! Adam over the named parameters of a `VarMap`.
//!
//! Moments are keyed by parameter name so the optimizer state can be written
//! next to the network weights and restored into a freshly built model.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::VarMap;

use atelier_core::{Error, Result, TrainConfig};

const STEP_KEY: &str = "step";

#[derive(Clone, Debug)]
pub struct AdamParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl AdamParams {
    pub fn from_train(train: &TrainConfig, lr: f64) -> Self {
        Self {
            lr,
            beta1: train.beta1,
            beta2: train.beta2,
            eps: 1e-8,
            weight_decay: train.weight_decay,
        }
    }
}

#[derive(Debug)]
struct NamedVar {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

#[derive(Debug)]
pub struct Adam {
    vars: Vec<NamedVar>,
    step_t: usize,
    params: AdamParams,
}

/// Snapshot of the name -> variable table of a `VarMap`, sorted by name
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Checkpoint("parameter map lock poisoned".into()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

impl Adam {
    pub fn new(varmap: &VarMap, params: AdamParams) -> Result<Self> {
        let vars = named_vars(varmap)?
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| -> Result<NamedVar> {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(NamedVar {
                    name,
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    pub fn params(&self) -> &AdamParams {
        &self.params
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Apply one update; parameters without a gradient are left untouched
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let AdamParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for entry in self.vars.iter() {
            let theta = &entry.var;
            let Some(g) = grads.get(theta) else {
                continue;
            };
            let g = if weight_decay != 0.0 {
                (g + (theta.as_tensor() * weight_decay)?)?
            } else {
                g.clone()
            };
            let m = &entry.first_moment;
            let v = &entry.second_moment;
            let next_m = ((m.as_tensor() * beta1)? + (&g * (1.0 - beta1))?)?;
            let next_v = ((v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (theta.as_tensor() - (update * lr)?)?;
            m.set(&next_m)?;
            v.set(&next_v)?;
            theta.set(&next_theta)?;
        }
        Ok(())
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Moments as `<param>.m` / `<param>.v` plus the step counter
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::with_capacity(2 * self.vars.len() + 1);
        for entry in &self.vars {
            state.insert(format!("{}.m", entry.name), entry.first_moment.as_tensor().detach());
            state.insert(format!("{}.v", entry.name), entry.second_moment.as_tensor().detach());
        }
        let device = self.vars.first().map(|e| e.var.device().clone()).unwrap_or(candle_core::Device::Cpu);
        state.insert(STEP_KEY.to_string(), Tensor::new(&[self.step_t as f64], &device)?);
        Ok(state)
    }

    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for entry in &self.vars {
            for (suffix, moment) in [("m", &entry.first_moment), ("v", &entry.second_moment)] {
                let key = format!("{}.{suffix}", entry.name);
                let saved = state
                    .get(&key)
                    .ok_or_else(|| Error::Checkpoint(format!("optimizer state is missing {key}")))?;
                if saved.dims() != moment.dims() {
                    return Err(Error::ShapeMismatch(format!(
                        "{key}: expected {:?}, found {:?}",
                        moment.dims(),
                        saved.dims()
                    )));
                }
                moment.set(&saved.to_device(moment.device())?.to_dtype(moment.dtype())?)?;
            }
        }
        if let Some(step) = state.get(STEP_KEY) {
            let step = step.flatten_all()?.to_dtype(DType::F64)?.get(0)?.to_scalar::<f64>()?;
            self.step_t = step.max(0.0) as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_nn::{Init, VarBuilder};

    fn single_param(value: f32) -> Result<(VarMap, Tensor)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(2, "w", Init::Const(value as f64))?;
        Ok((varmap, w))
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() -> Result<()> {
        let (varmap, w) = single_param(1.0)?;
        let mut opt = Adam::new(&varmap, AdamParams { lr: 0.1, ..Default::default() })?;
        // gradient of sum(3 w) is 3 everywhere: bias-corrected step is exactly lr
        opt.backward_step(&(&w * 3.0)?.sum_all()?)?;
        let after = w.to_vec1::<f32>()?;
        assert_abs_diff_eq!(after[0], 0.9, epsilon = 1e-5);
        assert_eq!(opt.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_weight_decay_changes_gradient() -> Result<()> {
        let (varmap, w) = single_param(2.0)?;
        let params = AdamParams {
            lr: 0.1,
            weight_decay: 1.0,
            ..Default::default()
        };
        let mut opt = Adam::new(&varmap, params)?;
        // loss gradient -1 is overwhelmed by the decay term +2
        opt.backward_step(&w.neg()?.sum_all()?)?;
        assert!(w.to_vec1::<f32>()?[0] < 2.0);
        Ok(())
    }

    #[test]
    fn test_state_round_trip() -> Result<()> {
        let (varmap, w) = single_param(1.0)?;
        let mut opt = Adam::new(&varmap, AdamParams::default())?;
        opt.backward_step(&w.sqr()?.sum_all()?)?;
        let state = opt.state_tensors()?;
        assert!(state.contains_key("w.m") && state.contains_key("w.v"));

        let (fresh_map, _) = single_param(1.0)?;
        let mut restored = Adam::new(&fresh_map, AdamParams::default())?;
        restored.load_state(&state)?;
        assert_eq!(restored.step_count(), 1);
        let m = restored.state_tensors()?["w.m"].to_vec1::<f32>()?;
        assert_eq!(m, state["w.m"].to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_load_rejects_wrong_shape() -> Result<()> {
        let (varmap, _) = single_param(1.0)?;
        let mut opt = Adam::new(&varmap, AdamParams::default())?;
        let mut state = opt.state_tensors()?;
        state.insert("w.m".into(), Tensor::zeros(3, DType::F32, &Device::Cpu)?);
        assert!(matches!(opt.load_state(&state), Err(Error::ShapeMismatch(_))));
        Ok(())
    }
}
