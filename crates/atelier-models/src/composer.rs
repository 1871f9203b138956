//! Weighted composition of named loss terms.

use candle_core::{Result, Tensor, Var};

/// One evaluated loss term
#[derive(Debug, Clone)]
pub struct LossTerm {
    pub name: String,
    pub weight: f64,
    /// Unweighted scalar loss
    pub raw: Tensor,
}

/// Accumulates `(name, weight, raw)` terms in insertion order.
///
/// A term with weight 0 is skipped before its closure runs, so disabled
/// losses cost nothing and cannot fail.
#[derive(Debug, Clone, Default)]
pub struct LossComposer {
    terms: Vec<LossTerm>,
}

impl LossComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate and record a term unless its weight is 0
    pub fn add<F, E>(&mut self, name: &str, weight: f64, term: F) -> std::result::Result<(), E>
    where
        F: FnOnce() -> std::result::Result<Tensor, E>,
    {
        if weight == 0.0 {
            return Ok(());
        }
        let raw = term()?;
        self.terms.push(LossTerm {
            name: name.to_string(),
            weight,
            raw,
        });
        Ok(())
    }

    pub fn terms(&self) -> &[LossTerm] {
        &self.terms
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&LossTerm> {
        self.terms.iter().find(|t| t.name == name)
    }

    /// `sum(weight * raw)` in insertion order, `None` when every term was disabled
    pub fn total(&self) -> Result<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        for term in &self.terms {
            let weighted = (&term.raw * term.weight)?;
            total = Some(match total {
                Some(acc) => (acc + weighted)?,
                None => weighted,
            });
        }
        Ok(total)
    }

    /// Raw scalar value of every evaluated term
    pub fn raw_values(&self) -> Result<Vec<(String, f32)>> {
        self.terms
            .iter()
            .map(|t| Ok((t.name.clone(), scalar(&t.raw)?)))
            .collect()
    }

    /// L2 norm of the gradient of each weighted term with respect to `image`.
    ///
    /// Every term is back-propagated on its own, so the terms must have been
    /// built on top of `image`. Terms that do not depend on it report 0.
    pub fn gradient_norms(&self, image: &Var) -> Result<Vec<(String, f32)>> {
        self.terms
            .iter()
            .map(|t| {
                let grads = (&t.raw * t.weight)?.backward()?;
                let norm = match grads.get(image.as_tensor()) {
                    Some(g) => g.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?,
                    None => 0.0,
                };
                Ok((t.name.clone(), norm))
            })
            .collect()
    }
}

/// Scalar value of a rank-0 (or single element) tensor as f32
pub fn scalar(t: &Tensor) -> Result<f32> {
    t.flatten_all()?
        .to_dtype(candle_core::DType::F32)?
        .get(0)?
        .to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn test_zero_weight_term_is_never_evaluated() -> Result<()> {
        let device = Device::Cpu;
        let mut composer = LossComposer::new();
        composer.add("l1", 1.0, || Tensor::new(2.0f32, &device))?;
        composer.add("style", 0.0, || -> Result<Tensor> { panic!("disabled term evaluated") })?;
        assert_eq!(composer.terms().len(), 1);
        assert!(composer.get("style").is_none());
        Ok(())
    }

    #[test]
    fn test_total_is_weighted_sum() -> Result<()> {
        let device = Device::Cpu;
        let mut composer = LossComposer::new();
        composer.add("a", 2.0, || Tensor::new(1.5f32, &device))?;
        composer.add("b", 0.5, || Tensor::new(4.0f32, &device))?;
        composer.add("c", 10.0, || Tensor::new(0.25f32, &device))?;

        let total = composer.total()?.unwrap();
        assert_abs_diff_eq!(total.to_scalar::<f32>()?, 3.0 + 2.0 + 2.5, epsilon = 1e-6);

        let raw = composer.raw_values()?;
        let names: Vec<&str> = raw.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(raw[1].1, 4.0);
        Ok(())
    }

    #[test]
    fn test_disabled_term_leaves_total_unchanged() -> Result<()> {
        let device = Device::Cpu;
        let build = |b_weight: Option<f64>| -> Result<f32> {
            let mut composer = LossComposer::new();
            composer.add("a", 0.3, || Tensor::new(0.9f32, &device))?;
            if let Some(w) = b_weight {
                composer.add("b", w, || Tensor::new(0.11f32, &device))?;
            }
            composer.add("c", 1.7, || Tensor::new(0.45f32, &device))?;
            composer.total()?.unwrap().to_scalar::<f32>()
        };

        let omitted = build(None)?;
        assert_eq!(build(Some(0.0))?, omitted);

        let enabled = build(Some(0.7))?;
        assert_abs_diff_eq!(enabled - omitted, 0.7 * 0.11, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_empty_composer_has_no_total() -> Result<()> {
        let composer = LossComposer::new();
        assert!(composer.total()?.is_none());
        Ok(())
    }

    #[test]
    fn test_gradient_norm_per_term() -> Result<()> {
        let device = Device::Cpu;
        let image = Var::new(&[1.0f32, -1.0, 3.0, 5.0], &device)?;
        let x = image.as_tensor();
        let mut composer = LossComposer::new();
        // d/dx 2 * mean(x) = 2/4 per element: norm = 0.5 * 2 = 1
        composer.add("mean", 2.0, || x.mean_all())?;
        // d/dx 0.5 * sum(x^2) = x: norm = 6
        composer.add("energy", 0.5, || x.sqr()?.sum_all())?;
        composer.add("constant", 1.0, || Tensor::new(3.0f32, &device))?;

        let norms = composer.gradient_norms(&image)?;
        assert_abs_diff_eq!(norms[0].1, 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(norms[1].1, 6.0, epsilon = 1e-5);
        assert_eq!(norms[2], ("constant".to_string(), 0.0));
        Ok(())
    }
}
