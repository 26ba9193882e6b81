//! Learning-rate schedule and gradient clipping.

use candle_core::{backprop::GradStore, Result, Var};

/// Cosine annealing from `base_lr` to `eta_min` over `total_steps` steps.
#[derive(Debug, Clone, Copy)]
pub struct CosineAnnealing {
    pub base_lr: f64,
    pub eta_min: f64,
    pub total_steps: usize,
}

impl CosineAnnealing {
    pub const DEFAULT_ETA_MIN: f64 = 1e-6;

    pub fn new(base_lr: f64, total_steps: usize) -> Self {
        Self { base_lr, eta_min: Self::DEFAULT_ETA_MIN, total_steps }
    }

    /// Rate after `step` scheduler steps.
    pub fn lr_at(&self, step: usize) -> f64 {
        if self.total_steps == 0 {
            return self.base_lr;
        }
        let progress = step as f64 / self.total_steps as f64;
        self.eta_min
            + (self.base_lr - self.eta_min) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
    }
}

/// Rescale the gradients of `vars` so their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = sq.sqrt();
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), g.affine(coef, 0.0)?);
            }
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn cosine_endpoints() {
        let s = CosineAnnealing::new(5e-6, 100);
        assert_abs_diff_eq!(s.lr_at(0), 5e-6, epsilon = 1e-15);
        assert_abs_diff_eq!(s.lr_at(50), (5e-6 + 1e-6) / 2.0, epsilon = 1e-15);
        assert_abs_diff_eq!(s.lr_at(100), 1e-6, epsilon = 1e-15);
        assert_eq!(CosineAnnealing::new(1e-3, 0).lr_at(7), 1e-3);
    }

    #[test]
    fn clipping_caps_global_norm() {
        let dev = Device::Cpu;
        let a = Var::new(&[1f32, 2.0], &dev).unwrap();
        let b = Var::new(&[3f32], &dev).unwrap();
        // d/dx of sum(3x) = 3, d/dy of sum(4y) = 4 → norm sqrt(9·2 + 16) = sqrt(34).
        let loss = ((a.as_tensor() * 3.0).unwrap().sum_all().unwrap()
            + (b.as_tensor() * 4.0).unwrap().sum_all().unwrap())
        .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert_abs_diff_eq!(norm, 34f64.sqrt(), epsilon = 1e-5);

        let total: f32 = vars
            .iter()
            .map(|v| grads.get(v.as_tensor()).unwrap().sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap())
            .sum();
        assert_abs_diff_eq!(total.sqrt(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn small_gradients_are_untouched() {
        let dev = Device::Cpu;
        let a = Var::new(&[0.1f32], &dev).unwrap();
        let loss = (a.as_tensor() * 0.5).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        clip_grad_norm(&mut grads, &[a.clone()], 1.0).unwrap();
        let g = grads.get(a.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(g[0], 0.5, epsilon = 1e-7);
    }
}
