//! # Adam 优化器
//!
//! 每个参数矩阵持有一份独立的一阶/二阶动量，随检查点一起保存以支持断点续训。
//!
//! ```text
//! m = β1·m + (1-β1)·g
//! v = β2·v + (1-β2)·g²
//! θ = θ - lr · m̂ / (sqrt(v̂) + ε)      m̂ = m/(1-β1^t), v̂ = v/(1-β2^t)
//! ```

use ndarray::{Array2, Zip};

#[derive(Clone, Debug)]
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub timestep: usize,
    pub m: Array2<f32>,
    pub v: Array2<f32>,
}

impl Adam {
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            timestep: 0,
            m: Array2::zeros(shape),
            v: Array2::zeros(shape),
        }
    }

    /// 用梯度 `grads` 更新 `params`。学习率非法或形状不一致时不做任何事。
    pub fn step(&mut self, params: &mut Array2<f32>, grads: &Array2<f32>, lr: f32) {
        if !lr.is_finite() || lr <= 0.0 {
            return;
        }
        if params.raw_dim() != grads.raw_dim() || self.m.raw_dim() != grads.raw_dim() {
            log::warn!(
                "Adam.step 形状不一致: params {:?}, grads {:?}, state {:?}",
                params.dim(),
                grads.dim(),
                self.m.dim()
            );
            return;
        }

        self.timestep += 1;
        let t = self.timestep as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);

        Zip::from(params)
            .and(grads)
            .and(&mut self.m)
            .and(&mut self.v)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_lr() {
        // 第一步经过偏差修正后，更新量约等于 lr * sign(g)
        let mut adam = Adam::new((1, 3));
        let mut params = Array2::from_shape_vec((1, 3), vec![1.0, 1.0, 1.0]).unwrap();
        let grads = Array2::from_shape_vec((1, 3), vec![0.5, -2.0, 0.0]).unwrap();
        adam.step(&mut params, &grads, 0.1);

        assert!((params[[0, 0]] - 0.9).abs() < 1e-4);
        assert!((params[[0, 1]] - 1.1).abs() < 1e-4);
        assert!((params[[0, 2]] - 1.0).abs() < 1e-6);
        assert_eq!(adam.timestep, 1);
    }

    #[test]
    fn test_invalid_lr_is_noop() {
        let mut adam = Adam::new((2, 2));
        let mut params = Array2::ones((2, 2));
        let grads = Array2::ones((2, 2));
        adam.step(&mut params, &grads, 0.0);
        adam.step(&mut params, &grads, f32::NAN);
        assert_eq!(params, Array2::<f32>::ones((2, 2)));
        assert_eq!(adam.timestep, 0);
    }

    #[test]
    fn test_converges_on_quadratic() {
        // f(x) = (x - 3)^2
        let mut adam = Adam::new((1, 1));
        let mut x = Array2::zeros((1, 1));
        for _ in 0..2000 {
            let g = x.mapv(|v: f32| 2.0 * (v - 3.0));
            adam.step(&mut x, &g, 0.05);
        }
        assert!((x[[0, 0]] - 3.0).abs() < 0.05, "x = {}", x[[0, 0]]);
    }
}
