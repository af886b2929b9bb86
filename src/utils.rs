/// 工具函数模块
///
/// 包含 softmax / log-softmax、参数初始化和采样等通用工具
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, concatenate};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{DaeError, Result};

// Softmax专用的epsilon常量（避免除零）
const SOFTMAX_EPS: f32 = 1e-12;

/// Softmax激活函数
///
/// 对输入张量的每一行应用softmax，将数值转换为概率分布。
/// 使用数值稳定的实现（减去最大值避免溢出）。
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut result = logits.clone();

    for mut row in result.rows_mut() {
        // 找到该行的最大值（用于数值稳定）
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        // 计算exp(x - max)
        row.mapv_inplace(|x| (x - max_val).exp());

        // 归一化
        let sum_exp: f32 = row.sum();
        row.mapv_inplace(|x| x / sum_exp.max(SOFTMAX_EPS));
    }

    result
}

/// Log-softmax：`x - max - ln(sum(exp(x - max)))`，逐行计算
pub fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut result = logits.clone();

    for mut row in result.rows_mut() {
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|&x| (x - max_val).exp()).sum::<f32>().ln();
        row.mapv_inplace(|x| x - max_val - log_sum);
    }

    result
}

/// 返回一行中最大值的下标和值；相等时取靠前的下标
pub fn argmax(row: ArrayView1<f32>) -> (usize, f32) {
    let mut best = (0, f32::NEG_INFINITY);
    for (idx, &value) in row.iter().enumerate() {
        if value > best.1 {
            best = (idx, value);
        }
    }
    best
}

/// 从由 log-probabilities 给出的类别分布中采样一个下标
pub fn sample_categorical<R: Rng>(log_probs: ArrayView1<f32>, rng: &mut R) -> usize {
    let total: f32 = log_probs.iter().map(|&lp| lp.exp()).sum();
    if !(total > 0.0) {
        return rng.random_range(0..log_probs.len());
    }

    let target: f32 = rng.random::<f32>() * total;
    let mut cumsum = 0.0;
    for (idx, &lp) in log_probs.iter().enumerate() {
        cumsum += lp.exp();
        if target < cumsum {
            return idx;
        }
    }

    // 浮点累加误差：回退到最后一个非零概率的类别
    log_probs
        .iter()
        .rposition(|&lp| lp.exp() > 0.0)
        .unwrap_or(log_probs.len() - 1)
}

/// 从正态分布 N(mean, std) 采样；std 非法时退化为 mean
pub fn sample_normal<R: Rng>(rng: &mut R, mean: f32, std: f32) -> f32 {
    match Normal::new(mean, std) {
        Ok(normal) => normal.sample(rng),
        Err(_) => mean,
    }
}

/// 均匀分布 U(-bound, bound) 初始化的矩阵
pub fn uniform_matrix<R: Rng>(rng: &mut R, shape: (usize, usize), bound: f32) -> Array2<f32> {
    if bound <= 0.0 {
        return Array2::zeros(shape);
    }
    Array2::from_shape_fn(shape, |_| rng.random_range(-bound..bound))
}

/// 按列拼接若干 (batch, *) 矩阵，行数不一致时报错
pub fn concat_columns(parts: &[ArrayView2<f32>]) -> Result<Array2<f32>> {
    concatenate(Axis(1), parts).map_err(|e| DaeError::InvalidData(format!("按列拼接失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_softmax_basic() {
        let input = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let output = softmax(&input);

        // 检查每行和为1
        for row in output.rows() {
            let sum: f32 = row.sum();
            assert!(
                (sum - 1.0).abs() < 1e-6,
                "每行和应为 1.0，实际为 {}",
                sum
            );
        }
    }

    #[test]
    fn test_softmax_numerical_stability() {
        // 测试大数值的稳定性
        let input = Array2::from_shape_vec((1, 3), vec![1000.0, 1001.0, 1002.0]).unwrap();
        let output = softmax(&input);

        // 应该不会产生NaN或Inf
        for &val in output.iter() {
            assert!(val.is_finite(), "Value should be finite, got {}", val);
        }
    }

    #[test]
    fn test_concat_columns() {
        let a = Array2::<f32>::ones((2, 1));
        let b = Array2::<f32>::zeros((2, 2));
        let joined = concat_columns(&[a.view(), b.view()]).unwrap();
        assert_eq!(joined.dim(), (2, 3));
        assert_eq!(joined[[1, 0]], 1.0);
        let c = Array2::<f32>::zeros((3, 1));
        assert!(concat_columns(&[a.view(), c.view()]).is_err());
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let input = Array2::from_shape_vec((1, 4), vec![0.5, -1.0, 2.0, 0.0]).unwrap();
        let probs = softmax(&input);
        let log_probs = log_softmax(&input);
        for (p, lp) in probs.iter().zip(log_probs.iter()) {
            assert!((p.ln() - lp).abs() < 1e-5);
        }
    }

    #[test]
    fn test_argmax_prefers_first_on_tie() {
        let row = ndarray::arr1(&[0.1, 0.7, 0.7, 0.2]);
        assert_eq!(argmax(row.view()), (1, 0.7));
    }

    #[test]
    fn test_sample_categorical_respects_zero_probability() {
        let mut rng = StdRng::seed_from_u64(7);
        let log_probs = ndarray::arr1(&[f32::NEG_INFINITY, -1e30, 0.0]);
        for _ in 0..100 {
            let idx = sample_categorical(log_probs.view(), &mut rng);
            assert_eq!(idx, 2);
        }
    }
}
