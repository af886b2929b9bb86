//! # 策略梯度损失（REINFORCE with mask）
//!
//! ```text
//! mask[t]  = seq[t] > 0
//! mask'    = [1, mask[0], ..., mask[L-2]]          右移一位，首位补 1
//! loss     = -Σ logp · adv · mask' / Σ mask'
//! ```
//!
//! 生成 `<end>` 的那一步在序列里已经被改写成 0，右移之后这一步仍然计入梯度。

use ndarray::Array2;

use crate::error::{DaeError, Result};

/// 右移后的掩码 (B, L)
pub fn shifted_mask(seq: &[Vec<usize>]) -> Array2<f32> {
    let batch = seq.len();
    let max_len = seq.first().map(Vec::len).unwrap_or(0);
    Array2::from_shape_fn((batch, max_len), |(b, t)| {
        if t == 0 || seq[b].get(t - 1).is_some_and(|&w| w > 0) {
            1.0
        } else {
            0.0
        }
    })
}

/// **计算损失及其对每个 log-probability 的梯度**
///
/// 返回 `(loss, d_loss/d_logprobs)`，梯度形状与 `logprobs` 相同。
pub fn policy_gradient_loss(
    logprobs: &Array2<f32>,
    seq: &[Vec<usize>],
    advantage: &Array2<f32>,
) -> Result<(f32, Array2<f32>)> {
    let mask = shifted_mask(seq);
    if mask.dim() != logprobs.dim() || advantage.dim() != logprobs.dim() {
        return Err(DaeError::InvalidData(format!(
            "形状不一致: logprobs {:?}, seq {:?}, advantage {:?}",
            logprobs.dim(),
            mask.dim(),
            advantage.dim()
        )));
    }

    let mask_sum = mask.sum();
    if mask_sum <= 0.0 {
        return Err(DaeError::InvalidData("空批次无法计算损失".to_string()));
    }

    let weighted = advantage * &mask;
    let loss = -(logprobs * &weighted).sum() / mask_sum;
    if !loss.is_finite() {
        return Err(DaeError::NumericalDegeneracy(format!("损失为 {}", loss)));
    }

    let grad = weighted.mapv(|w| -w / mask_sum);
    Ok((loss, grad))
}
