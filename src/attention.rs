//! # 字幕注意力（Additive / Bahdanau Attention）
//!
//! 解码器的每个时间步，用 attention-LSTM 的隐藏状态去"查询"编码器输出的逐词特征，
//! 得到一个上下文向量。
//!
//! ## 数学原理
//!
//! ```text
//! score[b,t] = w · tanh( W_f · feat[b,t] + W_d · h[b] ) + c
//! score[b,t] = -1e10                 若 mask[b,t] == 0
//! alpha[b,:] = softmax(score[b,:])
//! ctx[b]     = Σ_t alpha[b,t] · feat[b,t]
//! ```
//!
//! `W_f · feat` 与时间步无关，每个批次只算一次（[`AttentionInputs`]），
//! 它的梯度在所有时间步上累积，最后统一反传（[`CaptionAttention::backward_features`]）。
//!
//! ## 掩码
//!
//! 被掩码的位置使用有限的大负数 [`MASK_FILL`] 而不是 -∞，softmax 后这些位置的权重为 0。
//! 一整行都被掩码意味着上一版字幕长度为 0，属于数据错误，在构造输入时就会被拒绝。

use ndarray::{Array2, Array3, Axis};
use rand::Rng;

use crate::MASK_FILL;
use crate::error::{DaeError, Result};
use crate::linear::Linear;
use crate::param::{Layer, NamedParam, join_name};
use crate::utils::softmax;

/// **Softmax 梯度**
///
/// 梯度公式: ∂L/∂x_i = y_i * (∂L/∂y_i - sum_j(y_j * ∂L/∂y_j))
fn softmax_gradient(softmax_output: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
    let mut grad_input = Array2::zeros(softmax_output.dim());

    for (i, (sm_row, grad_row)) in softmax_output
        .rows()
        .into_iter()
        .zip(grad_output.rows())
        .enumerate()
    {
        let dot_product: f32 = sm_row
            .iter()
            .zip(grad_row.iter())
            .map(|(&y, &g)| y * g)
            .sum();

        for (j, (&y_val, &g_val)) in sm_row.iter().zip(grad_row.iter()).enumerate() {
            grad_input[[i, j]] = y_val * (g_val - dot_product);
        }
    }

    grad_input
}

/// (B, T, D) → (B·T, D)，按行主序展开
pub(crate) fn flatten(x: &Array3<f32>) -> Array2<f32> {
    let (b, t, d) = x.dim();
    Array2::from_shape_fn((b * t, d), |(row, k)| x[[row / t.max(1), row % t.max(1), k]])
}

/// (B·T, D) → (B, T, D)
pub(crate) fn unflatten(x: &Array2<f32>, batch: usize, steps: usize) -> Array3<f32> {
    Array3::from_shape_fn((batch, steps, x.ncols()), |(b, t, k)| x[[b * steps + t, k]])
}

/// 每个批次只计算一次的注意力输入
#[derive(Clone, Debug)]
pub struct AttentionInputs {
    /// 编码器逐词特征 (B, T, F)，填充位置为 0
    pub features: Array3<f32>,
    /// `W_f · feat + b_f` (B, T, A)
    pub projected: Array3<f32>,
    /// 有效位置掩码 (B, T)
    pub mask: Array2<f32>,
}

impl AttentionInputs {
    pub fn batch_size(&self) -> usize {
        self.features.dim().0
    }

    /// 按行选取（束搜索重排假设时使用）
    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            features: self.features.select(Axis(0), rows),
            projected: self.projected.select(Axis(0), rows),
            mask: self.mask.select(Axis(0), rows),
        }
    }
}

/// 一个时间步的反向传播缓存
#[derive(Clone, Debug)]
pub struct AttentionCache {
    pub hidden: Array2<f32>,
    /// tanh 之后的值，展开为 (B·T, A)
    pub activated: Array2<f32>,
    /// 注意力分布 (B, T)
    pub alpha: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct CaptionAttention {
    pub feature_att: Linear,
    pub decoder_att: Linear,
    pub full_att: Linear,
}

impl CaptionAttention {
    pub fn new<R: Rng>(feature_dim: usize, decoder_dim: usize, attention_dim: usize, rng: &mut R) -> Self {
        Self {
            feature_att: Linear::new(feature_dim, attention_dim, rng),
            decoder_att: Linear::new(decoder_dim, attention_dim, rng),
            full_att: Linear::new(attention_dim, 1, rng),
        }
    }

    /// 预先计算特征投影并校验掩码：每一行至少要有一个有效位置
    pub fn prepare(&self, features: &Array3<f32>, mask: &Array2<f32>) -> Result<AttentionInputs> {
        let (batch, steps, _) = features.dim();
        if mask.dim() != (batch, steps) {
            return Err(DaeError::InvalidData(format!(
                "mask 形状 {:?} 与特征 {:?} 不一致",
                mask.dim(),
                features.dim()
            )));
        }
        if let Some(row) = mask.rows().into_iter().position(|r| r.sum() == 0.0) {
            return Err(DaeError::NumericalDegeneracy(format!(
                "第 {} 行注意力掩码全为 0（上一版字幕长度为 0）",
                row
            )));
        }

        let projected = unflatten(&self.feature_att.forward(&flatten(features)), batch, steps);
        Ok(AttentionInputs {
            features: features.clone(),
            projected,
            mask: mask.clone(),
        })
    }

    /// **前向传播一个时间步**：返回上下文向量 (B, F)
    pub fn forward(&self, inputs: &AttentionInputs, hidden: &Array2<f32>) -> (Array2<f32>, AttentionCache) {
        let (batch, steps, feat_dim) = inputs.features.dim();
        let att2 = self.decoder_att.forward(hidden);
        let attention_dim = att2.ncols();

        let activated = Array2::from_shape_fn((batch * steps, attention_dim), |(row, k)| {
            let (b, t) = (row / steps, row % steps);
            (inputs.projected[[b, t, k]] + att2[[b, k]]).tanh()
        });
        let raw_scores = self.full_att.forward(&activated);

        let scores = Array2::from_shape_fn((batch, steps), |(b, t)| {
            if inputs.mask[[b, t]] == 0.0 {
                MASK_FILL
            } else {
                raw_scores[[b * steps + t, 0]]
            }
        });
        let alpha = softmax(&scores);

        let mut context = Array2::zeros((batch, feat_dim));
        for b in 0..batch {
            let weights = alpha.row(b);
            let weighted = weights.dot(&inputs.features.index_axis(Axis(0), b));
            context.row_mut(b).assign(&weighted);
        }

        let cache = AttentionCache {
            hidden: hidden.clone(),
            activated,
            alpha,
        };
        (context, cache)
    }

    /// **反向传播一个时间步**
    ///
    /// 把对特征和特征投影的梯度累积进 `d_features`、`d_projected`，返回对解码器隐藏状态的梯度。
    pub fn backward(
        &mut self,
        inputs: &AttentionInputs,
        cache: &AttentionCache,
        d_context: &Array2<f32>,
        d_features: &mut Array3<f32>,
        d_projected: &mut Array3<f32>,
    ) -> Array2<f32> {
        let (batch, steps, _) = inputs.features.dim();

        // ctx = Σ_t alpha·feat
        let mut d_alpha = Array2::zeros((batch, steps));
        for b in 0..batch {
            let feats = inputs.features.index_axis(Axis(0), b);
            let dc = d_context.row(b);
            d_alpha.row_mut(b).assign(&feats.dot(&dc));
            for t in 0..steps {
                let a = cache.alpha[[b, t]];
                let mut target = d_features.index_axis_mut(Axis(0), b);
                let mut row = target.row_mut(t);
                row.scaled_add(a, &dc);
            }
        }

        // 被掩码的位置分数是常数，没有梯度
        let mut d_scores = softmax_gradient(&cache.alpha, &d_alpha);
        d_scores.zip_mut_with(&inputs.mask, |g, &m| {
            if m == 0.0 {
                *g = 0.0;
            }
        });

        let d_scores_flat = Array2::from_shape_fn((batch * steps, 1), |(row, _)| {
            d_scores[[row / steps, row % steps]]
        });
        let d_activated = self.full_att.backward(&cache.activated, &d_scores_flat);
        let d_pre = &d_activated * &cache.activated.mapv(|v| 1.0 - v * v);

        *d_projected += &unflatten(&d_pre, batch, steps);

        let d_att2: Array2<f32> = unflatten(&d_pre, batch, steps).sum_axis(Axis(1));
        self.decoder_att.backward(&cache.hidden, &d_att2)
    }

    /// 把所有时间步累积的 `d_projected` 反传过特征投影层，返回对特征的额外梯度
    pub fn backward_features(&mut self, inputs: &AttentionInputs, d_projected: &Array3<f32>) -> Array3<f32> {
        let (batch, steps, _) = inputs.features.dim();
        let d_flat = self
            .feature_att
            .backward(&flatten(&inputs.features), &flatten(d_projected));
        unflatten(&d_flat, batch, steps)
    }

    /// 注意力分布，仅用于调试和测试
    pub fn weights(&self, inputs: &AttentionInputs, hidden: &Array2<f32>) -> Array2<f32> {
        self.forward(inputs, hidden).1.alpha
    }
}

impl Layer for CaptionAttention {
    fn layer_type(&self) -> &str {
        "CaptionAttention"
    }

    fn named_params(&mut self, prefix: &str) -> Vec<NamedParam<'_>> {
        let mut params = self.feature_att.named_params(&join_name(prefix, "feature_att"));
        params.extend(self.decoder_att.named_params(&join_name(prefix, "decoder_att")));
        params.extend(self.full_att.named_params(&join_name(prefix, "full_att")));
        params
    }
}

/// 长度为 T 的掩码行，前 `len` 个位置为 1
pub fn length_mask(lengths: &[usize], steps: usize) -> Array2<f32> {
    Array2::from_shape_fn((lengths.len(), steps), |(b, t)| if t < lengths[b] { 1.0 } else { 0.0 })
}

/// 旧式掩码：特征行之和不为 0 即视为有效
pub fn feature_sum_mask(features: &Array3<f32>) -> Array2<f32> {
    let sums: Array2<f32> = features.sum_axis(Axis(2));
    sums.mapv(|s| if s != 0.0 { 1.0 } else { 0.0 })
}
