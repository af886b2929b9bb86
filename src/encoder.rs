//! # 字幕编码器（Bidirectional LSTM）
//!
//! 读取上一版字幕，输出：
//!
//! - 逐词特征 `(B, T, 2H)`，T 为本批次最长的有效长度，填充位置全为 0；
//! - 有效位置掩码 `(B, T)`；
//! - 汇总向量 `tanh(Linear([h_fwd_last, h_bwd_last]))`。
//!
//! ## 变长序列
//!
//! 不要求调用方按长度排序。每个时间步对整批计算 LSTM，再按行混合：
//!
//! ```text
//! h_t = m_t · h_cell + (1 - m_t) · h_{t-1}        m_t[b] = 1 若 t < len[b]
//! out_t = m_t · h_cell
//! ```
//!
//! 无效时间步上状态保持不变、输出为 0，因此前向方向的最终状态就是第 `len-1` 步的状态，
//! 后向方向从全零状态开始，在 `t >= len` 的位置上一直保持为零。

use ndarray::{Array2, Array3, Axis, s};
use rand::Rng;

use crate::attention::{feature_sum_mask, length_mask};
use crate::config::{DaeConfig, MaskSource};
use crate::embeddings::{EmbeddingCache, TextEmbedding};
use crate::error::{DaeError, Result};
use crate::linear::Linear;
use crate::lstm::{LstmCache, LstmCell};
use crate::param::{Layer, NamedParam, join_name};
use crate::utils::concat_columns;

#[derive(Clone, Debug)]
pub struct EncoderOutput {
    pub features: Array3<f32>,
    pub mask: Array2<f32>,
    pub summary: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct EncoderCache {
    embeddings: Vec<EmbeddingCache>,
    forward_steps: Vec<LstmCache>,
    backward_steps: Vec<LstmCache>,
    /// 由长度得到的逐步掩码，与 [`MaskSource`] 无关
    step_mask: Array2<f32>,
    final_state: Array2<f32>,
    summary: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct CaptionEncoder {
    pub forward_lstm: LstmCell,
    pub backward_lstm: LstmCell,
    pub summary: Linear,
    pub mask_source: MaskSource,
}

fn mask_column(mask: &Array2<f32>, t: usize) -> Array2<f32> {
    mask.column(t).to_owned().insert_axis(Axis(1))
}

fn blend(mask: &Array2<f32>, new: &Array2<f32>, old: &Array2<f32>) -> Array2<f32> {
    mask * new + &(mask.mapv(|m| 1.0 - m) * old)
}

impl CaptionEncoder {
    pub fn new<R: Rng>(config: &DaeConfig, embedding_dim: usize, rng: &mut R) -> Self {
        Self {
            forward_lstm: LstmCell::new(embedding_dim, config.encoder_dim, rng),
            backward_lstm: LstmCell::new(embedding_dim, config.encoder_dim, rng),
            summary: Linear::new(config.feature_dim(), config.summary_dim, rng),
            mask_source: config.mask_source,
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.forward_lstm.hidden_dim
    }

    /// 校验长度并返回本批次的最大有效长度
    fn check_lengths(captions: &[Vec<usize>], lengths: &[usize]) -> Result<usize> {
        if captions.is_empty() {
            return Err(DaeError::InvalidData("编码器输入批次为空".to_string()));
        }
        if captions.len() != lengths.len() {
            return Err(DaeError::InvalidData(format!(
                "字幕数 {} 与长度数 {} 不一致",
                captions.len(),
                lengths.len()
            )));
        }
        for (row, (caption, &len)) in captions.iter().zip(lengths).enumerate() {
            if len == 0 {
                return Err(DaeError::InvalidData(format!("第 {} 条上一版字幕长度为 0", row)));
            }
            if len > caption.len() {
                return Err(DaeError::InvalidData(format!(
                    "第 {} 条字幕长度 {} 超过其宽度 {}",
                    row,
                    len,
                    caption.len()
                )));
            }
        }
        Ok(lengths.iter().copied().max().unwrap_or(0))
    }

    /// **前向传播**
    pub fn forward<R: Rng>(
        &self,
        embedding: &TextEmbedding,
        captions: &[Vec<usize>],
        lengths: &[usize],
        rng: &mut R,
    ) -> Result<(EncoderOutput, EncoderCache)> {
        let steps = Self::check_lengths(captions, lengths)?;
        let batch = captions.len();
        let hd = self.hidden_dim();
        let step_mask = length_mask(lengths, steps);

        let mut inputs = Vec::with_capacity(steps);
        let mut embeddings = Vec::with_capacity(steps);
        for t in 0..steps {
            // 宽度不足的行按 pad 处理
            let ids: Vec<usize> = captions.iter().map(|c| c.get(t).copied().unwrap_or(0)).collect();
            let (x, cache) = embedding.forward(&ids, rng)?;
            inputs.push(x);
            embeddings.push(cache);
        }

        let mut features = Array3::zeros((batch, steps, 2 * hd));

        let (mut h, mut c) = self.forward_lstm.zero_state(batch);
        let mut forward_steps = Vec::with_capacity(steps);
        for t in 0..steps {
            let m = mask_column(&step_mask, t);
            let (h_new, c_new, cache) = self.forward_lstm.forward(&inputs[t], &h, &c);
            features
                .slice_mut(s![.., t, 0..hd])
                .assign(&(&m * &h_new));
            h = blend(&m, &h_new, &h);
            c = blend(&m, &c_new, &c);
            forward_steps.push(cache);
        }
        let h_forward = h;

        let (mut h, mut c) = self.backward_lstm.zero_state(batch);
        let mut backward_steps = Vec::with_capacity(steps);
        for t in (0..steps).rev() {
            let m = mask_column(&step_mask, t);
            let (h_new, c_new, cache) = self.backward_lstm.forward(&inputs[t], &h, &c);
            features
                .slice_mut(s![.., t, hd..2 * hd])
                .assign(&(&m * &h_new));
            h = blend(&m, &h_new, &h);
            c = blend(&m, &c_new, &c);
            backward_steps.push(cache);
        }
        // 按时间顺序存放
        backward_steps.reverse();
        let h_backward = h;

        let final_state = concat_columns(&[h_forward.view(), h_backward.view()])?;
        let summary = self.summary.forward(&final_state).mapv(f32::tanh);

        let mask = match self.mask_source {
            MaskSource::Length => step_mask.clone(),
            MaskSource::FeatureSum => feature_sum_mask(&features),
        };

        let output = EncoderOutput {
            features,
            mask,
            summary: summary.clone(),
        };
        let cache = EncoderCache {
            embeddings,
            forward_steps,
            backward_steps,
            step_mask,
            final_state,
            summary,
        };
        Ok((output, cache))
    }

    /// **随时间反向传播**
    ///
    /// `d_features` 与 `d_summary` 来自解码器，梯度最终累积进两个 LSTM、汇总投影和词嵌入。
    pub fn backward(
        &mut self,
        embedding: &mut TextEmbedding,
        cache: &EncoderCache,
        d_features: &Array3<f32>,
        d_summary: &Array2<f32>,
    ) {
        let hd = self.hidden_dim();
        let steps = cache.step_mask.ncols();

        let d_pre = d_summary * &cache.summary.mapv(|v| 1.0 - v * v);
        let d_final = self.summary.backward(&cache.final_state, &d_pre);

        let mut d_inputs: Vec<Array2<f32>> = Vec::with_capacity(steps);

        let mut dh = d_final.slice(s![.., 0..hd]).to_owned();
        let mut dc = Array2::zeros(dh.dim());
        let mut forward_dx = vec![None; steps];
        for t in (0..steps).rev() {
            let m = mask_column(&cache.step_mask, t);
            let keep = m.mapv(|v| 1.0 - v);
            let d_out = d_features.slice(s![.., t, 0..hd]);
            let dh_new = &m * &(&dh + &d_out);
            let dc_new = &m * &dc;
            let (dx, dh_prev, dc_prev) = self.forward_lstm.backward(&cache.forward_steps[t], &dh_new, &dc_new);
            dh = dh_prev + &(&keep * &dh);
            dc = dc_prev + &(&keep * &dc);
            forward_dx[t] = Some(dx);
        }

        let mut dh = d_final.slice(s![.., hd..2 * hd]).to_owned();
        let mut dc = Array2::zeros(dh.dim());
        for t in 0..steps {
            let m = mask_column(&cache.step_mask, t);
            let keep = m.mapv(|v| 1.0 - v);
            let d_out = d_features.slice(s![.., t, hd..2 * hd]);
            let dh_new = &m * &(&dh + &d_out);
            let dc_new = &m * &dc;
            let (dx, dh_prev, dc_prev) = self.backward_lstm.backward(&cache.backward_steps[t], &dh_new, &dc_new);
            dh = dh_prev + &(&keep * &dh);
            dc = dc_prev + &(&keep * &dc);
            let total = match forward_dx[t].take() {
                Some(fx) => fx + &dx,
                None => dx,
            };
            d_inputs.push(total);
        }

        for (emb_cache, d_x) in cache.embeddings.iter().zip(d_inputs.iter()) {
            embedding.backward(emb_cache, d_x);
        }
    }
}

impl Layer for CaptionEncoder {
    fn layer_type(&self) -> &str {
        "CaptionEncoder"
    }

    fn named_params(&mut self, prefix: &str) -> Vec<NamedParam<'_>> {
        let mut params = self.forward_lstm.named_params(&join_name(prefix, "forward_lstm"));
        params.extend(self.backward_lstm.named_params(&join_name(prefix, "backward_lstm")));
        params.extend(self.summary.named_params(&join_name(prefix, "summary")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn build() -> (CaptionEncoder, TextEmbedding, StdRng) {
        let mut rng = StdRng::seed_from_u64(5);
        let config = DaeConfig::tiny(9);
        let embedding = TextEmbedding::new(9, config.embedding_dim, 0.0, &mut rng);
        let encoder = CaptionEncoder::new(&config, config.embedding_dim, &mut rng);
        (encoder, embedding, rng)
    }

    #[test]
    fn test_padding_rows_are_zero() {
        let (encoder, embedding, mut rng) = build();
        let captions = vec![vec![3, 4, 0, 0], vec![5, 6, 7, 8]];
        let (out, _) = encoder.forward(&embedding, &captions, &[2, 4], &mut rng).unwrap();
        assert_eq!(out.features.dim(), (2, 4, 12));
        assert!(out.features.slice(s![0, 2.., ..]).iter().all(|&v| v == 0.0));
        assert!(out.features.slice(s![1, 3, ..]).iter().any(|&v| v != 0.0));
        assert_eq!(out.mask, length_mask(&[2, 4], 4));
        assert_eq!(out.summary.dim(), (2, 8));
    }

    #[test]
    fn test_padding_does_not_change_result() {
        // 同一条字幕，无论补多少 pad、和谁同批，结果都一样
        let (encoder, embedding, mut rng) = build();
        let (alone, _) = encoder.forward(&embedding, &[vec![3, 4]], &[2], &mut rng).unwrap();
        let (batched, _) = encoder
            .forward(&embedding, &[vec![5, 6, 7], vec![3, 4, 0]], &[3, 2], &mut rng)
            .unwrap();
        for (a, b) in alone.summary.row(0).iter().zip(batched.summary.row(1).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        for t in 0..2 {
            for k in 0..12 {
                assert!((alone.features[[0, t, k]] - batched.features[[1, t, k]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let (encoder, embedding, mut rng) = build();
        let result = encoder.forward(&embedding, &[vec![3, 4], vec![0, 0]], &[2, 0], &mut rng);
        assert!(matches!(result, Err(DaeError::InvalidData(_))));
    }

    #[test]
    fn test_backward_reaches_embedding() {
        let (mut encoder, mut embedding, mut rng) = build();
        embedding.table.value.mapv_inplace(f32::abs);
        let captions = vec![vec![3, 4, 0], vec![5, 6, 7]];
        let (out, cache) = encoder.forward(&embedding, &captions, &[2, 3], &mut rng).unwrap();
        let d_features = Array3::ones(out.features.dim());
        let d_summary = Array2::ones(out.summary.dim());
        encoder.backward(&mut embedding, &cache, &d_features, &d_summary);
        assert!(embedding.table.grad.row(3).iter().any(|&g| g != 0.0));
        assert!(embedding.table.grad.row(7).iter().any(|&g| g != 0.0));
        // 填充位置的输入没有梯度
        assert!(embedding.table.grad.row(0).iter().all(|&g| g == 0.0));
        assert!(encoder.summary.weight.grad.iter().any(|&g| g != 0.0));
    }
}
