//! # 束搜索（评估专用）
//!
//! 同时维护 K 个假设及其累计 log-probability。每一步把 K×V 的得分展平，取全局前 K，
//! 再用整数除法 / 取模恢复来源假设和新词：
//!
//! ```text
//! prev = flat / V      next = flat % V
//! ```
//!
//! 第 1 步所有假设都相同，只展开第 0 行。生成 `<end>` 的假设移出束并记录得分，束宽随之缩小。
//! 超过步数上限仍未全部结束时，取剩下的第一个假设截断到生成长度，并标记为退化结果。

use std::cmp::Ordering;

use ndarray::Array2;
use rand::Rng;

use crate::error::{DaeError, Result};
use crate::generation::StepModel;

/// 束搜索需要能按来源假设重排内部状态
pub trait BeamStep: StepModel {
    /// 只保留 `rows` 指定的行（可重复，可缩小）
    fn reorder(&mut self, rows: &[usize]);
}

#[derive(Clone, Debug)]
pub struct BeamSearchConfig {
    pub beam_size: usize,
    pub start_id: usize,
    pub end_id: usize,
    /// 步数上限，超过后放弃
    pub max_steps: usize,
    /// 退化结果截断长度（含 `<start>`）
    pub max_len: usize,
}

/// 束搜索的输出
#[derive(Clone, Debug)]
pub struct BeamHypothesis {
    /// 以 `<start>` 开头；正常结束时以 `<end>` 结尾
    pub tokens: Vec<usize>,
    pub score: f32,
    /// 没有任何假设在步数上限内结束
    pub degenerate: bool,
    /// 终止时的步数（从 1 开始计）
    pub steps: usize,
    /// 每一步开始时的束宽
    pub widths: Vec<usize>,
}

/// 取得分最高的 k 个下标；得分相同时下标小的优先
fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    indexed.truncate(k);
    indexed
}

/// **束搜索**
pub fn beam_search<M: BeamStep, R: Rng>(
    model: &mut M,
    config: &BeamSearchConfig,
    rng: &mut R,
) -> Result<BeamHypothesis> {
    if config.beam_size == 0 {
        return Err(DaeError::InvalidDecodeMode("束宽必须大于 0".to_string()));
    }

    let mut k = config.beam_size;
    let mut prev_words = vec![config.start_id; k];
    let mut seqs: Vec<Vec<usize>> = vec![vec![config.start_id]; k];
    let mut top_scores = vec![0.0f32; k];

    let mut complete_seqs: Vec<Vec<usize>> = Vec::new();
    let mut complete_scores: Vec<f32> = Vec::new();
    let mut widths = Vec::new();
    let mut degenerate = false;
    let mut step = 1usize;

    loop {
        widths.push(k);
        let log_probs: Array2<f32> = model.step(&prev_words, rng)?;
        let vocab_size = log_probs.ncols();
        if log_probs.nrows() != k || vocab_size == 0 {
            return Err(DaeError::InvalidData(format!(
                "束搜索期望 ({}, V) 的分布，得到 {:?}",
                k,
                log_probs.dim()
            )));
        }

        // 第 1 步只展开第 0 行，展平下标恰好也落在第 0 行
        let rows = if step == 1 { 1 } else { k };
        let mut flat = Vec::with_capacity(rows * vocab_size);
        for (i, &base) in top_scores.iter().enumerate().take(rows) {
            flat.extend(log_probs.row(i).iter().map(|&lp| base + lp));
        }
        let best = top_k(&flat, k);

        let prev_inds: Vec<usize> = best.iter().map(|&(idx, _)| idx / vocab_size).collect();
        let next_words: Vec<usize> = best.iter().map(|&(idx, _)| idx % vocab_size).collect();
        let new_scores: Vec<f32> = best.iter().map(|&(_, s)| s).collect();

        let new_seqs: Vec<Vec<usize>> = prev_inds
            .iter()
            .zip(next_words.iter())
            .map(|(&p, &w)| {
                let mut seq = seqs[p].clone();
                seq.push(w);
                seq
            })
            .collect();

        let mut incomplete = Vec::new();
        for (j, &word) in next_words.iter().enumerate() {
            if word == config.end_id {
                complete_seqs.push(new_seqs[j].clone());
                complete_scores.push(new_scores[j]);
            } else {
                incomplete.push(j);
            }
        }
        k = incomplete.len();

        if k == 0 {
            break;
        }

        seqs = incomplete.iter().map(|&j| new_seqs[j].clone()).collect();
        let origins: Vec<usize> = incomplete.iter().map(|&j| prev_inds[j]).collect();
        model.reorder(&origins);
        top_scores = incomplete.iter().map(|&j| new_scores[j]).collect();
        prev_words = incomplete.iter().map(|&j| next_words[j]).collect();

        if step > config.max_steps {
            degenerate = true;
            break;
        }
        step += 1;
    }

    if degenerate || complete_seqs.is_empty() {
        log::warn!("束搜索在 {} 步内没有结束，输出截断的假设", step);
        let mut tokens = seqs.first().cloned().unwrap_or_default();
        tokens.truncate(config.max_len);
        return Ok(BeamHypothesis {
            tokens,
            score: top_scores.first().copied().unwrap_or(f32::NEG_INFINITY),
            degenerate: true,
            steps: step,
            widths,
        });
    }

    // 得分相同时取最先完成的
    let mut best_idx = 0;
    for (i, &score) in complete_scores.iter().enumerate() {
        if score > complete_scores[best_idx] {
            best_idx = i;
        }
    }

    Ok(BeamHypothesis {
        tokens: complete_seqs.swap_remove(best_idx),
        score: complete_scores[best_idx],
        degenerate: false,
        steps: step,
        widths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// 每一步都给出同样分布的模型
    struct Fixed {
        log_probs: Vec<f32>,
        reorders: usize,
    }

    impl StepModel for Fixed {
        fn step<R: Rng>(&mut self, tokens: &[usize], _rng: &mut R) -> Result<Array2<f32>> {
            let v = self.log_probs.len();
            Ok(Array2::from_shape_fn((tokens.len(), v), |(_, j)| self.log_probs[j]))
        }
    }

    impl BeamStep for Fixed {
        fn reorder(&mut self, _rows: &[usize]) {
            self.reorders += 1;
        }
    }

    fn config() -> BeamSearchConfig {
        BeamSearchConfig {
            beam_size: 3,
            start_id: 1,
            end_id: 2,
            max_steps: 50,
            max_len: 18,
        }
    }

    #[test]
    fn test_top_k_ties_prefer_lower_index() {
        let best = top_k(&[0.5, 1.0, 1.0, 0.2], 2);
        assert_eq!(best, vec![(1, 1.0), (2, 1.0)]);
    }

    #[test]
    fn test_first_step_uses_single_row() {
        // 第 1 步若展开全部 3 行，同一个续写会出现 3 次
        let mut model = Fixed { log_probs: vec![-3.0, -2.0, -0.1, -1.0], reorders: 0 };
        let mut rng = StdRng::seed_from_u64(0);
        let result = beam_search(&mut model, &config(), &mut rng).unwrap();
        assert!(!result.degenerate);
        assert_eq!(result.tokens, vec![1, 2]);
        assert_eq!(result.widths, vec![3, 2, 1]);
        assert_eq!(model.reorders, 2);
    }
}
