//! # 自我批判奖励（Self-Critical Reward）
//!
//! `advantage[i] = CIDEr(sampled[i], refs[i]) - CIDEr(greedy[i], refs[i])`
//!
//! 采样结果和贪心结果放进同一次评分调用：第 `i` 项与第 `B + i` 项共用参考集合 `i % B`。
//! 序列不解码成单词，而是渲染成空格分隔的 ID 串，参考字幕用同样的规则预处理，
//! 保证假设与参考使用同一套字母表和截断规则。

use std::collections::HashMap;

use ndarray::Array2;

use crate::cider::CiderD;
use crate::error::{DaeError, Result};
use crate::vocab::Vocab;

/// 把 ID 序列渲染成评分用的字符串：逐个输出，遇到第一个 0 时输出它并停止
///
/// `[3, 4, 0, 0]` → `"3 4 0"`，`[3, 4, 5]` → `"3 4 5"`。
pub fn array_to_str(tokens: &[usize]) -> String {
    let mut parts = Vec::with_capacity(tokens.len());
    for &token in tokens {
        parts.push(token.to_string());
        if token == 0 {
            break;
        }
    }
    parts.join(" ")
}

/// 参考字幕预处理：去掉 `<start>` 和 `<pad>`，`<end>` 改写为 0
///
/// 输入为每张图片的若干条参考字幕。
pub fn preprocess_references(all_captions: &[Vec<Vec<usize>>], vocab: &Vocab) -> Vec<Vec<Vec<usize>>> {
    let (start, pad, end) = (vocab.start_id(), vocab.pad_id(), vocab.end_id());
    all_captions
        .iter()
        .map(|image_caps| {
            image_caps
                .iter()
                .map(|caption| {
                    caption
                        .iter()
                        .filter(|&&w| w != start && w != pad)
                        .map(|&w| if w == end { 0 } else { w })
                        .collect()
                })
                .collect()
        })
        .collect()
}

/// 一个批次的奖励
#[derive(Clone, Debug)]
pub struct SelfCriticalReward {
    /// 优势值按时间步广播后的矩阵 (B, L)
    pub advantage: Array2<f32>,
    pub sampled_scores: Vec<f64>,
    pub greedy_scores: Vec<f64>,
}

impl SelfCriticalReward {
    /// 每条序列的优势值（广播前）
    pub fn per_sequence(&self) -> Vec<f32> {
        self.advantage.column(0).to_vec()
    }

    pub fn mean_advantage(&self) -> f32 {
        if self.advantage.nrows() == 0 || self.advantage.ncols() == 0 {
            return 0.0;
        }
        self.advantage.column(0).mean().unwrap_or(0.0)
    }
}

/// **计算自我批判奖励**
///
/// `sampled`、`greedy` 为 (B × L) 的存储序列，`ground_truth` 为已经过
/// [`preprocess_references`] 的参考字幕。
pub fn self_critical_reward(
    sampled: &[Vec<usize>],
    greedy: &[Vec<usize>],
    ground_truth: &[Vec<Vec<usize>>],
    scorer: &CiderD,
) -> Result<SelfCriticalReward> {
    let batch_size = sampled.len();
    if greedy.len() != batch_size || ground_truth.len() != batch_size {
        return Err(DaeError::InvalidData(format!(
            "批大小不一致: sampled {}, greedy {}, references {}",
            batch_size,
            greedy.len(),
            ground_truth.len()
        )));
    }
    let max_len = sampled.first().map(Vec::len).unwrap_or(0);

    let mut res: Vec<(usize, Vec<String>)> = Vec::with_capacity(2 * batch_size);
    for (i, seq) in sampled.iter().enumerate() {
        res.push((i, vec![array_to_str(seq)]));
    }
    for (i, seq) in greedy.iter().enumerate() {
        res.push((batch_size + i, vec![array_to_str(seq)]));
    }

    let refs: Vec<Vec<String>> = ground_truth
        .iter()
        .map(|caps| caps.iter().map(|c| array_to_str(c)).collect())
        .collect();
    let gts: HashMap<usize, Vec<String>> = (0..2 * batch_size)
        .map(|i| (i, refs[i % batch_size].clone()))
        .collect();

    let (_, scores) = scorer.compute_score(&gts, &res)?;
    let (sampled_scores, greedy_scores) = scores.split_at(batch_size);

    let advantage = Array2::from_shape_fn((batch_size, max_len), |(b, _)| {
        (sampled_scores[b] - greedy_scores[b]) as f32
    });

    Ok(SelfCriticalReward {
        advantage,
        sampled_scores: sampled_scores.to_vec(),
        greedy_scores: greedy_scores.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_to_str_stops_after_first_zero() {
        assert_eq!(array_to_str(&[3, 4, 0, 0, 5]), "3 4 0");
        assert_eq!(array_to_str(&[3, 4, 5]), "3 4 5");
        assert_eq!(array_to_str(&[0, 3]), "0");
        assert_eq!(array_to_str(&[]), "");
    }

    #[test]
    fn test_preprocess_references() {
        let vocab = Vocab::new(vec!["<pad>", "<start>", "<end>", "a", "dog"]).unwrap();
        let caps = vec![vec![vec![1, 3, 4, 2, 0, 0]]];
        let processed = preprocess_references(&caps, &vocab);
        assert_eq!(processed, vec![vec![vec![3, 4, 0]]]);
        assert_eq!(array_to_str(&processed[0][0]), "3 4 0");
    }

    #[test]
    fn test_batch_size_mismatch_rejected() {
        let scorer = CiderD::from_corpus(&[vec!["3 0".to_string()]]).unwrap();
        let result = self_critical_reward(&[vec![3, 0]], &[], &[vec![vec![3, 0]]], &scorer);
        assert!(matches!(result, Err(DaeError::InvalidData(_))));
    }
}
