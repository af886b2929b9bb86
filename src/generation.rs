//! # 按批展开的序列生成
//!
//! 贪心解码和随机采样共用同一个展开循环，区别只在每一步怎么选词。
//! 循环共 `L + 1` 次：最后一次只计算分布，不再选词。
//!
//! 每一步的约定：
//!
//! - 选中的词若为 `<end>`，存储时改写为 0（pad 与结束符共用 0）；
//! - 每条序列有一个 "未结束" 标志，初始为 true，每步与 `token > 0` 取与；
//! - 标志变为 false 之后，该序列后续位置一律为 0；
//! - 整批都结束时提前退出。

use ndarray::Array2;
use rand::Rng;

use crate::error::{DaeError, Result};
use crate::utils::{argmax, sample_categorical};

/// 解码策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeMode {
    /// 每步取概率最大的词
    Greedy,
    /// 按 softmax 分布采样
    Sample,
    /// 束搜索，仅用于评估
    Beam { width: usize },
}

impl DecodeMode {
    /// 由两个布尔开关构造：恰好一个为 true 才合法
    pub fn from_flags(sample_max: bool, sample_rl: bool) -> Result<Self> {
        match (sample_max, sample_rl) {
            (true, false) => Ok(DecodeMode::Greedy),
            (false, true) => Ok(DecodeMode::Sample),
            (true, true) => Err(DaeError::InvalidDecodeMode(
                "sample_max 与 sample_rl 不能同时为 true".to_string(),
            )),
            (false, false) => Err(DaeError::InvalidDecodeMode(
                "必须选择 sample_max 或 sample_rl 之一".to_string(),
            )),
        }
    }

    pub fn beam(width: usize) -> Result<Self> {
        if width == 0 {
            return Err(DaeError::InvalidDecodeMode("束宽必须大于 0".to_string()));
        }
        Ok(DecodeMode::Beam { width })
    }
}

/// 能逐步给出下一个词分布的模型
///
/// 解码状态（隐藏状态、注意力输入等）归实现者所有，只在一次解码调用内有效。
pub trait StepModel {
    /// 输入本步的词 (B)，返回 log-probabilities (B, V)
    fn step<R: Rng>(&mut self, tokens: &[usize], rng: &mut R) -> Result<Array2<f32>>;
}

/// 一次展开的结果
#[derive(Clone, Debug)]
pub struct Generation {
    /// 存储用的序列 (B × L)，结束后为 0
    pub seq: Vec<Vec<usize>>,
    /// 每步选中词的 log-probability (B, L)
    pub logprobs: Array2<f32>,
    /// 每步实际选中的词（改写和置零之前），`chosen[t][b]`，反向传播时用来定位 log-probability
    pub chosen: Vec<Vec<usize>>,
    /// 实际执行了选词的步数
    pub steps: usize,
}

impl Generation {
    pub fn batch_size(&self) -> usize {
        self.seq.len()
    }

    pub fn max_len(&self) -> usize {
        self.logprobs.ncols()
    }
}

/// **展开生成**
///
/// `mode` 只能是 [`DecodeMode::Greedy`] 或 [`DecodeMode::Sample`]。
pub fn unroll<M: StepModel, R: Rng>(
    model: &mut M,
    batch_size: usize,
    start_id: usize,
    end_id: usize,
    max_len: usize,
    mode: DecodeMode,
    rng: &mut R,
) -> Result<Generation> {
    if let DecodeMode::Beam { .. } = mode {
        return Err(DaeError::InvalidDecodeMode(
            "束搜索不走按批展开，请使用 beam_search".to_string(),
        ));
    }

    let mut seq = vec![vec![0usize; max_len]; batch_size];
    let mut logprobs = Array2::zeros((batch_size, max_len));
    let mut chosen = Vec::with_capacity(max_len);
    let mut unfinished = vec![true; batch_size];
    let mut tokens = vec![start_id; batch_size];
    let mut steps = 0;

    for t in 0..=max_len {
        let log_probs = model.step(&tokens, rng)?;
        if log_probs.nrows() != batch_size {
            return Err(DaeError::InvalidData(format!(
                "模型返回 {} 行分布，批大小为 {}",
                log_probs.nrows(),
                batch_size
            )));
        }
        if t == max_len {
            break;
        }

        let mut picked = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let row = log_probs.row(b);
            let (token, lp) = match mode {
                DecodeMode::Sample => {
                    let token = sample_categorical(row, rng);
                    (token, row[token])
                }
                _ => argmax(row),
            };
            picked.push(token);

            let stored = if token == end_id { 0 } else { token };
            unfinished[b] = unfinished[b] && stored > 0;
            let stored = if unfinished[b] { stored } else { 0 };

            seq[b][t] = stored;
            logprobs[[b, t]] = lp;
            tokens[b] = stored;
        }
        chosen.push(picked);
        steps = t + 1;

        if unfinished.iter().all(|&u| !u) {
            break;
        }
    }

    Ok(Generation {
        seq,
        logprobs,
        chosen,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// 按预设脚本输出 one-hot 分布的模型
    struct Scripted {
        vocab: usize,
        script: Vec<usize>,
        calls: usize,
    }

    impl StepModel for Scripted {
        fn step<R: Rng>(&mut self, tokens: &[usize], _rng: &mut R) -> Result<Array2<f32>> {
            let next = self.script.get(self.calls).copied().unwrap_or(0);
            self.calls += 1;
            Ok(Array2::from_shape_fn((tokens.len(), self.vocab), |(_, v)| {
                if v == next { 0.0 } else { -20.0 }
            }))
        }
    }

    #[test]
    fn test_from_flags() {
        assert_eq!(DecodeMode::from_flags(true, false).unwrap(), DecodeMode::Greedy);
        assert_eq!(DecodeMode::from_flags(false, true).unwrap(), DecodeMode::Sample);
        assert!(matches!(
            DecodeMode::from_flags(true, true),
            Err(DaeError::InvalidDecodeMode(_))
        ));
        assert!(matches!(
            DecodeMode::from_flags(false, false),
            Err(DaeError::InvalidDecodeMode(_))
        ));
        assert!(DecodeMode::beam(0).is_err());
    }

    #[test]
    fn test_end_rewritten_and_early_exit() {
        let mut model = Scripted { vocab: 5, script: vec![3, 4, 2, 3], calls: 0 };
        let mut rng = StdRng::seed_from_u64(0);
        let generation = unroll(&mut model, 2, 1, 2, 6, DecodeMode::Greedy, &mut rng).unwrap();
        assert_eq!(generation.seq[0], vec![3, 4, 0, 0, 0, 0]);
        assert_eq!(generation.steps, 3);
        assert_eq!(model.calls, 3);
        assert_eq!(generation.chosen[2], vec![2, 2]);
    }

    #[test]
    fn test_runs_l_plus_one_iterations() {
        let mut model = Scripted { vocab: 5, script: vec![3; 10], calls: 0 };
        let mut rng = StdRng::seed_from_u64(0);
        let generation = unroll(&mut model, 1, 1, 2, 4, DecodeMode::Sample, &mut rng).unwrap();
        assert_eq!(generation.seq[0], vec![3, 3, 3, 3]);
        assert_eq!(generation.steps, 4);
        assert_eq!(model.calls, 5);
    }

    #[test]
    fn test_beam_mode_rejected() {
        let mut model = Scripted { vocab: 5, script: vec![], calls: 0 };
        let mut rng = StdRng::seed_from_u64(0);
        let result = unroll(&mut model, 1, 1, 2, 4, DecodeMode::Beam { width: 3 }, &mut rng);
        assert!(matches!(result, Err(DaeError::InvalidDecodeMode(_))));
    }
}
