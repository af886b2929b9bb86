//! # 语料级 BLEU-1..4
//!
//! 与 COCO 字幕评测一致：先把所有图片的截断 n-gram 命中数、假设 n-gram 总数、
//! 假设长度和最接近的参考长度累加起来，最后统一计算几何平均和长度惩罚。
//! 所以这里不是逐句 BLEU 的平均。

use std::collections::HashMap;

pub const BLEU_N: usize = 4;

const TINY: f64 = 1e-15;
const SMALL: f64 = 1e-9;

fn extract_ngrams<'a>(tokens: &[&'a str], n: usize) -> HashMap<Vec<&'a str>, usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for window in tokens.windows(n) {
            *counts.entry(window.to_vec()).or_insert(0) += 1;
        }
    }
    counts
}

/// 长度差最小的参考长度，差值相同时取较短的那条
fn closest_ref_len(hyp_len: usize, ref_lens: &[usize]) -> usize {
    ref_lens
        .iter()
        .copied()
        .min_by_key(|&len| (len.abs_diff(hyp_len), len))
        .unwrap_or(0)
}

/// 累加所有 (假设, 参考集) 的统计量
#[derive(Clone, Debug, Default)]
pub struct BleuAccumulator {
    correct: [f64; BLEU_N],
    guess: [f64; BLEU_N],
    hyp_len: f64,
    ref_len: f64,
}

impl BleuAccumulator {
    pub fn add(&mut self, hypothesis: &str, references: &[String]) {
        let hyp: Vec<&str> = hypothesis.split_whitespace().collect();
        let refs: Vec<Vec<&str>> = references.iter().map(|r| r.split_whitespace().collect()).collect();
        let ref_lens: Vec<usize> = refs.iter().map(Vec::len).collect();

        self.hyp_len += hyp.len() as f64;
        self.ref_len += closest_ref_len(hyp.len(), &ref_lens) as f64;

        for k in 0..BLEU_N {
            let n = k + 1;
            self.guess[k] += hyp.len().saturating_sub(k) as f64;

            // 每个 n-gram 的命中数截断到单条参考中的最大出现次数
            let mut max_ref_counts: HashMap<Vec<&str>, usize> = HashMap::new();
            for reference in &refs {
                for (ngram, count) in extract_ngrams(reference, n) {
                    let entry = max_ref_counts.entry(ngram).or_insert(0);
                    *entry = (*entry).max(count);
                }
            }
            self.correct[k] += extract_ngrams(&hyp, n)
                .iter()
                .map(|(ngram, &count)| count.min(max_ref_counts.get(ngram).copied().unwrap_or(0)))
                .sum::<usize>() as f64;
        }
    }

    /// 返回 `[BLEU-1, BLEU-2, BLEU-3, BLEU-4]`
    pub fn scores(&self) -> [f64; BLEU_N] {
        let ratio = (self.hyp_len + TINY) / (self.ref_len + SMALL);
        let brevity = if ratio < 1.0 { (1.0 - 1.0 / ratio).exp() } else { 1.0 };

        let mut scores = [0.0; BLEU_N];
        let mut product = 1.0;
        for k in 0..BLEU_N {
            product *= (self.correct[k] + TINY) / (self.guess[k] + SMALL);
            scores[k] = product.powf(1.0 / (k + 1) as f64) * brevity;
        }
        scores
    }
}

/// 一次性计算整个语料的 BLEU-1..4，`pairs` 为 (假设, 参考集)
pub fn corpus_bleu<'a, I>(pairs: I) -> [f64; BLEU_N]
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let mut acc = BleuAccumulator::default();
    for (hypothesis, references) in pairs {
        acc.add(hypothesis, references);
    }
    acc.scores()
}
