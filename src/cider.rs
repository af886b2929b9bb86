//! # CIDEr-D 评分
//!
//! 基于 n-gram（n = 1..4）TF-IDF 向量的共识度量。每个 n 单独计算假设与每条参考的
//! 截断余弦相似度，再乘上长度高斯惩罚：
//!
//! ```text
//! vec[g]   = tf(g) · (ref_len - ln(max(1, df(g))))
//! sim_n    = Σ_g min(h[g], r[g]) · r[g] / (|h_n| · |r_n|) · exp(-δ² / 2σ²)
//! score    = mean_n( Σ_refs sim_n ) / |refs| · 10
//! ```
//!
//! document frequency 在构造时固定（来自缓存文件或一次性从参考语料统计），之后只读，
//! 所以同一对（假设，参考集）无论和谁一起评分，得分都不变。
//!
//! 注意：长度 δ 统计的是 bigram 的个数而不是词数，与常用的 CIDEr-D 实现保持一致。
//!
//! `with_clipping(false)` 得到 COCO 评测里的原始 CIDEr：分子为 `h[g] · r[g]`，没有长度惩罚。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DaeError, Result};

pub const CIDER_N: usize = 4;
pub const CIDER_SIGMA: f64 = 6.0;

/// 缓存文件格式：`{"document_frequency": {"1 2": 3, ...}, "ref_len": 82783}`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CiderCache {
    pub document_frequency: HashMap<String, f64>,
    /// 参考语料中的图片数（未取对数）
    pub ref_len: f64,
}

/// 一个句子的 n-gram 计数，key 为空格连接的 n-gram
type NgramCounts = HashMap<String, f64>;

fn precook(sentence: &str, n: usize) -> NgramCounts {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    let mut counts = NgramCounts::new();
    for k in 1..=n {
        if words.len() < k {
            break;
        }
        for window in words.windows(k) {
            *counts.entry(window.join(" ")).or_insert(0.0) += 1.0;
        }
    }
    counts
}

fn ngram_order(ngram: &str) -> usize {
    ngram.split(' ').count()
}

struct TfIdf {
    vec: Vec<HashMap<String, f64>>,
    norm: Vec<f64>,
    length: f64,
}

#[derive(Clone, Debug)]
pub struct CiderD {
    n: usize,
    sigma: f64,
    document_frequency: HashMap<String, f64>,
    corpus_size: f64,
    /// ln(corpus_size)
    ref_len: f64,
    /// true 为 CIDEr-D（截断分子 + 长度惩罚），false 为原始 CIDEr
    clipped: bool,
}

impl CiderD {
    pub fn new(document_frequency: HashMap<String, f64>, corpus_size: f64) -> Result<Self> {
        if !(corpus_size >= 1.0) {
            return Err(DaeError::InvalidData(format!(
                "CIDEr 参考语料大小必须 >= 1，得到 {}",
                corpus_size
            )));
        }
        Ok(Self {
            n: CIDER_N,
            sigma: CIDER_SIGMA,
            document_frequency,
            corpus_size,
            ref_len: corpus_size.ln(),
            clipped: true,
        })
    }

    /// 从参考语料统计 document frequency：每个参考集合（一张图片）内出现过的 n-gram 计一次
    pub fn from_corpus(references: &[Vec<String>]) -> Result<Self> {
        let mut document_frequency: HashMap<String, f64> = HashMap::new();
        for refs in references {
            let mut seen: HashSet<String> = HashSet::new();
            for sentence in refs {
                seen.extend(precook(sentence, CIDER_N).into_keys());
            }
            for ngram in seen {
                *document_frequency.entry(ngram).or_insert(0.0) += 1.0;
            }
        }
        Self::new(document_frequency, references.len() as f64)
    }

    pub fn from_cache(cache: CiderCache) -> Result<Self> {
        Self::new(cache.document_frequency, cache.ref_len)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let cache: CiderCache = serde_json::from_str(&text)?;
        log::info!(
            "CIDEr-D 缓存加载完成: {} 个 n-gram, ref_len = {} ({:?})",
            cache.document_frequency.len(),
            cache.ref_len,
            path.as_ref()
        );
        Self::from_cache(cache)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let cache = CiderCache {
            document_frequency: self.document_frequency.clone(),
            ref_len: self.corpus_size,
        };
        fs::write(path, serde_json::to_string(&cache)?)?;
        Ok(())
    }

    pub fn with_clipping(mut self, clipped: bool) -> Self {
        self.clipped = clipped;
        self
    }

    pub fn is_clipped(&self) -> bool {
        self.clipped
    }

    pub fn ref_len(&self) -> f64 {
        self.ref_len
    }

    pub fn num_ngrams(&self) -> usize {
        self.document_frequency.len()
    }

    fn counts_to_vec(&self, counts: &NgramCounts) -> TfIdf {
        let mut vec = vec![HashMap::new(); self.n];
        let mut norm = vec![0.0; self.n];
        let mut length = 0.0;

        for (ngram, &term_freq) in counts {
            let order = ngram_order(ngram) - 1;
            if order >= self.n {
                continue;
            }
            let df = self
                .document_frequency
                .get(ngram)
                .copied()
                .unwrap_or(0.0)
                .max(1.0)
                .ln();
            let value = term_freq * (self.ref_len - df);
            norm[order] += value * value;
            vec[order].insert(ngram.clone(), value);
            if order == 1 {
                length += term_freq;
            }
        }

        TfIdf {
            vec,
            norm: norm.into_iter().map(f64::sqrt).collect(),
            length,
        }
    }

    fn sim(&self, hyp: &TfIdf, reference: &TfIdf) -> Vec<f64> {
        let delta = hyp.length - reference.length;
        let penalty = if self.clipped {
            (-(delta * delta) / (2.0 * self.sigma * self.sigma)).exp()
        } else {
            1.0
        };

        (0..self.n)
            .map(|n| {
                let mut val: f64 = hyp.vec[n]
                    .iter()
                    .map(|(ngram, &h)| {
                        let r = reference.vec[n].get(ngram).copied().unwrap_or(0.0);
                        if self.clipped { h.min(r) * r } else { h * r }
                    })
                    .sum();
                if hyp.norm[n] != 0.0 && reference.norm[n] != 0.0 {
                    val /= hyp.norm[n] * reference.norm[n];
                }
                val * penalty
            })
            .collect()
    }

    /// 单个假设对一组参考的 CIDEr-D
    pub fn score(&self, hypothesis: &str, references: &[String]) -> f64 {
        if references.is_empty() {
            return 0.0;
        }
        let hyp = self.counts_to_vec(&precook(hypothesis, self.n));
        let mut total = vec![0.0; self.n];
        for reference in references {
            let reference = self.counts_to_vec(&precook(reference, self.n));
            for (acc, v) in total.iter_mut().zip(self.sim(&hyp, &reference)) {
                *acc += v;
            }
        }
        let mean = total.iter().sum::<f64>() / self.n as f64;
        mean / references.len() as f64 * 10.0
    }

    /// **批量评分**
    ///
    /// `res` 中每一项为 `(id, [假设])`，假设必须恰好一条；`gts[id]` 为该 id 的参考集合。
    /// 返回 (平均分, 按 `res` 顺序的逐项得分)。
    pub fn compute_score(
        &self,
        gts: &HashMap<usize, Vec<String>>,
        res: &[(usize, Vec<String>)],
    ) -> Result<(f64, Vec<f64>)> {
        let mut scores = Vec::with_capacity(res.len());
        for (id, hypothesis) in res {
            if hypothesis.len() != 1 {
                return Err(DaeError::InvalidData(format!(
                    "id {} 的假设必须恰好一条，得到 {} 条",
                    id,
                    hypothesis.len()
                )));
            }
            let references = gts
                .get(id)
                .ok_or_else(|| DaeError::InvalidData(format!("id {} 没有参考字幕", id)))?;
            if references.is_empty() {
                return Err(DaeError::InvalidData(format!("id {} 的参考字幕为空", id)));
            }
            let score = self.score(&hypothesis[0], references);
            if score.is_nan() {
                return Err(DaeError::NumericalDegeneracy(format!("id {} 的 CIDEr 为 NaN", id)));
            }
            scores.push(score);
        }
        let mean = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        Ok((mean, scores))
    }
}
