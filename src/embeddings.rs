//! # 词嵌入层（Text Embedding）
//!
//! 将离散的 token ID 转换为连续向量。编码器（读取上一版字幕）和解码器（读取上一步生成的词）
//! 共享同一张嵌入表。
//!
//! ## 两种模式
//!
//! - **可训练模式**（默认）：查表 → ReLU → Dropout(0.5)，嵌入矩阵参与训练。
//! - **预训练模式**：从 GloVe 文本文件加载并冻结，查表后不做激活和 Dropout。
//!
//! ```text
//! token_ids = [5, 12, 3]
//! embeddings = [[第5行], [第12行], [第3行]]
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ndarray::{Array2, Axis};
use rand::Rng;

use crate::dropout::Dropout;
use crate::error::{DaeError, Result};
use crate::param::{Layer, NamedParam, Param, join_name};
use crate::utils::{sample_normal, uniform_matrix};
use crate::vocab::Vocab;

/// **嵌入层结构体**
#[derive(Clone, Debug)]
pub struct TextEmbedding {
    /// **词嵌入矩阵** (vocab_size × embedding_dim)
    pub table: Param,
    /// 预训练模式：冻结，且不使用 ReLU/Dropout
    pub pretrained: bool,
    pub dropout: Dropout,
}

/// 一次查表的反向传播缓存
#[derive(Clone, Debug)]
pub struct EmbeddingCache {
    pub token_ids: Vec<usize>,
    /// ReLU 前的值是否为正（预训练模式为 None）
    pub relu_mask: Option<Array2<f32>>,
    pub dropout_mask: Option<Array2<f32>>,
}

impl TextEmbedding {
    /// **创建可训练的嵌入层**
    ///
    /// 使用正态分布 N(0, 1) 初始化。
    pub fn new<R: Rng>(vocab_size: usize, embedding_dim: usize, dropout: f32, rng: &mut R) -> Self {
        let table = Array2::from_shape_fn((vocab_size, embedding_dim), |_| sample_normal(rng, 0.0, 1.0));
        Self {
            table: Param::new(table),
            pretrained: false,
            dropout: Dropout::new(dropout),
        }
    }

    /// 用给定矩阵构造冻结的预训练嵌入层
    pub fn from_pretrained(table: Array2<f32>) -> Self {
        Self {
            table: Param::frozen(table),
            pretrained: true,
            dropout: Dropout::new(0.0),
        }
    }

    /// **从 GloVe 文本文件加载**
    ///
    /// 文件每行格式：`word v1 v2 ... vd`。嵌入维度由第一行推断。
    /// 词表中但文件里没有的词用 U(-sqrt(3/d), sqrt(3/d)) 初始化；文件中不在词表里的词被跳过。
    pub fn load_glove<P: AsRef<Path>, R: Rng>(path: P, vocab: &Vocab, rng: &mut R) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut table: Option<Array2<f32>> = None;
        let mut found = 0usize;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let mut parts = line.split(' ').filter(|p| !p.is_empty() && !p.trim().is_empty());
            let Some(word) = parts.next() else {
                continue;
            };
            let values = parts
                .map(|v| v.trim().parse::<f32>())
                .collect::<std::result::Result<Vec<f32>, _>>()
                .map_err(|e| DaeError::InvalidData(format!("GloVe 第 {} 行无法解析: {}", line_no + 1, e)))?;

            if table.is_none() {
                let dim = values.len();
                if dim == 0 {
                    return Err(DaeError::InvalidData("GloVe 第一行没有向量".to_string()));
                }
                let bound = (3.0 / dim as f32).sqrt();
                table = Some(uniform_matrix(rng, (vocab.len(), dim), bound));
            }
            let Some(matrix) = table.as_mut() else {
                continue;
            };

            if values.len() != matrix.ncols() {
                return Err(DaeError::InvalidData(format!(
                    "GloVe 第 {} 行维度为 {}，应为 {}",
                    line_no + 1,
                    values.len(),
                    matrix.ncols()
                )));
            }

            if let Some(id) = vocab.encode(word) {
                matrix
                    .row_mut(id)
                    .assign(&ndarray::ArrayView1::from(values.as_slice()));
                found += 1;
            }
        }

        let table = table.ok_or_else(|| DaeError::InvalidData("GloVe 文件为空".to_string()))?;
        if found < vocab.len() {
            log::warn!("GloVe 覆盖了 {}/{} 个词，其余随机初始化", found, vocab.len());
        }
        log::info!("GloVe 加载完成: {} 维", table.ncols());
        Ok(Self::from_pretrained(table))
    }

    pub fn vocab_size(&self) -> usize {
        self.table.value.nrows()
    }

    pub fn embedding_dim(&self) -> usize {
        self.table.value.ncols()
    }

    /// **前向传播**：查表（+ ReLU + Dropout），返回 (len(token_ids), embedding_dim)
    pub fn forward<R: Rng>(&self, token_ids: &[usize], rng: &mut R) -> Result<(Array2<f32>, EmbeddingCache)> {
        let vocab_size = self.vocab_size();
        if let Some(&bad) = token_ids.iter().find(|&&id| id >= vocab_size) {
            return Err(DaeError::InvalidData(format!(
                "token id {} 越界（词表大小 {}）",
                bad, vocab_size
            )));
        }

        let looked_up = self.table.value.select(Axis(0), token_ids);

        if self.pretrained {
            let cache = EmbeddingCache {
                token_ids: token_ids.to_vec(),
                relu_mask: None,
                dropout_mask: None,
            };
            return Ok((looked_up, cache));
        }

        let relu_mask = looked_up.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let activated = looked_up.mapv(|v| v.max(0.0));
        let (output, dropout_mask) = self.dropout.forward(&activated, rng);

        let cache = EmbeddingCache {
            token_ids: token_ids.to_vec(),
            relu_mask: Some(relu_mask),
            dropout_mask,
        };
        Ok((output, cache))
    }

    /// **反向传播**：按 token ID 把梯度累加到对应的嵌入行（同一 ID 出现多次时梯度相加）
    pub fn backward(&mut self, cache: &EmbeddingCache, grads: &Array2<f32>) {
        if !self.table.trainable {
            return;
        }

        let mut grads = Dropout::backward(grads, cache.dropout_mask.as_ref());
        if let Some(relu_mask) = cache.relu_mask.as_ref() {
            grads *= relu_mask;
        }

        for (row, &token_id) in grads.rows().into_iter().zip(cache.token_ids.iter()) {
            let mut target = self.table.grad.row_mut(token_id);
            target += &row;
        }
    }
}

impl Layer for TextEmbedding {
    fn layer_type(&self) -> &str {
        "TextEmbedding"
    }

    fn named_params(&mut self, prefix: &str) -> Vec<NamedParam<'_>> {
        vec![(join_name(prefix, "table"), &mut self.table)]
    }

    fn set_training_mode(&mut self, training: bool) {
        self.dropout.set_training_mode(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_lookup_applies_relu() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut emb = TextEmbedding::new(4, 3, 0.0, &mut rng);
        emb.table.value = Array2::from_shape_vec((4, 3), (0..12).map(|v| v as f32 - 6.0).collect()).unwrap();
        let (out, _) = emb.forward(&[0, 3], &mut rng).unwrap();
        assert_eq!(out.row(0).to_vec(), vec![0.0, 0.0, 0.0]);
        assert_eq!(out.row(1).to_vec(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_out_of_range_id_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let emb = TextEmbedding::new(4, 3, 0.0, &mut rng);
        assert!(matches!(emb.forward(&[4], &mut rng), Err(DaeError::InvalidData(_))));
    }

    #[test]
    fn test_backward_accumulates_repeated_ids() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut emb = TextEmbedding::new(3, 2, 0.0, &mut rng);
        emb.table.value.fill(1.0);
        let (_, cache) = emb.forward(&[1, 1, 2], &mut rng).unwrap();
        emb.backward(&cache, &Array2::ones((3, 2)));
        assert_eq!(emb.table.grad[[1, 0]], 2.0);
        assert_eq!(emb.table.grad[[2, 1]], 1.0);
        assert_eq!(emb.table.grad[[0, 0]], 0.0);
    }

    #[test]
    fn test_pretrained_is_frozen() {
        let mut emb = TextEmbedding::from_pretrained(Array2::from_elem((3, 2), -1.0));
        let mut rng = StdRng::seed_from_u64(0);
        let (out, cache) = emb.forward(&[2], &mut rng).unwrap();
        assert_eq!(out[[0, 0]], -1.0);
        emb.backward(&cache, &Array2::ones((1, 2)));
        assert_eq!(emb.table.grad, Array2::<f32>::zeros((3, 2)));
    }
}
