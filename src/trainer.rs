//! # 自我批判序列训练（SCST）
//!
//! 每个批次：
//!
//! 1. 评估模式下贪心解码，得到基线序列
//! 2. 训练模式下采样解码，同时记录反向传播缓存
//! 3. 两组序列一起送进 CIDEr-D，得到 `advantage = 采样得分 - 贪心得分`
//! 4. 策略梯度损失 → 随时间反向传播 → 全局梯度裁剪 (0.25) → Adam
//!
//! 每个 epoch 结束后在验证集上做束搜索评估，按 CIDEr 决定是否保存最佳模型和衰减学习率。

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::beam_search::BeamSearchConfig;
use crate::bleu::BleuAccumulator;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::cider::CiderD;
use crate::config::TrainConfig;
use crate::dataset::{CAPTIONS_PER_IMAGE, TrainBatch, TrainDataset, ValDataset, shuffled_batches};
use crate::decoder::Dae;
use crate::error::{DaeError, Result};
use crate::generation::DecodeMode;
use crate::loss::policy_gradient_loss;
use crate::param::Layer;
use crate::reward::{array_to_str, preprocess_references, self_critical_reward};
use crate::vocab::Vocab;

/// 加权滑动平均
#[derive(Clone, Debug, Default)]
pub struct AverageMeter {
    pub val: f32,
    pub sum: f32,
    pub count: usize,
}

impl AverageMeter {
    pub fn update(&mut self, val: f32, n: usize) {
        self.val = val;
        self.sum += val * n as f32;
        self.count += n;
    }

    pub fn avg(&self) -> f32 {
        if self.count == 0 { 0.0 } else { self.sum / self.count as f32 }
    }
}

/// 单个批次的统计
#[derive(Clone, Debug)]
pub struct StepStats {
    pub loss: f32,
    pub mean_advantage: f32,
    pub grad_norm: f32,
}

#[derive(Clone, Debug)]
pub struct EpochStats {
    pub average_reward: f32,
    pub average_loss: f32,
    pub batches: usize,
}

/// 评估结果文件中的一项
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptionResult {
    pub image_id: u64,
    pub caption: String,
}

/// 验证集指标，写入 `captions_val_eval_<epoch>.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalScores {
    #[serde(rename = "Bleu_1")]
    pub bleu_1: f64,
    #[serde(rename = "Bleu_2")]
    pub bleu_2: f64,
    #[serde(rename = "Bleu_3")]
    pub bleu_3: f64,
    #[serde(rename = "Bleu_4")]
    pub bleu_4: f64,
    #[serde(rename = "CIDEr")]
    pub cider: f64,
}

#[derive(Clone, Debug)]
pub struct EvalResult {
    /// 没有参考字幕时为 `None`
    pub scores: Option<EvalScores>,
    pub degenerate: usize,
    pub results_path: PathBuf,
    /// 只有算出了指标才会写分数文件
    pub scores_path: Option<PathBuf>,
    pub predictions: Vec<CaptionResult>,
}

impl EvalResult {
    pub fn cider(&self) -> Option<f64> {
        self.scores.as_ref().map(|s| s.cider)
    }
}

/// 跨 epoch 的训练状态，随检查点保存
#[derive(Clone, Debug, PartialEq)]
pub struct TrainState {
    /// 下一个要训练的 epoch
    pub epoch: usize,
    pub epochs_since_improvement: usize,
    pub best_cider: f64,
    pub learning_rate: f32,
}

impl TrainState {
    pub fn fresh(config: &TrainConfig) -> Self {
        Self {
            epoch: 0,
            epochs_since_improvement: 0,
            best_cider: 0.0,
            learning_rate: config.learning_rate,
        }
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            epoch: checkpoint.epoch + 1,
            epochs_since_improvement: checkpoint.epochs_since_improvement,
            best_cider: checkpoint.best_cider,
            learning_rate: checkpoint.learning_rate,
        }
    }
}

/// **学习率调度**
///
/// 本次运行的第一个 epoch 重置为初始学习率；之后只要验证集连续没有提升就乘以衰减因子。
pub fn scheduled_learning_rate(
    epoch: usize,
    first_epoch: usize,
    current: f32,
    epochs_since_improvement: usize,
    config: &TrainConfig,
) -> f32 {
    let mut lr = current;
    if epoch == first_epoch {
        lr = config.learning_rate;
        log::info!("SCST 学习率设置为 {:.2e}", lr);
    }
    if epochs_since_improvement > 0 {
        lr *= config.lr_shrink_factor;
        log::info!("学习率衰减为 {:.2e}", lr);
    }
    lr
}

/// 训练集的参考语料：每张图片一组，用于构建 CIDEr-D 的 document frequency
pub fn training_reference_corpus(dataset: &TrainDataset, vocab: &Vocab) -> Result<Vec<Vec<String>>> {
    let mut corpus = Vec::with_capacity(dataset.len() / CAPTIONS_PER_IMAGE);
    for i in (0..dataset.len()).step_by(CAPTIONS_PER_IMAGE) {
        let item = dataset.get(i)?;
        let refs = preprocess_references(&[item.all_captions], vocab);
        corpus.extend(
            refs.into_iter()
                .map(|caps| caps.iter().map(|c| array_to_str(c)).collect::<Vec<String>>()),
        );
    }
    Ok(corpus)
}

pub struct Trainer<'a> {
    pub model: Dae,
    pub state: TrainState,
    vocab: &'a Vocab,
    scorer: &'a CiderD,
    config: &'a TrainConfig,
    rng: StdRng,
}

impl<'a> Trainer<'a> {
    pub fn new(model: Dae, vocab: &'a Vocab, scorer: &'a CiderD, config: &'a TrainConfig, state: TrainState) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            model,
            state,
            vocab,
            scorer,
            config,
            rng,
        }
    }

    fn beam_config(&self) -> BeamSearchConfig {
        BeamSearchConfig {
            beam_size: self.config.beam_size,
            start_id: self.vocab.start_id(),
            end_id: self.vocab.end_id(),
            max_steps: self.config.beam_max_steps,
            max_len: self.config.max_caption_len,
        }
    }

    /// **一个批次的 SCST 更新**
    pub fn train_step(&mut self, batch: &TrainBatch) -> Result<StepStats> {
        let max_len = self.config.max_caption_len;

        self.model.set_training_mode(false);
        let greedy = self.model.decode(
            self.vocab,
            &batch.previous_captions,
            &batch.previous_lengths,
            DecodeMode::Greedy,
            max_len,
            &mut self.rng,
        )?;

        self.model.set_training_mode(true);
        let (sampled, tape) = self.model.sample_with_tape(
            self.vocab,
            &batch.previous_captions,
            &batch.previous_lengths,
            max_len,
            &mut self.rng,
        )?;

        let references = preprocess_references(&batch.all_captions, self.vocab);
        let reward = self_critical_reward(&sampled.seq, &greedy.seq, &references, self.scorer)?;
        let (loss, d_logprobs) = policy_gradient_loss(&sampled.logprobs, &sampled.seq, &reward.advantage)?;

        self.model.zero_grad();
        self.model.backward(tape, &sampled, &d_logprobs)?;
        let grad_norm = self.model.apply_gradients(self.config.grad_clip, self.state.learning_rate);

        log::debug!(
            "batch: loss={:.4}, reward={:.4}, grad_norm={:.4}, steps={}",
            loss,
            reward.mean_advantage(),
            grad_norm,
            sampled.steps
        );

        Ok(StepStats {
            loss,
            mean_advantage: reward.mean_advantage(),
            grad_norm,
        })
    }

    /// **训练一个 epoch**
    pub fn train_epoch(&mut self, dataset: &TrainDataset, epoch: usize) -> Result<EpochStats> {
        let batches = shuffled_batches(dataset.len(), self.config.batch_size, &mut self.rng);
        let total = batches.len();
        let mut rewards = AverageMeter::default();
        let mut losses = AverageMeter::default();
        let start = Instant::now();

        for (i, indices) in batches.iter().enumerate() {
            let batch = dataset.collate(indices)?;
            let stats = self.train_step(&batch).inspect_err(|e| {
                log::error!("Epoch {} 第 {} 个批次失败: {}", epoch, i, e);
            })?;
            rewards.update(stats.mean_advantage, batch.len());
            losses.update(stats.loss, batch.len());

            if self.config.print_freq > 0 && i % self.config.print_freq == 0 {
                log::info!(
                    "Epoch: [{}][{}/{}]\tAverage Reward {:.4}\tLoss {:.4} ({:.4})",
                    epoch,
                    i,
                    total,
                    rewards.avg(),
                    losses.val,
                    losses.avg()
                );
            }
        }

        log::info!(
            "Epoch {} 完成: {} 个批次, 平均奖励 {:.4}, 平均损失 {:.4}, 用时 {:.1}s",
            epoch,
            total,
            rewards.avg(),
            losses.avg(),
            start.elapsed().as_secs_f32()
        );

        Ok(EpochStats {
            average_reward: rewards.avg(),
            average_loss: losses.avg(),
            batches: total,
        })
    }

    /// **验证集评估**
    ///
    /// 每张图片一次束搜索；结果写入 `results_dir/captions_val_results_<epoch>.json`。
    /// 有参考字幕时计算 BLEU-1..4 和 CIDEr，写入 `results_dir/captions_val_eval_<epoch>.json`。
    ///
    /// 这里的 CIDEr 是 COCO 评测的原始版本（不截断、无长度惩罚），document frequency
    /// 由验证集参考统计；训练奖励用的则是 CIDEr-D。两者数值不能直接比较。
    pub fn evaluate(&mut self, dataset: &ValDataset, epoch: usize) -> Result<EvalResult> {
        self.model.set_training_mode(false);
        let beam = self.beam_config();

        let mut predictions = Vec::with_capacity(dataset.len());
        let mut hypotheses = Vec::with_capacity(dataset.len());
        let mut degenerate = 0;

        for i in 0..dataset.len() {
            let item = dataset.get(i)?;
            let result = self.model.beam_search(
                &item.previous_caption,
                item.previous_length,
                &beam,
                &mut self.rng,
            )?;
            if result.degenerate {
                degenerate += 1;
            }
            predictions.push(CaptionResult {
                image_id: item.image_id,
                caption: self.vocab.decode_caption(&result.tokens),
            });
            hypotheses.push((item.image_id, result.tokens));
        }

        fs::create_dir_all(&self.config.results_dir)?;
        let results_path = self
            .config
            .results_dir
            .join(format!("captions_val_results_{}.json", epoch));
        fs::write(&results_path, serde_json::to_string_pretty(&predictions)?)?;
        log::info!("评估结果已写入 {:?} ({} 条)", results_path, predictions.len());

        let scores = match &dataset.references {
            Some(references) => Some(self.corpus_scores(&hypotheses, references)?),
            None => None,
        };

        if degenerate > 0 {
            log::warn!("{} 条束搜索结果在步数上限内没有结束", degenerate);
        }

        let scores_path = match &scores {
            Some(scores) => {
                let path = self
                    .config
                    .results_dir
                    .join(format!("captions_val_eval_{}.json", epoch));
                fs::write(&path, serde_json::to_string_pretty(scores)?)?;
                log::info!(
                    "Epoch {} 验证集 CIDEr: {:.4}, BLEU-4: {:.4}",
                    epoch,
                    scores.cider,
                    scores.bleu_4
                );
                Some(path)
            }
            None => None,
        };

        Ok(EvalResult {
            scores,
            degenerate,
            results_path,
            scores_path,
            predictions,
        })
    }

    fn corpus_scores(
        &self,
        hypotheses: &[(u64, Vec<usize>)],
        references: &HashMap<u64, Vec<Vec<usize>>>,
    ) -> Result<EvalScores> {
        let mut corpus = Vec::with_capacity(hypotheses.len());
        let mut gts = HashMap::with_capacity(hypotheses.len());
        let mut res = Vec::with_capacity(hypotheses.len());
        let mut bleu = BleuAccumulator::default();

        for (idx, (image_id, tokens)) in hypotheses.iter().enumerate() {
            let refs = references
                .get(image_id)
                .ok_or_else(|| DaeError::InvalidData(format!("image_id {} 没有参考字幕", image_id)))?;
            let refs: Vec<String> = preprocess_references(&[refs.clone()], self.vocab)
                .into_iter()
                .flatten()
                .map(|c| array_to_str(&c))
                .collect();
            let hypothesis: Vec<String> = preprocess_references(&[vec![tokens.clone()]], self.vocab)
                .into_iter()
                .flatten()
                .map(|c| array_to_str(&c))
                .collect();

            for h in &hypothesis {
                bleu.add(h, &refs);
            }
            corpus.push(refs.clone());
            gts.insert(idx, refs);
            res.push((idx, hypothesis));
        }

        let scorer = CiderD::from_corpus(&corpus)?.with_clipping(false);
        let (cider, _) = scorer.compute_score(&gts, &res)?;
        let [bleu_1, bleu_2, bleu_3, bleu_4] = bleu.scores();
        Ok(EvalScores {
            bleu_1,
            bleu_2,
            bleu_3,
            bleu_4,
            cider,
        })
    }

    /// **完整训练流程**
    ///
    /// 每个 epoch：调度学习率 → 训练 → 评估 → 更新最佳分数 → 保存检查点。
    pub fn run(
        &mut self,
        train: &TrainDataset,
        val: &ValDataset,
        manager: &CheckpointManager,
    ) -> Result<TrainState> {
        let first_epoch = self.state.epoch;
        log::info!(
            "开始 SCST 训练: epoch {}..{}, 模型 {} ({} 个参数)",
            first_epoch,
            self.config.epochs,
            self.model.network_description(),
            self.model.total_parameters()
        );

        for epoch in first_epoch..self.config.epochs {
            self.state.learning_rate = scheduled_learning_rate(
                epoch,
                first_epoch,
                self.state.learning_rate,
                self.state.epochs_since_improvement,
                self.config,
            );

            self.train_epoch(train, epoch)?;
            let eval = self.evaluate(val, epoch)?;

            let is_best = match eval.cider() {
                Some(score) if score > self.state.best_cider => {
                    self.state.best_cider = score;
                    self.state.epochs_since_improvement = 0;
                    true
                }
                Some(_) => {
                    self.state.epochs_since_improvement += 1;
                    log::info!(
                        "距上次提升已经 {} 个 epoch",
                        self.state.epochs_since_improvement
                    );
                    false
                }
                None => false,
            };

            let checkpoint = Checkpoint::new(
                &mut self.model,
                epoch,
                self.state.epochs_since_improvement,
                self.state.best_cider,
                self.state.learning_rate,
            );
            if let Err(e) = manager.save(&checkpoint, is_best) {
                log::error!("保存检查点失败: {}", e);
                return Err(e);
            }
            self.state.epoch = epoch + 1;
        }

        Ok(self.state.clone())
    }
}
