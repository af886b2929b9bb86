//! # DAE-SCST - 以上一版字幕为条件的字幕解码器及其自我批判训练
//!
//! 纯 Rust 实现：只用 `ndarray` 做矩阵运算，所有层手写前向与反向传播。
//!
//! ## 核心流程
//!
//! 1. **编码**：双向 LSTM 把上一版字幕编码成逐位置特征和一个摘要向量
//! 2. **解码**：注意力 LSTM + 语言 LSTM 逐步生成新字幕（贪心 / 采样 / 束搜索）
//! 3. **奖励**：采样结果与贪心结果的 CIDEr-D 之差作为优势值
//! 4. **更新**：策略梯度损失 → 随时间反向传播 → 梯度裁剪 → Adam
//!
//! ## 模块组织
//!
//! ### 模型
//! - `decoder`: 解码器主类，包含一次解码调用的会话状态与反向传播
//! - `encoder`: 上一版字幕的双向 LSTM 编码器
//! - `attention`: 加性注意力（带掩码）
//!
//! ### 神经网络层
//! - `embeddings`: 词嵌入（可训练或 GloVe 预训练并冻结）
//! - `lstm`: LSTM 单元
//! - `linear`: 全连接层
//! - `dropout`: Dropout 正则化层
//!
//! ### 训练
//! - `generation` / `beam_search`: 解码策略
//! - `cider` / `reward` / `loss`: CIDEr-D、自我批判奖励与策略梯度损失
//! - `trainer`: epoch 循环、学习率调度与评估
//! - `bleu`: 验证集的 BLEU-1..4
//! - `checkpoint`: 模型与优化器状态的保存和加载
//!
//! ### 工具模块
//! - `vocab`、`dataset`、`config`、`error`、`param`、`adam`、`utils`

// ============================================================================
// 模块声明
// ============================================================================

pub mod adam; // Adam 优化器
pub mod attention; // 加性注意力
pub mod beam_search; // 束搜索（仅评估）
pub mod bleu; // 语料级 BLEU
pub mod checkpoint; // 检查点保存和加载
pub mod cider; // CIDEr-D 评分
pub mod config; // 模型与训练配置
pub mod dataset; // 训练集和验证集
pub mod decoder; // DAE 解码器
pub mod dropout; // Dropout 层
pub mod embeddings; // 词嵌入
pub mod encoder; // 双向 LSTM 编码器
pub mod error; // 错误类型
pub mod generation; // 贪心 / 采样展开
pub mod linear; // 全连接层
pub mod loss; // 策略梯度损失
pub mod lstm; // LSTM 单元
pub mod param; // 参数与梯度裁剪
pub mod reward; // 自我批判奖励
pub mod trainer; // 训练循环
pub mod utils; // 通用数值函数
pub mod vocab; // 词汇表

// ============================================================================
// 重导出核心类型（简化外部使用）
// ============================================================================

pub use beam_search::{BeamHypothesis, BeamSearchConfig, BeamStep, beam_search};
pub use checkpoint::{Checkpoint, CheckpointFormat, CheckpointManager, SerializableDae};
pub use cider::CiderD;
pub use config::{DaeConfig, MaskSource, RunConfig, TrainConfig};
pub use dataset::{TrainDataset, ValDataset};
pub use decoder::{Dae, DecodeSession};
pub use embeddings::TextEmbedding;
pub use error::{DaeError, Result};
pub use generation::{DecodeMode, Generation, StepModel, unroll};
pub use loss::{policy_gradient_loss, shifted_mask};
pub use param::{Layer, Param};
pub use reward::{array_to_str, preprocess_references, self_critical_reward};
pub use trainer::{EvalScores, TrainState, Trainer};
pub use vocab::Vocab;

// ============================================================================
// 特殊 token
// ============================================================================

/// 填充符，同时充当序列终止符，ID 必须为 0
pub const PAD_TOKEN: &str = "<pad>";
pub const START_TOKEN: &str = "<start>";
pub const END_TOKEN: &str = "<end>";
pub const UNK_TOKEN: &str = "<unk>";

// ============================================================================
// 训练超参数默认值
// ============================================================================

/// **生成序列的最大长度 L**
///
/// 贪心和采样展开都恰好产生 L 列；束搜索的退化结果也截断到这个长度。
pub const MAX_CAPTION_LEN: usize = 18;

pub const DEFAULT_BEAM_SIZE: usize = 3;

/// **束搜索步数上限**
///
/// 第 51 步开始前仍没有任何假设结束时，放弃搜索并输出退化结果。
pub const DEFAULT_MAX_STEPS: usize = 50;

/// 全局梯度范数上限
pub const DEFAULT_GRAD_CLIP: f32 = 0.25;

// ============================================================================
// 数值常量
// ============================================================================

/// **注意力掩码填充值**
///
/// 无效位置的注意力分数被替换为这个值，softmax 之后权重为 0。
pub const MASK_FILL: f32 = -1e10;
