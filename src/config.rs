//! # 配置（Configuration）
//!
//! 模型超参数 [`DaeConfig`] 与训练超参数 [`TrainConfig`]。
//! 在进程启动时构造一次，按引用传给编码器、解码器、损失和训练循环，
//! 不存在任何全局状态。
//!
//! 加载顺序：默认值 → 可选 JSON 文件（`--config=path`）→ 命令行 `--key=value`。

use std::fs;
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{DaeError, Result};
use crate::{DEFAULT_BEAM_SIZE, DEFAULT_GRAD_CLIP, DEFAULT_MAX_STEPS, MAX_CAPTION_LEN};

/// 注意力掩码的来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum MaskSource {
    /// 由存储的有效长度构造：`mask[b, t] = t < len[b]`
    Length,
    /// 由编码器特征构造：`mask[b, t] = sum(features[b, t, :]) != 0`。
    /// 真实时间步恰好全零时会被误掩码，仅为兼容保留。
    FeatureSum,
}

/// **模型超参数**
#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
#[serde(default)]
pub struct DaeConfig {
    pub vocab_size: usize,
    /// 词嵌入维度（使用 GloVe 时由文件推断）
    pub embedding_dim: usize,
    /// 双向编码器每个方向的隐藏维度
    pub encoder_dim: usize,
    /// 编码器汇总向量维度（`tanh(Linear(2·encoder_dim → summary_dim))`）
    pub summary_dim: usize,
    /// 两层解码 LSTM 的隐藏维度
    pub decoder_dim: usize,
    /// 加性注意力的中间维度
    pub attention_dim: usize,
    pub dropout: f32,
    pub mask_source: MaskSource,
    /// 是否使用预训练（冻结）词嵌入
    pub pretrained_embedding: bool,
}

impl Default for DaeConfig {
    fn default() -> Self {
        Self {
            vocab_size: 0,
            embedding_dim: 1024,
            encoder_dim: 512,
            summary_dim: 1024,
            decoder_dim: 1024,
            attention_dim: 512,
            dropout: 0.5,
            mask_source: MaskSource::Length,
            pretrained_embedding: false,
        }
    }
}

impl DaeConfig {
    /// 测试和小实验用的迷你配置
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            embedding_dim: 8,
            encoder_dim: 6,
            summary_dim: 8,
            decoder_dim: 10,
            attention_dim: 7,
            dropout: 0.0,
            mask_source: MaskSource::Length,
            pretrained_embedding: false,
        }
    }

    /// 编码器每个时间步输出的特征维度（前向 + 后向）
    pub fn feature_dim(&self) -> usize {
        self.encoder_dim * 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size < 3 {
            return Err(DaeError::Config(format!(
                "vocab_size 至少要容纳 <pad>/<start>/<end>，当前为 {}",
                self.vocab_size
            )));
        }
        let dims = [
            ("embedding_dim", self.embedding_dim),
            ("encoder_dim", self.encoder_dim),
            ("summary_dim", self.summary_dim),
            ("decoder_dim", self.decoder_dim),
            ("attention_dim", self.attention_dim),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(DaeError::Config(format!("{} 必须大于 0", name)));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(DaeError::Config(format!(
                "dropout 必须在 [0, 1) 内，当前为 {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// **训练超参数与文件路径**
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// 生成序列的最大长度 L
    pub max_caption_len: usize,
    pub beam_size: usize,
    /// 束搜索步数上限
    pub beam_max_steps: usize,
    pub grad_clip: f32,
    /// SCST 阶段首个 epoch 设置的学习率
    pub learning_rate: f32,
    /// 验证集没有提升时学习率的衰减因子
    pub lr_shrink_factor: f32,
    pub epochs: usize,
    pub print_freq: usize,
    pub seed: u64,
    pub data_dir: PathBuf,
    pub word_map: PathBuf,
    /// 训练集参考文本的 document-frequency 缓存
    pub cider_cache: Option<PathBuf>,
    pub glove_file: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub checkpoint_dir: PathBuf,
    pub results_dir: PathBuf,
    /// 检查点格式：`bin` 或 `json`
    pub checkpoint_format: String,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 60,
            max_caption_len: MAX_CAPTION_LEN,
            beam_size: DEFAULT_BEAM_SIZE,
            beam_max_steps: DEFAULT_MAX_STEPS,
            grad_clip: DEFAULT_GRAD_CLIP,
            learning_rate: 5e-5,
            lr_shrink_factor: 0.5,
            epochs: 50,
            print_freq: 100,
            seed: 42,
            data_dir: PathBuf::from("caption data"),
            word_map: PathBuf::from("caption data/WORDMAP_coco.json"),
            cider_cache: None,
            glove_file: None,
            checkpoint: None,
            checkpoint_dir: PathBuf::from("checkpoints"),
            results_dir: PathBuf::from("results"),
            checkpoint_format: "bin".to_string(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DaeError::Config("batch_size 必须大于 0".to_string()));
        }
        if self.max_caption_len == 0 {
            return Err(DaeError::Config("max_caption_len 必须大于 0".to_string()));
        }
        if self.beam_size == 0 {
            return Err(DaeError::Config("beam_size 必须大于 0".to_string()));
        }
        if !(self.grad_clip > 0.0 && self.grad_clip.is_finite()) {
            return Err(DaeError::Config(format!("grad_clip 必须为正数，当前为 {}", self.grad_clip)));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(DaeError::Config(format!(
                "learning_rate 必须为正数，当前为 {}",
                self.learning_rate
            )));
        }
        if !(self.lr_shrink_factor > 0.0 && self.lr_shrink_factor <= 1.0) {
            return Err(DaeError::Config(format!(
                "lr_shrink_factor 必须在 (0, 1] 内，当前为 {}",
                self.lr_shrink_factor
            )));
        }
        if self.checkpoint_format != "bin" && self.checkpoint_format != "json" {
            return Err(DaeError::Config(format!(
                "checkpoint_format 只能是 bin 或 json，当前为 {}",
                self.checkpoint_format
            )));
        }
        Ok(())
    }
}

/// 两份配置一起从 JSON 读取时的外层结构
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: DaeConfig,
    pub train: TrainConfig,
}

impl RunConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// 用 `--key=value` 形式的命令行参数覆盖配置。未知的 key 会被忽略并记录警告。
    pub fn apply_args(&mut self, args: &[String]) -> Result<()> {
        for arg in args {
            let Some(arg) = arg.strip_prefix("--") else {
                continue;
            };
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            match key {
                "config" | "log-level" => {}
                "embedding-dim" => self.model.embedding_dim = parse_value(key, value)?,
                "encoder-dim" => self.model.encoder_dim = parse_value(key, value)?,
                "summary-dim" => self.model.summary_dim = parse_value(key, value)?,
                "decoder-dim" => self.model.decoder_dim = parse_value(key, value)?,
                "attention-dim" => self.model.attention_dim = parse_value(key, value)?,
                "dropout" => self.model.dropout = parse_value(key, value)?,
                "mask" => {
                    self.model.mask_source = match value {
                        "length" => MaskSource::Length,
                        "feature-sum" => MaskSource::FeatureSum,
                        other => {
                            return Err(DaeError::Config(format!("未知的掩码来源 {}", other)));
                        }
                    }
                }
                "batch-size" => self.train.batch_size = parse_value(key, value)?,
                "max-len" => self.train.max_caption_len = parse_value(key, value)?,
                "beam-size" => self.train.beam_size = parse_value(key, value)?,
                "beam-max-steps" => self.train.beam_max_steps = parse_value(key, value)?,
                "grad-clip" => self.train.grad_clip = parse_value(key, value)?,
                "lr" => self.train.learning_rate = parse_value(key, value)?,
                "lr-shrink" => self.train.lr_shrink_factor = parse_value(key, value)?,
                "epochs" => self.train.epochs = parse_value(key, value)?,
                "print-freq" => self.train.print_freq = parse_value(key, value)?,
                "seed" => self.train.seed = parse_value(key, value)?,
                "data-dir" => self.train.data_dir = PathBuf::from(value),
                "word-map" => self.train.word_map = PathBuf::from(value),
                "cider-cache" => self.train.cider_cache = Some(PathBuf::from(value)),
                "glove" => {
                    self.train.glove_file = Some(PathBuf::from(value));
                    self.model.pretrained_embedding = true;
                }
                "checkpoint" => self.train.checkpoint = Some(PathBuf::from(value)),
                "checkpoint-dir" => self.train.checkpoint_dir = PathBuf::from(value),
                "results-dir" => self.train.results_dir = PathBuf::from(value),
                "format" => self.train.checkpoint_format = value.to_string(),
                other => log::warn!("忽略未知参数 --{}", other),
            }
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| DaeError::Config(format!("无法解析参数 --{}={}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let mut model = DaeConfig::default();
        model.vocab_size = 100;
        assert!(model.validate().is_ok());
        assert!(TrainConfig::default().validate().is_ok());
        assert_eq!(TrainConfig::default().max_caption_len, 18);
        assert_eq!(TrainConfig::default().beam_size, 3);
    }

    #[test]
    fn test_apply_args_overrides() {
        let mut cfg = RunConfig::default();
        let args: Vec<String> = ["--batch-size=8", "--lr=0.001", "--mask=feature-sum", "train"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        cfg.apply_args(&args).unwrap();
        assert_eq!(cfg.train.batch_size, 8);
        assert!((cfg.train.learning_rate - 0.001).abs() < 1e-9);
        assert_eq!(cfg.model.mask_source, MaskSource::FeatureSum);
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut cfg = RunConfig::default();
        let args = vec!["--batch-size=lots".to_string()];
        assert!(matches!(cfg.apply_args(&args), Err(DaeError::Config(_))));

        let mut train = TrainConfig::default();
        train.grad_clip = 0.0;
        assert!(train.validate().is_err());

        let model = DaeConfig::tiny(2);
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_validation_message_names_the_field() {
        let mut train = TrainConfig::default();
        train.checkpoint_format = "pth".to_string();
        let text = train.validate().unwrap_err().to_string();
        assert!(text.starts_with("配置错误"));
        assert!(text.contains("checkpoint_format 只能是 bin 或 json"));

        let mut model = DaeConfig::tiny(10);
        model.dropout = 1.5;
        let text = model.validate().unwrap_err().to_string();
        assert!(text.contains("dropout 必须在 [0, 1) 内"));
    }
}
