//! # 检查点（Checkpoint）
//!
//! 支持两种格式，由文件扩展名决定：
//!
//! 1. **二进制格式** `.bin`：bincode 序列化，文件小、速度快，推荐用于训练。
//! 2. **JSON 格式** `.json`：人类可读，方便检查权重。
//!
//! 检查点包含完整的训练状态：
//! - 模型配置与每个命名参数（形状、数据、Adam 的 m/v 与 timestep）
//! - 训练元数据（epoch、距上次提升的 epoch 数、最佳 CIDEr、学习率、时间戳）
//!
//! 每个 epoch 保存 `checkpoint_<epoch>.<ext>`；当前 epoch 最好时另存一份 `BEST_checkpoint_<epoch>.<ext>`。
//! 加载时逐个核对参数名和形状，任何不一致都会返回 [`DaeError::ShapeMismatch`]。

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::adam::Adam;
use crate::config::DaeConfig;
use crate::decoder::Dae;
use crate::embeddings::TextEmbedding;
use crate::error::{DaeError, Result};
use crate::param::{Layer, Param};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Clone, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct SerializableAdam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub timestep: usize,
    pub m_data: Vec<f32>,
    pub v_data: Vec<f32>,
}

impl SerializableAdam {
    pub fn from_adam(adam: &Adam) -> Self {
        Self {
            beta1: adam.beta1,
            beta2: adam.beta2,
            epsilon: adam.epsilon,
            timestep: adam.timestep,
            m_data: adam.m.iter().map(|&x| if x.is_finite() { x } else { 0.0 }).collect(),
            v_data: adam.v.iter().map(|&x| if x.is_finite() { x } else { 0.0 }).collect(),
        }
    }

    pub fn to_adam(&self, name: &str, shape: (usize, usize)) -> Result<Adam> {
        let rebuild = |data: &[f32], what: &str| {
            Array2::from_shape_vec(shape, data.to_vec()).map_err(|e| {
                DaeError::InvalidData(format!("无法重建 {} 的 Adam {}: {}", name, what, e))
            })
        };
        Ok(Adam {
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            timestep: self.timestep,
            m: rebuild(&self.m_data, "m")?,
            v: rebuild(&self.v_data, "v")?,
        })
    }
}

#[derive(Clone, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct SerializableParam {
    pub name: String,
    pub shape: (usize, usize),
    pub data: Vec<f32>,
    pub trainable: bool,
    pub optimizer: SerializableAdam,
}

impl SerializableParam {
    fn from_param(name: String, param: &Param) -> Self {
        Self {
            name,
            shape: param.dim(),
            data: param.value.iter().copied().collect(),
            trainable: param.trainable,
            optimizer: SerializableAdam::from_adam(&param.optimizer),
        }
    }

    /// 形状核对通过后写入目标参数
    fn restore_into(&self, target: &mut Param) -> Result<()> {
        let expected = target.dim();
        if self.shape != expected {
            return Err(DaeError::ShapeMismatch {
                name: self.name.clone(),
                expected,
                found: self.shape,
            });
        }
        target.value = Array2::from_shape_vec(self.shape, self.data.clone())
            .map_err(|e| DaeError::InvalidData(format!("无法重建 {}: {}", self.name, e)))?;
        target.optimizer = self.optimizer.to_adam(&self.name, self.shape)?;
        target.trainable = self.trainable;
        target.zero_grad();
        Ok(())
    }
}

/// 模型的可序列化表示
#[derive(Clone, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct SerializableDae {
    pub version: u32,
    pub config: DaeConfig,
    pub params: Vec<SerializableParam>,
}

impl SerializableDae {
    pub fn from_model(model: &mut Dae) -> Self {
        let config = model.config.clone();
        let params = model
            .named_params("")
            .into_iter()
            .map(|(name, param)| SerializableParam::from_param(name, param))
            .collect();
        Self {
            version: CHECKPOINT_VERSION,
            config,
            params,
        }
    }

    /// 按配置重建模型骨架，再逐个写回参数
    pub fn to_model(&self) -> Result<Dae> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = if self.config.pretrained_embedding {
            let table = Array2::zeros((self.config.vocab_size, self.config.embedding_dim));
            Dae::with_embedding(self.config.clone(), TextEmbedding::from_pretrained(table), &mut rng)?
        } else {
            Dae::new(self.config.clone(), &mut rng)?
        };

        let mut saved: HashMap<&str, &SerializableParam> =
            self.params.iter().map(|p| (p.name.as_str(), p)).collect();
        for (name, param) in model.named_params("") {
            let stored = saved
                .remove(name.as_str())
                .ok_or_else(|| DaeError::InvalidData(format!("检查点缺少参数 {}", name)))?;
            stored.restore_into(param)?;
        }
        if let Some(extra) = saved.keys().next() {
            return Err(DaeError::InvalidData(format!("检查点含有未知参数 {}", extra)));
        }
        Ok(model)
    }
}

/// 完整的检查点数据
#[derive(Clone, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub epochs_since_improvement: usize,
    pub best_cider: f64,
    pub learning_rate: f32,
    pub timestamp: String,
    pub model: SerializableDae,
}

/// 检查点格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointFormat {
    Binary,
    Json,
}

impl CheckpointFormat {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "bin" => Ok(CheckpointFormat::Binary),
            "json" => Ok(CheckpointFormat::Json),
            other => Err(DaeError::Config(format!("未知的检查点格式: {}", other))),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::from_name(ext)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CheckpointFormat::Binary => "bin",
            CheckpointFormat::Json => "json",
        }
    }
}

impl Checkpoint {
    pub fn new(
        model: &mut Dae,
        epoch: usize,
        epochs_since_improvement: usize,
        best_cider: f64,
        learning_rate: f32,
    ) -> Self {
        Self {
            epoch,
            epochs_since_improvement,
            best_cider,
            learning_rate,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            model: SerializableDae::from_model(model),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let format = CheckpointFormat::from_path(path)?;
        let mut writer = BufWriter::new(File::create(path)?);
        match format {
            CheckpointFormat::Binary => {
                bincode::encode_into_std_write(self, &mut writer, bincode::config::standard())?;
            }
            CheckpointFormat::Json => serde_json::to_writer_pretty(&mut writer, self)?,
        }
        writer.flush()?;
        let file_size = fs::metadata(path)?.len();
        log::info!(
            "检查点已保存: {} (epoch={}, {:.2} MB)",
            path.display(),
            self.epoch,
            file_size as f64 / 1_048_576.0
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = CheckpointFormat::from_path(path)?;
        let mut reader = BufReader::new(File::open(path)?);
        let checkpoint: Checkpoint = match format {
            CheckpointFormat::Binary => bincode::decode_from_std_read(&mut reader, bincode::config::standard())?,
            CheckpointFormat::Json => serde_json::from_reader(reader)?,
        };
        if checkpoint.model.version != CHECKPOINT_VERSION {
            log::warn!(
                "检查点版本 {} 与当前版本 {} 不同",
                checkpoint.model.version,
                CHECKPOINT_VERSION
            );
        }
        log::info!(
            "检查点加载成功: {} (epoch={}, best CIDEr={:.4}, saved {})",
            path.display(),
            checkpoint.epoch,
            checkpoint.best_cider,
            checkpoint.timestamp
        );
        Ok(checkpoint)
    }
}

/// 检查点目录管理
#[derive(Clone, Debug)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    format: CheckpointFormat,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P, format: CheckpointFormat) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        if !checkpoint_dir.exists() {
            fs::create_dir_all(&checkpoint_dir)?;
        }
        Ok(Self {
            checkpoint_dir,
            format,
        })
    }

    pub fn path_for(&self, epoch: usize, best: bool) -> PathBuf {
        let name = format!("checkpoint_{}.{}", epoch, self.format.extension());
        if best {
            self.checkpoint_dir.join(format!("BEST_{}", name))
        } else {
            self.checkpoint_dir.join(name)
        }
    }

    /// 保存本 epoch 的检查点；`is_best` 时另存一份 `BEST_` 副本。返回普通检查点路径。
    pub fn save(&self, checkpoint: &Checkpoint, is_best: bool) -> Result<PathBuf> {
        let path = self.path_for(checkpoint.epoch, false);
        checkpoint.save(&path)?;
        if is_best {
            checkpoint.save(self.path_for(checkpoint.epoch, true))?;
            log::info!("新的最佳模型: epoch {}, CIDEr {:.4}", checkpoint.epoch, checkpoint.best_cider);
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(CheckpointFormat::from_path(Path::new("a/b.bin")).unwrap(), CheckpointFormat::Binary);
        assert_eq!(CheckpointFormat::from_path(Path::new("b.json")).unwrap(), CheckpointFormat::Json);
        assert!(CheckpointFormat::from_path(Path::new("b.pth")).is_err());
    }

    #[test]
    fn test_best_path_naming() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), CheckpointFormat::Json).unwrap();
        assert!(manager.path_for(3, true).ends_with("BEST_checkpoint_3.json"));
        assert!(manager.path_for(3, false).ends_with("checkpoint_3.json"));
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let mut param = Param::new(Array2::zeros((2, 3)));
        let stored = SerializableParam {
            name: "fc.weight".to_string(),
            shape: (3, 2),
            data: vec![0.0; 6],
            trainable: true,
            optimizer: SerializableAdam::from_adam(&Adam::new((3, 2))),
        };
        let err = stored.restore_into(&mut param).unwrap_err();
        assert!(matches!(err, DaeError::ShapeMismatch { expected: (2, 3), found: (3, 2), .. }));
    }
}
