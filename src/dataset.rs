//! # 数据集加载
//!
//! 训练集和验证集都来自预先编码好的 JSON 文件（`data_dir` 下）：
//!
//! | 文件 | 内容 |
//! |------|------|
//! | `TRAIN_CAPTIONS_coco.json` | 每条参考字幕的 ID 序列（每张图片 5 条，连续存放） |
//! | `TRAIN_CAPLENS_coco.json`  | 每条参考字幕的有效长度 |
//! | `TRAIN_names_coco.json`    | 图片名，第 `i` 条字幕属于第 `i / 5` 张图片 |
//! | `CAPUTIL_train.json`       | `{图片名: {encoded_previous_caption, previous_caption_length, image_ids}}` |
//! | `VAL_names_coco.json`      | 验证集图片名 |
//! | `CAPUTIL_val.json`         | 验证集的上一版字幕 |
//! | `VAL_REFS_coco.json`       | 可选，`{image_id: [[ids], ...]}`，用于进程内计算 CIDEr-D |

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DaeError, Result};

pub const CAPTIONS_PER_IMAGE: usize = 5;

pub const TRAIN_CAPTIONS_FILE: &str = "TRAIN_CAPTIONS_coco.json";
pub const TRAIN_CAPLENS_FILE: &str = "TRAIN_CAPLENS_coco.json";
pub const TRAIN_NAMES_FILE: &str = "TRAIN_names_coco.json";
pub const TRAIN_CAPUTIL_FILE: &str = "CAPUTIL_train.json";
pub const VAL_NAMES_FILE: &str = "VAL_names_coco.json";
pub const VAL_CAPUTIL_FILE: &str = "CAPUTIL_val.json";
pub const VAL_REFS_FILE: &str = "VAL_REFS_coco.json";

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| {
        log::error!("读取数据文件失败 ({:?}): {}", path, e);
        e
    })?;
    serde_json::from_str(&text).map_err(|e| {
        log::error!("解析JSON数据失败 ({:?}): {}", path, e);
        e.into()
    })
}

/// 长度字段既可能是数字也可能是只有一个元素的数组
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LengthField {
    Scalar(usize),
    Wrapped(Vec<usize>),
}

impl LengthField {
    pub fn value(&self) -> Option<usize> {
        match self {
            LengthField::Scalar(n) => Some(*n),
            LengthField::Wrapped(v) => v.first().copied(),
        }
    }
}

/// 一张图片的上一版字幕
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptionUtil {
    pub encoded_previous_caption: Vec<usize>,
    pub previous_caption_length: LengthField,
    pub image_ids: u64,
}

impl CaptionUtil {
    /// 校验并返回有效长度：必须在 `[1, 宽度]` 内
    pub fn previous_length(&self, name: &str) -> Result<usize> {
        let len = self
            .previous_caption_length
            .value()
            .ok_or_else(|| DaeError::InvalidData(format!("{} 缺少上一版字幕长度", name)))?;
        if len == 0 || len > self.encoded_previous_caption.len() {
            return Err(DaeError::InvalidData(format!(
                "{} 的上一版字幕长度 {} 不在 [1, {}] 内",
                name,
                len,
                self.encoded_previous_caption.len()
            )));
        }
        Ok(len)
    }
}

/// 打乱后按批切分下标，最后一批可以不满
pub fn shuffled_batches<R: Rng>(len: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    indices.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}

/// 训练集的一条样本
#[derive(Clone, Debug)]
pub struct TrainItem {
    pub caption: Vec<usize>,
    pub caption_length: usize,
    pub previous_caption: Vec<usize>,
    pub previous_length: usize,
    /// 同一张图片的全部参考字幕
    pub all_captions: Vec<Vec<usize>>,
}

#[derive(Clone, Debug, Default)]
pub struct TrainBatch {
    pub captions: Vec<Vec<usize>>,
    pub caption_lengths: Vec<usize>,
    pub previous_captions: Vec<Vec<usize>>,
    pub previous_lengths: Vec<usize>,
    pub all_captions: Vec<Vec<Vec<usize>>>,
}

impl TrainBatch {
    pub fn len(&self) -> usize {
        self.previous_captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous_captions.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct TrainDataset {
    captions: Vec<Vec<usize>>,
    caption_lengths: Vec<usize>,
    names: Vec<String>,
    caption_util: HashMap<String, CaptionUtil>,
}

impl TrainDataset {
    pub fn new(
        captions: Vec<Vec<usize>>,
        caption_lengths: Vec<usize>,
        names: Vec<String>,
        caption_util: HashMap<String, CaptionUtil>,
    ) -> Result<Self> {
        if captions.len() != caption_lengths.len() {
            return Err(DaeError::InvalidData(format!(
                "字幕 {} 条，长度 {} 条",
                captions.len(),
                caption_lengths.len()
            )));
        }
        if captions.len() != names.len() * CAPTIONS_PER_IMAGE {
            return Err(DaeError::InvalidData(format!(
                "{} 张图片应有 {} 条字幕，实际 {} 条",
                names.len(),
                names.len() * CAPTIONS_PER_IMAGE,
                captions.len()
            )));
        }
        for name in &names {
            let util = caption_util
                .get(name)
                .ok_or_else(|| DaeError::InvalidData(format!("CAPUTIL 中缺少图片 {}", name)))?;
            util.previous_length(name)?;
        }
        Ok(Self {
            captions,
            caption_lengths,
            names,
            caption_util,
        })
    }

    pub fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref();
        let dataset = Self::new(
            read_json(&dir.join(TRAIN_CAPTIONS_FILE))?,
            read_json(&dir.join(TRAIN_CAPLENS_FILE))?,
            read_json(&dir.join(TRAIN_NAMES_FILE))?,
            read_json(&dir.join(TRAIN_CAPUTIL_FILE))?,
        )?;
        log::info!(
            "训练集加载完成: {} 张图片, {} 条字幕",
            dataset.names.len(),
            dataset.len()
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
    }

    pub fn get(&self, i: usize) -> Result<TrainItem> {
        if i >= self.len() {
            return Err(DaeError::InvalidData(format!("样本下标 {} 越界", i)));
        }
        let image = i / CAPTIONS_PER_IMAGE;
        let name = &self.names[image];
        let util = self
            .caption_util
            .get(name)
            .ok_or_else(|| DaeError::InvalidData(format!("CAPUTIL 中缺少图片 {}", name)))?;
        let first = image * CAPTIONS_PER_IMAGE;

        Ok(TrainItem {
            caption: self.captions[i].clone(),
            caption_length: self.caption_lengths[i],
            previous_caption: util.encoded_previous_caption.clone(),
            previous_length: util.previous_length(name)?,
            all_captions: self.captions[first..first + CAPTIONS_PER_IMAGE].to_vec(),
        })
    }

    pub fn collate(&self, indices: &[usize]) -> Result<TrainBatch> {
        let mut batch = TrainBatch::default();
        for &i in indices {
            let item = self.get(i)?;
            batch.captions.push(item.caption);
            batch.caption_lengths.push(item.caption_length);
            batch.previous_captions.push(item.previous_caption);
            batch.previous_lengths.push(item.previous_length);
            batch.all_captions.push(item.all_captions);
        }
        Ok(batch)
    }
}

/// 验证集的一条样本
#[derive(Clone, Debug)]
pub struct ValItem {
    pub image_id: u64,
    pub previous_caption: Vec<usize>,
    pub previous_length: usize,
}

#[derive(Clone, Debug)]
pub struct ValDataset {
    names: Vec<String>,
    caption_util: HashMap<String, CaptionUtil>,
    /// `image_id → 参考字幕 ID 序列`
    pub references: Option<HashMap<u64, Vec<Vec<usize>>>>,
}

impl ValDataset {
    pub fn new(
        names: Vec<String>,
        caption_util: HashMap<String, CaptionUtil>,
        references: Option<HashMap<u64, Vec<Vec<usize>>>>,
    ) -> Result<Self> {
        for name in &names {
            let util = caption_util
                .get(name)
                .ok_or_else(|| DaeError::InvalidData(format!("CAPUTIL 中缺少图片 {}", name)))?;
            util.previous_length(name)?;
        }
        Ok(Self {
            names,
            caption_util,
            references,
        })
    }

    /// 参考字幕文件不存在时只生成结果，不计算 CIDEr
    pub fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref();
        let refs_path = dir.join(VAL_REFS_FILE);
        let references = if refs_path.exists() {
            let raw: HashMap<String, Vec<Vec<usize>>> = read_json(&refs_path)?;
            let mut parsed = HashMap::with_capacity(raw.len());
            for (key, caps) in raw {
                let id = key
                    .parse::<u64>()
                    .map_err(|e| DaeError::InvalidData(format!("参考字幕的 image_id {:?} 无法解析: {}", key, e)))?;
                parsed.insert(id, caps);
            }
            Some(parsed)
        } else {
            log::warn!("未找到 {:?}，评估时不计算 CIDEr", refs_path);
            None
        };

        let dataset = Self::new(
            read_json(&dir.join(VAL_NAMES_FILE))?,
            read_json(&dir.join(VAL_CAPUTIL_FILE))?,
            references,
        )?;
        log::info!("验证集加载完成: {} 张图片", dataset.len());
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, i: usize) -> Result<ValItem> {
        let name = self
            .names
            .get(i)
            .ok_or_else(|| DaeError::InvalidData(format!("样本下标 {} 越界", i)))?;
        let util = self
            .caption_util
            .get(name)
            .ok_or_else(|| DaeError::InvalidData(format!("CAPUTIL 中缺少图片 {}", name)))?;
        Ok(ValItem {
            image_id: util.image_ids,
            previous_caption: util.encoded_previous_caption.clone(),
            previous_length: util.previous_length(name)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn util(len: usize, id: u64) -> CaptionUtil {
        CaptionUtil {
            encoded_previous_caption: vec![1, 3, 4, 2, 0],
            previous_caption_length: LengthField::Wrapped(vec![len]),
            image_ids: id,
        }
    }

    fn dataset() -> TrainDataset {
        let captions: Vec<Vec<usize>> = (0..10).map(|i| vec![1, 3 + i % 2, 2, 0]).collect();
        let mut utils = HashMap::new();
        utils.insert("a.jpg".to_string(), util(4, 1));
        utils.insert("b.jpg".to_string(), util(3, 2));
        TrainDataset::new(captions, vec![3; 10], vec!["a.jpg".into(), "b.jpg".into()], utils).unwrap()
    }

    #[test]
    fn test_item_groups_five_references() {
        let ds = dataset();
        let item = ds.get(7).unwrap();
        assert_eq!(item.previous_length, 3);
        assert_eq!(item.all_captions.len(), CAPTIONS_PER_IMAGE);
        assert_eq!(item.all_captions[2], item.caption);
    }

    #[test]
    fn test_zero_length_previous_caption_rejected() {
        let mut utils = HashMap::new();
        utils.insert("a.jpg".to_string(), util(0, 1));
        let result = ValDataset::new(vec!["a.jpg".into()], utils, None);
        assert!(matches!(result, Err(DaeError::InvalidData(_))));
    }

    #[test]
    fn test_wrong_caption_count_rejected() {
        let mut utils = HashMap::new();
        utils.insert("a.jpg".to_string(), util(2, 1));
        let result = TrainDataset::new(vec![vec![1, 2]; 4], vec![2; 4], vec!["a.jpg".into()], utils);
        assert!(result.is_err());
    }

    #[test]
    fn test_shuffled_batches_cover_everything() {
        let mut rng = StdRng::seed_from_u64(9);
        let batches = shuffled_batches(7, 3, &mut rng);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
        let mut all: Vec<usize> = batches.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_length_field_accepts_both_forms() {
        let scalar: CaptionUtil =
            serde_json::from_str(r#"{"encoded_previous_caption":[1,2],"previous_caption_length":2,"image_ids":5}"#)
                .unwrap();
        let wrapped: CaptionUtil =
            serde_json::from_str(r#"{"encoded_previous_caption":[1,2],"previous_caption_length":[2],"image_ids":5}"#)
                .unwrap();
        assert_eq!(scalar.previous_length("x").unwrap(), 2);
        assert_eq!(wrapped.previous_length("x").unwrap(), 2);
    }
}
