use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DaeError, Result};
use crate::{END_TOKEN, PAD_TOKEN, START_TOKEN, UNK_TOKEN};

/// 词表：token 字符串与稠密整数 ID `[0, |V|)` 的双向映射
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vocab {
    pub encode: HashMap<String, usize>,
    pub decode: HashMap<usize, String>,
    pub words: Vec<String>,
}

impl Vocab {
    /// 按给定顺序分配 ID。必须包含 `<pad>`、`<start>`、`<end>`，且 `<pad>` 的 ID 为 0。
    pub fn new(words: Vec<&str>) -> Result<Self> {
        let map = words
            .iter()
            .enumerate()
            .map(|(i, &w)| (w.to_string(), i))
            .collect::<HashMap<String, usize>>();
        if map.len() != words.len() {
            return Err(DaeError::InvalidData("词表中存在重复的词".to_string()));
        }
        Self::from_word_map(map)
    }

    /// 从 `{word: id}` 映射构造并校验
    pub fn from_word_map(word_map: HashMap<String, usize>) -> Result<Self> {
        if word_map.is_empty() {
            return Err(DaeError::InvalidData("词表为空".to_string()));
        }

        let size = word_map.len();
        let mut words = vec![None; size];
        for (word, &id) in &word_map {
            if id >= size {
                return Err(DaeError::InvalidData(format!(
                    "词 {:?} 的 ID {} 超出范围 [0, {})",
                    word, id, size
                )));
            }
            if words[id].is_some() {
                return Err(DaeError::InvalidData(format!("ID {} 被多个词占用", id)));
            }
            words[id] = Some(word.clone());
        }
        let words: Vec<String> = words.into_iter().flatten().collect();

        for special in [PAD_TOKEN, START_TOKEN, END_TOKEN] {
            if !word_map.contains_key(special) {
                return Err(DaeError::InvalidData(format!("词表缺少特殊 token {}", special)));
            }
        }
        if word_map[PAD_TOKEN] != 0 {
            return Err(DaeError::InvalidData(format!(
                "{} 的 ID 必须为 0，实际为 {}",
                PAD_TOKEN, word_map[PAD_TOKEN]
            )));
        }

        let decode = words.iter().enumerate().map(|(i, w)| (i, w.clone())).collect();
        Ok(Vocab {
            encode: word_map,
            decode,
            words,
        })
    }

    /// 读取 `WORDMAP_*.json`
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let word_map: HashMap<String, usize> = serde_json::from_str(&text)?;
        let vocab = Self::from_word_map(word_map)?;
        log::info!("词表加载完成: {} 个词 ({:?})", vocab.len(), path.as_ref());
        Ok(vocab)
    }

    /// Convert a word to its token index
    pub fn encode(&self, word: &str) -> Option<usize> {
        self.encode.get(word).copied()
    }

    /// Convert a token index back to a word
    pub fn decode(&self, token_id: usize) -> Option<&String> {
        self.decode.get(&token_id)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn pad_id(&self) -> usize {
        self.encode[PAD_TOKEN]
    }

    pub fn start_id(&self) -> usize {
        self.encode[START_TOKEN]
    }

    pub fn end_id(&self) -> usize {
        self.encode[END_TOKEN]
    }

    pub fn unk_id(&self) -> Option<usize> {
        self.encode(UNK_TOKEN)
    }

    /// 把 ID 序列渲染成句子：去掉 `<start>`、`<end>`、`<pad>`，词之间用单个空格分隔
    pub fn decode_caption(&self, token_ids: &[usize]) -> String {
        let skip = [self.start_id(), self.end_id(), self.pad_id()];
        token_ids
            .iter()
            .filter(|id| !skip.contains(id))
            .filter_map(|&id| self.decode(id).map(|w| w.as_str()))
            .collect::<Vec<&str>>()
            .join(" ")
    }
}
