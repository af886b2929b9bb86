use std::collections::HashMap;

use dae_scst::{DaeError, TextEmbedding, Vocab};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn word_map(pairs: &[(&str, usize)]) -> HashMap<String, usize> {
    pairs.iter().map(|&(w, i)| (w.to_string(), i)).collect()
}

#[test]
fn test_vocab_special_ids() {
    let vocab = Vocab::new(vec!["<pad>", "<start>", "<end>", "a", "dog", "<unk>"]).unwrap();
    assert_eq!(vocab.len(), 6);
    assert_eq!(vocab.pad_id(), 0);
    assert_eq!(vocab.start_id(), 1);
    assert_eq!(vocab.end_id(), 2);
    assert_eq!(vocab.unk_id(), Some(5));
    assert_eq!(vocab.encode("dog"), Some(4));
    assert_eq!(vocab.decode(3).map(String::as_str), Some("a"));
    assert_eq!(vocab.encode("cat"), None);
}

#[test]
fn test_decode_caption_skips_markers() {
    let vocab = Vocab::new(vec!["<pad>", "<start>", "<end>", "a", "dog"]).unwrap();
    assert_eq!(vocab.decode_caption(&[1, 3, 4, 2, 0, 0]), "a dog");
    assert_eq!(vocab.decode_caption(&[1, 2]), "");
}

#[test]
fn test_invalid_word_maps_rejected() {
    // 空词表
    assert!(matches!(Vocab::from_word_map(HashMap::new()), Err(DaeError::InvalidData(_))));
    // ID 不稠密
    let sparse = word_map(&[("<pad>", 0), ("<start>", 1), ("<end>", 5)]);
    assert!(matches!(Vocab::from_word_map(sparse), Err(DaeError::InvalidData(_))));
    // <pad> 不是 0
    let shifted = word_map(&[("<start>", 0), ("<pad>", 1), ("<end>", 2)]);
    assert!(matches!(Vocab::from_word_map(shifted), Err(DaeError::InvalidData(_))));
    // 缺少 <end>
    let missing = word_map(&[("<pad>", 0), ("<start>", 1), ("a", 2)]);
    assert!(matches!(Vocab::from_word_map(missing), Err(DaeError::InvalidData(_))));
    // 重复的词
    assert!(Vocab::new(vec!["<pad>", "<start>", "<end>", "a", "a"]).is_err());
}

#[test]
fn test_load_word_map_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("WORDMAP_coco.json");
    std::fs::write(&path, r#"{"<pad>": 0, "<start>": 1, "<end>": 2, "a": 3, "dog": 4}"#).unwrap();
    let vocab = Vocab::load_json(&path).unwrap();
    assert_eq!(vocab.len(), 5);
    assert_eq!(vocab.words[4], "dog");
}

#[test]
fn test_glove_loading() {
    let vocab = Vocab::new(vec!["<pad>", "<start>", "<end>", "a", "dog"]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("glove.txt");
    std::fs::write(&path, "dog 0.5 -0.25 1.0\ncat 9 9 9\na 1 2 3\n").unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    let embedding = TextEmbedding::load_glove(&path, &vocab, &mut rng).unwrap();
    assert!(embedding.pretrained);
    assert!(!embedding.table.trainable);
    assert_eq!(embedding.embedding_dim(), 3);
    assert_eq!(embedding.vocab_size(), 5);
    assert_eq!(embedding.table.value.row(4).to_vec(), vec![0.5, -0.25, 1.0]);
    assert_eq!(embedding.table.value.row(3).to_vec(), vec![1.0, 2.0, 3.0]);

    // 文件中没有的词在 ±sqrt(3/d) 内随机初始化
    let bound = (3.0f32 / 3.0).sqrt();
    assert!(embedding.table.value.row(0).iter().all(|v| v.abs() <= bound));
}

#[test]
fn test_glove_dimension_mismatch_rejected() {
    let vocab = Vocab::new(vec!["<pad>", "<start>", "<end>", "a"]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("glove.txt");
    std::fs::write(&path, "a 1 2 3\n<end> 1 2\n").unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let result = TextEmbedding::load_glove(&path, &vocab, &mut rng);
    assert!(matches!(result, Err(DaeError::InvalidData(_))));
}
