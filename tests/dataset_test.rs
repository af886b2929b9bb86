//! 数据集加载集成测试

use std::fs;
use std::path::Path;

use dae_scst::dataset::{
    TRAIN_CAPLENS_FILE, TRAIN_CAPTIONS_FILE, TRAIN_CAPUTIL_FILE, TRAIN_NAMES_FILE, VAL_CAPUTIL_FILE,
    VAL_NAMES_FILE, VAL_REFS_FILE, shuffled_batches,
};
use dae_scst::trainer::training_reference_corpus;
use dae_scst::{DaeError, TrainDataset, ValDataset, Vocab};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn write_train_files(dir: &Path) {
    let captions: Vec<Vec<usize>> = (0..10)
        .map(|i| if i < 5 { vec![1, 3, 4, 2, 0] } else { vec![1, 4, 2, 0, 0] })
        .collect();
    let lengths: Vec<usize> = (0..10).map(|i| if i < 5 { 4 } else { 3 }).collect();
    write(dir, TRAIN_CAPTIONS_FILE, &serde_json::to_string(&captions).unwrap());
    write(dir, TRAIN_CAPLENS_FILE, &serde_json::to_string(&lengths).unwrap());
    write(dir, TRAIN_NAMES_FILE, r#"["x.jpg", "y.jpg"]"#);
    write(
        dir,
        TRAIN_CAPUTIL_FILE,
        r#"{
            "x.jpg": {"encoded_previous_caption": [1, 3, 2, 0], "previous_caption_length": [3], "image_ids": 10},
            "y.jpg": {"encoded_previous_caption": [1, 4, 4, 2], "previous_caption_length": 4, "image_ids": 20}
        }"#,
    );
}

fn write_val_files(dir: &Path, with_refs: bool) {
    write(dir, VAL_NAMES_FILE, r#"["v.jpg"]"#);
    write(
        dir,
        VAL_CAPUTIL_FILE,
        r#"{"v.jpg": {"encoded_previous_caption": [1, 3, 4, 2, 0], "previous_caption_length": [4], "image_ids": 77}}"#,
    );
    if with_refs {
        write(dir, VAL_REFS_FILE, r#"{"77": [[1, 3, 4, 2], [1, 4, 2, 0]]}"#);
    }
}

fn vocab() -> Vocab {
    Vocab::new(vec!["<pad>", "<start>", "<end>", "a", "dog"]).unwrap()
}

#[test]
fn test_load_train_dataset() {
    let dir = tempfile::tempdir().unwrap();
    write_train_files(dir.path());
    let dataset = TrainDataset::load(dir.path()).unwrap();
    assert_eq!(dataset.len(), 10);

    let item = dataset.get(6).unwrap();
    assert_eq!(item.caption, vec![1, 4, 2, 0, 0]);
    assert_eq!(item.caption_length, 3);
    assert_eq!(item.previous_caption, vec![1, 4, 4, 2]);
    assert_eq!(item.previous_length, 4);
    assert_eq!(item.all_captions.len(), 5);

    let batch = dataset.collate(&[0, 9]).unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.previous_lengths, vec![3, 4]);
    assert!(dataset.get(10).is_err());
}

#[test]
fn test_reference_corpus_from_training_set() {
    let dir = tempfile::tempdir().unwrap();
    write_train_files(dir.path());
    let dataset = TrainDataset::load(dir.path()).unwrap();
    let corpus = training_reference_corpus(&dataset, &vocab()).unwrap();
    assert_eq!(corpus.len(), 2);
    assert!(corpus[0].iter().all(|s| s == "3 4 0"));
    assert!(corpus[1].iter().all(|s| s == "4 0"));
}

#[test]
fn test_load_val_dataset_with_and_without_references() {
    let dir = tempfile::tempdir().unwrap();
    write_val_files(dir.path(), false);
    let dataset = ValDataset::load(dir.path()).unwrap();
    assert_eq!(dataset.len(), 1);
    assert!(dataset.references.is_none());
    let item = dataset.get(0).unwrap();
    assert_eq!(item.image_id, 77);
    assert_eq!(item.previous_length, 4);

    write_val_files(dir.path(), true);
    let dataset = ValDataset::load(dir.path()).unwrap();
    let references = dataset.references.unwrap();
    assert_eq!(references[&77].len(), 2);
}

#[test]
fn test_previous_length_longer_than_caption_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), VAL_NAMES_FILE, r#"["v.jpg"]"#);
    write(
        dir.path(),
        VAL_CAPUTIL_FILE,
        r#"{"v.jpg": {"encoded_previous_caption": [1, 2], "previous_caption_length": [3], "image_ids": 1}}"#,
    );
    assert!(matches!(ValDataset::load(dir.path()), Err(DaeError::InvalidData(_))));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(TrainDataset::load(dir.path()), Err(DaeError::Io(_))));
}

#[test]
fn test_batches_are_seeded() {
    let a = shuffled_batches(23, 5, &mut StdRng::seed_from_u64(1));
    let b = shuffled_batches(23, 5, &mut StdRng::seed_from_u64(1));
    assert_eq!(a, b);
    assert_eq!(a.len(), 5);
    assert_eq!(a.last().map(Vec::len), Some(3));
}
