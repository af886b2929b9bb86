use std::collections::HashMap;
use std::str::FromStr;

use rand::SeedableRng;
use rand::rngs::StdRng;

use dae_scst::checkpoint::{Checkpoint, CheckpointFormat, CheckpointManager};
use dae_scst::trainer::{TrainState, Trainer, training_reference_corpus};
use dae_scst::{CiderD, Dae, DaeError, Result, RunConfig, TextEmbedding, TrainDataset, ValDataset, Vocab};

const USAGE: &str = "用法: dae-scst <train|eval|init> [--config=path] [--key=value ...]";

// CLI 解析辅助函数
fn arg_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("{}=", key);
    args.iter().find_map(|a| a.strip_prefix(&prefix))
}

fn init_logger(args: &[String]) {
    let level = arg_value(args, "--log-level")
        .and_then(|v| log::LevelFilter::from_str(v).ok())
        .unwrap_or(log::LevelFilter::Info);
    if let Err(e) = simple_logger::SimpleLogger::new().with_level(level).init() {
        eprintln!("日志初始化失败: {}", e);
    }
}

/// 按配置新建模型；指定了 GloVe 文件时使用冻结的预训练词嵌入
fn build_model(config: &RunConfig, vocab: &Vocab, rng: &mut StdRng) -> Result<Dae> {
    match &config.train.glove_file {
        Some(path) => {
            let embedding = TextEmbedding::load_glove(path, vocab, rng)?;
            Dae::with_embedding(config.model.clone(), embedding, rng)
        }
        None => Dae::new(config.model.clone(), rng),
    }
}

/// 有检查点时从检查点恢复，否则新建
fn load_or_build(config: &RunConfig, vocab: &Vocab) -> Result<(Dae, TrainState)> {
    match &config.train.checkpoint {
        Some(path) => {
            let checkpoint = Checkpoint::load(path)?;
            let model = checkpoint.model.to_model()?;
            if model.config.vocab_size != vocab.len() {
                return Err(DaeError::Config(format!(
                    "检查点的词表大小 {} 与词表文件 {} 不一致",
                    model.config.vocab_size,
                    vocab.len()
                )));
            }
            if model.config != config.model {
                log::info!("使用检查点中保存的模型配置");
            }
            Ok((model, TrainState::from_checkpoint(&checkpoint)))
        }
        None => {
            let mut rng = StdRng::seed_from_u64(config.train.seed);
            let model = build_model(config, vocab, &mut rng)?;
            Ok((model, TrainState::fresh(&config.train)))
        }
    }
}

fn run_train(config: &RunConfig, vocab: &Vocab) -> Result<()> {
    let (model, state) = load_or_build(config, vocab)?;
    let train = TrainDataset::load(&config.train.data_dir)?;
    let val = ValDataset::load(&config.train.data_dir)?;

    let scorer = match &config.train.cider_cache {
        Some(path) => CiderD::load(path)?,
        None => {
            log::info!("未指定 CIDEr-D 缓存，从训练集参考字幕统计 document frequency");
            CiderD::from_corpus(&training_reference_corpus(&train, vocab)?)?
        }
    };
    let manager = CheckpointManager::new(
        &config.train.checkpoint_dir,
        CheckpointFormat::from_name(&config.train.checkpoint_format)?,
    )?;

    let mut trainer = Trainer::new(model, vocab, &scorer, &config.train, state);
    let state = trainer.run(&train, &val, &manager)?;
    log::info!(
        "训练结束: best CIDEr-D {:.4}, 学习率 {:.2e}",
        state.best_cider,
        state.learning_rate
    );
    Ok(())
}

fn run_eval(config: &RunConfig, vocab: &Vocab) -> Result<()> {
    if config.train.checkpoint.is_none() {
        log::warn!("未指定 --checkpoint，评估随机初始化的模型");
    }
    let (model, state) = load_or_build(config, vocab)?;
    let val = ValDataset::load(&config.train.data_dir)?;

    // 评估只用束搜索，奖励用的评分器不会被调用
    let scorer = CiderD::new(HashMap::new(), 1.0)?;
    let epoch = state.epoch.saturating_sub(1);
    let mut trainer = Trainer::new(model, vocab, &scorer, &config.train, state);
    let result = trainer.evaluate(&val, epoch)?;

    match &result.scores {
        Some(scores) => log::info!(
            "CIDEr: {:.4}, BLEU-1..4: {:.4} / {:.4} / {:.4} / {:.4}",
            scores.cider,
            scores.bleu_1,
            scores.bleu_2,
            scores.bleu_3,
            scores.bleu_4
        ),
        None => log::info!("没有参考字幕，结果见 {:?}", result.results_path),
    }
    log::info!("退化的束搜索结果: {}/{}", result.degenerate, result.predictions.len());
    Ok(())
}

/// 写出一个 epoch 0 的初始检查点，SCST 可以直接从它开始
fn run_init(config: &RunConfig, vocab: &Vocab) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(config.train.seed);
    let mut model = build_model(config, vocab, &mut rng)?;
    let manager = CheckpointManager::new(
        &config.train.checkpoint_dir,
        CheckpointFormat::from_name(&config.train.checkpoint_format)?,
    )?;
    log::info!(
        "初始化模型: {} ({} 个参数)",
        model.network_description(),
        model.total_parameters()
    );
    let checkpoint = Checkpoint::new(&mut model, 0, 0, 0.0, config.train.learning_rate);
    let path = manager.save(&checkpoint, false)?;
    log::info!("初始检查点: {}", path.display());
    Ok(())
}

fn run(args: &[String]) -> Result<()> {
    let command = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .map(String::as_str)
        .unwrap_or("train");

    let mut config = match arg_value(args, "--config") {
        Some(path) => RunConfig::from_json_file(path)?,
        None => RunConfig::default(),
    };
    config.apply_args(args)?;
    config.train.validate()?;

    let vocab = Vocab::load_json(&config.train.word_map)?;
    config.model.vocab_size = vocab.len();
    log::info!("词表大小: {}", vocab.len());

    match command {
        "train" => run_train(&config, &vocab),
        "eval" => run_eval(&config, &vocab),
        "init" => run_init(&config, &vocab),
        other => Err(DaeError::Config(format!("未知命令 {}\n{}", other, USAGE))),
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return;
    }
    init_logger(&args);

    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
