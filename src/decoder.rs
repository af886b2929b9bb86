//! # DAE 解码器
//!
//! 以上一版字幕的编码为条件，逐步生成新字幕的两层 LSTM 解码器：
//!
//! ```text
//! h1, c1 = AttentionLSTM([embed(token), summary, h2], (h1, c1))
//! ctx    = Attention(features, h1, mask)
//! h2, c2 = LanguageLSTM([h1, ctx], (h2, c2))
//! logp   = log_softmax(fc(dropout(h2)))
//! ```
//!
//! 一次解码调用的隐藏状态全部放在 [`DecodeSession`] 里，调用结束即丢弃，不跨批次共享。
//! 训练时会话记录每一步的缓存（[`DecodeTape`]），[`Dae::backward`] 据此做随时间反向传播。

use ndarray::{Array2, Array3, Axis, s};
use rand::Rng;

use crate::attention::{AttentionCache, AttentionInputs, CaptionAttention};
use crate::beam_search::{BeamHypothesis, BeamSearchConfig, BeamStep, beam_search};
use crate::config::DaeConfig;
use crate::dropout::Dropout;
use crate::embeddings::{EmbeddingCache, TextEmbedding};
use crate::encoder::{CaptionEncoder, EncoderCache, EncoderOutput};
use crate::error::{DaeError, Result};
use crate::generation::{DecodeMode, Generation, StepModel, unroll};
use crate::linear::Linear;
use crate::lstm::{LstmCache, LstmCell};
use crate::param::{Layer, NamedParam, Param, clip_grad_norm, join_name};
use crate::utils::{concat_columns, log_softmax};
use crate::vocab::Vocab;

#[derive(Clone, Debug)]
pub struct Dae {
    pub config: DaeConfig,
    pub embedding: TextEmbedding,
    pub encoder: CaptionEncoder,
    pub attention: CaptionAttention,
    pub attention_lstm: LstmCell,
    pub language_lstm: LstmCell,
    pub dropout: Dropout,
    pub fc: Linear,
    training: bool,
}

/// 解码器一个时间步的缓存
#[derive(Clone, Debug)]
pub struct DecoderStepCache {
    embedding: EmbeddingCache,
    attention_lstm: LstmCache,
    attention: AttentionCache,
    language_lstm: LstmCache,
    dropout_mask: Option<Array2<f32>>,
    /// dropout 之后、输出层之前的 h2
    fc_input: Array2<f32>,
    log_probs: Array2<f32>,
}

/// 一次带记录的解码所需的全部反向传播信息
#[derive(Clone, Debug)]
pub struct DecodeTape {
    pub encoder: EncoderCache,
    pub inputs: AttentionInputs,
    pub steps: Vec<DecoderStepCache>,
}

impl Dae {
    pub fn new<R: Rng>(config: DaeConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let embedding = TextEmbedding::new(config.vocab_size, config.embedding_dim, config.dropout, rng);
        Self::with_embedding(config, embedding, rng)
    }

    /// 使用给定的词嵌入层（例如 GloVe）构建，嵌入维度以嵌入层为准
    pub fn with_embedding<R: Rng>(mut config: DaeConfig, embedding: TextEmbedding, rng: &mut R) -> Result<Self> {
        if embedding.vocab_size() != config.vocab_size {
            return Err(DaeError::Config(format!(
                "嵌入表有 {} 行，词表大小为 {}",
                embedding.vocab_size(),
                config.vocab_size
            )));
        }
        config.embedding_dim = embedding.embedding_dim();
        config.pretrained_embedding = embedding.pretrained;
        config.validate()?;

        let feature_dim = config.feature_dim();
        let encoder = CaptionEncoder::new(&config, config.embedding_dim, rng);
        let attention = CaptionAttention::new(feature_dim, config.decoder_dim, config.attention_dim, rng);
        let attention_lstm = LstmCell::new(
            config.embedding_dim + config.summary_dim + config.decoder_dim,
            config.decoder_dim,
            rng,
        );
        let language_lstm = LstmCell::new(config.decoder_dim + feature_dim, config.decoder_dim, rng);
        let fc = Linear::new(config.decoder_dim, config.vocab_size, rng);
        let dropout = Dropout::new(config.dropout);

        Ok(Self {
            config,
            embedding,
            encoder,
            attention,
            attention_lstm,
            language_lstm,
            dropout,
            fc,
            training: true,
        })
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn network_description(&self) -> String {
        [
            self.embedding.layer_type(),
            self.encoder.layer_type(),
            self.attention.layer_type(),
            self.attention_lstm.layer_type(),
            self.language_lstm.layer_type(),
            self.fc.layer_type(),
        ]
        .join(", ")
    }

    pub fn total_parameters(&mut self) -> usize {
        self.parameters()
    }

    pub fn zero_grad(&mut self) {
        for (_, param) in self.named_params("") {
            param.zero_grad();
        }
    }

    /// 全局梯度裁剪后对所有可训练参数执行一次 Adam 更新，返回裁剪前的梯度范数
    pub fn apply_gradients(&mut self, max_norm: f32, lr: f32) -> f32 {
        let mut params: Vec<&mut Param> = self.named_params("").into_iter().map(|(_, p)| p).collect();
        let norm = clip_grad_norm(&mut params, max_norm);
        for param in params.iter_mut() {
            param.step(lr);
        }
        norm
    }

    pub fn encode<R: Rng>(
        &self,
        captions: &[Vec<usize>],
        lengths: &[usize],
        rng: &mut R,
    ) -> Result<(EncoderOutput, EncoderCache)> {
        self.encoder.forward(&self.embedding, captions, lengths, rng)
    }

    /// **按批解码（不记录缓存）**
    pub fn decode<R: Rng>(
        &self,
        vocab: &Vocab,
        captions: &[Vec<usize>],
        lengths: &[usize],
        mode: DecodeMode,
        max_len: usize,
        rng: &mut R,
    ) -> Result<Generation> {
        let (encoded, _) = self.encode(captions, lengths, rng)?;
        let mut session = DecodeSession::new(self, &encoded, false)?;
        unroll(
            &mut session,
            captions.len(),
            vocab.start_id(),
            vocab.end_id(),
            max_len,
            mode,
            rng,
        )
    }

    /// **采样解码并记录反向传播所需的缓存**
    pub fn sample_with_tape<R: Rng>(
        &self,
        vocab: &Vocab,
        captions: &[Vec<usize>],
        lengths: &[usize],
        max_len: usize,
        rng: &mut R,
    ) -> Result<(Generation, DecodeTape)> {
        let (encoded, encoder_cache) = self.encode(captions, lengths, rng)?;
        let mut session = DecodeSession::new(self, &encoded, true)?;
        let generation = unroll(
            &mut session,
            captions.len(),
            vocab.start_id(),
            vocab.end_id(),
            max_len,
            DecodeMode::Sample,
            rng,
        )?;
        let (inputs, steps) = session.into_tape();
        let tape = DecodeTape {
            encoder: encoder_cache,
            inputs,
            steps,
        };
        Ok((generation, tape))
    }

    /// **单条字幕的束搜索**
    pub fn beam_search<R: Rng>(
        &self,
        caption: &[usize],
        length: usize,
        config: &BeamSearchConfig,
        rng: &mut R,
    ) -> Result<BeamHypothesis> {
        let (encoded, _) = self.encode(&[caption.to_vec()], &[length], rng)?;
        let mut session = DecodeSession::new(self, &encoded, false)?;
        session.reorder(&vec![0; config.beam_size]);
        beam_search(&mut session, config, rng)
    }

    /// **随时间反向传播**
    ///
    /// `d_logprobs[b, t]` 是损失对第 t 步所选词 log-probability 的梯度，
    /// 参数梯度累积进各层的 [`Param`]，不做更新。
    pub fn backward(&mut self, tape: DecodeTape, generation: &Generation, d_logprobs: &Array2<f32>) -> Result<()> {
        let DecodeTape {
            encoder: encoder_cache,
            inputs,
            steps,
        } = tape;

        if steps.len() < generation.steps || generation.chosen.len() < generation.steps {
            return Err(DaeError::InvalidData(format!(
                "记录了 {} 步，生成了 {} 步",
                steps.len(),
                generation.steps
            )));
        }
        if d_logprobs.dim() != generation.logprobs.dim() {
            return Err(DaeError::InvalidData(format!(
                "梯度形状 {:?} 与 log-probabilities {:?} 不一致",
                d_logprobs.dim(),
                generation.logprobs.dim()
            )));
        }

        let batch = inputs.batch_size();
        let dd = self.config.decoder_dim;
        let ed = self.embedding.embedding_dim();
        let sd = self.config.summary_dim;

        let mut d_features = Array3::zeros(inputs.features.dim());
        let mut d_projected = Array3::zeros(inputs.projected.dim());
        let mut d_summary = Array2::zeros((batch, sd));
        let mut dh1 = Array2::zeros((batch, dd));
        let mut dc1 = Array2::zeros((batch, dd));
        let mut dh2 = Array2::zeros((batch, dd));
        let mut dc2 = Array2::zeros((batch, dd));

        for t in (0..generation.steps).rev() {
            let cache = &steps[t];

            // d logp[tok] / d logits = onehot(tok) - softmax
            let mut d_logits = cache.log_probs.mapv(f32::exp);
            for (b, &token) in generation.chosen[t].iter().enumerate() {
                let g = d_logprobs[[b, t]];
                d_logits.row_mut(b).mapv_inplace(|p| -g * p);
                d_logits[[b, token]] += g;
            }

            let d_dropped = self.fc.backward(&cache.fc_input, &d_logits);
            let dh2_total = Dropout::backward(&d_dropped, cache.dropout_mask.as_ref()) + &dh2;
            let (dx_lang, dh2_prev, dc2_prev) = self.language_lstm.backward(&cache.language_lstm, &dh2_total, &dc2);

            let d_context = dx_lang.slice(s![.., dd..]).to_owned();
            let dh1_from_attention = self.attention.backward(
                &inputs,
                &cache.attention,
                &d_context,
                &mut d_features,
                &mut d_projected,
            );
            let dh1_total = &dx_lang.slice(s![.., 0..dd]) + &dh1_from_attention + &dh1;
            let (dx_att, dh1_prev, dc1_prev) = self.attention_lstm.backward(&cache.attention_lstm, &dh1_total, &dc1);

            let d_embedding = dx_att.slice(s![.., 0..ed]).to_owned();
            d_summary += &dx_att.slice(s![.., ed..ed + sd]);
            self.embedding.backward(&cache.embedding, &d_embedding);

            dh1 = dh1_prev;
            dc1 = dc1_prev;
            dh2 = dh2_prev + &dx_att.slice(s![.., ed + sd..]);
            dc2 = dc2_prev;
        }

        d_features += &self.attention.backward_features(&inputs, &d_projected);
        self.encoder
            .backward(&mut self.embedding, &encoder_cache, &d_features, &d_summary);
        Ok(())
    }
}

impl Layer for Dae {
    fn layer_type(&self) -> &str {
        "DAE"
    }

    fn named_params(&mut self, prefix: &str) -> Vec<NamedParam<'_>> {
        let mut params = self.embedding.named_params(&join_name(prefix, "embedding"));
        params.extend(self.encoder.named_params(&join_name(prefix, "encoder")));
        params.extend(self.attention.named_params(&join_name(prefix, "attention")));
        params.extend(self.attention_lstm.named_params(&join_name(prefix, "attention_lstm")));
        params.extend(self.language_lstm.named_params(&join_name(prefix, "language_lstm")));
        params.extend(self.fc.named_params(&join_name(prefix, "fc")));
        params
    }

    fn set_training_mode(&mut self, training: bool) {
        self.training = training;
        self.embedding.set_training_mode(training);
        self.dropout.set_training_mode(training);
    }
}

/// 一次解码调用的状态
pub struct DecodeSession<'a> {
    model: &'a Dae,
    inputs: AttentionInputs,
    summary: Array2<f32>,
    h1: Array2<f32>,
    c1: Array2<f32>,
    h2: Array2<f32>,
    c2: Array2<f32>,
    tape: Option<Vec<DecoderStepCache>>,
}

impl<'a> DecodeSession<'a> {
    /// 隐藏状态清零；`record` 为 true 时记录每一步的缓存
    pub fn new(model: &'a Dae, encoded: &EncoderOutput, record: bool) -> Result<Self> {
        let inputs = model.attention.prepare(&encoded.features, &encoded.mask)?;
        let batch = inputs.batch_size();
        let (h1, c1) = model.attention_lstm.zero_state(batch);
        let (h2, c2) = model.language_lstm.zero_state(batch);
        Ok(Self {
            model,
            inputs,
            summary: encoded.summary.clone(),
            h1,
            c1,
            h2,
            c2,
            tape: record.then(Vec::new),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.h1.nrows()
    }

    pub fn into_tape(self) -> (AttentionInputs, Vec<DecoderStepCache>) {
        (self.inputs, self.tape.unwrap_or_default())
    }
}

impl StepModel for DecodeSession<'_> {
    fn step<R: Rng>(&mut self, tokens: &[usize], rng: &mut R) -> Result<Array2<f32>> {
        if tokens.len() != self.batch_size() {
            return Err(DaeError::InvalidData(format!(
                "输入 {} 个词，会话批大小为 {}",
                tokens.len(),
                self.batch_size()
            )));
        }
        let model = self.model;

        let (embedded, embedding_cache) = model.embedding.forward(tokens, rng)?;
        let att_input = concat_columns(&[embedded.view(), self.summary.view(), self.h2.view()])?;
        let (h1, c1, att_lstm_cache) = model.attention_lstm.forward(&att_input, &self.h1, &self.c1);

        let (context, attention_cache) = model.attention.forward(&self.inputs, &h1);

        let lang_input = concat_columns(&[h1.view(), context.view()])?;
        let (h2, c2, lang_lstm_cache) = model.language_lstm.forward(&lang_input, &self.h2, &self.c2);

        let (fc_input, dropout_mask) = model.dropout.forward(&h2, rng);
        let log_probs = log_softmax(&model.fc.forward(&fc_input));

        if let Some(tape) = self.tape.as_mut() {
            tape.push(DecoderStepCache {
                embedding: embedding_cache,
                attention_lstm: att_lstm_cache,
                attention: attention_cache,
                language_lstm: lang_lstm_cache,
                dropout_mask,
                fc_input,
                log_probs: log_probs.clone(),
            });
        }

        self.h1 = h1;
        self.c1 = c1;
        self.h2 = h2;
        self.c2 = c2;
        Ok(log_probs)
    }
}

impl BeamStep for DecodeSession<'_> {
    /// 束搜索只在评估时使用，重排后不再记录缓存
    fn reorder(&mut self, rows: &[usize]) {
        self.inputs = self.inputs.select(rows);
        self.summary = self.summary.select(Axis(0), rows);
        self.h1 = self.h1.select(Axis(0), rows);
        self.c1 = self.c1.select(Axis(0), rows);
        self.h2 = self.h2.select(Axis(0), rows);
        self.c2 = self.c2.select(Axis(0), rows);
        self.tape = None;
    }
}
