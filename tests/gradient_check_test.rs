/// 解码器梯度正确性测试
///
/// 固定输入词序列驱动一次带记录的解码，损失取 `Σ w[b,t] · logp[b,t]`，
/// 把随时间反向传播得到的参数梯度与有限差分结果对比。
/// 覆盖编码器、注意力、两层 LSTM 和输出层。
use dae_scst::decoder::{DecodeSession, DecodeTape};
use dae_scst::{Dae, DaeConfig, Generation, Layer, StepModel};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// 数值梯度检查使用的扰动大小
const EPSILON: f32 = 1e-2;
/// 相对误差允许范围
const REL_TOLERANCE: f32 = 0.1;
const ABS_TOLERANCE: f32 = 2e-3;

const PREVIOUS: [[usize; 5]; 2] = [[1, 3, 4, 5, 2], [1, 5, 2, 0, 0]];
const LENGTHS: [usize; 2] = [5, 3];
/// `SCRIPT[t][b]`：第 t 步选中的词
const SCRIPT: [[usize; 2]; 4] = [[3, 5], [4, 6], [5, 2], [2, 3]];

fn weights() -> Array2<f32> {
    Array2::from_shape_fn((2, SCRIPT.len()), |(b, t)| 0.3 + 0.2 * b as f32 - 0.15 * t as f32)
}

fn build_model() -> Dae {
    let mut rng = StdRng::seed_from_u64(11);
    let mut model = Dae::new(DaeConfig::tiny(7), &mut rng).unwrap();
    model.set_training_mode(false);
    model
}

/// 按脚本逐步解码，返回 (损失, 生成结果, 反向传播缓存)
fn scripted_run(model: &Dae) -> (f32, Generation, DecodeTape) {
    let mut rng = StdRng::seed_from_u64(0);
    let captions: Vec<Vec<usize>> = PREVIOUS.iter().map(|c| c.to_vec()).collect();
    let (encoded, encoder_cache) = model.encode(&captions, &LENGTHS, &mut rng).unwrap();
    let mut session = DecodeSession::new(model, &encoded, true).unwrap();

    let steps = SCRIPT.len();
    let mut logprobs = Array2::zeros((2, steps));
    let mut tokens = vec![1usize; 2];
    for (t, chosen) in SCRIPT.iter().enumerate() {
        let log_probs = session.step(&tokens, &mut rng).unwrap();
        for (b, &token) in chosen.iter().enumerate() {
            logprobs[[b, t]] = log_probs[[b, token]];
        }
        tokens = chosen.to_vec();
    }

    let loss = (&logprobs * &weights()).sum();
    let generation = Generation {
        seq: (0..2).map(|b| SCRIPT.iter().map(|step| step[b]).collect()).collect(),
        logprobs,
        chosen: SCRIPT.iter().map(|step| step.to_vec()).collect(),
        steps,
    };
    let (inputs, step_caches) = session.into_tape();
    let tape = DecodeTape {
        encoder: encoder_cache,
        inputs,
        steps: step_caches,
    };
    (loss, generation, tape)
}

fn perturb(model: &mut Dae, name: &str, index: (usize, usize), delta: f32) {
    let mut params = model.named_params("");
    let (_, param) = params
        .iter_mut()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("参数 {} 不存在", name));
    param.value[[index.0, index.1]] += delta;
}

fn analytic_gradients(model: &mut Dae) -> Vec<(String, Array2<f32>)> {
    let (_, generation, tape) = scripted_run(model);
    model.zero_grad();
    model.backward(tape, &generation, &weights()).unwrap();
    model
        .named_params("")
        .into_iter()
        .map(|(name, param)| (name, param.grad.clone()))
        .collect()
}

fn numerical_gradient(model: &mut Dae, name: &str, index: (usize, usize)) -> f32 {
    perturb(model, name, index, EPSILON);
    let (plus, _, _) = scripted_run(model);
    perturb(model, name, index, -2.0 * EPSILON);
    let (minus, _, _) = scripted_run(model);
    perturb(model, name, index, EPSILON);
    (plus - minus) / (2.0 * EPSILON)
}

fn check(name: &str, indices: &[(usize, usize)]) {
    let mut model = build_model();
    let grads = analytic_gradients(&mut model);
    let (_, grad) = grads
        .iter()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("参数 {} 不存在", name));

    for &index in indices {
        let analytic = grad[[index.0, index.1]];
        let numeric = numerical_gradient(&mut model, name, index);
        let scale = analytic.abs().max(numeric.abs());
        assert!(
            (analytic - numeric).abs() <= ABS_TOLERANCE + REL_TOLERANCE * scale,
            "{}{:?}: analytic {} vs numeric {}",
            name,
            index,
            analytic,
            numeric
        );
    }
}

#[test]
fn test_output_layer_gradients() {
    check("fc.weight", &[(0, 0), (3, 2), (9, 6)]);
    check("fc.bias", &[(0, 2), (0, 5)]);
}

#[test]
fn test_language_lstm_gradients() {
    check("language_lstm.w_ih", &[(0, 0), (12, 17), (21, 33)]);
    check("language_lstm.w_hh", &[(1, 4), (9, 39)]);
}

#[test]
fn test_attention_lstm_gradients() {
    check("attention_lstm.w_ih", &[(0, 1), (10, 22), (25, 38)]);
    check("attention_lstm.bias", &[(0, 3), (0, 31)]);
}

#[test]
fn test_attention_gradients() {
    check("attention.feature_att.weight", &[(0, 0), (7, 4), (11, 6)]);
    check("attention.decoder_att.weight", &[(2, 3), (9, 0)]);
    check("attention.full_att.weight", &[(0, 0), (5, 0)]);
}

#[test]
fn test_encoder_gradients() {
    check("encoder.forward_lstm.w_ih", &[(0, 0), (5, 13), (7, 23)]);
    check("encoder.backward_lstm.w_hh", &[(2, 2), (5, 20)]);
    check("encoder.summary.weight", &[(0, 0), (8, 5), (11, 7)]);
}
