//! 可训练参数与全局梯度裁剪
//!
//! 与逐层 `backward(grads, lr)` 立即更新不同，解码器按时间展开后同一组权重会被多次使用，
//! 所以梯度先累积到 [`Param::grad`]，整批反向传播结束后统一裁剪再由 Adam 更新。

use ndarray::Array2;

use crate::adam::Adam;

#[derive(Clone, Debug)]
pub struct Param {
    pub value: Array2<f32>,
    pub grad: Array2<f32>,
    pub optimizer: Adam,
    /// 冻结的参数（如预训练词嵌入）不累积梯度，也不参与更新
    pub trainable: bool,
}

impl Param {
    pub fn new(value: Array2<f32>) -> Self {
        let shape = value.dim();
        Self {
            value,
            grad: Array2::zeros(shape),
            optimizer: Adam::new(shape),
            trainable: true,
        }
    }

    pub fn frozen(value: Array2<f32>) -> Self {
        let mut param = Self::new(value);
        param.trainable = false;
        param
    }

    pub fn dim(&self) -> (usize, usize) {
        self.value.dim()
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn accumulate(&mut self, grad: &Array2<f32>) {
        if self.trainable {
            self.grad += grad;
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn step(&mut self, lr: f32) {
        if self.trainable {
            self.optimizer.step(&mut self.value, &self.grad, lr);
        }
    }
}

/// 带名字的参数引用，用于检查点和调试输出
pub type NamedParam<'a> = (String, &'a mut Param);

/// 参数容器：解码器的每个子模块都实现它，外层按固定顺序拼接
pub trait Layer {
    fn layer_type(&self) -> &str;

    /// 按固定顺序列出所有参数（包括冻结的），名字以 `prefix` 开头
    fn named_params(&mut self, prefix: &str) -> Vec<NamedParam<'_>>;

    fn parameters(&mut self) -> usize {
        self.named_params("").iter().map(|(_, p)| p.len()).sum()
    }

    fn set_training_mode(&mut self, _training: bool) {}
}

/// **全局 L2 范数梯度裁剪**
///
/// 计算所有可训练参数梯度的全局范数，超过 `max_norm` 时整体等比例缩小。
/// 返回裁剪前的范数。
pub fn clip_grad_norm(params: &mut [&mut Param], max_norm: f32) -> f32 {
    let total_sq: f32 = params
        .iter()
        .filter(|p| p.trainable)
        .map(|p| p.grad.iter().map(|g| g * g).sum::<f32>())
        .sum();
    let norm = total_sq.sqrt();

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for param in params.iter_mut().filter(|p| p.trainable) {
            param.grad.mapv_inplace(|g| g * scale);
        }
    }

    norm
}

pub fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
