//! # Dropout 正则化层
//!
//! Dropout 通过随机"丢弃"神经元来防止过拟合。本实现使用 **Inverted Dropout**，训练时进行缩放：
//!
//! ```text
//! 训练时: output = input * mask / (1 - p)
//! 推理时: output = input（不需要缩放）
//! ```
//!
//! 解码器在时间维上展开，同一个 Dropout 在一个批次里会被调用多次，
//! 因此掩码不保存在层内部，而是随前向结果一起返回，由调用方放进各自的时间步缓存。

use ndarray::Array2;
use rand::Rng;

/// **Dropout 正则化层**
#[derive(Clone, Debug)]
pub struct Dropout {
    /// **丢弃率**: 0.0-1.0，表示神经元被丢弃的概率
    pub dropout_rate: f32,

    /// **训练模式标志**
    /// - true: 训练模式，应用 dropout
    /// - false: 推理模式，不应用 dropout
    training: bool,
}

impl Dropout {
    pub fn new(dropout_rate: f32) -> Self {
        Self {
            dropout_rate,
            training: true,
        }
    }

    pub fn set_training_mode(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_active(&self) -> bool {
        self.training && self.dropout_rate > 0.0
    }

    /// **生成随机掩码**
    ///
    /// 保留的位置直接存放缩放因子 `1/(1-p)`，丢弃的位置为 0，
    /// 这样前向和反向都只需一次逐元素乘法。
    fn create_mask<R: Rng>(&self, shape: (usize, usize), rng: &mut R) -> Array2<f32> {
        let scale = 1.0 / (1.0 - self.dropout_rate);
        Array2::from_shape_fn(shape, |_| {
            if rng.random::<f32>() > self.dropout_rate {
                scale
            } else {
                0.0
            }
        })
    }

    /// 前向传播。推理模式下返回 `None` 掩码，反向时梯度原样通过。
    pub fn forward<R: Rng>(&self, input: &Array2<f32>, rng: &mut R) -> (Array2<f32>, Option<Array2<f32>>) {
        if self.is_active() {
            let mask = self.create_mask(input.dim(), rng);
            (input * &mask, Some(mask))
        } else {
            (input.clone(), None)
        }
    }

    pub fn backward(grads: &Array2<f32>, mask: Option<&Array2<f32>>) -> Array2<f32> {
        match mask {
            Some(mask) => grads * mask,
            None => grads.clone(),
        }
    }
}
