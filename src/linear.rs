//! # 全连接层（Linear）
//!
//! ```text
//! 前向: y = x · W + b          x: (batch, in)  W: (in, out)  b: (1, out)
//!
//! 反向:
//!   grad_W += x^T · dy
//!   grad_b += sum(dy, axis=0)
//!   dx      = dy · W^T
//! ```
//!
//! 解码器的输出层、注意力中的三个投影以及编码器的汇总投影都是它。
//! 前向不缓存输入：同一层在一个批次里被多个时间步共享，输入由调用方存进时间步缓存。

use ndarray::{Array2, Axis};
use rand::Rng;

use crate::param::{Layer, NamedParam, Param, join_name};
use crate::utils::uniform_matrix;

#[derive(Clone, Debug)]
pub struct Linear {
    /// **权重矩阵** W: (in_dim, out_dim)
    pub weight: Param,
    /// **偏置向量** b: (1, out_dim)
    pub bias: Param,
}

impl Linear {
    /// 权重和偏置都用 U(-1/sqrt(in), 1/sqrt(in)) 初始化
    pub fn new<R: Rng>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
        Self {
            weight: Param::new(uniform_matrix(rng, (in_dim, out_dim), bound)),
            bias: Param::new(uniform_matrix(rng, (1, out_dim), bound)),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.value.ncols()
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        input.dot(&self.weight.value) + &self.bias.value
    }

    /// 累积参数梯度并返回对输入的梯度
    pub fn backward(&mut self, input: &Array2<f32>, grads: &Array2<f32>) -> Array2<f32> {
        if self.weight.trainable {
            self.weight.grad += &input.t().dot(grads);
        }
        if self.bias.trainable {
            self.bias.grad += &grads.sum_axis(Axis(0)).insert_axis(Axis(0));
        }
        grads.dot(&self.weight.value.t())
    }
}

impl Layer for Linear {
    fn layer_type(&self) -> &str {
        "Linear"
    }

    fn named_params(&mut self, prefix: &str) -> Vec<NamedParam<'_>> {
        vec![
            (join_name(prefix, "weight"), &mut self.weight),
            (join_name(prefix, "bias"), &mut self.bias),
        ]
    }
}
