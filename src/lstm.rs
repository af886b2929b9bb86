//! # LSTM 单元（LSTMCell）
//!
//! 单个时间步的长短期记忆单元，门的排列顺序为 `[i, f, g, o]`：
//!
//! ```text
//! z = x · W_ih + h · W_hh + b                       (batch, 4H)
//! i = σ(z_i)   f = σ(z_f)   g = tanh(z_g)   o = σ(z_o)
//! c' = f ⊙ c + i ⊙ g
//! h' = o ⊙ tanh(c')
//! ```
//!
//! 解码器的 attention-LSTM、language-LSTM 以及双向编码器的两个方向都用它。
//! 前向返回 [`LstmCache`]，反向传播时由调用方按时间逆序喂回来。

use ndarray::{Array2, Axis, s};
use rand::Rng;

use crate::param::{Layer, NamedParam, Param, join_name};
use crate::utils::uniform_matrix;

#[derive(Clone, Debug)]
pub struct LstmCell {
    pub input_dim: usize,
    pub hidden_dim: usize,
    /// 输入到四个门的权重 (input_dim, 4H)
    pub w_ih: Param,
    /// 隐藏状态到四个门的权重 (H, 4H)
    pub w_hh: Param,
    /// 偏置 (1, 4H)
    pub bias: Param,
}

/// 一个时间步前向传播的中间结果
#[derive(Clone, Debug)]
pub struct LstmCache {
    pub input: Array2<f32>,
    pub h_prev: Array2<f32>,
    pub c_prev: Array2<f32>,
    pub i: Array2<f32>,
    pub f: Array2<f32>,
    pub g: Array2<f32>,
    pub o: Array2<f32>,
    /// tanh(c')
    pub c_tanh: Array2<f32>,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl LstmCell {
    /// 所有权重用 U(-1/sqrt(H), 1/sqrt(H)) 初始化
    pub fn new<R: Rng>(input_dim: usize, hidden_dim: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (hidden_dim.max(1) as f32).sqrt();
        Self {
            input_dim,
            hidden_dim,
            w_ih: Param::new(uniform_matrix(rng, (input_dim, 4 * hidden_dim), bound)),
            w_hh: Param::new(uniform_matrix(rng, (hidden_dim, 4 * hidden_dim), bound)),
            bias: Param::new(uniform_matrix(rng, (1, 4 * hidden_dim), bound)),
        }
    }

    /// 全零的 (h, c)
    pub fn zero_state(&self, batch_size: usize) -> (Array2<f32>, Array2<f32>) {
        (
            Array2::zeros((batch_size, self.hidden_dim)),
            Array2::zeros((batch_size, self.hidden_dim)),
        )
    }

    pub fn forward(
        &self,
        input: &Array2<f32>,
        h_prev: &Array2<f32>,
        c_prev: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, LstmCache) {
        let hd = self.hidden_dim;
        let z = input.dot(&self.w_ih.value) + h_prev.dot(&self.w_hh.value) + &self.bias.value;

        let i = z.slice(s![.., 0..hd]).mapv(sigmoid);
        let f = z.slice(s![.., hd..2 * hd]).mapv(sigmoid);
        let g = z.slice(s![.., 2 * hd..3 * hd]).mapv(f32::tanh);
        let o = z.slice(s![.., 3 * hd..4 * hd]).mapv(sigmoid);

        let c = &f * c_prev + &i * &g;
        let c_tanh = c.mapv(f32::tanh);
        let h = &o * &c_tanh;

        let cache = LstmCache {
            input: input.clone(),
            h_prev: h_prev.clone(),
            c_prev: c_prev.clone(),
            i,
            f,
            g,
            o,
            c_tanh,
        };
        (h, c, cache)
    }

    /// **反向传播一个时间步**
    ///
    /// `dh`、`dc` 是损失对本步输出 `h'`、`c'` 的梯度（包含来自后续时间步的部分）。
    /// 返回 `(dx, dh_prev, dc_prev)`，并把参数梯度累积进各自的 [`Param`]。
    pub fn backward(
        &mut self,
        cache: &LstmCache,
        dh: &Array2<f32>,
        dc: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let hd = self.hidden_dim;
        let batch = dh.nrows();

        let d_o = dh * &cache.c_tanh;
        let dc_total = dc + &(dh * &cache.o * &cache.c_tanh.mapv(|t| 1.0 - t * t));
        let d_i = &dc_total * &cache.g;
        let d_f = &dc_total * &cache.c_prev;
        let d_g = &dc_total * &cache.i;
        let dc_prev = &dc_total * &cache.f;

        // 对门的预激活值求导
        let mut dz = Array2::<f32>::zeros((batch, 4 * hd));
        dz.slice_mut(s![.., 0..hd])
            .assign(&(&d_i * &cache.i.mapv(|v| v * (1.0 - v))));
        dz.slice_mut(s![.., hd..2 * hd])
            .assign(&(&d_f * &cache.f.mapv(|v| v * (1.0 - v))));
        dz.slice_mut(s![.., 2 * hd..3 * hd])
            .assign(&(&d_g * &cache.g.mapv(|v| 1.0 - v * v)));
        dz.slice_mut(s![.., 3 * hd..4 * hd])
            .assign(&(&d_o * &cache.o.mapv(|v| v * (1.0 - v))));

        if self.w_ih.trainable {
            self.w_ih.grad += &cache.input.t().dot(&dz);
        }
        if self.w_hh.trainable {
            self.w_hh.grad += &cache.h_prev.t().dot(&dz);
        }
        if self.bias.trainable {
            self.bias.grad += &dz.sum_axis(Axis(0)).insert_axis(Axis(0));
        }

        let dx = dz.dot(&self.w_ih.value.t());
        let dh_prev = dz.dot(&self.w_hh.value.t());
        (dx, dh_prev, dc_prev)
    }
}

impl Layer for LstmCell {
    fn layer_type(&self) -> &str {
        "LSTMCell"
    }

    fn named_params(&mut self, prefix: &str) -> Vec<NamedParam<'_>> {
        vec![
            (join_name(prefix, "w_ih"), &mut self.w_ih),
            (join_name(prefix, "w_hh"), &mut self.w_hh),
            (join_name(prefix, "bias"), &mut self.bias),
        ]
    }
}
