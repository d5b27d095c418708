// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/model/fallback.rs - 降级模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::fmt;

use ndarray::{Array, Array1, Array2, Array4, ArrayD, ArrayView4, ShapeBuilder};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::frame::{NhwcTensor, RGB_CHANNELS};
use crate::model::label::LABEL_COUNT;
use crate::model::ops::{self, OpError, Padding, Window};
use crate::model::{InferenceError, Model, RawOutput};

const FALLBACK_FILTERS: usize = 16;
const FALLBACK_KERNEL: usize = 3;
const FALLBACK_POOL: usize = 2;

/// 编译降级模型时使用的损失函数，推理阶段不会用到梯度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loss {
  #[default]
  CategoricalCrossentropy,
}

impl Loss {
  /// 计算单个样本的损失，`target` 为真实类别索引
  pub fn evaluate(self, predicted: &[f32], target: usize) -> f32 {
    match self {
      Loss::CategoricalCrossentropy => {
        let p = predicted.get(target).copied().unwrap_or(0.0);
        -p.clamp(f32::EPSILON, 1.0).ln()
      }
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct FallbackModelBuilder {
  seed: Option<u64>,
  loss: Loss,
}

impl FallbackModelBuilder {
  pub fn seed(mut self, seed: Option<u64>) -> Self {
    self.seed = seed;
    self
  }

  pub fn compile(mut self, loss: Loss) -> Self {
    self.loss = loss;
    self
  }

  /// 构建 conv(16, 3x3) -> maxpool(2, 2) -> flatten -> dense(10, softmax)
  pub fn build<const W: u32, const H: u32>(self) -> FallbackModel<W, H> {
    let mut rng = match self.seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_entropy(),
    };

    let conv_h = (H as usize).saturating_sub(FALLBACK_KERNEL - 1);
    let conv_w = (W as usize).saturating_sub(FALLBACK_KERNEL - 1);
    let features = (conv_h / FALLBACK_POOL) * (conv_w / FALLBACK_POOL) * FALLBACK_FILTERS;

    let receptive = FALLBACK_KERNEL * FALLBACK_KERNEL;
    let conv_kernel = glorot_uniform(
      &mut rng,
      (FALLBACK_KERNEL, FALLBACK_KERNEL, RGB_CHANNELS, FALLBACK_FILTERS),
      receptive * RGB_CHANNELS,
      receptive * FALLBACK_FILTERS,
    );
    let dense_kernel = glorot_uniform(&mut rng, (features, LABEL_COUNT), features, LABEL_COUNT);

    info!(
      "构建降级模型: 输入 {}x{}, 展平特征 {}, 损失 {:?}",
      W, H, features, self.loss
    );

    FallbackModel {
      conv_kernel,
      conv_bias: Array1::zeros(FALLBACK_FILTERS),
      dense_kernel,
      dense_bias: Array1::zeros(LABEL_COUNT),
      loss: self.loss,
    }
  }
}

fn glorot_uniform<R, D, Sh>(rng: &mut R, shape: Sh, fan_in: usize, fan_out: usize) -> Array<f32, D>
where
  R: Rng,
  D: ndarray::Dimension,
  Sh: ShapeBuilder<Dim = D>,
{
  let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
  let dist = Uniform::new_inclusive(-limit, limit);
  Array::from_shape_simple_fn(shape, || dist.sample(&mut *rng))
}

/// 未经训练的最小分类网络，只在真实模型不可用时保证流程可用
pub struct FallbackModel<const W: u32, const H: u32> {
  conv_kernel: Array4<f32>,
  conv_bias: Array1<f32>,
  dense_kernel: Array2<f32>,
  dense_bias: Array1<f32>,
  loss: Loss,
}

impl<const W: u32, const H: u32> FallbackModel<W, H> {
  pub fn loss(&self) -> Loss {
    self.loss
  }

  pub fn parameter_count(&self) -> usize {
    self.conv_kernel.len() + self.conv_bias.len() + self.dense_kernel.len() + self.dense_bias.len()
  }

  fn forward(&self, input: ArrayView4<f32>) -> Result<ArrayD<f32>, OpError> {
    let conv = ops::conv2d(input, self.conv_kernel.view(), (1, 1), Padding::Valid)?.into_dyn();
    let conv = ops::bias_add(conv.view(), self.conv_bias.view().into_dyn())?;
    let conv = ops::relu(conv.view()).into_dimensionality::<ndarray::Ix4>()?;
    let pooled = ops::max_pool(
      conv.view(),
      Window {
        size: (FALLBACK_POOL, FALLBACK_POOL),
        strides: (FALLBACK_POOL, FALLBACK_POOL),
        padding: Padding::Valid,
      },
    )?;
    let flat = ops::flatten(pooled.view().into_dyn())?;
    let logits = ops::matmul(flat.view(), self.dense_kernel.view(), false, false)?.into_dyn();
    let logits = ops::bias_add(logits.view(), self.dense_bias.view().into_dyn())?;
    Ok(ops::softmax(logits.view()))
  }
}

impl<const W: u32, const H: u32> Model for FallbackModel<W, H> {
  type Input = NhwcTensor<W, H>;
  type Output = RawOutput;
  type Error = InferenceError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("降级模型前向计算");
    self.forward(input.view()).map_err(|source| InferenceError::Op {
      node: "fallback".to_string(),
      source,
    })
  }
}

impl<const W: u32, const H: u32> fmt::Debug for FallbackModel<W, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FallbackModel")
      .field("input", &(W, H))
      .field("parameters", &self.parameter_count())
      .field("loss", &self.loss)
      .finish()
  }
}
