// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/frame.rs - NHWC 张量定义
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

use ndarray::{Array4, ArrayView4, ArrayViewD};
use thiserror::Error;
use tracing::trace;

pub const RGB_CHANNELS: usize = 3;

/// 模型输入宽度
pub const MODEL_INPUT_WIDTH: u32 = 224;
/// 模型输入高度
pub const MODEL_INPUT_HEIGHT: u32 = 224;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("张量形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    expected: [usize; 4],
    actual: Vec<usize>,
  },
}

/// 批大小为 1 的 NHWC 浮点张量，数值归一化到 [0, 1]
///
/// 每次推理都会新建一个张量，推理引擎获取其所有权，调用结束时释放。
#[derive(Debug, Clone, PartialEq)]
pub struct NhwcTensor<const W: u32, const H: u32> {
  data: Array4<f32>,
}

/// 模型所需的 [1, 224, 224, 3] 输入张量
pub type PreprocessedTensor = NhwcTensor<MODEL_INPUT_WIDTH, MODEL_INPUT_HEIGHT>;

impl<const W: u32, const H: u32> NhwcTensor<W, H> {
  pub const SHAPE: [usize; 4] = [1, H as usize, W as usize, RGB_CHANNELS];

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn shape(&self) -> &[usize] {
    self.data.shape()
  }

  pub fn view(&self) -> ArrayView4<'_, f32> {
    self.data.view()
  }

  pub fn view_dyn(&self) -> ArrayViewD<'_, f32> {
    self.data.view().into_dyn()
  }

  pub fn as_slice(&self) -> Option<&[f32]> {
    self.data.as_slice()
  }
}

impl<const W: u32, const H: u32> TryFrom<Array4<f32>> for NhwcTensor<W, H> {
  type Error = FrameError;

  fn try_from(data: Array4<f32>) -> Result<Self, Self::Error> {
    if data.shape() != Self::SHAPE {
      return Err(FrameError::ShapeMismatch {
        expected: Self::SHAPE,
        actual: data.shape().to_vec(),
      });
    }

    Ok(Self { data })
  }
}

impl<const W: u32, const H: u32> Default for NhwcTensor<W, H> {
  fn default() -> Self {
    Self {
      data: Array4::zeros((1, H as usize, W as usize, RGB_CHANNELS)),
    }
  }
}

impl<const W: u32, const H: u32> Drop for NhwcTensor<W, H> {
  fn drop(&mut self) {
    trace!("释放输入张量 {:?}", self.data.shape());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_tensor_is_zero_with_batch_dimension() {
    let tensor = PreprocessedTensor::default();
    assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
    assert!(tensor.view().iter().all(|&v| v == 0.0));
  }

  #[test]
  fn rejects_wrong_shape() {
    let data = Array4::<f32>::zeros((1, 3, 224, 224));
    let err = PreprocessedTensor::try_from(data).unwrap_err();
    assert!(matches!(err, FrameError::ShapeMismatch { .. }));
  }
}
