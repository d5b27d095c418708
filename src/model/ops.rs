// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/model/ops.rs - 张量算子
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

//! NHWC 布局下的前向计算算子
//!
//! 图模型解释器与降级模型共用这些算子，所有算子只做前向计算。

use ndarray::{
  Array2, Array4, ArrayD, ArrayView2, ArrayView4, ArrayViewD, Axis, IxDyn, ShapeError, Zip, s,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpError {
  #[error("形状错误: {0}")]
  Shape(#[from] ShapeError),
  #[error("形状不匹配: {0}")]
  Mismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
  Same,
  Valid,
}

impl Padding {
  /// 计算输出尺寸与前置填充，规则与 TensorFlow 一致
  pub fn output_size(
    self,
    input: usize,
    kernel: usize,
    stride: usize,
  ) -> Result<(usize, usize), OpError> {
    if stride == 0 || kernel == 0 {
      return Err(OpError::Mismatch("步长和卷积核尺寸必须大于 0".to_string()));
    }
    match self {
      Padding::Same => {
        let output = input.div_ceil(stride);
        let total = ((output.saturating_sub(1)) * stride + kernel).saturating_sub(input);
        Ok((output, total / 2))
      }
      Padding::Valid => {
        if input < kernel {
          return Err(OpError::Mismatch(format!(
            "输入尺寸 {} 小于卷积核尺寸 {}",
            input, kernel
          )));
        }
        Ok(((input - kernel) / stride + 1, 0))
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
  pub size: (usize, usize),
  pub strides: (usize, usize),
  pub padding: Padding,
}

/// 将输出坐标映射回输入坐标，越界时返回 None
#[inline]
fn source_index(out: usize, stride: usize, offset: usize, pad: usize, limit: usize) -> Option<usize> {
  (out * stride + offset)
    .checked_sub(pad)
    .filter(|&index| index < limit)
}

/// 二维卷积，输入 [N, H, W, C]，卷积核 [KH, KW, C, O]
///
/// 每个输出行先展开成 [OW, KH*KW*C] 的图块矩阵，再与卷积核做矩阵乘法。
pub fn conv2d(
  input: ArrayView4<f32>,
  kernel: ArrayView4<f32>,
  strides: (usize, usize),
  padding: Padding,
) -> Result<Array4<f32>, OpError> {
  let (batch, in_h, in_w, in_c) = input.dim();
  let (k_h, k_w, k_c, out_c) = kernel.dim();
  if k_c != in_c {
    return Err(OpError::Mismatch(format!(
      "卷积输入通道 {} 与卷积核通道 {} 不一致",
      in_c, k_c
    )));
  }

  let (out_h, pad_top) = padding.output_size(in_h, k_h, strides.0)?;
  let (out_w, pad_left) = padding.output_size(in_w, k_w, strides.1)?;
  let patch_len = k_h * k_w * in_c;
  let weights = kernel
    .as_standard_layout()
    .into_owned()
    .into_shape((patch_len, out_c))?;

  let mut output = Array4::<f32>::zeros((batch, out_h, out_w, out_c));
  let mut patches = Array2::<f32>::zeros((out_w, patch_len));

  for b in 0..batch {
    for oy in 0..out_h {
      patches.fill(0.0);
      for ox in 0..out_w {
        let mut row = patches.row_mut(ox);
        for ky in 0..k_h {
          let Some(iy) = source_index(oy, strides.0, ky, pad_top, in_h) else {
            continue;
          };
          for kx in 0..k_w {
            let Some(ix) = source_index(ox, strides.1, kx, pad_left, in_w) else {
              continue;
            };
            let base = (ky * k_w + kx) * in_c;
            for c in 0..in_c {
              row[base + c] = input[[b, iy, ix, c]];
            }
          }
        }
      }
      let rows = patches.dot(&weights);
      output.slice_mut(s![b, oy, .., ..]).assign(&rows);
    }
  }

  Ok(output)
}

/// 逐通道卷积，卷积核 [KH, KW, C, M]，输出通道数为 C*M
pub fn depthwise_conv2d(
  input: ArrayView4<f32>,
  kernel: ArrayView4<f32>,
  strides: (usize, usize),
  padding: Padding,
) -> Result<Array4<f32>, OpError> {
  let (batch, in_h, in_w, in_c) = input.dim();
  let (k_h, k_w, k_c, multiplier) = kernel.dim();
  if k_c != in_c {
    return Err(OpError::Mismatch(format!(
      "逐通道卷积输入通道 {} 与卷积核通道 {} 不一致",
      in_c, k_c
    )));
  }

  let (out_h, pad_top) = padding.output_size(in_h, k_h, strides.0)?;
  let (out_w, pad_left) = padding.output_size(in_w, k_w, strides.1)?;
  let mut output = Array4::<f32>::zeros((batch, out_h, out_w, in_c * multiplier));

  for b in 0..batch {
    for oy in 0..out_h {
      for ox in 0..out_w {
        for ky in 0..k_h {
          let Some(iy) = source_index(oy, strides.0, ky, pad_top, in_h) else {
            continue;
          };
          for kx in 0..k_w {
            let Some(ix) = source_index(ox, strides.1, kx, pad_left, in_w) else {
              continue;
            };
            for c in 0..in_c {
              let value = input[[b, iy, ix, c]];
              for m in 0..multiplier {
                output[[b, oy, ox, c * multiplier + m]] += value * kernel[[ky, kx, c, m]];
              }
            }
          }
        }
      }
    }
  }

  Ok(output)
}

fn pool<F>(input: ArrayView4<f32>, window: Window, mut reduce: F) -> Result<Array4<f32>, OpError>
where
  F: FnMut(&mut dyn Iterator<Item = f32>) -> f32,
{
  let (batch, in_h, in_w, channels) = input.dim();
  let (out_h, pad_top) = window
    .padding
    .output_size(in_h, window.size.0, window.strides.0)?;
  let (out_w, pad_left) = window
    .padding
    .output_size(in_w, window.size.1, window.strides.1)?;
  let mut output = Array4::<f32>::zeros((batch, out_h, out_w, channels));

  for b in 0..batch {
    for oy in 0..out_h {
      let rows: Vec<usize> = (0..window.size.0)
        .filter_map(|ky| source_index(oy, window.strides.0, ky, pad_top, in_h))
        .collect();
      for ox in 0..out_w {
        let cols: Vec<usize> = (0..window.size.1)
          .filter_map(|kx| source_index(ox, window.strides.1, kx, pad_left, in_w))
          .collect();
        for c in 0..channels {
          let mut values = rows
            .iter()
            .flat_map(|&iy| cols.iter().map(move |&ix| (iy, ix)))
            .map(|(iy, ix)| input[[b, iy, ix, c]]);
          output[[b, oy, ox, c]] = reduce(&mut values);
        }
      }
    }
  }

  Ok(output)
}

/// 最大池化，填充区域不参与比较
pub fn max_pool(input: ArrayView4<f32>, window: Window) -> Result<Array4<f32>, OpError> {
  pool(input, window, |values| values.fold(f32::NEG_INFINITY, f32::max))
}

/// 平均池化，只对有效位置求平均
pub fn avg_pool(input: ArrayView4<f32>, window: Window) -> Result<Array4<f32>, OpError> {
  pool(input, window, |values| {
    let (sum, count) = values.fold((0.0f32, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0.0 } else { sum / count as f32 }
  })
}

/// 计算两个形状按 NumPy 规则广播后的形状
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, OpError> {
  let rank = a.len().max(b.len());
  let mut shape = vec![0; rank];
  for i in 0..rank {
    let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
    let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
    shape[i] = match (da, db) {
      (x, y) if x == y => x,
      (1, y) => y,
      (x, 1) => x,
      _ => {
        return Err(OpError::Mismatch(format!(
          "无法广播形状 {:?} 与 {:?}",
          a, b
        )));
      }
    };
  }
  Ok(shape)
}

/// 带广播的逐元素二元运算
pub fn binary<F>(a: ArrayViewD<f32>, b: ArrayViewD<f32>, f: F) -> Result<ArrayD<f32>, OpError>
where
  F: Fn(f32, f32) -> f32,
{
  let shape = broadcast_shape(a.shape(), b.shape())?;
  let lhs = a
    .broadcast(IxDyn(&shape))
    .ok_or_else(|| OpError::Mismatch(format!("无法广播形状 {:?}", a.shape())))?;
  let rhs = b
    .broadcast(IxDyn(&shape))
    .ok_or_else(|| OpError::Mismatch(format!("无法广播形状 {:?}", b.shape())))?;
  let mut output = ArrayD::<f32>::zeros(IxDyn(&shape));
  Zip::from(&mut output)
    .and(&lhs)
    .and(&rhs)
    .for_each(|o, &x, &y| *o = f(x, y));
  Ok(output)
}

/// 偏置加法，偏置长度必须等于最后一维
pub fn bias_add(input: ArrayViewD<f32>, bias: ArrayViewD<f32>) -> Result<ArrayD<f32>, OpError> {
  let channels = input.shape().last().copied().unwrap_or(0);
  if bias.ndim() != 1 || bias.len() != channels {
    return Err(OpError::Mismatch(format!(
      "偏置形状 {:?} 与输入通道数 {} 不一致",
      bias.shape(),
      channels
    )));
  }
  binary(input, bias, |x, y| x + y)
}

pub fn relu(input: ArrayViewD<f32>) -> ArrayD<f32> {
  input.mapv(|v| v.max(0.0))
}

pub fn relu6(input: ArrayViewD<f32>) -> ArrayD<f32> {
  input.mapv(|v| v.clamp(0.0, 6.0))
}

pub fn sigmoid(input: ArrayViewD<f32>) -> ArrayD<f32> {
  input.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// 二维矩阵乘法
pub fn matmul(
  a: ArrayView2<f32>,
  b: ArrayView2<f32>,
  transpose_a: bool,
  transpose_b: bool,
) -> Result<Array2<f32>, OpError> {
  let a = if transpose_a { a.reversed_axes() } else { a };
  let b = if transpose_b { b.reversed_axes() } else { b };
  if a.ncols() != b.nrows() {
    return Err(OpError::Mismatch(format!(
      "矩阵乘法维度不匹配: {:?} x {:?}",
      a.dim(),
      b.dim()
    )));
  }
  Ok(a.dot(&b))
}

/// 沿最后一维做 softmax
pub fn softmax(input: ArrayViewD<f32>) -> ArrayD<f32> {
  let mut output = input.to_owned();
  if output.ndim() == 0 {
    output.fill(1.0);
    return output;
  }
  let last = Axis(output.ndim() - 1);
  for mut lane in output.lanes_mut(last) {
    let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    lane.mapv_inplace(|v| (v - max).exp());
    let sum = lane.sum();
    if sum > 0.0 {
      lane.mapv_inplace(|v| v / sum);
    }
  }
  output
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize, OpError> {
  let resolved = if axis < 0 { axis + rank as i64 } else { axis };
  if resolved < 0 || resolved >= rank as i64 {
    return Err(OpError::Mismatch(format!("轴 {} 超出范围 (秩 {})", axis, rank)));
  }
  Ok(resolved as usize)
}

/// 沿指定轴求平均
pub fn mean(input: ArrayViewD<f32>, axes: &[i64], keep_dims: bool) -> Result<ArrayD<f32>, OpError> {
  let rank = input.ndim();
  let mut resolved = axes
    .iter()
    .map(|&axis| normalize_axis(axis, rank))
    .collect::<Result<Vec<_>, _>>()?;
  resolved.sort_unstable();
  resolved.dedup();

  let mut output = input.to_owned();
  for &axis in resolved.iter().rev() {
    output = output
      .mean_axis(Axis(axis))
      .ok_or_else(|| OpError::Mismatch(format!("轴 {} 长度为 0", axis)))?;
    if keep_dims {
      output = output.insert_axis(Axis(axis));
    }
  }
  Ok(output)
}

/// 改变形状，目标形状中最多允许一个 -1
pub fn reshape(input: ArrayViewD<f32>, shape: &[i64]) -> Result<ArrayD<f32>, OpError> {
  let known = shape
    .iter()
    .filter(|&&d| d >= 0)
    .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
    .ok_or_else(|| OpError::Mismatch(format!("目标形状 {:?} 溢出", shape)))?;
  let inferred = shape.iter().filter(|&&d| d < 0).count();
  let dims = match inferred {
    0 => shape.iter().map(|&d| d as usize).collect::<Vec<_>>(),
    1 if known > 0 && input.len() % known == 0 => shape
      .iter()
      .map(|&d| if d < 0 { input.len() / known } else { d as usize })
      .collect(),
    _ => {
      return Err(OpError::Mismatch(format!(
        "无法将 {:?} 变形为 {:?}",
        input.shape(),
        shape
      )));
    }
  };
  let data: Vec<f32> = input.iter().copied().collect();
  Ok(ArrayD::from_shape_vec(IxDyn(&dims), data)?)
}

/// 去掉长度为 1 的维度，`axes` 为空时去掉全部
pub fn squeeze(input: ArrayViewD<f32>, axes: &[i64]) -> Result<ArrayD<f32>, OpError> {
  let rank = input.ndim();
  let targets = axes
    .iter()
    .map(|&axis| normalize_axis(axis, rank))
    .collect::<Result<Vec<_>, _>>()?;
  let mut dims = Vec::with_capacity(rank);
  for (axis, &len) in input.shape().iter().enumerate() {
    let selected = targets.is_empty() || targets.contains(&axis);
    if selected && len == 1 {
      continue;
    }
    if selected && !targets.is_empty() {
      return Err(OpError::Mismatch(format!("轴 {} 长度为 {}，无法压缩", axis, len)));
    }
    dims.push(len);
  }
  let data: Vec<f32> = input.iter().copied().collect();
  Ok(ArrayD::from_shape_vec(IxDyn(&dims), data)?)
}

/// 保留第一维，其余维度展平
pub fn flatten(input: ArrayViewD<f32>) -> Result<Array2<f32>, OpError> {
  let batch = input.shape().first().copied().unwrap_or(1);
  let features = if batch == 0 { 0 } else { input.len() / batch };
  let data: Vec<f32> = input.iter().copied().collect();
  Ok(Array2::from_shape_vec((batch, features), data)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use ndarray::{Array1, array};

  #[test]
  fn same_padding_matches_tensorflow() {
    assert_eq!(Padding::Same.output_size(224, 3, 2).unwrap(), (112, 0));
    assert_eq!(Padding::Same.output_size(5, 3, 1).unwrap(), (5, 1));
    assert_eq!(Padding::Valid.output_size(224, 3, 1).unwrap(), (222, 0));
    assert!(Padding::Valid.output_size(2, 3, 1).is_err());
  }

  #[test]
  fn conv2d_sums_window() {
    let input = Array4::<f32>::ones((1, 3, 3, 1));
    let kernel = Array4::<f32>::ones((3, 3, 1, 2));
    let valid = conv2d(input.view(), kernel.view(), (1, 1), Padding::Valid).unwrap();
    assert_eq!(valid.shape(), &[1, 1, 1, 2]);
    assert_abs_diff_eq!(valid[[0, 0, 0, 0]], 9.0);

    let same = conv2d(input.view(), kernel.view(), (1, 1), Padding::Same).unwrap();
    assert_eq!(same.shape(), &[1, 3, 3, 2]);
    assert_abs_diff_eq!(same[[0, 0, 0, 1]], 4.0);
    assert_abs_diff_eq!(same[[0, 1, 1, 1]], 9.0);
  }

  #[test]
  fn conv2d_rejects_channel_mismatch() {
    let input = Array4::<f32>::ones((1, 3, 3, 3));
    let kernel = Array4::<f32>::ones((3, 3, 1, 2));
    assert!(conv2d(input.view(), kernel.view(), (1, 1), Padding::Valid).is_err());
  }

  #[test]
  fn depthwise_keeps_channels_apart() {
    let mut input = Array4::<f32>::zeros((1, 2, 2, 2));
    input.slice_mut(s![.., .., .., 0]).fill(1.0);
    input.slice_mut(s![.., .., .., 1]).fill(2.0);
    let kernel = Array4::<f32>::ones((2, 2, 2, 1));
    let output = depthwise_conv2d(input.view(), kernel.view(), (1, 1), Padding::Valid).unwrap();
    assert_eq!(output.shape(), &[1, 1, 1, 2]);
    assert_abs_diff_eq!(output[[0, 0, 0, 0]], 4.0);
    assert_abs_diff_eq!(output[[0, 0, 0, 1]], 8.0);
  }

  #[test]
  fn pools_take_max_and_mean() {
    let input = Array4::from_shape_vec((1, 2, 2, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let window = Window {
      size: (2, 2),
      strides: (2, 2),
      padding: Padding::Valid,
    };
    assert_abs_diff_eq!(max_pool(input.view(), window).unwrap()[[0, 0, 0, 0]], 4.0);
    assert_abs_diff_eq!(avg_pool(input.view(), window).unwrap()[[0, 0, 0, 0]], 2.5);
  }

  #[test]
  fn softmax_rows_sum_to_one() {
    let logits = array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]].into_dyn();
    let probs = softmax(logits.view());
    for row in probs.outer_iter() {
      assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
    }
    assert_abs_diff_eq!(probs[[1, 0]], 1.0 / 3.0, epsilon = 1e-6);
  }

  #[test]
  fn bias_add_broadcasts_over_last_axis() {
    let input = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 3]));
    let bias = Array1::from(vec![1.0f32, 2.0, 3.0]).into_dyn();
    let output = bias_add(input.view(), bias.view()).unwrap();
    assert_abs_diff_eq!(output[[0, 1, 2]], 3.0);

    let wrong = Array1::from(vec![1.0f32, 2.0]).into_dyn();
    assert!(bias_add(input.view(), wrong.view()).is_err());
  }

  #[test]
  fn reshape_infers_one_dimension() {
    let input = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 2, 4]));
    let output = reshape(input.view(), &[1, -1]).unwrap();
    assert_eq!(output.shape(), &[1, 16]);
    assert!(reshape(input.view(), &[3, -1]).is_err());
  }

  #[test]
  fn reshape_rejects_overflowing_shape() {
    let input = ArrayD::<f32>::zeros(IxDyn(&[1, 4]));
    assert!(matches!(
      reshape(input.view(), &[i64::MAX, i64::MAX, -1]),
      Err(OpError::Mismatch(_))
    ));
    assert!(reshape(input.view(), &[i64::MAX, i64::MAX]).is_err());
  }

  #[test]
  fn mean_and_squeeze_collapse_spatial_axes() {
    let input = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1, 2]), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
    let pooled = mean(input.view(), &[1, 2], true).unwrap();
    assert_eq!(pooled.shape(), &[1, 1, 1, 2]);
    assert_abs_diff_eq!(pooled[[0, 0, 0, 1]], 3.0);
    let squeezed = squeeze(pooled.view(), &[1, 2]).unwrap();
    assert_eq!(squeezed.shape(), &[1, 2]);
  }

  #[test]
  fn matmul_honours_transpose() {
    let a = array![[1.0f32, 2.0]];
    let b = array![[3.0f32, 4.0]];
    let out = matmul(a.view(), b.view(), false, true).unwrap();
    assert_abs_diff_eq!(out[[0, 0]], 11.0);
    assert!(matmul(a.view(), b.view(), false, false).is_err());
  }
}
