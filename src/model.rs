// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/model.rs - 模型
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

use ndarray::ArrayD;
use serde::Serialize;
use thiserror::Error;

use crate::frame::{MODEL_INPUT_HEIGHT, MODEL_INPUT_WIDTH, NhwcTensor};

pub mod label;
pub mod ops;

mod fallback;
mod graph;
mod loader;

pub use self::fallback::{FallbackModel, FallbackModelBuilder, Loss};
pub use self::graph::{GraphModel, GraphModelBuilder, ModelLoadError};
pub use self::label::{LABEL_COUNT, SkinLabel, WithLabel, describe};
pub use self::loader::ModelLoader;

/// 模型前向计算的原始输出
pub type RawOutput = ArrayD<f32>;

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("节点 {node} 计算失败: {source}")]
  Op {
    node: String,
    #[source]
    source: ops::OpError,
  },
  #[error("节点 {0} 的输入缺失")]
  MissingValue(String),
  #[error("模型输出无效: {0}")]
  Output(String),
}

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
  /// 随应用打包的预训练图模型
  Real,
  /// 随机初始化的降级模型，预测没有实际意义
  Fallback,
}

impl fmt::Display for ModelKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelKind::Real => f.write_str("real"),
      ModelKind::Fallback => f.write_str("fallback"),
    }
  }
}

/// 加载完成的模型，加载时确定实现，之后只读
pub enum LoadedModel<const W: u32 = { MODEL_INPUT_WIDTH }, const H: u32 = { MODEL_INPUT_HEIGHT }> {
  Graph(GraphModel<W, H>),
  Fallback(FallbackModel<W, H>),
}

impl<const W: u32, const H: u32> LoadedModel<W, H> {
  pub fn kind(&self) -> ModelKind {
    match self {
      LoadedModel::Graph(_) => ModelKind::Real,
      LoadedModel::Fallback(_) => ModelKind::Fallback,
    }
  }
}

impl<const W: u32, const H: u32> Model for LoadedModel<W, H> {
  type Input = NhwcTensor<W, H>;
  type Output = RawOutput;
  type Error = InferenceError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    match self {
      LoadedModel::Graph(model) => model.infer(input),
      LoadedModel::Fallback(model) => model.infer(input),
    }
  }
}

impl<const W: u32, const H: u32> fmt::Debug for LoadedModel<W, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LoadedModel::Graph(model) => f.debug_tuple("Graph").field(model).finish(),
      LoadedModel::Fallback(model) => f.debug_tuple("Fallback").field(model).finish(),
    }
  }
}
