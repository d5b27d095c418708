// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/engine.rs - 推理引擎
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
use std::sync::Mutex;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::frame::NhwcTensor;
use crate::model::{LABEL_COUNT, LoadedModel, Model, ModelKind, RawOutput};

/// 概率取值允许的误差
const PROBABILITY_TOLERANCE: f32 = 1e-6;

/// 概率向量的来源
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Provenance {
  /// 模型前向计算的结果
  Model,
  /// 模型输出无效时生成的随机向量
  Synthetic { reason: String },
}

/// 与标签顺序对应的 10 个概率
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityVector {
  values: [f32; LABEL_COUNT],
  model: ModelKind,
  provenance: Provenance,
}

impl ProbabilityVector {
  pub fn from_model(values: [f32; LABEL_COUNT], model: ModelKind) -> Self {
    Self {
      values,
      model,
      provenance: Provenance::Model,
    }
  }

  pub fn synthetic(values: [f32; LABEL_COUNT], model: ModelKind, reason: impl Into<String>) -> Self {
    Self {
      values,
      model,
      provenance: Provenance::Synthetic {
        reason: reason.into(),
      },
    }
  }

  pub fn values(&self) -> &[f32; LABEL_COUNT] {
    &self.values
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn model(&self) -> ModelKind {
    self.model
  }

  pub fn provenance(&self) -> &Provenance {
    &self.provenance
  }

  pub fn is_synthetic(&self) -> bool {
    matches!(self.provenance, Provenance::Synthetic { .. })
  }
}

/// 执行前向计算并提取概率向量，该操作不会失败
#[derive(Debug)]
pub struct InferenceEngine {
  rng: Mutex<StdRng>,
}

impl Default for InferenceEngine {
  fn default() -> Self {
    Self::new(None)
  }
}

impl InferenceEngine {
  /// `seed` 只影响输出无效时生成的合成向量
  pub fn new(seed: Option<u64>) -> Self {
    let rng = match seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_entropy(),
    };
    Self {
      rng: Mutex::new(rng),
    }
  }

  /// 运行推理，输入张量在调用结束时释放
  pub fn run<const W: u32, const H: u32>(
    &self,
    model: &LoadedModel<W, H>,
    tensor: NhwcTensor<W, H>,
  ) -> ProbabilityVector {
    self.run_with(model, model.kind(), tensor)
  }

  pub fn run_with<M>(&self, model: &M, kind: ModelKind, input: M::Input) -> ProbabilityVector
  where
    M: Model<Output = RawOutput>,
    M::Error: fmt::Display,
  {
    let outcome = model
      .infer(&input)
      .map_err(|err| format!("前向计算失败: {}", err))
      .and_then(|output| extract(&output));
    drop(input);

    match outcome {
      Ok(values) => {
        debug!("{} 模型输出: {:?}", kind, values);
        ProbabilityVector::from_model(values, kind)
      }
      Err(reason) => {
        warn!("模型输出无效, 使用随机概率: {}", reason);
        ProbabilityVector::synthetic(self.synthetic_values(), kind, reason)
      }
    }
  }

  fn synthetic_values(&self) -> [f32; LABEL_COUNT] {
    let dist = Uniform::new(0.0f32, 1.0);
    let mut values = [0.0; LABEL_COUNT];
    // 锁中毒时 RNG 状态依然可用
    let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for value in values.iter_mut() {
      *value = dist.sample(&mut *rng);
    }
    values
  }
}

/// 从原始输出中取出长度为标签数量的概率
fn extract(output: &RawOutput) -> Result<[f32; LABEL_COUNT], String> {
  if output.len() != LABEL_COUNT {
    return Err(format!(
      "输出长度 {} 与标签数量 {} 不一致",
      output.len(),
      LABEL_COUNT
    ));
  }

  let mut values = [0.0f32; LABEL_COUNT];
  for (slot, &value) in values.iter_mut().zip(output.iter()) {
    if !value.is_finite() {
      return Err(format!("输出包含非有限值 {}", value));
    }
    if !(-PROBABILITY_TOLERANCE..=1.0 + PROBABILITY_TOLERANCE).contains(&value) {
      return Err(format!("输出值 {} 超出 [0, 1]", value));
    }
    *slot = value.clamp(0.0, 1.0);
  }
  Ok(values)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{FallbackModelBuilder, InferenceError};
  use ndarray::{ArrayD, IxDyn};

  fn fallback() -> LoadedModel<8, 8> {
    LoadedModel::Fallback(FallbackModelBuilder::default().seed(Some(11)).build())
  }

  #[test]
  fn zero_tensor_yields_full_length_vector() {
    let engine = InferenceEngine::new(Some(1));
    let probs = engine.run(&fallback(), NhwcTensor::default());
    assert_eq!(probs.len(), LABEL_COUNT);
    assert_eq!(probs.provenance(), &Provenance::Model);
    assert_eq!(probs.model(), ModelKind::Fallback);
  }

  struct BrokenModel;

  impl Model for BrokenModel {
    type Input = NhwcTensor<8, 8>;
    type Output = RawOutput;
    type Error = InferenceError;

    fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
      Err(InferenceError::Output("broken".to_string()))
    }
  }

  #[test]
  fn failed_forward_pass_is_flagged_synthetic() {
    let engine = InferenceEngine::new(Some(9));
    let probs = engine.run_with(&BrokenModel, ModelKind::Real, NhwcTensor::default());
    assert_eq!(probs.len(), LABEL_COUNT);
    assert!(probs.is_synthetic());
    assert!(probs.values().iter().all(|v| (0.0..1.0).contains(v)));
  }

  #[test]
  fn wrong_length_is_rejected() {
    let output = ArrayD::from_elem(IxDyn(&[1, 7]), 0.1f32);
    assert!(extract(&output).is_err());
  }

  #[test]
  fn non_finite_values_are_rejected() {
    let mut output = ArrayD::from_elem(IxDyn(&[1, LABEL_COUNT]), 0.1f32);
    output[IxDyn(&[0, 3])] = f32::NAN;
    assert!(extract(&output).is_err());
    output[IxDyn(&[0, 3])] = 1.5;
    assert!(extract(&output).is_err());
  }

  #[test]
  fn synthetic_values_are_seeded_and_in_range() {
    let a = InferenceEngine::new(Some(42)).synthetic_values();
    let b = InferenceEngine::new(Some(42)).synthetic_values();
    assert_eq!(a, b);
    assert!(a.iter().all(|v| (0.0..1.0).contains(v)));
  }
}
