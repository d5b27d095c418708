// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/ranker.rs - 结果排序
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

use serde::Serialize;

use crate::engine::{ProbabilityVector, Provenance};
use crate::model::{ModelKind, SkinLabel, WithLabel};

/// 一次预测的最终结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
  pub label: SkinLabel,
  pub index: usize,
  /// 百分比，取值 [0, 100]
  pub confidence: f32,
  pub model: ModelKind,
  /// 概率向量为随机生成时记录原因
  #[serde(skip_serializing_if = "Option::is_none")]
  pub synthetic: Option<String>,
  pub degraded: bool,
}

impl PredictionResult {
  pub fn label_str(&self) -> &'static str {
    self.label.to_label_str()
  }

  pub fn description(&self) -> &'static str {
    self.label.description()
  }

  /// 降级模型或随机向量得到的结果没有诊断意义
  pub fn is_degraded(&self) -> bool {
    self.degraded
  }
}

/// 选出概率最大的类别
///
/// 初始最大值为 0、索引为 0，只有严格大于当前最大值才更新，
/// 因此并列时取第一个，全为 0 时返回第一个类别。
pub fn rank(probabilities: &ProbabilityVector) -> PredictionResult {
  let mut max = 0.0f32;
  let mut index = 0usize;
  for (i, &p) in probabilities.values().iter().enumerate() {
    if p > max {
      max = p;
      index = i;
    }
  }

  let synthetic = match probabilities.provenance() {
    Provenance::Model => None,
    Provenance::Synthetic { reason } => Some(reason.clone()),
  };
  let model = probabilities.model();

  PredictionResult {
    label: SkinLabel::ALL[index],
    index,
    confidence: max * 100.0,
    model,
    degraded: synthetic.is_some() || model == ModelKind::Fallback,
    synthetic,
  }
}
