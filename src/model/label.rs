// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/model/label.rs - 皮肤病类别标签
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
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 标签集合大小，分类器输出宽度
pub const LABEL_COUNT: usize = 10;

/// 未知标签的描述
pub const UNKNOWN_DESCRIPTION: &str = "No additional information available.";
/// 没有预测结果时的描述
pub const NO_CONDITION_DESCRIPTION: &str = "No condition detected.";

pub trait WithLabel: Sized + fmt::Debug {
  fn to_label_str(&self) -> &'static str;
  fn from_label_id(id: u32) -> Option<Self>;
}

/// 分类器可输出的皮肤病类别，顺序与模型输出索引一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkinLabel {
  Eczema,
  Melanoma,
  #[serde(rename = "Atopic Dermatitis")]
  AtopicDermatitis,
  #[serde(rename = "Basal Cell Carcinoma")]
  BasalCellCarcinoma,
  #[serde(rename = "Melanocytic Nevi")]
  MelanocyticNevi,
  #[serde(rename = "Benign Keratosis")]
  BenignKeratosis,
  Psoriasis,
  #[serde(rename = "Seborrheic Keratoses")]
  SeborrheicKeratoses,
  Tinea,
  Warts,
}

impl SkinLabel {
  pub const ALL: [SkinLabel; LABEL_COUNT] = [
    SkinLabel::Eczema,
    SkinLabel::Melanoma,
    SkinLabel::AtopicDermatitis,
    SkinLabel::BasalCellCarcinoma,
    SkinLabel::MelanocyticNevi,
    SkinLabel::BenignKeratosis,
    SkinLabel::Psoriasis,
    SkinLabel::SeborrheicKeratoses,
    SkinLabel::Tinea,
    SkinLabel::Warts,
  ];

  pub fn index(self) -> usize {
    self as usize
  }

  pub fn description(self) -> &'static str {
    match self {
      SkinLabel::Eczema => "A condition causing inflamed, itchy, cracked, and rough skin.",
      SkinLabel::Melanoma => {
        "A serious form of skin cancer that develops in the pigment-producing cells."
      }
      SkinLabel::AtopicDermatitis => {
        "A chronic skin condition characterized by dry, itchy, and inflamed skin."
      }
      SkinLabel::BasalCellCarcinoma => {
        "A common skin cancer that arises from the basal cells in the epidermis."
      }
      SkinLabel::MelanocyticNevi => {
        "Commonly known as moles, these are benign proliferations of melanocytes."
      }
      SkinLabel::BenignKeratosis => {
        "Non-cancerous skin growths that may appear as rough, scaly patches."
      }
      SkinLabel::Psoriasis => {
        "An autoimmune condition that causes rapid skin cell turnover, leading to scaling and inflammation."
      }
      SkinLabel::SeborrheicKeratoses => {
        "Common, benign skin growths that appear as brown or black waxy plaques."
      }
      SkinLabel::Tinea => {
        "A group of contagious fungal infections affecting the skin, hair, or nails."
      }
      SkinLabel::Warts => "Small, grainy skin growths caused by the human papillomavirus (HPV).",
    }
  }
}

impl WithLabel for SkinLabel {
  fn to_label_str(&self) -> &'static str {
    match self {
      SkinLabel::Eczema => "Eczema",
      SkinLabel::Melanoma => "Melanoma",
      SkinLabel::AtopicDermatitis => "Atopic Dermatitis",
      SkinLabel::BasalCellCarcinoma => "Basal Cell Carcinoma",
      SkinLabel::MelanocyticNevi => "Melanocytic Nevi",
      SkinLabel::BenignKeratosis => "Benign Keratosis",
      SkinLabel::Psoriasis => "Psoriasis",
      SkinLabel::SeborrheicKeratoses => "Seborrheic Keratoses",
      SkinLabel::Tinea => "Tinea",
      SkinLabel::Warts => "Warts",
    }
  }

  fn from_label_id(id: u32) -> Option<Self> {
    SkinLabel::ALL.get(id as usize).copied()
  }
}

impl fmt::Display for SkinLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.to_label_str())
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("未知标签: {0}")]
pub struct UnknownLabel(pub String);

impl FromStr for SkinLabel {
  type Err = UnknownLabel;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    SkinLabel::ALL
      .iter()
      .copied()
      .find(|label| label.to_label_str() == s)
      .ok_or_else(|| UnknownLabel(s.to_string()))
  }
}

/// 根据标签名查找描述
///
/// 未知标签返回通用描述，没有标签时返回 "No condition detected."
pub fn describe(label: Option<&str>) -> &'static str {
  match label {
    None => NO_CONDITION_DESCRIPTION,
    Some(name) => name
      .parse::<SkinLabel>()
      .map(SkinLabel::description)
      .unwrap_or(UNKNOWN_DESCRIPTION),
  }
}
