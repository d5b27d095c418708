// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/output/json_report.rs - JSON 报告文件
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

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::input::CapturedImage;
use crate::output::Render;
use crate::ranker::PredictionResult;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum JsonReportError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
  #[error("路径解码失败: {0}")]
  PathDecode(#[from] std::string::FromUtf8Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 写入文件的记录
#[derive(Debug, Serialize)]
pub struct JsonRecord<'a> {
  #[serde(flatten)]
  pub result: &'a PredictionResult,
  pub description: &'static str,
  pub source: &'a Path,
  pub timestamp: DateTime<Utc>,
}

/// 将预测结果写入 JSON 文件，父目录不存在时自动创建
#[derive(Debug)]
pub struct JsonReport {
  path: PathBuf,
}

impl FromUrlWithScheme for JsonReport {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonReport {
  type Error = JsonReportError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(JsonReportError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let path = urlencoding::decode(uri.path())?;
    Ok(JsonReport::new(path.into_owned()))
  }
}

impl JsonReport {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Render<CapturedImage, PredictionResult> for JsonReport {
  type Error = JsonReportError;

  fn render_result(
    &self,
    frame: &CapturedImage,
    result: &PredictionResult,
  ) -> Result<(), Self::Error> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let record = JsonRecord {
      result,
      description: result.description(),
      source: frame.path(),
      timestamp: Utc::now(),
    };
    let json = serde_json::to_string_pretty(&record)?;
    std::fs::write(&self.path, json)?;

    info!("保存预测结果到文件: {}", self.path.display());

    Ok(())
  }
}
