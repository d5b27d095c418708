// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/output/console_report.rs - 控制台报告
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

use std::io::Write as _;

use thiserror::Error;
use url::Url;

use crate::input::CapturedImage;
use crate::model::ModelKind;
use crate::output::Render;
use crate::ranker::PredictionResult;
use crate::{FromUrl, FromUrlWithScheme};

pub const DISCLAIMER: &str = "Disclaimer: This is an AI-assisted prediction and should not replace \
professional medical advice. Always consult a healthcare professional for accurate diagnosis and \
treatment.";

#[derive(Error, Debug)]
pub enum ConsoleReportError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 将预测结果打印到标准输出
#[derive(Debug, Default)]
pub struct ConsoleReport;

impl FromUrlWithScheme for ConsoleReport {
  const SCHEME: &'static str = "console";
}

impl FromUrl for ConsoleReport {
  type Error = ConsoleReportError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(ConsoleReportError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    Ok(ConsoleReport)
  }
}

impl ConsoleReport {
  pub fn format_report(result: &PredictionResult) -> String {
    let notice = if result.is_degraded() {
      format!("{}\n", degraded_notice(result))
    } else {
      String::new()
    };
    format!(
      "Prediction Result\n\
       Detected Condition: {label}\n\
       Confidence: {confidence:.2}%\n\
       {notice}\n\
       About {label}\n\
       {description}\n\n\
       {DISCLAIMER}",
      label = result.label,
      confidence = result.confidence,
      description = result.description(),
    )
  }
}

fn degraded_notice(result: &PredictionResult) -> String {
  match (&result.synthetic, result.model) {
    (Some(reason), _) => format!(
      "Note: the model produced no usable output ({}); this result is random.",
      reason
    ),
    (None, ModelKind::Fallback) => {
      "Note: the bundled model could not be loaded; this result comes from an untrained fallback model."
        .to_string()
    }
    (None, ModelKind::Real) => String::new(),
  }
}

impl Render<CapturedImage, PredictionResult> for ConsoleReport {
  type Error = ConsoleReportError;

  fn render_result(
    &self,
    frame: &CapturedImage,
    result: &PredictionResult,
  ) -> Result<(), Self::Error> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "Image: {}", frame.path().display())?;
    writeln!(stdout, "{}", Self::format_report(result))?;
    stdout.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::SkinLabel;

  fn result(model: ModelKind, synthetic: Option<&str>) -> PredictionResult {
    PredictionResult {
      label: SkinLabel::Psoriasis,
      index: 6,
      confidence: 87.654,
      model,
      synthetic: synthetic.map(str::to_string),
      degraded: model == ModelKind::Fallback || synthetic.is_some(),
    }
  }

  #[test]
  fn report_shows_two_decimal_confidence_and_description() {
    let report = ConsoleReport::format_report(&result(ModelKind::Real, None));
    assert!(report.contains("Detected Condition: Psoriasis"));
    assert!(report.contains("Confidence: 87.65%"));
    assert!(report.contains(SkinLabel::Psoriasis.description()));
    assert!(report.ends_with(DISCLAIMER));
    assert!(!report.contains("Note:"));
    assert!(report.contains("Confidence: 87.65%\n\nAbout Psoriasis\n"));
  }

  #[test]
  fn degraded_results_carry_a_notice() {
    let fallback = ConsoleReport::format_report(&result(ModelKind::Fallback, None));
    assert!(fallback.contains("untrained fallback model"));
    let synthetic = ConsoleReport::format_report(&result(ModelKind::Real, Some("NaN")));
    assert!(synthetic.contains("(NaN)"));
  }
}
