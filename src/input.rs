// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/input.rs - 图像输入
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

use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

mod preprocess;
pub use self::preprocess::{PreprocessError, Preprocessor};

/// `image://` 与 `file://` 均可用于指定拍摄的图像
const FILE_SCHEME: &str = "file";

#[derive(Error, Debug)]
pub enum AcquisitionError {
  #[error("没有可用的图像")]
  NoImage,
  #[error("无法读取图像 {}: {source}", .path.display())]
  Unreadable {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("{} 不是文件", .0.display())]
  NotAFile(PathBuf),
  #[error("无效的图像句柄: {0}")]
  InvalidHandle(String),
  #[error("URI 方案不匹配: 期望 '{expected}' 或 'file', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
}

/// 本地存储中拍摄图像的句柄，由调用方持有并显式传入流水线
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
  path: PathBuf,
}

impl CapturedImage {
  pub fn new(path: impl Into<PathBuf>) -> Result<Self, AcquisitionError> {
    let path = path.into();
    let metadata = std::fs::metadata(&path).map_err(|source| AcquisitionError::Unreadable {
      path: path.clone(),
      source,
    })?;
    if !metadata.is_file() {
      return Err(AcquisitionError::NotAFile(path));
    }
    Ok(Self { path })
  }

  /// 从拍摄组件交给的字符串句柄创建，可以是路径或 URL
  pub fn from_handle(handle: &str) -> Result<Self, AcquisitionError> {
    let handle = handle.trim();
    if handle.is_empty() {
      return Err(AcquisitionError::InvalidHandle(handle.to_string()));
    }
    match Url::parse(handle) {
      // 单个字母的方案是 Windows 盘符
      Ok(url) if url.scheme().len() > 1 => Self::from_url(&url),
      _ => Self::new(handle),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl FromUrlWithScheme for CapturedImage {
  const SCHEME: &'static str = "image";
}

impl FromUrl for CapturedImage {
  type Error = AcquisitionError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME && url.scheme() != FILE_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(AcquisitionError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let path = urlencoding::decode(url.path())
      .map_err(|_| AcquisitionError::InvalidHandle(url.to_string()))?;
    Self::new(path.into_owned())
  }
}
