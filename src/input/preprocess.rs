// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/input/preprocess.rs - 图像预处理
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

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, ImageReader, RgbImage};
use ndarray::{Array3, Axis};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{DEFAULT_JPEG_QUALITY, PipelineConfig};
use crate::frame::{FrameError, NhwcTensor, RGB_CHANNELS};
use crate::input::CapturedImage;

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("I/O 错误 {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("图像解码失败: {0}")]
  Decode(#[source] image::ImageError),
  #[error("JPEG 编码失败: {0}")]
  Encode(#[source] image::ImageError),
  #[error("像素数据形状错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
  #[error(transparent)]
  Frame(#[from] FrameError),
}

/// 将拍摄的图像转换为模型输入张量
///
/// 缩放到 `W`x`H`，重新编码为 JPEG，再解码并归一化到 [0, 1]。
/// 相同的输入字节总是得到相同的张量。
#[derive(Debug, Clone)]
pub struct Preprocessor<const W: u32, const H: u32> {
  filter: FilterType,
  jpeg_quality: u8,
  cache_dir: Option<PathBuf>,
}

impl<const W: u32, const H: u32> Default for Preprocessor<W, H> {
  fn default() -> Self {
    Self {
      filter: FilterType::Triangle,
      jpeg_quality: DEFAULT_JPEG_QUALITY,
      cache_dir: None,
    }
  }
}

impl<const W: u32, const H: u32> Preprocessor<W, H> {
  pub fn from_config(config: &PipelineConfig) -> Self {
    Self {
      filter: config.resize_filter,
      jpeg_quality: config.jpeg_quality,
      cache_dir: config.resized_cache_dir.clone(),
    }
  }

  pub fn with_filter(mut self, filter: FilterType) -> Self {
    self.filter = filter;
    self
  }

  pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
    self.jpeg_quality = quality.clamp(1, 100);
    self
  }

  pub fn with_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
    self.cache_dir = dir;
    self
  }

  pub fn preprocess(&self, image: &CapturedImage) -> Result<NhwcTensor<W, H>, PreprocessError> {
    let path = image.path();
    let source = ImageReader::open(path)
      .map_err(|source| PreprocessError::Io {
        path: path.to_path_buf(),
        source,
      })?
      .with_guessed_format()
      .map_err(|source| PreprocessError::Io {
        path: path.to_path_buf(),
        source,
      })?
      .decode()
      .map_err(PreprocessError::Decode)?
      .to_rgb8();
    debug!(
      "读取图像 {}: {}x{}",
      path.display(),
      source.width(),
      source.height()
    );

    let resized = imageops::resize(&source, W, H, self.filter);
    drop(source);

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, self.jpeg_quality)
      .encode_image(&resized)
      .map_err(PreprocessError::Encode)?;

    let encoded = match &self.cache_dir {
      Some(dir) => self.round_trip_through_cache(dir, path, &encoded)?,
      None => encoded,
    };

    let decoded = image::load_from_memory_with_format(&encoded, ImageFormat::Jpeg)
      .map_err(PreprocessError::Decode)?
      .to_rgb8();

    Self::tensor_from_rgb(decoded)
  }

  /// 写入缩放后的 JPEG 文件并读回其字节
  fn round_trip_through_cache(
    &self,
    dir: &Path,
    source: &Path,
    encoded: &[u8],
  ) -> Result<Vec<u8>, PreprocessError> {
    let io_error = |path: &Path| {
      let path = path.to_path_buf();
      move |source| PreprocessError::Io { path, source }
    };

    std::fs::create_dir_all(dir).map_err(io_error(dir))?;
    let stem = source
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "capture".to_string());
    let cached = dir.join(format!("{}-resized-{}x{}.jpg", stem, W, H));
    std::fs::write(&cached, encoded).map_err(io_error(&cached))?;
    info!("缩放后的图像写入: {}", cached.display());
    std::fs::read(&cached).map_err(io_error(&cached))
  }

  /// 将 `W`x`H` 的 RGB 像素转换为 [1, H, W, 3] 的归一化张量
  pub fn tensor_from_rgb(image: RgbImage) -> Result<NhwcTensor<W, H>, PreprocessError> {
    let (width, height) = image.dimensions();
    let pixels = Array3::from_shape_vec(
      (height as usize, width as usize, RGB_CHANNELS),
      image.into_raw(),
    )?;
    let normalized = pixels.mapv(|v| v as f32 / 255.0).insert_axis(Axis(0));
    Ok(NhwcTensor::try_from(normalized)?)
  }
}
