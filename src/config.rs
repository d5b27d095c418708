// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/config.rs - 推理流水线配置
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

use std::collections::HashMap;
use std::path::PathBuf;

use image::imageops::FilterType;
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

/// 拓扑描述文件的默认文件名
pub const DEFAULT_TOPOLOGY_FILE: &str = "model.json";
/// 随应用打包的权重分片数量
pub const DEFAULT_SHARD_COUNT: usize = 3;
pub const DEFAULT_JPEG_QUALITY: u8 = 92;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("路径解码失败: {0}")]
  PathDecode(#[from] std::string::FromUtf8Error),
}

/// 推理流水线配置
///
/// 通过 `graph:///path/to/models?shards=3&topology=model.json&output=Identity`
/// 形式的 URL 或构建器方法创建。
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// 模型资源目录，包含拓扑描述文件和权重分片
  pub model_dir: PathBuf,
  pub topology_file: String,
  /// `None` 表示不校验分片数量
  pub expected_shards: Option<usize>,
  /// 图模型输出节点，`None` 时自动推断
  pub output_node: Option<String>,
  pub resize_filter: FilterType,
  pub jpeg_quality: u8,
  /// 缩放后的 JPEG 写入该目录后再读回，`None` 时只在内存中处理
  pub resized_cache_dir: Option<PathBuf>,
  /// 降级模型随机初始化种子
  pub fallback_seed: Option<u64>,
  /// 合成概率向量的随机种子
  pub synthetic_seed: Option<u64>,
}

impl PipelineConfig {
  pub fn new(model_dir: impl Into<PathBuf>) -> Self {
    Self {
      model_dir: model_dir.into(),
      topology_file: DEFAULT_TOPOLOGY_FILE.to_string(),
      expected_shards: Some(DEFAULT_SHARD_COUNT),
      output_node: None,
      resize_filter: FilterType::Triangle,
      jpeg_quality: DEFAULT_JPEG_QUALITY,
      resized_cache_dir: None,
      fallback_seed: None,
      synthetic_seed: None,
    }
  }

  pub fn topology_file(mut self, file: impl Into<String>) -> Self {
    self.topology_file = file.into();
    self
  }

  pub fn expected_shards(mut self, shards: Option<usize>) -> Self {
    self.expected_shards = shards;
    self
  }

  pub fn output_node(mut self, node: Option<String>) -> Self {
    self.output_node = node;
    self
  }

  pub fn resize_filter(mut self, filter: FilterType) -> Self {
    self.resize_filter = filter;
    self
  }

  pub fn jpeg_quality(mut self, quality: u8) -> Self {
    self.jpeg_quality = quality.clamp(1, 100);
    self
  }

  pub fn resized_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
    self.resized_cache_dir = dir;
    self
  }

  pub fn fallback_seed(mut self, seed: Option<u64>) -> Self {
    self.fallback_seed = seed;
    self
  }

  pub fn synthetic_seed(mut self, seed: Option<u64>) -> Self {
    self.synthetic_seed = seed;
    self
  }

  pub fn topology_path(&self) -> PathBuf {
    self.model_dir.join(&self.topology_file)
  }
}

fn parse_filter(value: &str) -> Option<FilterType> {
  match value {
    "nearest" => Some(FilterType::Nearest),
    "triangle" | "bilinear" => Some(FilterType::Triangle),
    "catmull-rom" | "bicubic" => Some(FilterType::CatmullRom),
    "gaussian" => Some(FilterType::Gaussian),
    "lanczos3" => Some(FilterType::Lanczos3),
    _ => None,
  }
}

impl FromUrlWithScheme for PipelineConfig {
  const SCHEME: &'static str = "graph";
}

impl FromUrl for PipelineConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let path = urlencoding::decode(url.path())?;
    let mut config = PipelineConfig::new(path.into_owned());

    let invalid = |key: &str, value: &str| ConfigError::InvalidParameter {
      key: key.to_string(),
      value: value.to_string(),
    };

    if let Some(topology) = query.get("topology") {
      config = config.topology_file(topology.as_str());
    }
    if let Some(shards) = query.get("shards") {
      let expected = match shards.as_str() {
        "any" => None,
        value => Some(value.parse::<usize>().map_err(|_| invalid("shards", value))?),
      };
      config = config.expected_shards(expected);
    }
    if let Some(output) = query.get("output") {
      config = config.output_node(Some(output.clone()));
    }
    if let Some(filter) = query.get("filter") {
      let filter = parse_filter(filter).ok_or_else(|| invalid("filter", filter.as_str()))?;
      config = config.resize_filter(filter);
    }
    if let Some(quality) = query.get("quality") {
      let quality = quality
        .parse::<u8>()
        .map_err(|_| invalid("quality", quality.as_str()))?;
      config = config.jpeg_quality(quality);
    }
    if let Some(cache) = query.get("cache") {
      config = config.resized_cache_dir(Some(PathBuf::from(cache)));
    }

    Ok(config)
  }
}
