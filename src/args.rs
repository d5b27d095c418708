// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/args.rs - 项目参数配置
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

use clap::Parser;
use url::Url;

use pifu::FromUrl;
use pifu::config::{ConfigError, PipelineConfig};

/// Pifu 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型资源目录，或 graph:///path?shards=3 形式的 URL
  #[arg(long, value_name = "MODEL")]
  pub model: String,

  /// 拍摄的图像，本地路径或 file:// / image:// URL
  #[arg(long, value_name = "IMAGE")]
  pub input: Option<String>,

  /// 输出方式
  /// 支持格式:
  /// - console: 打印到标准输出
  /// - json:///path/to/result.json
  #[arg(long, default_value = "console:", value_name = "OUTPUT")]
  pub output: Url,

  /// 随机种子，用于降级模型和合成概率
  #[arg(long, value_name = "SEED")]
  pub seed: Option<u64>,

  /// 缩放后的 JPEG 写入该目录
  #[arg(long, value_name = "DIR")]
  pub resized_cache: Option<std::path::PathBuf>,
}

impl Args {
  pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
    let config = match Url::parse(&self.model) {
      Ok(url) if url.scheme().len() > 1 => PipelineConfig::from_url(&url)?,
      _ => PipelineConfig::new(&self.model),
    };

    let config = match &self.resized_cache {
      Some(dir) => config.resized_cache_dir(Some(dir.clone())),
      None => config,
    };

    Ok(
      config
        .fallback_seed(self.seed)
        .synthetic_seed(self.seed),
    )
  }
}
