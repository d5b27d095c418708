// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 重复推理耗时测试
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use pifu::{
  FromUrl,
  config::PipelineConfig,
  input::CapturedImage,
  output::OutputWrapper,
  task::{RepeatShotTask, Session, Task},
};
use tracing::info;

/// Pifu 重复推理参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型资源 URL，例如 graph:///opt/pifu/models
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像 URL，例如 image:///tmp/photo.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出方式
  #[arg(long, default_value = "console:", value_name = "OUTPUT")]
  pub output: Url,
  /// 推理次数
  #[arg(long, default_value = "100", value_name = "TIMES")]
  pub times: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出方式: {}", args.output);
  info!("推理次数: {}", args.times);

  let config = PipelineConfig::from_url(&args.model)?;
  let image = CapturedImage::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let session: Session = Session::open(&config);

  RepeatShotTask::new(args.times).run_task(Some(image), &session, output)?;

  Ok(())
}
