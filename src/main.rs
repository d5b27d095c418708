// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use pifu::{
  FromUrl,
  input::CapturedImage,
  output::OutputWrapper,
  task::{OneShotTask, Pending, PipelineError, Session, Task},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("模型路径: {}", args.model);
  info!("输入来源: {:?}", args.input);
  info!("输出方式: {}", args.output);

  let config = args.pipeline_config()?;
  // 模型在后台加载，同时解析输入和输出
  let pending: Pending<Session> = Session::open_in_background(config);

  let output = OutputWrapper::from_url(&args.output)?;
  let image = match args.input.as_deref().map(CapturedImage::from_handle).transpose() {
    Ok(image) => image,
    Err(err) => {
      let err = PipelineError::from(err);
      eprintln!("{}", err.user_message());
      return Err(err.into());
    }
  };

  let session = pending.wait().map_err(PipelineError::from)?;
  info!("模型就绪: {}", session.model_kind());

  if let Err(err) = OneShotTask.run_task(image, &session, output) {
    match err.downcast_ref::<PipelineError>() {
      Some(pipeline) => eprintln!("{}", pipeline.user_message()),
      None => error!("输出失败: {}", err),
    }
    return Err(err);
  }

  Ok(())
}
