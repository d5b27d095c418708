// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/task.rs - 推理会话与任务
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

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::engine::InferenceEngine;
use crate::frame::{MODEL_INPUT_HEIGHT, MODEL_INPUT_WIDTH};
use crate::input::{AcquisitionError, CapturedImage, PreprocessError, Preprocessor};
use crate::model::{LoadedModel, ModelKind, ModelLoader};
use crate::output::Render;
use crate::ranker::{PredictionResult, rank};

#[derive(Error, Debug)]
pub enum PendingError {
  #[error("后台任务异常终止")]
  Panicked,
}

/// 在后台线程中执行的操作，不支持取消和超时
#[derive(Debug)]
pub struct Pending<T> {
  rx: Receiver<T>,
  ready: Option<T>,
}

impl<T: Send + 'static> Pending<T> {
  pub fn spawn<F>(f: F) -> Self
  where
    F: FnOnce() -> T + Send + 'static,
  {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
      // 接收端已被丢弃时结果无人需要
      let _ = tx.send(f());
    });
    Self { rx, ready: None }
  }
}

impl<T> Pending<T> {
  /// 结果已就绪或后台线程已退出
  pub fn is_ready(&mut self) -> bool {
    if self.ready.is_some() {
      return true;
    }
    match self.rx.try_recv() {
      Ok(value) => {
        self.ready = Some(value);
        true
      }
      Err(TryRecvError::Empty) => false,
      Err(TryRecvError::Disconnected) => true,
    }
  }

  /// 非阻塞地取出结果，尚未完成时返回 `None`
  pub fn try_take(&mut self) -> Option<Result<T, PendingError>> {
    if let Some(value) = self.ready.take() {
      return Some(Ok(value));
    }
    match self.rx.try_recv() {
      Ok(value) => Some(Ok(value)),
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Disconnected) => Some(Err(PendingError::Panicked)),
    }
  }

  pub fn wait(self) -> Result<T, PendingError> {
    match self.ready {
      Some(value) => Ok(value),
      None => self.rx.recv().map_err(|_| PendingError::Panicked),
    }
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("图像获取失败: {0}")]
  Acquisition(#[from] AcquisitionError),
  #[error("图像预处理失败: {0}")]
  Preprocessing(#[from] PreprocessError),
  #[error("预测失败: {0}")]
  Fatal(String),
}

impl From<PendingError> for PipelineError {
  fn from(err: PendingError) -> Self {
    PipelineError::Fatal(err.to_string())
  }
}

impl PipelineError {
  /// 展示给用户的提示
  pub fn user_message(&self) -> String {
    match self {
      PipelineError::Acquisition(AcquisitionError::NoImage) => "No image found".to_string(),
      PipelineError::Acquisition(_) => "Failed to load image".to_string(),
      PipelineError::Preprocessing(err) => format!("Error during image analysis: {}", err),
      PipelineError::Fatal(cause) => format!("Error during image analysis: {}", cause),
    }
  }
}

/// 推理会话，持有加载完成的模型
///
/// 模型只读，通过 `Arc` 在多次推理之间共享。同一会话一次只处理一张图像。
#[derive(Debug, Clone)]
pub struct Session<const W: u32 = { MODEL_INPUT_WIDTH }, const H: u32 = { MODEL_INPUT_HEIGHT }> {
  model: Arc<LoadedModel<W, H>>,
  preprocessor: Preprocessor<W, H>,
  engine: Arc<InferenceEngine>,
}

impl<const W: u32, const H: u32> Session<W, H> {
  /// 加载模型并创建会话，模型加载失败时使用降级模型
  pub fn open(config: &PipelineConfig) -> Self {
    let model = ModelLoader::from_config(config).load();
    Self::with_model(model, config)
  }

  pub fn with_model(model: LoadedModel<W, H>, config: &PipelineConfig) -> Self {
    info!("创建推理会话: {} 模型, 输入 {}x{}", model.kind(), W, H);
    Self {
      model: Arc::new(model),
      preprocessor: Preprocessor::from_config(config),
      engine: Arc::new(InferenceEngine::new(config.synthetic_seed)),
    }
  }

  pub fn open_in_background(config: PipelineConfig) -> Pending<Self> {
    Pending::spawn(move || Self::open(&config))
  }

  pub fn model_kind(&self) -> ModelKind {
    self.model.kind()
  }

  pub fn model(&self) -> &LoadedModel<W, H> {
    &self.model
  }

  /// 预处理、推理并排序
  pub fn predict(&self, image: Option<&CapturedImage>) -> Result<PredictionResult, PipelineError> {
    let image = image.ok_or(AcquisitionError::NoImage)?;
    debug!("预处理图像: {}", image.path().display());
    let tensor = self.preprocessor.preprocess(image)?;
    let probabilities = self.engine.run(&self.model, tensor);
    let result = rank(&probabilities);
    info!(
      "预测结果: {} ({:.2}%){}",
      result.label,
      result.confidence,
      if result.is_degraded() { " [降级]" } else { "" }
    );
    Ok(result)
  }

  pub fn predict_in_background(
    &self,
    image: Option<CapturedImage>,
  ) -> Pending<Result<PredictionResult, PipelineError>> {
    let session = self.clone();
    Pending::spawn(move || session.predict(image.as_ref()))
  }
}

pub trait Task<I, S, O>: Sized {
  type Error;
  fn run_task(self, input: I, session: S, output: O) -> Result<(), Self::Error>;
}

pub struct OneShotTask;

impl<'s, const W: u32, const H: u32, RE, O> Task<Option<CapturedImage>, &'s Session<W, H>, O>
  for OneShotTask
where
  RE: std::error::Error + Sync + Send + 'static,
  O: Render<CapturedImage, PredictionResult, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: Option<CapturedImage>,
    session: &'s Session<W, H>,
    output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let now = Instant::now();
    let result = session.predict(input.as_ref())?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    if let Some(image) = &input {
      output.render_result(image, &result)?;
    }
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 复用同一模型重复推理，用于测量平均耗时
pub struct RepeatShotTask {
  times: usize,
}

impl RepeatShotTask {
  pub fn new(times: usize) -> Self {
    Self {
      times: times.max(1),
    }
  }
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self::new(100)
  }
}

impl<'s, const W: u32, const H: u32, RE, O> Task<Option<CapturedImage>, &'s Session<W, H>, O>
  for RepeatShotTask
where
  RE: std::error::Error + Sync + Send + 'static,
  O: Render<CapturedImage, PredictionResult, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: Option<CapturedImage>,
    session: &'s Session<W, H>,
    output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let image = input.ok_or(AcquisitionError::NoImage)?;
    let mut times = Vec::with_capacity(self.times);
    let mut last = None;
    for i in 0..self.times {
      let now = Instant::now();
      let result = session.predict(Some(&image))?;
      let elapsed = now.elapsed();
      debug!("({})推理完成，耗时: {:.2?}", i, elapsed);
      times.push(elapsed);
      last = Some(result);
    }

    // 前两次包含缓存预热
    let warm: Vec<Duration> = if times.len() > 2 {
      times[2..].to_vec()
    } else {
      times
    };
    warn!(
      "平均推理时间: {:.2?} ({} 次)",
      warm.iter().sum::<Duration>() / warm.len() as u32,
      warm.len()
    );

    if let Some(result) = last {
      output.render_result(&image, &result)?;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::FallbackModelBuilder;

  fn session() -> Session<8, 8> {
    let config = PipelineConfig::new(std::env::temp_dir().join("pifu-task-missing"));
    Session::with_model(
      LoadedModel::Fallback(FallbackModelBuilder::default().seed(Some(2)).build()),
      &config,
    )
  }

  #[test]
  fn missing_image_is_an_acquisition_error() {
    let err = session().predict(None).unwrap_err();
    assert!(matches!(
      err,
      PipelineError::Acquisition(AcquisitionError::NoImage)
    ));
    assert_eq!(err.user_message(), "No image found");
  }

  #[test]
  fn fatal_message_includes_cause() {
    let err = PipelineError::from(PendingError::Panicked);
    assert!(err.user_message().starts_with("Error during image analysis: "));
  }

  #[test]
  fn pending_reports_panics() {
    let pending = Pending::spawn(|| -> u32 { panic!("boom") });
    assert!(matches!(pending.wait(), Err(PendingError::Panicked)));
  }

  #[test]
  fn pending_value_can_be_polled() {
    let mut pending = Pending::spawn(|| 41 + 1);
    while !pending.is_ready() {
      thread::yield_now();
    }
    assert_eq!(pending.try_take().unwrap().unwrap(), 42);
  }

  #[test]
  fn background_prediction_without_image_fails() {
    let result = session().predict_in_background(None).wait().unwrap();
    assert!(matches!(result, Err(PipelineError::Acquisition(_))));
  }
}
