// 该文件是 Pifu （皮肤识别） 项目的一部分。
// tests/pipeline.rs - 端到端流水线测试
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

mod common;

use anyhow::{Context, Result};
use approx::assert_abs_diff_eq;
use url::Url;

use pifu::{
  FromUrl,
  config::PipelineConfig,
  engine::InferenceEngine,
  frame::NhwcTensor,
  input::{AcquisitionError, CapturedImage, Preprocessor},
  model::{LABEL_COUNT, LoadedModel, ModelKind, ModelLoadError, ModelLoader, SkinLabel},
  output::{JsonReport, Render},
  task::{PipelineError, Session},
};

use common::{EXPECTED_CONFIDENCE, EXPECTED_INDEX};

fn red_pixel(dir: &std::path::Path) -> Result<CapturedImage> {
  let path = dir.join("red.jpg");
  common::write_jpeg(&path, 1, 1, [255, 0, 0])?;
  Ok(CapturedImage::new(path)?)
}

#[test]
fn real_model_classifies_single_red_pixel() -> Result<()> {
  let dir = common::scratch_dir("real-model")?;
  common::write_graph_model(&dir.join("models"))?;
  let image = red_pixel(&dir)?;

  let session: Session = Session::open(&PipelineConfig::new(dir.join("models")));
  assert_eq!(session.model_kind(), ModelKind::Real);

  let result = session.predict(Some(&image))?;
  assert_eq!(result.index, EXPECTED_INDEX);
  assert_eq!(result.label, SkinLabel::BasalCellCarcinoma);
  assert_abs_diff_eq!(result.confidence, EXPECTED_CONFIDENCE, epsilon = 1e-2);
  assert!(!result.is_degraded());
  Ok(())
}

#[test]
fn red_pixel_preprocesses_to_model_shape() -> Result<()> {
  let dir = common::scratch_dir("red-pixel-shape")?;
  let image = red_pixel(&dir)?;
  let tensor = Preprocessor::<224, 224>::default().preprocess(&image)?;
  assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
  let values = tensor.as_slice().context("张量不连续")?;
  assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
  Ok(())
}

#[test]
fn missing_image_stops_before_preprocessing() -> Result<()> {
  let dir = common::scratch_dir("no-image")?;
  let session: Session<16, 16> = Session::open(&PipelineConfig::new(dir.join("models")));
  let err = session.predict(None).unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Acquisition(AcquisitionError::NoImage)
  ));
  assert_eq!(err.user_message(), "No image found");
  Ok(())
}

#[test]
fn undecodable_image_is_a_preprocessing_error() -> Result<()> {
  let dir = common::scratch_dir("bad-image")?;
  let path = dir.join("broken.jpg");
  std::fs::write(&path, b"\xff\xd8\xff garbage")?;
  let session: Session<16, 16> = Session::open(&PipelineConfig::new(dir.join("models")));
  let err = session.predict(Some(&CapturedImage::new(path)?)).unwrap_err();
  assert!(matches!(err, PipelineError::Preprocessing(_)));
  assert!(err.user_message().starts_with("Error during image analysis: "));
  Ok(())
}

#[test]
fn missing_assets_use_fallback_model() -> Result<()> {
  let dir = common::scratch_dir("missing-assets")?;
  let image = red_pixel(&dir)?;
  let config = PipelineConfig::new(dir.join("models")).fallback_seed(Some(3));

  let session: Session<32, 32> = Session::open(&config);
  assert_eq!(session.model_kind(), ModelKind::Fallback);

  let result = session.predict(Some(&image))?;
  assert!(result.index < LABEL_COUNT);
  assert!((0.0..=100.0).contains(&result.confidence));
  assert!(result.is_degraded());
  assert_eq!(result.model, ModelKind::Fallback);
  Ok(())
}

#[test]
fn truncated_shard_falls_back() -> Result<()> {
  let dir = common::scratch_dir("truncated-shard")?;
  let models = dir.join("models");
  common::write_graph_model(&models)?;
  common::truncate_shard(&models, 2)?;

  let loader = ModelLoader::from_config(&PipelineConfig::new(&models));
  assert!(matches!(
    loader.load_graph::<16, 16>(),
    Err(ModelLoadError::CorruptShard(_))
  ));
  assert_eq!(loader.load::<16, 16>().kind(), ModelKind::Fallback);
  Ok(())
}

#[test]
fn missing_shard_falls_back() -> Result<()> {
  let dir = common::scratch_dir("missing-shard")?;
  let models = dir.join("models");
  common::write_graph_model(&models)?;
  std::fs::remove_file(models.join(common::SHARD_FILES[1]))?;

  let loader = ModelLoader::from_config(&PipelineConfig::new(&models));
  assert!(matches!(
    loader.load_graph::<16, 16>(),
    Err(ModelLoadError::Io { .. })
  ));
  assert_eq!(loader.load::<16, 16>().kind(), ModelKind::Fallback);
  Ok(())
}

#[test]
fn unexpected_shard_count_falls_back() -> Result<()> {
  let dir = common::scratch_dir("shard-count")?;
  let models = dir.join("models");
  common::write_graph_model(&models)?;

  let strict = PipelineConfig::new(&models).expected_shards(Some(2));
  assert!(matches!(
    ModelLoader::from_config(&strict).load_graph::<16, 16>(),
    Err(ModelLoadError::ShardCount {
      expected: 2,
      actual: 3
    })
  ));

  let relaxed = PipelineConfig::new(&models).expected_shards(None);
  assert_eq!(
    ModelLoader::from_config(&relaxed).load::<16, 16>().kind(),
    ModelKind::Real
  );
  Ok(())
}

#[test]
fn overflowing_weight_shape_falls_back() -> Result<()> {
  let dir = common::scratch_dir("overflow-shape")?;
  let models = dir.join("models");
  common::write_graph_model(&models)?;
  common::edit_topology(&models, |topology| {
    topology["weightsManifest"][0]["weights"][1]["shape"] = serde_json::json!([4611686018427387904u64]);
  })?;

  let loader = ModelLoader::from_config(&PipelineConfig::new(&models));
  assert!(matches!(
    loader.load_graph::<16, 16>(),
    Err(ModelLoadError::CorruptShard(_))
  ));
  assert_eq!(loader.load::<16, 16>().kind(), ModelKind::Fallback);
  Ok(())
}

#[test]
fn unsupported_op_falls_back() -> Result<()> {
  let dir = common::scratch_dir("unsupported-op")?;
  let models = dir.join("models");
  common::write_graph_model_with_op(&models, "LeakyRelu")?;

  let loader = ModelLoader::from_config(&PipelineConfig::new(&models));
  assert!(matches!(
    loader.load_graph::<16, 16>(),
    Err(ModelLoadError::UnsupportedOp { .. })
  ));
  assert_eq!(loader.load::<16, 16>().kind(), ModelKind::Fallback);
  Ok(())
}

#[test]
fn zero_tensor_gives_full_probability_vector() -> Result<()> {
  let dir = common::scratch_dir("zero-tensor")?;
  common::write_graph_model(&dir)?;
  let model: LoadedModel = ModelLoader::from_config(&PipelineConfig::new(&dir)).load();
  assert_eq!(model.kind(), ModelKind::Real);

  let probs = InferenceEngine::new(Some(1)).run(&model, NhwcTensor::default());
  assert_eq!(probs.len(), LABEL_COUNT);
  assert!(!probs.is_synthetic());
  assert_abs_diff_eq!(probs.values().iter().sum::<f32>(), 1.0, epsilon = 1e-5);
  Ok(())
}

#[test]
fn seeded_fallback_predictions_are_deterministic() -> Result<()> {
  let dir = common::scratch_dir("deterministic")?;
  let path = dir.join("patch.jpg");
  common::write_jpeg(&path, 40, 40, [200, 150, 120])?;
  let image = CapturedImage::new(path)?;
  let config = PipelineConfig::new(dir.join("models"))
    .fallback_seed(Some(21))
    .synthetic_seed(Some(21));

  let first: Session<24, 24> = Session::open(&config);
  let second: Session<24, 24> = Session::open(&config);
  assert_eq!(first.predict(Some(&image))?, second.predict(Some(&image))?);
  assert_eq!(first.predict(Some(&image))?, first.predict(Some(&image))?);
  Ok(())
}

#[test]
fn background_session_and_prediction() -> Result<()> {
  let dir = common::scratch_dir("background")?;
  common::write_graph_model(&dir.join("models"))?;
  let image = red_pixel(&dir)?;

  let session: Session<32, 32> =
    Session::open_in_background(PipelineConfig::new(dir.join("models"))).wait()?;
  let result = session.predict_in_background(Some(image)).wait()??;
  assert_eq!(result.label, SkinLabel::BasalCellCarcinoma);
  assert_eq!(result.model, ModelKind::Real);
  Ok(())
}

#[test]
fn json_report_round_trip() -> Result<()> {
  let dir = common::scratch_dir("json-report")?;
  common::write_graph_model(&dir.join("models"))?;
  let image = red_pixel(&dir)?;
  let session: Session<32, 32> = Session::open(&PipelineConfig::new(dir.join("models")));
  let result = session.predict(Some(&image))?;

  let target = dir.join("out").join("result.json");
  let file_url = Url::from_file_path(&target).map_err(|_| anyhow::anyhow!("路径无效"))?;
  let url = Url::parse(&format!("json://{}", file_url.path()))?;
  JsonReport::from_url(&url)?.render_result(&image, &result)?;

  let value: serde_json::Value = serde_json::from_slice(&std::fs::read(&target)?)?;
  assert_eq!(value["label"], "Basal Cell Carcinoma");
  assert_eq!(value["model"], "real");
  assert_eq!(value["degraded"], false);
  assert_eq!(
    value["description"],
    SkinLabel::BasalCellCarcinoma.description()
  );
  Ok(())
}
