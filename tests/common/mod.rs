// 该文件是 Pifu （皮肤识别） 项目的一部分。
// tests/common/mod.rs - 测试用模型资源
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

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use image::{Rgb, RgbImage};
use serde_json::json;

/// 全连接层权重为 0，Basal Cell Carcinoma 的偏置为 5，其余为 0，
/// 输出恒为 e^5 / (e^5 + 9)
pub const EXPECTED_INDEX: usize = 3;
pub const EXPECTED_CONFIDENCE: f32 = 94.2826;

pub const SHARD_FILES: [&str; 3] = [
  "group1-shard1of3.bin",
  "group1-shard2of3.bin",
  "group1-shard3of3.bin",
];

pub fn scratch_dir(name: &str) -> Result<PathBuf> {
  let dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(name);
  if dir.exists() {
    std::fs::remove_dir_all(&dir).with_context(|| format!("清理 {}", dir.display()))?;
  }
  std::fs::create_dir_all(&dir)?;
  Ok(dir)
}

fn b64(s: &str) -> String {
  BASE64.encode(s)
}

fn fused(ops: &[&str]) -> serde_json::Value {
  json!({ "list": { "s": ops.iter().map(|op| b64(op)).collect::<Vec<_>>() } })
}

fn topology(extra_op: Option<&str>) -> serde_json::Value {
  let mut nodes = vec![
    json!({ "name": "input", "op": "Placeholder",
      "attr": { "dtype": { "type": "DT_FLOAT" } } }),
    json!({ "name": "conv/kernel", "op": "Const" }),
    json!({ "name": "conv/bias", "op": "Const" }),
    json!({ "name": "conv", "op": "_FusedConv2D",
      "input": ["input", "conv/kernel", "conv/bias"],
      "attr": {
        "strides": { "list": { "i": ["1", "1", "1", "1"] } },
        "padding": { "s": b64("SAME") },
        "data_format": { "s": b64("NHWC") },
        "dilations": { "list": { "i": ["1", "1", "1", "1"] } },
        "fused_ops": fused(&["BiasAdd", "Relu"])
      } }),
    json!({ "name": "gap/axes", "op": "Const" }),
    json!({ "name": "gap", "op": "Mean", "input": ["conv", "gap/axes"],
      "attr": { "keep_dims": { "b": false } } }),
    json!({ "name": "dense/kernel", "op": "Const" }),
    json!({ "name": "dense/bias", "op": "Const" }),
    json!({ "name": "dense", "op": "_FusedMatMul",
      "input": ["gap", "dense/kernel", "dense/bias"],
      "attr": {
        "transpose_a": { "b": false },
        "transpose_b": { "b": false },
        "fused_ops": fused(&["BiasAdd"])
      } }),
  ];
  let head = match extra_op {
    Some(op) => {
      nodes.push(json!({ "name": "extra", "op": op, "input": ["dense"] }));
      "extra"
    }
    None => "dense",
  };
  nodes.push(json!({ "name": "probs", "op": "Softmax", "input": [head] }));
  nodes.push(json!({ "name": "Identity", "op": "Identity", "input": ["probs"] }));

  json!({
    "format": "graph-model",
    "generatedBy": "2.15.0",
    "convertedBy": "TensorFlow.js Converter v4.17.0",
    "modelTopology": { "node": nodes, "versions": { "producer": 1645 } },
    "weightsManifest": [{
      "paths": SHARD_FILES,
      "weights": [
        { "name": "conv/kernel", "shape": [1, 1, 3, 4], "dtype": "float32" },
        { "name": "conv/bias", "shape": [4], "dtype": "float32" },
        { "name": "gap/axes", "shape": [2], "dtype": "int32" },
        { "name": "dense/kernel", "shape": [4, 10], "dtype": "float32" },
        { "name": "dense/bias", "shape": [10], "dtype": "float32" }
      ]
    }]
  })
}

fn weight_bytes() -> Vec<u8> {
  let mut bytes = Vec::new();
  let mut floats = |values: &[f32]| {
    for v in values {
      bytes.extend_from_slice(&v.to_le_bytes());
    }
  };
  floats(&[0.5; 12]);
  floats(&[0.1; 4]);
  for axis in [1i32, 2] {
    bytes.extend_from_slice(&axis.to_le_bytes());
  }
  for _ in 0..40 {
    bytes.extend_from_slice(&0.0f32.to_le_bytes());
  }
  for i in 0..10 {
    let bias: f32 = if i == EXPECTED_INDEX { 5.0 } else { 0.0 };
    bytes.extend_from_slice(&bias.to_le_bytes());
  }
  bytes
}

fn write_model(dir: &Path, extra_op: Option<&str>) -> Result<()> {
  std::fs::create_dir_all(dir)?;
  std::fs::write(
    dir.join("model.json"),
    serde_json::to_vec_pretty(&topology(extra_op))?,
  )?;

  let bytes = weight_bytes();
  let split = [0, 100, 200, bytes.len()];
  for (i, file) in SHARD_FILES.iter().enumerate() {
    std::fs::write(dir.join(file), &bytes[split[i]..split[i + 1]])?;
  }
  Ok(())
}

/// 写入一个可以被完整加载的小型图模型
pub fn write_graph_model(dir: &Path) -> Result<()> {
  write_model(dir, None)
}

/// 写入包含不支持算子的图模型
pub fn write_graph_model_with_op(dir: &Path, op: &str) -> Result<()> {
  write_model(dir, Some(op))
}

/// 读取、修改并写回 model.json
pub fn edit_topology(dir: &Path, edit: impl FnOnce(&mut serde_json::Value)) -> Result<()> {
  let path = dir.join("model.json");
  let mut topology: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
  edit(&mut topology);
  std::fs::write(&path, serde_json::to_vec_pretty(&topology)?)?;
  Ok(())
}

pub fn truncate_shard(dir: &Path, index: usize) -> Result<()> {
  let path = dir.join(SHARD_FILES[index]);
  let bytes = std::fs::read(&path)?;
  std::fs::write(&path, &bytes[..bytes.len() / 2])?;
  Ok(())
}

pub fn write_jpeg(path: &Path, width: u32, height: u32, color: [u8; 3]) -> Result<()> {
  RgbImage::from_pixel(width, height, Rgb(color))
    .save(path)
    .with_context(|| format!("写入 {}", path.display()))?;
  Ok(())
}
