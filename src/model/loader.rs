// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/model/loader.rs - 模型加载
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

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::model::{
  FallbackModelBuilder, GraphModel, GraphModelBuilder, LoadedModel, Loss, ModelLoadError,
};
use crate::task::Pending;

/// 先尝试加载随应用打包的图模型，失败时构建降级模型
#[derive(Debug, Clone)]
pub struct ModelLoader {
  graph: GraphModelBuilder,
  fallback: FallbackModelBuilder,
}

impl ModelLoader {
  pub fn new(graph: GraphModelBuilder) -> Self {
    Self {
      graph,
      fallback: FallbackModelBuilder::default().compile(Loss::CategoricalCrossentropy),
    }
  }

  pub fn from_config(config: &PipelineConfig) -> Self {
    Self::new(GraphModelBuilder::from_config(config)).fallback_seed(config.fallback_seed)
  }

  pub fn fallback_seed(mut self, seed: Option<u64>) -> Self {
    self.fallback = self.fallback.seed(seed);
    self
  }

  /// 只加载图模型，错误直接返回
  pub fn load_graph<const W: u32, const H: u32>(&self) -> Result<GraphModel<W, H>, ModelLoadError> {
    self.graph.build()
  }

  /// 加载模型，该操作不会失败
  pub fn load<const W: u32, const H: u32>(&self) -> LoadedModel<W, H> {
    match self.load_graph() {
      Ok(model) => {
        info!("已加载预训练模型: {}", self.graph.model_dir().display());
        LoadedModel::Graph(model)
      }
      Err(err) => {
        warn!("预训练模型加载失败, 使用降级模型: {}", err);
        LoadedModel::Fallback(self.fallback.clone().build())
      }
    }
  }

  pub fn load_in_background<const W: u32, const H: u32>(self) -> Pending<LoadedModel<W, H>> {
    Pending::spawn(move || self.load())
  }
}
