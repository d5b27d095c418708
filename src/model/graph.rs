// 该文件是 Pifu （皮肤识别） 项目的一部分。
// src/model/graph.rs - 图模型加载与执行
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

//! 图模型由拓扑描述文件（`model.json`）和若干二进制权重分片组成。
//!
//! 描述文件中 `modelTopology.node` 给出计算节点，`weightsManifest` 给出
//! 分片文件列表以及每个权重的名称、形状和类型。权重按清单顺序依次排列在
//! 拼接后的分片字节中，数值为小端序。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ndarray::{ArrayD, ArrayViewD, CowArray, Ix2, Ix4, IxDyn};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{DEFAULT_SHARD_COUNT, DEFAULT_TOPOLOGY_FILE, PipelineConfig};
use crate::frame::NhwcTensor;
use crate::model::label::LABEL_COUNT;
use crate::model::ops::{self, OpError, Padding, Window};
use crate::model::{InferenceError, Model, RawOutput};

const GRAPH_MODEL_FORMAT: &str = "graph-model";

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("读取模型资源 {} 失败: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("拓扑描述解析失败: {0}")]
  Descriptor(#[from] serde_json::Error),
  #[error("不支持的模型格式: {0}")]
  UnsupportedFormat(String),
  #[error("节点 {node} 使用了不支持的算子 {op}")]
  UnsupportedOp { node: String, op: String },
  #[error("节点 {node} 的属性 {attr} 无效: {reason}")]
  InvalidAttr {
    node: String,
    attr: String,
    reason: String,
  },
  #[error("节点 {node} 引用了不存在的输入 {input}")]
  MissingInput { node: String, input: String },
  #[error("节点 {node} 需要 {expected} 个输入, 实际 {actual} 个")]
  Arity {
    node: String,
    expected: usize,
    actual: usize,
  },
  #[error("常量节点 {0} 缺少权重")]
  MissingWeight(String),
  #[error("权重分片数量不匹配: 期望 {expected}, 实际 {actual}")]
  ShardCount { expected: usize, actual: usize },
  #[error("权重分片损坏: {0}")]
  CorruptShard(String),
  #[error("权重 {name} 的类型 {dtype} 不受支持")]
  UnsupportedDtype { name: String, dtype: String },
  #[error("计算图无效: {0}")]
  InvalidGraph(String),
  #[error("模型输出宽度为 {actual}, 标签数量为 {expected}")]
  OutputWidth { expected: usize, actual: usize },
  #[error("权重形状错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
  #[error("模型试运行失败: {0}")]
  Probe(#[from] InferenceError),
}

impl ModelLoadError {
  fn invalid_attr(node: &NodeDef, attr: &str, reason: impl Into<String>) -> Self {
    ModelLoadError::InvalidAttr {
      node: node.name.clone(),
      attr: attr.to_string(),
      reason: reason.into(),
    }
  }

  fn unsupported(node: &NodeDef, op: impl Into<String>) -> Self {
    ModelLoadError::UnsupportedOp {
      node: node.name.clone(),
      op: op.into(),
    }
  }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ModelDescriptor {
  format: Option<String>,
  model_topology: GraphTopology,
  #[serde(default)]
  weights_manifest: Vec<WeightGroup>,
}

#[derive(Deserialize, Debug)]
struct GraphTopology {
  #[serde(default)]
  node: Vec<NodeDef>,
}

#[derive(Deserialize, Debug)]
struct NodeDef {
  name: String,
  op: String,
  #[serde(default)]
  input: Vec<String>,
  #[serde(default)]
  attr: HashMap<String, AttrValue>,
}

#[derive(Deserialize, Debug, Default)]
struct AttrValue {
  s: Option<String>,
  b: Option<bool>,
  list: Option<AttrList>,
}

#[derive(Deserialize, Debug, Default)]
struct AttrList {
  #[serde(default)]
  s: Vec<String>,
  #[serde(default)]
  i: Vec<IntValue>,
}

/// 64 位整数在描述文件中可能以字符串形式出现
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum IntValue {
  Number(i64),
  Text(String),
}

impl IntValue {
  fn as_i64(&self) -> Option<i64> {
    match self {
      IntValue::Number(v) => Some(*v),
      IntValue::Text(s) => s.parse().ok(),
    }
  }
}

#[derive(Deserialize, Debug)]
struct WeightGroup {
  paths: Vec<String>,
  weights: Vec<WeightEntry>,
}

#[derive(Deserialize, Debug)]
struct WeightEntry {
  name: String,
  shape: Vec<usize>,
  dtype: String,
  quantization: Option<serde_json::Value>,
}

impl NodeDef {
  fn decode_str(&self, attr: &str, encoded: &str) -> Result<String, ModelLoadError> {
    let bytes = BASE64
      .decode(encoded)
      .map_err(|e| ModelLoadError::invalid_attr(self, attr, e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ModelLoadError::invalid_attr(self, attr, e.to_string()))
  }

  fn attr_str(&self, attr: &str) -> Result<Option<String>, ModelLoadError> {
    match self.attr.get(attr).and_then(|v| v.s.as_deref()) {
      Some(encoded) => self.decode_str(attr, encoded).map(Some),
      None => Ok(None),
    }
  }

  fn attr_strs(&self, attr: &str) -> Result<Vec<String>, ModelLoadError> {
    match self.attr.get(attr).and_then(|v| v.list.as_ref()) {
      Some(list) => list
        .s
        .iter()
        .map(|encoded| self.decode_str(attr, encoded))
        .collect(),
      None => Ok(Vec::new()),
    }
  }

  fn attr_ints(&self, attr: &str) -> Result<Option<Vec<i64>>, ModelLoadError> {
    let Some(list) = self.attr.get(attr).and_then(|v| v.list.as_ref()) else {
      return Ok(None);
    };
    list
      .i
      .iter()
      .map(|v| {
        v.as_i64()
          .ok_or_else(|| ModelLoadError::invalid_attr(self, attr, format!("{:?} 不是整数", v)))
      })
      .collect::<Result<Vec<_>, _>>()
      .map(Some)
  }

  fn attr_bool(&self, attr: &str) -> bool {
    self.attr.get(attr).and_then(|v| v.b).unwrap_or(false)
  }

  /// 读取 NHWC 四元组属性中间的两个值，例如步长 [1, sh, sw, 1]
  fn attr_hw(&self, attr: &str, default: (usize, usize)) -> Result<(usize, usize), ModelLoadError> {
    match self.attr_ints(attr)? {
      None => Ok(default),
      Some(values) => match values.as_slice() {
        [1, h, w, 1] if *h > 0 && *w > 0 => Ok((*h as usize, *w as usize)),
        _ => Err(ModelLoadError::invalid_attr(
          self,
          attr,
          format!("期望 [1, h, w, 1], 实际 {:?}", values),
        )),
      },
    }
  }

  fn padding(&self) -> Result<Padding, ModelLoadError> {
    match self.attr_str("padding")?.as_deref() {
      Some("SAME") => Ok(Padding::Same),
      Some("VALID") => Ok(Padding::Valid),
      Some(other) => Err(ModelLoadError::invalid_attr(self, "padding", other)),
      None => Err(ModelLoadError::invalid_attr(self, "padding", "缺少填充方式")),
    }
  }

  fn check_nhwc(&self) -> Result<(), ModelLoadError> {
    match self.attr_str("data_format")?.as_deref() {
      None | Some("NHWC") => Ok(()),
      Some(other) => Err(ModelLoadError::invalid_attr(self, "data_format", other)),
    }
  }

  fn window(&self) -> Result<Window, ModelLoadError> {
    self.check_nhwc()?;
    Ok(Window {
      size: self.attr_hw("ksize", (1, 1))?,
      strides: self.attr_hw("strides", (1, 1))?,
      padding: self.padding()?,
    })
  }

  /// 解析融合算子后缀，返回是否带偏置以及激活函数
  fn fused_ops(&self) -> Result<(bool, Activation), ModelLoadError> {
    let mut bias = false;
    let mut activation = Activation::Identity;
    for op in self.attr_strs("fused_ops")? {
      match op.as_str() {
        "BiasAdd" => bias = true,
        "Relu" => activation = Activation::Relu,
        "Relu6" => activation = Activation::Relu6,
        other => return Err(ModelLoadError::unsupported(self, format!("{}+{}", self.op, other))),
      }
    }
    Ok((bias, activation))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
  Identity,
  Relu,
  Relu6,
}

impl Activation {
  fn apply(self, input: ArrayD<f32>) -> ArrayD<f32> {
    match self {
      Activation::Identity => input,
      Activation::Relu => ops::relu(input.view()),
      Activation::Relu6 => ops::relu6(input.view()),
    }
  }
}

enum Op {
  Input,
  Const(ArrayD<f32>),
  Conv2D {
    strides: (usize, usize),
    padding: Padding,
    depthwise: bool,
    bias: bool,
    activation: Activation,
  },
  BiasAdd,
  Add,
  Sub,
  Mul,
  Relu,
  Relu6,
  Sigmoid,
  MaxPool(Window),
  AvgPool(Window),
  Mean {
    keep_dims: bool,
  },
  Reshape,
  Squeeze(Vec<i64>),
  MatMul {
    transpose_a: bool,
    transpose_b: bool,
    bias: bool,
    activation: Activation,
  },
  Softmax,
}

impl Op {
  fn parse(node: &NodeDef, weights: &mut HashMap<String, ArrayD<f32>>) -> Result<Op, ModelLoadError> {
    let conv = |depthwise: bool, fused: bool| -> Result<Op, ModelLoadError> {
      node.check_nhwc()?;
      if let Some(dilations) = node.attr_ints("dilations")?
        && dilations.iter().any(|&d| d != 1)
      {
        return Err(ModelLoadError::invalid_attr(node, "dilations", "不支持空洞卷积"));
      }
      let (bias, activation) = if fused {
        node.fused_ops()?
      } else {
        (false, Activation::Identity)
      };
      Ok(Op::Conv2D {
        strides: node.attr_hw("strides", (1, 1))?,
        padding: node.padding()?,
        depthwise,
        bias,
        activation,
      })
    };

    let op = match node.op.as_str() {
      "Placeholder" => Op::Input,
      "Const" => Op::Const(
        weights
          .remove(&node.name)
          .ok_or_else(|| ModelLoadError::MissingWeight(node.name.clone()))?,
      ),
      "Conv2D" => conv(false, false)?,
      "_FusedConv2D" => conv(false, true)?,
      "DepthwiseConv2dNative" => conv(true, false)?,
      "FusedDepthwiseConv2dNative" => conv(true, true)?,
      "BiasAdd" => {
        node.check_nhwc()?;
        Op::BiasAdd
      }
      "Add" | "AddV2" => Op::Add,
      "Sub" => Op::Sub,
      "Mul" => Op::Mul,
      "Relu" => Op::Relu,
      "Relu6" => Op::Relu6,
      "Sigmoid" => Op::Sigmoid,
      "MaxPool" => Op::MaxPool(node.window()?),
      "AvgPool" => Op::AvgPool(node.window()?),
      "Mean" => Op::Mean {
        keep_dims: node.attr_bool("keep_dims"),
      },
      "Reshape" => Op::Reshape,
      "Squeeze" => Op::Squeeze(node.attr_ints("squeeze_dims")?.unwrap_or_default()),
      "MatMul" => Op::MatMul {
        transpose_a: node.attr_bool("transpose_a"),
        transpose_b: node.attr_bool("transpose_b"),
        bias: false,
        activation: Activation::Identity,
      },
      "_FusedMatMul" => {
        let (bias, activation) = node.fused_ops()?;
        Op::MatMul {
          transpose_a: node.attr_bool("transpose_a"),
          transpose_b: node.attr_bool("transpose_b"),
          bias,
          activation,
        }
      }
      "Softmax" => Op::Softmax,
      other => return Err(ModelLoadError::unsupported(node, other)),
    };
    Ok(op)
  }

  fn arity(&self) -> usize {
    match self {
      Op::Input | Op::Const(_) => 0,
      Op::Conv2D { bias, .. } | Op::MatMul { bias, .. } => {
        if *bias {
          3
        } else {
          2
        }
      }
      Op::BiasAdd | Op::Add | Op::Sub | Op::Mul | Op::Mean { .. } | Op::Reshape => 2,
      Op::Relu
      | Op::Relu6
      | Op::Sigmoid
      | Op::MaxPool(_)
      | Op::AvgPool(_)
      | Op::Squeeze(_)
      | Op::Softmax => 1,
    }
  }

  fn eval(&self, args: &[ArrayViewD<f32>]) -> Result<ArrayD<f32>, OpError> {
    match self {
      Op::Input | Op::Const(_) => Err(OpError::Mismatch("源节点不参与计算".to_string())),
      Op::Conv2D {
        strides,
        padding,
        depthwise,
        bias,
        activation,
      } => {
        let input = args[0].view().into_dimensionality::<Ix4>()?;
        let kernel = args[1].view().into_dimensionality::<Ix4>()?;
        let output = if *depthwise {
          ops::depthwise_conv2d(input, kernel, *strides, *padding)?
        } else {
          ops::conv2d(input, kernel, *strides, *padding)?
        }
        .into_dyn();
        let output = if *bias {
          ops::bias_add(output.view(), args[2].view())?
        } else {
          output
        };
        Ok(activation.apply(output))
      }
      Op::BiasAdd => ops::bias_add(args[0].view(), args[1].view()),
      Op::Add => ops::binary(args[0].view(), args[1].view(), |x, y| x + y),
      Op::Sub => ops::binary(args[0].view(), args[1].view(), |x, y| x - y),
      Op::Mul => ops::binary(args[0].view(), args[1].view(), |x, y| x * y),
      Op::Relu => Ok(ops::relu(args[0].view())),
      Op::Relu6 => Ok(ops::relu6(args[0].view())),
      Op::Sigmoid => Ok(ops::sigmoid(args[0].view())),
      Op::MaxPool(window) => {
        let input = args[0].view().into_dimensionality::<Ix4>()?;
        Ok(ops::max_pool(input, *window)?.into_dyn())
      }
      Op::AvgPool(window) => {
        let input = args[0].view().into_dimensionality::<Ix4>()?;
        Ok(ops::avg_pool(input, *window)?.into_dyn())
      }
      Op::Mean { keep_dims } => ops::mean(args[0].view(), &as_ints(&args[1]), *keep_dims),
      Op::Reshape => ops::reshape(args[0].view(), &as_ints(&args[1])),
      Op::Squeeze(axes) => ops::squeeze(args[0].view(), axes),
      Op::MatMul {
        transpose_a,
        transpose_b,
        bias,
        activation,
      } => {
        let a = args[0].view().into_dimensionality::<Ix2>()?;
        let b = args[1].view().into_dimensionality::<Ix2>()?;
        let output = ops::matmul(a, b, *transpose_a, *transpose_b)?.into_dyn();
        let output = if *bias {
          ops::bias_add(output.view(), args[2].view())?
        } else {
          output
        };
        Ok(activation.apply(output))
      }
      Op::Softmax => Ok(ops::softmax(args[0].view())),
    }
  }
}

fn as_ints(values: &ArrayViewD<f32>) -> Vec<i64> {
  values.iter().map(|&v| v as i64).collect()
}

struct Step {
  name: String,
  op: Op,
  inputs: Vec<usize>,
}

/// 编译后的执行计划，步骤按拓扑顺序排列
struct Plan {
  steps: Vec<Step>,
  output: usize,
  /// 每个槽位最后一次被使用的步骤
  last_use: Vec<usize>,
}

fn parse_input_ref(node: &NodeDef, input: &str) -> Result<Option<String>, ModelLoadError> {
  if input.starts_with('^') {
    // 控制依赖
    return Ok(None);
  }
  match input.rsplit_once(':') {
    Some((name, "0")) => Ok(Some(name.to_string())),
    Some((_, index)) if index.parse::<usize>().is_ok() => Err(ModelLoadError::InvalidGraph(format!(
      "节点 {} 引用了多输出节点 {}",
      node.name, input
    ))),
    _ => Ok(Some(input.to_string())),
  }
}

fn compile(
  nodes: Vec<NodeDef>,
  weights: &mut HashMap<String, ArrayD<f32>>,
  output_node: Option<&str>,
) -> Result<Plan, ModelLoadError> {
  let mut index: HashMap<String, usize> = HashMap::with_capacity(nodes.len());
  let mut inputs: Vec<Vec<String>> = Vec::with_capacity(nodes.len());
  for (i, node) in nodes.iter().enumerate() {
    if index.insert(node.name.clone(), i).is_some() {
      return Err(ModelLoadError::InvalidGraph(format!("节点名重复: {}", node.name)));
    }
    let refs = node
      .input
      .iter()
      .map(|input| parse_input_ref(node, input))
      .collect::<Result<Vec<_>, _>>()?;
    inputs.push(refs.into_iter().flatten().collect());
  }

  for (node, refs) in nodes.iter().zip(&inputs) {
    for input in refs {
      if !index.contains_key(input) {
        return Err(ModelLoadError::MissingInput {
          node: node.name.clone(),
          input: input.clone(),
        });
      }
    }
  }

  // Identity 节点直接映射到其输入
  let resolve = |mut i: usize| -> Result<usize, ModelLoadError> {
    let mut hops = 0;
    while nodes[i].op == "Identity" {
      let Some(target) = inputs[i].first() else {
        return Err(ModelLoadError::Arity {
          node: nodes[i].name.clone(),
          expected: 1,
          actual: 0,
        });
      };
      i = index[target];
      hops += 1;
      if hops > nodes.len() {
        return Err(ModelLoadError::InvalidGraph("Identity 节点成环".to_string()));
      }
    }
    Ok(i)
  };

  let output = match output_node {
    Some(name) => *index.get(name).ok_or_else(|| {
      ModelLoadError::InvalidGraph(format!("输出节点 {} 不存在", name))
    })?,
    None => {
      let consumed: HashSet<&str> = inputs.iter().flatten().map(String::as_str).collect();
      let sinks: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| !matches!(node.op.as_str(), "Const" | "Placeholder" | "NoOp"))
        .filter(|(_, node)| !consumed.contains(node.name.as_str()))
        .map(|(i, _)| i)
        .collect();
      match sinks.as_slice() {
        [single] => *single,
        [] => return Err(ModelLoadError::InvalidGraph("找不到输出节点".to_string())),
        many => {
          let names: Vec<&str> = many.iter().map(|&i| nodes[i].name.as_str()).collect();
          return Err(ModelLoadError::InvalidGraph(format!(
            "存在多个候选输出节点: {:?}",
            names
          )));
        }
      }
    }
  };
  let output = resolve(output)?;

  // 深度优先后序遍历得到拓扑顺序，只保留输出节点的祖先
  #[derive(Clone, Copy, PartialEq)]
  enum Mark {
    New,
    Visiting,
    Done,
  }
  let mut marks = vec![Mark::New; nodes.len()];
  let mut order: Vec<usize> = Vec::new();
  let mut stack: Vec<(usize, bool)> = vec![(output, false)];
  while let Some((i, expanded)) = stack.pop() {
    if expanded {
      marks[i] = Mark::Done;
      order.push(i);
      continue;
    }
    match marks[i] {
      Mark::Done => continue,
      Mark::Visiting => {
        return Err(ModelLoadError::InvalidGraph(format!(
          "计算图在节点 {} 处成环",
          nodes[i].name
        )));
      }
      Mark::New => {}
    }
    marks[i] = Mark::Visiting;
    stack.push((i, true));
    for input in inputs[i].iter().rev() {
      let dep = resolve(index[input])?;
      match marks[dep] {
        Mark::Done => {}
        Mark::Visiting => {
          return Err(ModelLoadError::InvalidGraph(format!(
            "计算图在节点 {} 处成环",
            nodes[dep].name
          )));
        }
        Mark::New => stack.push((dep, false)),
      }
    }
  }

  let mut slot_of: HashMap<usize, usize> = HashMap::with_capacity(order.len());
  let mut steps = Vec::with_capacity(order.len());
  for &i in &order {
    let node = &nodes[i];
    let op = Op::parse(node, weights)?;
    let arity = op.arity();
    if inputs[i].len() < arity {
      return Err(ModelLoadError::Arity {
        node: node.name.clone(),
        expected: arity,
        actual: inputs[i].len(),
      });
    }
    let step_inputs = inputs[i][..arity]
      .iter()
      .map(|input| {
        let dep = resolve(index[input])?;
        slot_of.get(&dep).copied().ok_or_else(|| {
          ModelLoadError::InvalidGraph(format!("节点 {} 的输入 {} 未就绪", node.name, input))
        })
      })
      .collect::<Result<Vec<_>, _>>()?;
    slot_of.insert(i, steps.len());
    steps.push(Step {
      name: node.name.clone(),
      op,
      inputs: step_inputs,
    });
  }

  let sources = steps.iter().filter(|s| matches!(s.op, Op::Input)).count();
  if sources != 1 {
    return Err(ModelLoadError::InvalidGraph(format!(
      "计算图需要恰好一个输入节点, 实际 {} 个",
      sources
    )));
  }

  let mut last_use: Vec<usize> = (0..steps.len()).collect();
  for (position, step) in steps.iter().enumerate() {
    for &slot in &step.inputs {
      last_use[slot] = last_use[slot].max(position);
    }
  }

  Ok(Plan {
    output: steps.len() - 1,
    steps,
    last_use,
  })
}

fn read_asset(path: &Path) -> Result<Vec<u8>, ModelLoadError> {
  std::fs::read(path).map_err(|source| ModelLoadError::Io {
    path: path.to_path_buf(),
    source,
  })
}

fn load_weights(
  model_dir: &Path,
  manifest: &[WeightGroup],
  expected_shards: Option<usize>,
) -> Result<HashMap<String, ArrayD<f32>>, ModelLoadError> {
  let shard_count: usize = manifest.iter().map(|group| group.paths.len()).sum();
  if let Some(expected) = expected_shards
    && expected != shard_count
  {
    return Err(ModelLoadError::ShardCount {
      expected,
      actual: shard_count,
    });
  }

  let mut weights = HashMap::new();
  for group in manifest {
    let mut buffer = Vec::new();
    for path in &group.paths {
      let shard = read_asset(&model_dir.join(path))?;
      debug!(
        "读取权重分片 {}: {:.2} MB",
        path,
        shard.len() as f64 / (1024.0 * 1024.0)
      );
      buffer.extend_from_slice(&shard);
    }

    let mut offset = 0usize;
    for entry in &group.weights {
      if entry.quantization.is_some() {
        return Err(ModelLoadError::UnsupportedDtype {
          name: entry.name.clone(),
          dtype: format!("quantized {}", entry.dtype),
        });
      }
      let end = entry
        .shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .and_then(|count| count.checked_mul(4))
        .and_then(|bytes| offset.checked_add(bytes));
      let Some(end) = end else {
        return Err(ModelLoadError::CorruptShard(format!(
          "权重 {} 的形状 {:?} 溢出",
          entry.name, entry.shape
        )));
      };
      let Some(chunk) = buffer.get(offset..end) else {
        return Err(ModelLoadError::CorruptShard(format!(
          "权重 {} 需要字节 {}..{}, 分片总长 {}",
          entry.name,
          offset,
          end,
          buffer.len()
        )));
      };
      let words = chunk.chunks_exact(4).map(|b| [b[0], b[1], b[2], b[3]]);
      let values: Vec<f32> = match entry.dtype.as_str() {
        "float32" => words.map(f32::from_le_bytes).collect(),
        "int32" => words.map(|w| i32::from_le_bytes(w) as f32).collect(),
        other => {
          return Err(ModelLoadError::UnsupportedDtype {
            name: entry.name.clone(),
            dtype: other.to_string(),
          });
        }
      };
      let array = ArrayD::from_shape_vec(IxDyn(&entry.shape), values)?;
      weights.insert(entry.name.clone(), array);
      offset = end;
    }

    if offset != buffer.len() {
      return Err(ModelLoadError::CorruptShard(format!(
        "清单描述 {} 字节, 分片实际 {} 字节",
        offset,
        buffer.len()
      )));
    }
  }

  Ok(weights)
}

#[derive(Debug, Clone)]
pub struct GraphModelBuilder {
  model_dir: PathBuf,
  topology_file: String,
  expected_shards: Option<usize>,
  output_node: Option<String>,
}

impl GraphModelBuilder {
  pub fn new(model_dir: impl Into<PathBuf>) -> Self {
    Self {
      model_dir: model_dir.into(),
      topology_file: DEFAULT_TOPOLOGY_FILE.to_string(),
      expected_shards: Some(DEFAULT_SHARD_COUNT),
      output_node: None,
    }
  }

  pub fn from_config(config: &PipelineConfig) -> Self {
    Self {
      model_dir: config.model_dir.clone(),
      topology_file: config.topology_file.clone(),
      expected_shards: config.expected_shards,
      output_node: config.output_node.clone(),
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

  pub fn model_dir(&self) -> &Path {
    &self.model_dir
  }

  pub fn build<const W: u32, const H: u32>(&self) -> Result<GraphModel<W, H>, ModelLoadError> {
    let topology_path = self.model_dir.join(&self.topology_file);
    info!("加载模型拓扑: {}", topology_path.display());
    let descriptor: ModelDescriptor = serde_json::from_slice(&read_asset(&topology_path)?)?;

    if let Some(format) = descriptor.format.as_deref()
      && format != GRAPH_MODEL_FORMAT
    {
      error!("模型格式为 {}, 期望 {}", format, GRAPH_MODEL_FORMAT);
      return Err(ModelLoadError::UnsupportedFormat(format.to_string()));
    }

    let mut weights = load_weights(
      &self.model_dir,
      &descriptor.weights_manifest,
      self.expected_shards,
    )?;
    debug!("权重数量: {}", weights.len());

    let plan = compile(
      descriptor.model_topology.node,
      &mut weights,
      self.output_node.as_deref(),
    )?;
    if !weights.is_empty() {
      debug!("{} 个权重未被计算图引用", weights.len());
    }

    let model = GraphModel {
      plan,
      source: self.model_dir.clone(),
    };

    let probe = model.infer(&NhwcTensor::<W, H>::default())?;
    if probe.len() != LABEL_COUNT {
      error!("模型输出宽度 {} 与标签数量 {} 不一致", probe.len(), LABEL_COUNT);
      return Err(ModelLoadError::OutputWidth {
        expected: LABEL_COUNT,
        actual: probe.len(),
      });
    }

    info!("模型加载完成: {} 个计算步骤", model.plan.steps.len());
    Ok(model)
  }
}

/// 由拓扑描述和权重分片组装的预训练模型
pub struct GraphModel<const W: u32, const H: u32> {
  plan: Plan,
  source: PathBuf,
}

impl<const W: u32, const H: u32> GraphModel<W, H> {
  pub fn source(&self) -> &Path {
    &self.source
  }

  pub fn step_count(&self) -> usize {
    self.plan.steps.len()
  }

  fn forward<'a>(&'a self, input: ArrayViewD<'a, f32>) -> Result<ArrayD<f32>, InferenceError> {
    let plan = &self.plan;
    let mut values: Vec<Option<CowArray<'a, f32, IxDyn>>> =
      (0..plan.steps.len()).map(|_| None).collect();

    for (position, step) in plan.steps.iter().enumerate() {
      let value = match &step.op {
        Op::Input => CowArray::from(input.clone()),
        Op::Const(tensor) => CowArray::from(tensor.view()),
        op => {
          let args = step
            .inputs
            .iter()
            .map(|&slot| {
              values[slot]
                .as_ref()
                .map(|v| v.view())
                .ok_or_else(|| InferenceError::MissingValue(step.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
          let output = op.eval(&args).map_err(|source| InferenceError::Op {
            node: step.name.clone(),
            source,
          })?;
          CowArray::from(output)
        }
      };
      values[position] = Some(value);

      // 中间结果在最后一次使用后立即释放
      for &slot in &step.inputs {
        if plan.last_use[slot] == position && slot != plan.output {
          values[slot] = None;
        }
      }
    }

    values[plan.output]
      .take()
      .map(|value| value.into_owned())
      .ok_or_else(|| InferenceError::Output("输出节点没有产生结果".to_string()))
  }
}

impl<const W: u32, const H: u32> Model for GraphModel<W, H> {
  type Input = NhwcTensor<W, H>;
  type Output = RawOutput;
  type Error = InferenceError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("图模型前向计算");
    self.forward(input.view_dyn())
  }
}

impl<const W: u32, const H: u32> fmt::Debug for GraphModel<W, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GraphModel")
      .field("source", &self.source)
      .field("steps", &self.plan.steps.len())
      .finish()
  }
}
