// 该文件是 Linzhi （林芝） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理引擎
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

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  str::FromStr,
  sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use ndarray::IxDyn;
use ort::{
  execution_providers::{CPUExecutionProvider, CUDAExecutionProvider},
  session::{Session, builder::GraphOptimizationLevel},
  value::TensorRef,
};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{DetectError, Result},
  model::{InferenceEngine, Model, ModelMetadata, ModelResolver, ResolveError, load_class_names},
  tensor::{InputShape, Tensor},
};

const DEFAULT_INPUT_SIZE: usize = 640;
const DEFAULT_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum OnnxError {
  #[error("推理会话 {0} 的锁已损坏")]
  Poisoned(usize),
  #[error("输入张量在内存中不连续")]
  NonContiguous,
}

/// 推理执行目标，构造时选定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionTarget {
  #[default]
  Cpu,
  Cuda,
}

impl FromStr for ExecutionTarget {
  type Err = ResolveError;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "cpu" => Ok(ExecutionTarget::Cpu),
      "cuda" | "gpu" => Ok(ExecutionTarget::Cuda),
      other => Err(ResolveError::InvalidParameter(format!(
        "未知的执行设备: {}",
        other
      ))),
    }
  }
}

/// 基于 ONNX Runtime 的推理引擎。
///
/// ONNX Runtime 会话运行时需要独占访问，因此引擎持有若干个会话，
/// 每个会话由互斥锁保护；一次 `forward` 只在单次运行期间持有其中一个锁，
/// 任何返回路径上锁都会随守卫释放。
pub struct OnnxEngine {
  sessions: Vec<Mutex<Session>>,
  next: AtomicUsize,
  name: String,
}

impl OnnxEngine {
  pub fn load(
    path: impl AsRef<Path>,
    target: ExecutionTarget,
    sessions: usize,
  ) -> std::result::Result<Self, ResolveError> {
    let path = path.as_ref();
    info!("加载模型文件: {}", path.display());

    let count = sessions.max(1);
    let mut pool = Vec::with_capacity(count);
    for i in 0..count {
      debug!("创建推理会话 {}/{}, 设备: {:?}", i + 1, count, target);
      pool.push(Mutex::new(Self::build_session(path, target)?));
    }
    info!("模型加载完成");

    Ok(Self {
      sessions: pool,
      next: AtomicUsize::new(0),
      name: path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default(),
    })
  }

  fn build_session(
    path: &Path,
    target: ExecutionTarget,
  ) -> std::result::Result<Session, ResolveError> {
    let load = |e: ort::Error| ResolveError::Load(Box::new(e));

    let builder = Session::builder().map_err(load)?;
    let builder = match target {
      ExecutionTarget::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()]),
      ExecutionTarget::Cuda => builder.with_execution_providers([CUDAExecutionProvider::default()
        .build()
        .error_on_failure()]),
    }
    .map_err(load)?;

    builder
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(load)?
      .commit_from_file(path)
      .map_err(|e| {
        error!("创建推理会话失败: {}", e);
        load(e)
      })
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

impl InferenceEngine for OnnxEngine {
  fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>> {
    let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
    let mut session = self.sessions[idx]
      .lock()
      .map_err(|_| DetectError::engine(OnnxError::Poisoned(idx)))?;

    let contiguous = input.as_standard_layout();
    let data = contiguous
      .as_slice()
      .ok_or_else(|| DetectError::engine(OnnxError::NonContiguous))?;
    let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
    let tensor = TensorRef::from_array_view((dims, data)).map_err(DetectError::engine)?;

    debug!("模型 {} 使用会话 {} 推理", self.name, idx);
    let outputs = session
      .run(ort::inputs![tensor])
      .map_err(DetectError::engine)?;

    let mut tensors = Vec::new();
    for (name, value) in outputs.iter() {
      let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(DetectError::engine)?;
      let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
      debug!("输出 {}: {:?}", name, shape);
      tensors.push(Tensor::from_shape_vec(IxDyn(&shape), data.to_vec()).map_err(DetectError::engine)?);
    }

    Ok(tensors)
  }
}

/// 由 `onnx://` URL 描述的模型。
///
/// `onnx:///models/waste.onnx?labels=/models/waste.txt&size=640x640&device=cuda&sessions=2&batch=dynamic`
pub struct OnnxModelBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  class_names: Option<Vec<String>>,
  input_shape: InputShape,
  target: ExecutionTarget,
  sessions: usize,
}

impl FromUrlWithScheme for OnnxModelBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxModelBuilder {
  type Error = ResolveError;

  fn from_url(url: &Url) -> std::result::Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ResolveError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        found: url.scheme().to_string(),
      });
    }

    let model_path = urlencoding::decode(url.path())
      .map_err(|e| ResolveError::InvalidParameter(format!("模型路径编码错误: {}", e)))?
      .into_owned();

    let query_pairs: HashMap<_, _> = url.query_pairs().collect();

    let (width, height) = match query_pairs.get("size") {
      Some(size) => parse_size(size)?,
      None => (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE),
    };
    let batch = match query_pairs.get("batch") {
      None => Some(1),
      Some(v) if v == "dynamic" => None,
      Some(n) => match n.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => return Err(ResolveError::InvalidParameter(format!("批大小无效: {}", n))),
      },
    };
    let target = match query_pairs.get("device") {
      Some(device) => device.parse()?,
      None => ExecutionTarget::default(),
    };
    let sessions = match query_pairs.get("sessions") {
      None => 1,
      Some(n) => match n.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => return Err(ResolveError::InvalidParameter(format!("会话数无效: {}", n))),
      },
    };

    Ok(OnnxModelBuilder {
      model_path: PathBuf::from(model_path),
      labels_path: query_pairs.get("labels").map(|p| PathBuf::from(p.to_string())),
      class_names: None,
      input_shape: InputShape::nchw(batch, DEFAULT_CHANNELS, height, width),
      target,
      sessions,
    })
  }
}

impl OnnxModelBuilder {
  pub fn class_names(mut self, names: Vec<String>) -> Self {
    self.class_names = Some(names);
    self
  }

  pub fn target(mut self, target: ExecutionTarget) -> Self {
    self.target = target;
    self
  }

  pub fn input_shape(mut self, shape: InputShape) -> Self {
    self.input_shape = shape;
    self
  }

  pub fn build(self) -> std::result::Result<Model, ResolveError> {
    let class_names = match (self.class_names, self.labels_path) {
      (Some(names), _) => names,
      (None, Some(path)) => load_class_names(path)?,
      (None, None) => {
        return Err(ResolveError::InvalidParameter(
          "缺少类别名称, 请通过 labels 参数指定".to_string(),
        ));
      }
    };

    let engine = OnnxEngine::load(&self.model_path, self.target, self.sessions)?;
    let metadata = ModelMetadata {
      input_shape: self.input_shape,
      class_names,
    };
    Ok(Model::new(metadata, engine)?)
  }
}

/// 解析 `onnx://` 标识符的模型解析器
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxResolver;

impl ModelResolver for OnnxResolver {
  fn resolve(&self, id: &Url) -> std::result::Result<Model, ResolveError> {
    OnnxModelBuilder::from_url(id)?.build()
  }
}

fn parse_size(size: &str) -> std::result::Result<(usize, usize), ResolveError> {
  let invalid = || ResolveError::InvalidParameter(format!("输入尺寸无效: {}", size));
  let (w, h) = match size.split_once(['x', 'X']) {
    Some((w, h)) => (w, h),
    None => (size, size),
  };
  let w: usize = w.trim().parse().map_err(|_| invalid())?;
  let h: usize = h.trim().parse().map_err(|_| invalid())?;
  if w == 0 || h == 0 {
    return Err(invalid());
  }
  Ok((w, h))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_reads_query_parameters() {
    let url = Url::parse(
      "onnx:///models/waste%20v8.onnx?labels=/models/waste.txt&size=416x320&device=cuda&sessions=2&batch=dynamic",
    )
    .unwrap();
    let builder = OnnxModelBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/models/waste v8.onnx"));
    assert_eq!(builder.labels_path, Some(PathBuf::from("/models/waste.txt")));
    assert_eq!(builder.input_shape, InputShape::nchw(None, 3, 320, 416));
    assert_eq!(builder.target, ExecutionTarget::Cuda);
    assert_eq!(builder.sessions, 2);
  }

  #[test]
  fn builder_rejects_other_schemes() {
    let url = Url::parse("image:///tmp/a.png").unwrap();
    assert!(matches!(
      OnnxModelBuilder::from_url(&url),
      Err(ResolveError::SchemeMismatch { .. })
    ));
  }

  #[test]
  fn builder_rejects_invalid_numbers() {
    for query in ["sessions=abc", "sessions=0", "batch=four", "batch=0", "size=0"] {
      let url = Url::parse(&format!("onnx:///models/waste.onnx?{}", query)).unwrap();
      assert!(
        matches!(
          OnnxModelBuilder::from_url(&url),
          Err(ResolveError::InvalidParameter(_))
        ),
        "{}",
        query
      );
    }
  }

  #[test]
  fn size_parsing() {
    assert_eq!(parse_size("640").unwrap(), (640, 640));
    assert_eq!(parse_size("320X256").unwrap(), (320, 256));
    assert!(parse_size("0x10").is_err());
    assert!(parse_size("abc").is_err());
  }
}
