// 该文件是 Linzhi （林芝） 项目的一部分。
// src/model.rs - 模型与推理引擎
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

use std::path::Path;

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  error::{DetectError, Result},
  tensor::{InputShape, Tensor},
};

/// 执行一次前向推理的能力。
///
/// 实现必须可以跨线程共享；如果底层运行时不允许并发执行，
/// 由实现自己在一次 `forward` 调用期间串行化访问。
pub trait InferenceEngine: Send + Sync {
  fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
  fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>> {
    (**self).forward(input)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
  pub input_shape: InputShape,
  /// 类别名称，下标即类别编号
  pub class_names: Vec<String>,
}

/// 已加载的模型句柄。权重对流程不可见，只暴露输入形状、类别名称与前向推理。
pub struct Model {
  metadata: ModelMetadata,
  engine: Box<dyn InferenceEngine>,
}

impl std::fmt::Debug for Model {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Model")
      .field("metadata", &self.metadata)
      .field("engine", &"<dyn InferenceEngine>")
      .finish()
  }
}

impl Model {
  pub fn new<E: InferenceEngine + 'static>(metadata: ModelMetadata, engine: E) -> Result<Self> {
    if metadata.class_names.is_empty() {
      error!("模型缺少类别名称");
      return Err(DetectError::contract("模型缺少类别名称"));
    }
    let shape = metadata.input_shape;
    if shape.channels == 0 || shape.height == 0 || shape.width == 0 || shape.batch == Some(0) {
      error!("模型输入形状无效: {:?}", shape);
      return Err(DetectError::contract(format!(
        "模型输入形状无效: {:?}",
        shape
      )));
    }

    Ok(Self {
      metadata,
      engine: Box::new(engine),
    })
  }

  pub fn input_shape(&self) -> &InputShape {
    &self.metadata.input_shape
  }

  pub fn class_names(&self) -> &[String] {
    &self.metadata.class_names
  }

  pub fn metadata(&self) -> &ModelMetadata {
    &self.metadata
  }

  /// 前向推理，输入形状与模型声明不一致时返回 `ShapeMismatch`
  pub fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>> {
    if let Err(e) = self.metadata.input_shape.check(input.shape()) {
      error!("模型输入形状不匹配: {}", e);
      return Err(e);
    }

    debug!("执行模型推理, 输入形状: {:?}", input.shape());
    let outputs = self.engine.forward(input)?;
    if outputs.is_empty() {
      error!("推理引擎没有返回任何输出");
      return Err(DetectError::contract("推理引擎没有返回任何输出"));
    }
    debug!(
      "模型输出形状: {:?}",
      outputs.iter().map(|t| t.shape().to_vec()).collect::<Vec<_>>()
    );

    Ok(outputs)
  }
}

#[derive(Error, Debug)]
pub enum ResolveError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{found}'")]
  SchemeMismatch { expected: String, found: String },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("类别文件无效: {0}")]
  InvalidLabels(String),
  #[error("参数无效: {0}")]
  InvalidParameter(String),
  #[error("模型加载错误: {0}")]
  Load(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error(transparent)]
  Detect(#[from] DetectError),
}

/// 由标识符取得模型。模型从何而来（本地文件、远程下载、缓存）由实现决定，流程只依赖 [`Model`]。
pub trait ModelResolver {
  fn resolve(&self, id: &Url) -> Result<Model, ResolveError>;
}

/// 读取类别名称文件：JSON 字符串数组，或每行一个名称
pub fn load_class_names(path: impl AsRef<Path>) -> Result<Vec<String>, ResolveError> {
  let path = path.as_ref();
  let content = std::fs::read_to_string(path)?;
  parse_class_names(&content).inspect(|names| {
    debug!("从 {} 读取 {} 个类别", path.display(), names.len());
  })
}

pub fn parse_class_names(content: &str) -> Result<Vec<String>, ResolveError> {
  let names: Vec<String> = if content.trim_start().starts_with('[') {
    serde_json::from_str(content).map_err(|e| ResolveError::InvalidLabels(e.to_string()))?
  } else {
    content
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect()
  };

  if names.is_empty() {
    return Err(ResolveError::InvalidLabels("类别列表为空".to_string()));
  }
  Ok(names)
}

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{ExecutionTarget, OnnxEngine, OnnxModelBuilder, OnnxResolver};

#[cfg(test)]
mod tests {
  use super::*;

  struct Echo;

  impl InferenceEngine for Echo {
    fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>> {
      Ok(vec![input.clone()])
    }
  }

  struct Silent;

  impl InferenceEngine for Silent {
    fn forward(&self, _input: &Tensor) -> Result<Vec<Tensor>> {
      Ok(Vec::new())
    }
  }

  fn metadata() -> ModelMetadata {
    ModelMetadata {
      input_shape: InputShape::nchw(Some(1), 3, 8, 8),
      class_names: vec!["plastic".to_string(), "paper".to_string()],
    }
  }

  #[test]
  fn forward_checks_input_shape() {
    let model = Model::new(metadata(), Echo).unwrap();
    let good = Tensor::zeros(ndarray::IxDyn(&[1, 3, 8, 8]));
    assert_eq!(model.forward(&good).unwrap().len(), 1);

    let bad = Tensor::zeros(ndarray::IxDyn(&[1, 3, 8, 9]));
    assert!(matches!(
      model.forward(&bad),
      Err(DetectError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn empty_outputs_break_the_contract() {
    let model = Model::new(metadata(), Silent).unwrap();
    let input = Tensor::zeros(ndarray::IxDyn(&[1, 3, 8, 8]));
    assert!(matches!(
      model.forward(&input),
      Err(DetectError::ModelContract(_))
    ));
  }

  #[test]
  fn model_requires_class_names() {
    let mut meta = metadata();
    meta.class_names.clear();
    assert!(matches!(
      Model::new(meta, Echo),
      Err(DetectError::ModelContract(_))
    ));
  }

  #[test]
  fn class_names_from_json_or_lines() {
    assert_eq!(
      parse_class_names(r#"["glass", "metal"]"#).unwrap(),
      vec!["glass", "metal"]
    );
    assert_eq!(
      parse_class_names("glass\n\n metal \n").unwrap(),
      vec!["glass", "metal"]
    );
    assert!(matches!(
      parse_class_names("  \n"),
      Err(ResolveError::InvalidLabels(_))
    ));
  }

  #[test]
  fn class_names_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "cardboard\ntrash\n").unwrap();
    assert_eq!(load_class_names(&path).unwrap(), vec!["cardboard", "trash"]);
  }
}
