// 该文件是 Linzhi （林芝） 项目的一部分。
// src/error.rs - 检测流程错误定义
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

use thiserror::Error;

/// 检测流程中各阶段可能产生的错误。
///
/// 错误在发现问题的阶段同步产生，并原样向调用者传播；流程不做任何重试。
#[derive(Error, Debug)]
pub enum DetectError {
  #[error("图像无效: {0}")]
  InvalidImage(String),
  #[error("张量形状不匹配 ({context}): 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    context: String,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("模型约定错误: {0}")]
  ModelContract(String),
  #[error("检测参数无效: {0}")]
  InvalidConfig(String),
  #[error("推理引擎错误: {0}")]
  Engine(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DetectError {
  pub fn invalid_image(msg: impl Into<String>) -> Self {
    DetectError::InvalidImage(msg.into())
  }

  pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
    DetectError::ShapeMismatch {
      context: context.into(),
      expected: expected.to_vec(),
      actual: actual.to_vec(),
    }
  }

  pub fn contract(msg: impl Into<String>) -> Self {
    DetectError::ModelContract(msg.into())
  }

  pub fn config(msg: impl Into<String>) -> Self {
    DetectError::InvalidConfig(msg.into())
  }

  pub fn engine<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    DetectError::Engine(Box::new(err))
  }
}

pub type Result<T, E = DetectError> = std::result::Result<T, E>;
