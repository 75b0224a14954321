// 该文件是 Linzhi （林芝） 项目的一部分。
// src/tensor.rs - 张量与输入形状
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

use ndarray::ArrayD;

use crate::error::{DetectError, Result};

/// 流程中流转的浮点张量，形状随数据一起携带
pub type Tensor = ArrayD<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
  #[default]
  Nchw,
  Nhwc,
}

/// 模型声明的输入形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
  /// 固定批大小；`None` 表示批维度可变
  pub batch: Option<usize>,
  pub channels: usize,
  pub height: usize,
  pub width: usize,
  pub layout: TensorLayout,
}

impl InputShape {
  pub fn nchw(batch: Option<usize>, channels: usize, height: usize, width: usize) -> Self {
    Self {
      batch,
      channels,
      height,
      width,
      layout: TensorLayout::Nchw,
    }
  }

  pub fn with_layout(mut self, layout: TensorLayout) -> Self {
    self.layout = layout;
    self
  }

  /// 给定批大小时的完整维度
  pub fn dims(&self, batch: usize) -> Vec<usize> {
    match self.layout {
      TensorLayout::Nchw => vec![batch, self.channels, self.height, self.width],
      TensorLayout::Nhwc => vec![batch, self.height, self.width, self.channels],
    }
  }

  /// 批大小是否可以为 `n`
  pub fn accepts_batch(&self, n: usize) -> bool {
    n > 0 && self.batch.is_none_or(|b| b == n)
  }

  /// 校验输入张量形状
  pub fn check(&self, shape: &[usize]) -> Result<()> {
    let batch = shape.first().copied().unwrap_or(0);
    let expected = self.dims(self.batch.unwrap_or(batch));
    if shape != expected.as_slice() || !self.accepts_batch(batch) {
      return Err(DetectError::shape_mismatch("模型输入", &expected, shape));
    }
    Ok(())
  }
}

/// 校验张量的维数与批大小，返回其形状
pub(crate) fn expect_rank_batch<'a>(
  tensor: &'a Tensor,
  rank: usize,
  batch: usize,
  context: &str,
) -> Result<&'a [usize]> {
  let shape = tensor.shape();
  if shape.len() != rank || shape[0] != batch {
    let mut expected = vec![batch];
    expected.extend(shape.iter().skip(1).take(rank.saturating_sub(1)));
    expected.resize(rank, 0);
    return Err(DetectError::shape_mismatch(context, &expected, shape));
  }
  Ok(shape)
}
