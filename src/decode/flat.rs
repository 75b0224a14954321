// 该文件是 Linzhi （林芝） 项目的一部分。
// src/decode/flat.rs - 已展平的预测输出（YOLOv8 / YOLO11 / 导出的 YOLOv5）
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

use ndarray::{Axis, Ix2};
use tracing::{debug, error};

use crate::{
  decode::{Activation, CandidateSink, HeadDecoder},
  error::{DetectError, Result},
  model::ModelMetadata,
  tensor::{Tensor, expect_rank_batch},
};

/// 单个输出张量 `[N, F, P]` 或 `[N, P, F]`，每个预测的特征为
/// `cx, cy, w, h, [objectness], class...`，框已经是输入像素坐标。
#[derive(Debug, Clone)]
pub struct FlatHead {
  class_activation: Activation,
  objectness: Option<Activation>,
  normalized_boxes: bool,
}

impl Default for FlatHead {
  fn default() -> Self {
    Self::yolov8()
  }
}

impl FlatHead {
  /// YOLOv8 / YOLO11：`[N, 4 + C, P]`，无 objectness，类别分数已激活
  pub fn yolov8() -> Self {
    Self {
      class_activation: Activation::Identity,
      objectness: None,
      normalized_boxes: false,
    }
  }

  /// 导出的 YOLOv5：`[N, P, 5 + C]`，带 objectness，均已激活
  pub fn yolov5() -> Self {
    Self {
      class_activation: Activation::Identity,
      objectness: Some(Activation::Identity),
      normalized_boxes: false,
    }
  }

  pub fn class_activation(mut self, activation: Activation) -> Self {
    self.class_activation = activation;
    self
  }

  pub fn objectness(mut self, activation: Option<Activation>) -> Self {
    self.objectness = activation;
    self
  }

  /// 框坐标归一化到 [0, 1]，解码时乘以输入尺寸
  pub fn normalized_boxes(mut self, normalized: bool) -> Self {
    self.normalized_boxes = normalized;
    self
  }

  fn box_features(&self) -> usize {
    if self.objectness.is_some() { 5 } else { 4 }
  }
}

impl HeadDecoder for FlatHead {
  fn name(&self) -> &str {
    if self.objectness.is_some() {
      "flat-objectness"
    } else {
      "flat"
    }
  }

  fn decode_into(
    &self,
    outputs: &[Tensor],
    batch_index: usize,
    metadata: &ModelMetadata,
    sink: &mut CandidateSink,
  ) -> Result<()> {
    let tensor = &outputs[0];
    let batch = tensor.shape()[0];
    let shape = expect_rank_batch(tensor, 3, batch, "展平检测输出")?;

    let num_classes = metadata.class_names.len();
    let features = self.box_features() + num_classes;
    // 特征维在前优先，与 YOLOv8 的默认导出一致
    let transposed = if shape[1] == features {
      false
    } else if shape[2] == features {
      true
    } else {
      error!(
        "输出形状 {:?} 与类别数 {} 不符 (每个预测应有 {} 个特征)",
        shape, num_classes, features
      );
      return Err(DetectError::contract(format!(
        "输出形状 {:?} 与类别数 {} 不符",
        shape, num_classes
      )));
    };

    let view = tensor
      .index_axis(Axis(0), batch_index)
      .into_dimensionality::<Ix2>()
      .map_err(|_| DetectError::shape_mismatch("展平检测输出", &[features, 0], shape))?;
    let view = if transposed { view } else { view.reversed_axes() };
    debug!("展平输出: {} 个预测, {} 个特征", view.nrows(), features);

    let input = &metadata.input_shape;
    let (sx, sy) = if self.normalized_boxes {
      (input.width as f32, input.height as f32)
    } else {
      (1.0, 1.0)
    };
    let class_offset = self.box_features();
    let mut scores = vec![0.0f32; num_classes];

    for (p, row) in view.outer_iter().enumerate() {
      for (c, score) in scores.iter_mut().enumerate() {
        *score = self.class_activation.apply(row[class_offset + c]);
      }
      let objectness = self.objectness.map(|act| act.apply(row[4])).unwrap_or(1.0);

      sink.offer(p, objectness, &scores, || {
        [row[0] * sx, row[1] * sy, row[2] * sx, row[3] * sy]
      });
    }

    Ok(())
  }
}
