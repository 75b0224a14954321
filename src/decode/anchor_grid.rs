// 该文件是 Linzhi （林芝） 项目的一部分。
// src/decode/anchor_grid.rs - 锚框网格检测头（YOLOv3 / YOLOv5 / YOLOv7）
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

use ndarray::{Axis, Ix3};
use tracing::{debug, error};

use crate::{
  decode::{Activation, CandidateSink, HeadDecoder},
  error::{DetectError, Result},
  model::ModelMetadata,
  tensor::{Tensor, expect_rank_batch},
};

// COCO 上聚类得到的默认锚框 (w, h)，单位为输入像素
const DEFAULT_ANCHORS: [[(f32, f32); 3]; 3] = [
  [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)],
  [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)],
  [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)],
];
const DEFAULT_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];

/// 框的偏移 / 尺度编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoxEncoding {
  /// `c = (σ(t) + g)·s`, `w = a·exp(t)`
  Yolov3,
  /// `c = (2σ(t) − 0.5 + g)·s`, `w = a·(2σ(t))²`
  #[default]
  Yolov5,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnchorLevel {
  pub stride: f32,
  pub anchors: Vec<(f32, f32)>,
}

/// 每个检测层一个输出 `[N, A·(5 + C), H, W]`，通道按锚框分组，
/// 组内依次为 `tx, ty, tw, th, objectness, class...`。
#[derive(Debug, Clone)]
pub struct AnchorGridHead {
  levels: Vec<AnchorLevel>,
  activation: Activation,
  encoding: BoxEncoding,
}

impl AnchorGridHead {
  pub fn new(levels: Vec<AnchorLevel>, encoding: BoxEncoding) -> Self {
    Self {
      levels,
      activation: Activation::Sigmoid,
      encoding,
    }
  }

  pub fn yolov3() -> Self {
    Self::new(default_levels(), BoxEncoding::Yolov3)
  }

  pub fn yolov5() -> Self {
    Self::new(default_levels(), BoxEncoding::Yolov5)
  }

  pub fn activation(mut self, activation: Activation) -> Self {
    self.activation = activation;
    self
  }

  pub fn levels(&self) -> &[AnchorLevel] {
    &self.levels
  }

  fn geometry(&self, t: [f32; 4], gx: f32, gy: f32, stride: f32, anchor: (f32, f32)) -> [f32; 4] {
    let act = |v: f32| self.activation.apply(v);
    match self.encoding {
      BoxEncoding::Yolov3 => [
        (act(t[0]) + gx) * stride,
        (act(t[1]) + gy) * stride,
        anchor.0 * t[2].exp(),
        anchor.1 * t[3].exp(),
      ],
      BoxEncoding::Yolov5 => [
        (act(t[0]) * 2.0 - 0.5 + gx) * stride,
        (act(t[1]) * 2.0 - 0.5 + gy) * stride,
        (act(t[2]) * 2.0).powi(2) * anchor.0,
        (act(t[3]) * 2.0).powi(2) * anchor.1,
      ],
    }
  }
}

fn default_levels() -> Vec<AnchorLevel> {
  DEFAULT_STRIDES
    .iter()
    .zip(DEFAULT_ANCHORS.iter())
    .map(|(&stride, anchors)| AnchorLevel {
      stride,
      anchors: anchors.to_vec(),
    })
    .collect()
}

impl HeadDecoder for AnchorGridHead {
  fn name(&self) -> &str {
    match self.encoding {
      BoxEncoding::Yolov3 => "anchor-grid-v3",
      BoxEncoding::Yolov5 => "anchor-grid-v5",
    }
  }

  fn decode_into(
    &self,
    outputs: &[Tensor],
    batch_index: usize,
    metadata: &ModelMetadata,
    sink: &mut CandidateSink,
  ) -> Result<()> {
    if outputs.len() != self.levels.len() {
      error!(
        "预期检测层输出数量为 {}, 实际为 {}",
        self.levels.len(),
        outputs.len()
      );
      return Err(DetectError::contract(format!(
        "预期检测层输出数量为 {}, 实际为 {}",
        self.levels.len(),
        outputs.len()
      )));
    }

    let num_classes = metadata.class_names.len();
    let per_anchor = 5 + num_classes;
    let mut scores = vec![0.0f32; num_classes];
    let mut cell_offset = 0usize;

    for (level_idx, (tensor, level)) in outputs.iter().zip(&self.levels).enumerate() {
      let batch = tensor.shape()[0];
      let shape = expect_rank_batch(tensor, 4, batch, "锚框检测层输出")?;
      let num_anchors = level.anchors.len();
      let (channels, map_h, map_w) = (shape[1], shape[2], shape[3]);

      if channels != num_anchors * per_anchor {
        if num_anchors > 0 && channels % num_anchors == 0 && channels / num_anchors > 5 {
          error!(
            "检测层 {}: 每个锚框 {} 个通道, 与类别数 {} 不符",
            level_idx,
            channels / num_anchors,
            num_classes
          );
          return Err(DetectError::contract(format!(
            "检测层 {} 的类别维度为 {}, 类别名称有 {} 个",
            level_idx,
            channels / num_anchors - 5,
            num_classes
          )));
        }
        return Err(DetectError::shape_mismatch(
          format!("检测层 {} 通道", level_idx),
          &[batch, num_anchors * per_anchor, map_h, map_w],
          shape,
        ));
      }

      debug!(
        "检测层 {}: 网格 {}x{}, 步长 {}, 锚框 {}",
        level_idx, map_h, map_w, level.stride, num_anchors
      );

      let view = tensor
        .index_axis(Axis(0), batch_index)
        .into_dimensionality::<Ix3>()
        .map_err(|_| DetectError::shape_mismatch("锚框检测层输出", &[channels, map_h, map_w], shape))?;

      for (a, &anchor) in level.anchors.iter().enumerate() {
        let base = a * per_anchor;
        for gy in 0..map_h {
          for gx in 0..map_w {
            let objectness = self.activation.apply(view[[base + 4, gy, gx]]);
            for (c, score) in scores.iter_mut().enumerate() {
              *score = self.activation.apply(view[[base + 5 + c, gy, gx]]);
            }

            let cell = cell_offset + (a * map_h + gy) * map_w + gx;
            sink.offer(cell, objectness, &scores, || {
              let t = [
                view[[base, gy, gx]],
                view[[base + 1, gy, gx]],
                view[[base + 2, gy, gx]],
                view[[base + 3, gy, gx]],
              ];
              self.geometry(t, gx as f32, gy as f32, level.stride, anchor)
            });
          }
        }
      }

      cell_offset += num_anchors * map_h * map_w;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{decode::decode, tensor::InputShape};
  use ndarray::{Array4, IxDyn};

  fn metadata() -> ModelMetadata {
    ModelMetadata {
      input_shape: InputShape::nchw(Some(1), 3, 64, 64),
      class_names: vec!["bottle".to_string(), "can".to_string()],
    }
  }

  fn single_level(encoding: BoxEncoding) -> AnchorGridHead {
    AnchorGridHead::new(
      vec![AnchorLevel {
        stride: 32.0,
        anchors: vec![(10.0, 20.0), (40.0, 40.0)],
      }],
      encoding,
    )
  }

  /// 2 个锚框、2 个类别、2x2 网格，全部 logit 取很小的值
  fn quiet_output() -> Array4<f32> {
    Array4::from_elem((1, 2 * 7, 2, 2), -20.0)
  }

  #[test]
  fn yolov5_encoding() {
    let mut raw = quiet_output();
    // 锚框 1，网格 (gx=1, gy=0)
    let base = 7;
    raw[[0, base, 0, 1]] = 0.0; // σ = 0.5 -> 偏移 0.5
    raw[[0, base + 1, 0, 1]] = 0.0;
    raw[[0, base + 2, 0, 1]] = 0.0; // (2·0.5)² = 1 -> 锚框原尺寸
    raw[[0, base + 3, 0, 1]] = 0.0;
    raw[[0, base + 4, 0, 1]] = 20.0;
    raw[[0, base + 6, 0, 1]] = 20.0;

    let candidates =
      decode(&single_level(BoxEncoding::Yolov5), &[raw.into_dyn()], &metadata(), 0.25).unwrap();
    assert_eq!(candidates.len(), 1);
    let c = &candidates[0];
    assert!((c.center_x - 48.0).abs() < 1e-3);
    assert!((c.center_y - 16.0).abs() < 1e-3);
    assert!((c.width - 40.0).abs() < 1e-3);
    assert!((c.height - 40.0).abs() < 1e-3);
    assert_eq!(c.class_id(), 1);
    assert_eq!(c.source_cell_index, 4 + 1);
  }

  #[test]
  fn yolov3_encoding() {
    let mut raw = quiet_output();
    raw[[0, 0, 1, 1]] = 0.0;
    raw[[0, 1, 1, 1]] = 0.0;
    raw[[0, 2, 1, 1]] = 2f32.ln();
    raw[[0, 3, 1, 1]] = 0.0;
    raw[[0, 4, 1, 1]] = 20.0;
    raw[[0, 5, 1, 1]] = 20.0;

    let candidates =
      decode(&single_level(BoxEncoding::Yolov3), &[raw.into_dyn()], &metadata(), 0.25).unwrap();
    assert_eq!(candidates.len(), 1);
    let c = &candidates[0];
    assert!((c.center_x - 48.0).abs() < 1e-3);
    assert!((c.center_y - 48.0).abs() < 1e-3);
    assert!((c.width - 20.0).abs() < 1e-3);
    assert!((c.height - 20.0).abs() < 1e-3);
    assert_eq!(c.source_cell_index, 3);
  }

  #[test]
  fn level_count_must_match() {
    let head = AnchorGridHead::yolov5();
    let raw = quiet_output().into_dyn();
    assert!(matches!(
      decode(&head, &[raw], &metadata(), 0.25),
      Err(DetectError::ModelContract(_))
    ));
  }

  #[test]
  fn class_dimension_mismatch() {
    // 每个锚框 8 个通道 = 3 个类别，但只有 2 个类别名称
    let raw = Tensor::zeros(IxDyn(&[1, 16, 2, 2]));
    assert!(matches!(
      decode(&single_level(BoxEncoding::Yolov5), &[raw], &metadata(), 0.25),
      Err(DetectError::ModelContract(_))
    ));

    let raw = Tensor::zeros(IxDyn(&[1, 9, 2, 2]));
    assert!(matches!(
      decode(&single_level(BoxEncoding::Yolov5), &[raw], &metadata(), 0.25),
      Err(DetectError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn default_levels_follow_strides() {
    let head = AnchorGridHead::yolov3();
    let strides: Vec<f32> = head.levels().iter().map(|l| l.stride).collect();
    assert_eq!(strides, vec![8.0, 16.0, 32.0]);
    assert!(head.levels().iter().all(|l| l.anchors.len() == 3));
  }
}
