// 该文件是 Linzhi （林芝） 项目的一部分。
// src/mapper.rs - 坐标映射回原图
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

use crate::{detection::BoundingBox, preprocess::Letterbox};

// 浮点误差容限，避免 99.99997 之类的值被向外取整
const ROUNDING_TOLERANCE: f32 = 1e-3;

/// 把模型输入坐标中的框映射回原图像素坐标。
///
/// 左上角向下取整、右下角向上取整（先向框内收缩一个很小的容限），
/// 再裁剪到 `[0, width] × [0, height]`，结果均为整数像素边界。
pub fn remap(
  boxes: &[BoundingBox],
  transform: &Letterbox,
  original_width: u32,
  original_height: u32,
) -> Vec<BoundingBox> {
  let (max_x, max_y) = (original_width as f32, original_height as f32);
  boxes
    .iter()
    .map(|b| {
      let (x1, y1) = transform.to_original(b.x1, b.y1);
      let (x2, y2) = transform.to_original(b.x2, b.y2);

      let x1 = (x1 + ROUNDING_TOLERANCE).floor().clamp(0.0, max_x);
      let y1 = (y1 + ROUNDING_TOLERANCE).floor().clamp(0.0, max_y);
      let x2 = (x2 - ROUNDING_TOLERANCE).ceil().clamp(0.0, max_x).max(x1);
      let y2 = (y2 - ROUNDING_TOLERANCE).ceil().clamp(0.0, max_y).max(y1);

      BoundingBox {
        x1,
        y1,
        x2,
        y2,
        confidence: b.confidence,
        class_id: b.class_id,
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::preprocess::Padding;

  #[test]
  fn identity_transform_keeps_integer_boxes() {
    let t = Letterbox::fit(416, 416, 416, 416, Padding::Center).unwrap();
    let boxes = [BoundingBox::new([100.0, 100.0, 200.0, 200.0], 0.9, 0)];
    let mapped = remap(&boxes, &t, 416, 416);
    assert_eq!(mapped[0].corners(), [100.0, 100.0, 200.0, 200.0]);
  }

  #[test]
  fn letterbox_round_trip() {
    let t = Letterbox::fit(300, 200, 416, 416, Padding::Center).unwrap();
    let (mx1, my1) = t.to_model(100.0, 50.0);
    let (mx2, my2) = t.to_model(200.0, 150.0);
    let boxes = [BoundingBox::new([mx1, my1, mx2, my2], 0.8, 1)];
    let mapped = remap(&boxes, &t, 300, 200);
    assert_eq!(mapped[0].corners(), [100.0, 50.0, 200.0, 150.0]);
    assert_eq!(mapped[0].class_id, 1);
  }

  #[test]
  fn fractional_coordinates_grow_outward() {
    let t = Letterbox::fit(100, 100, 100, 100, Padding::Center).unwrap();
    let boxes = [BoundingBox::new([10.4, 10.6, 20.2, 20.7], 0.5, 0)];
    let mapped = remap(&boxes, &t, 100, 100);
    assert_eq!(mapped[0].corners(), [10.0, 10.0, 21.0, 21.0]);
  }

  #[test]
  fn boxes_are_clipped_to_the_image() {
    let t = Letterbox::fit(300, 200, 416, 416, Padding::Center).unwrap();
    // 延伸到上方填充区以及右侧图像外
    let boxes = [BoundingBox::new([-20.0, 10.0, 500.0, 120.0], 0.7, 0)];
    let mapped = remap(&boxes, &t, 300, 200);
    let b = mapped[0];
    assert_eq!(b.x1, 0.0);
    assert_eq!(b.y1, 0.0);
    assert_eq!(b.x2, 300.0);
    assert!(b.y2 > 0.0 && b.y2 <= 200.0);

    // 完全落在填充区内的框退化为面积为 0
    let boxes = [BoundingBox::new([10.0, 0.0, 50.0, 30.0], 0.7, 0)];
    let b = remap(&boxes, &t, 300, 200)[0];
    assert_eq!(b.y1, 0.0);
    assert_eq!(b.y2, 0.0);
    assert!(b.x1 <= b.x2);
  }
}
