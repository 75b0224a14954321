// 该文件是 Linzhi （林芝） 项目的一部分。
// src/detection.rs - 检测结果定义
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

use serde_json::{Value, json};

/// 轴对齐边界框，保证 `x1 <= x2`、`y1 <= y2`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
  /// 置信度，范围 [0, 1]
  pub confidence: f32,
  pub class_id: usize,
}

impl BoundingBox {
  pub fn new(corners: [f32; 4], confidence: f32, class_id: usize) -> Self {
    let [ax, ay, bx, by] = corners;
    Self {
      x1: ax.min(bx),
      y1: ay.min(by),
      x2: ax.max(bx),
      y2: ay.max(by),
      confidence,
      class_id,
    }
  }

  pub fn corners(&self) -> [f32; 4] {
    [self.x1, self.y1, self.x2, self.y2]
  }

  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn iou(&self, other: &BoundingBox) -> f32 {
    crate::nms::iou(self.corners(), other.corners())
  }
}

/// 一张图像的最终检测结果，按置信度降序排列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSet {
  items: Box<[BoundingBox]>,
}

impl DetectionSet {
  /// 按置信度降序稳定排序，置信度相同的框保持原有先后
  pub fn new(mut items: Vec<BoundingBox>) -> Self {
    items.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Self {
      items: items.into_boxed_slice(),
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, BoundingBox> {
    self.items.iter()
  }

  pub fn as_slice(&self) -> &[BoundingBox] {
    &self.items
  }

  pub fn into_vec(self) -> Vec<BoundingBox> {
    self.items.into_vec()
  }

  /// 转为 JSON，类别名称缺失时只输出编号
  pub fn to_json(&self, class_names: &[String]) -> Value {
    Value::Array(
      self
        .items
        .iter()
        .map(|b| {
          json!({
            "class_id": b.class_id,
            "class_name": class_names.get(b.class_id),
            "confidence": b.confidence,
            "bbox": [b.x1, b.y1, b.x2, b.y2],
          })
        })
        .collect(),
    )
  }
}

impl<'a> IntoIterator for &'a DetectionSet {
  type Item = &'a BoundingBox;
  type IntoIter = std::slice::Iter<'a, BoundingBox>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_box_orders_corners() {
    let b = BoundingBox::new([10.0, 20.0, 5.0, 2.0], 0.5, 1);
    assert_eq!(b.corners(), [5.0, 2.0, 10.0, 20.0]);
    assert_eq!(b.area(), 90.0);
  }

  #[test]
  fn set_is_sorted_by_confidence() {
    let set = DetectionSet::new(vec![
      BoundingBox::new([0.0, 0.0, 1.0, 1.0], 0.3, 0),
      BoundingBox::new([0.0, 0.0, 2.0, 2.0], 0.9, 1),
      BoundingBox::new([0.0, 0.0, 3.0, 3.0], 0.3, 2),
    ]);
    let order: Vec<usize> = set.iter().map(|b| b.class_id).collect();
    assert_eq!(order, vec![1, 0, 2]);
  }

  #[test]
  fn json_contains_names() {
    let set = DetectionSet::new(vec![
      BoundingBox::new([1.0, 2.0, 3.0, 4.0], 0.5, 0),
      BoundingBox::new([1.0, 2.0, 3.0, 4.0], 0.25, 7),
    ]);
    let value = set.to_json(&["battery".to_string()]);
    assert_eq!(value[0]["class_name"], "battery");
    assert_eq!(value[0]["bbox"][2], 3.0);
    assert!(value[1]["class_name"].is_null());
  }
}
