// 该文件是 Linzhi （林芝） 项目的一部分。
// src/nms.rs - 非极大值抑制
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

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::{decode::Candidate, detection::BoundingBox};

/// 交并比，输入为 `[x1, y1, x2, y2]`。
///
/// 面积为 0 的框只与完全相同的框 IoU 为 1，与其他框均为 0。
pub fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  if area_a <= 0.0 || area_b <= 0.0 {
    return if a == b { 1.0 } else { 0.0 };
  }

  let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = inter_w * inter_h;
  let union = area_a + area_b - inter;
  if union <= 0.0 {
    return 0.0;
  }
  (inter / union).clamp(0.0, 1.0)
}

/// 贪心非极大值抑制
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suppressor {
  pub iou_threshold: f32,
  pub max_detections: usize,
  /// 为 true 时不区分类别
  pub agnostic: bool,
}

impl Default for Suppressor {
  fn default() -> Self {
    Self {
      iou_threshold: 0.45,
      max_detections: 300,
      agnostic: false,
    }
  }
}

impl Suppressor {
  pub fn new(iou_threshold: f32, max_detections: usize) -> Self {
    Self {
      iou_threshold,
      max_detections,
      agnostic: false,
    }
  }

  pub fn agnostic(mut self, agnostic: bool) -> Self {
    self.agnostic = agnostic;
    self
  }

  /// 对候选框做抑制，结果位于模型输入坐标，按置信度降序排列
  pub fn suppress(&self, candidates: &[Candidate]) -> Vec<BoundingBox> {
    let boxes: Vec<BoundingBox> = candidates
      .iter()
      .map(|c| BoundingBox::new(c.corners(), c.confidence(), c.class_id()))
      .collect();
    self.suppress_boxes(&boxes)
  }

  /// 对已有的框再次抑制，对自身输出调用时结果不变
  pub fn suppress_boxes(&self, boxes: &[BoundingBox]) -> Vec<BoundingBox> {
    if boxes.is_empty() || self.max_detections == 0 {
      return Vec::new();
    }

    // 置信度降序，相同时按原始顺序
    let rank = |&i: &usize, &j: &usize| -> Ordering {
      boxes[j]
        .confidence
        .total_cmp(&boxes[i].confidence)
        .then(i.cmp(&j))
    };
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(rank);

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for idx in order {
      let key = if self.agnostic { 0 } else { boxes[idx].class_id };
      groups.entry(key).or_default().push(idx);
    }

    let mut keep = Vec::new();
    for (class_id, group) in &groups {
      let mut suppressed = vec![false; group.len()];
      let mut kept = 0usize;
      for i in 0..group.len() {
        if suppressed[i] {
          continue;
        }
        keep.push(group[i]);
        kept += 1;
        // 同一组中排在更后面的框不可能进入全局前 max_detections
        if kept == self.max_detections {
          break;
        }
        let current = boxes[group[i]].corners();
        for j in (i + 1)..group.len() {
          if !suppressed[j] && iou(current, boxes[group[j]].corners()) > self.iou_threshold {
            suppressed[j] = true;
          }
        }
      }
      debug!("类别 {}: {} 个框保留 {} 个", class_id, group.len(), kept);
    }

    keep.sort_by(rank);
    keep.truncate(self.max_detections);
    keep.into_iter().map(|i| boxes[i]).collect()
  }
}

/// 按类别做非极大值抑制
pub fn suppress(
  candidates: &[Candidate],
  iou_threshold: f32,
  max_detections: usize,
) -> Vec<BoundingBox> {
  Suppressor::new(iou_threshold, max_detections).suppress(candidates)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn candidate(corners: [f32; 4], score: f32, class_id: usize, cell: usize) -> Candidate {
    let mut class_scores = vec![0.0; 3];
    class_scores[class_id] = score;
    Candidate {
      center_x: (corners[0] + corners[2]) / 2.0,
      center_y: (corners[1] + corners[3]) / 2.0,
      width: corners[2] - corners[0],
      height: corners[3] - corners[1],
      objectness: 1.0,
      class_scores,
      source_cell_index: cell,
    }
  }

  #[test]
  fn iou_basics() {
    let a = [0.0, 0.0, 10.0, 10.0];
    let b = [5.0, 0.0, 15.0, 10.0];
    assert!((iou(a, b) - 50.0 / 150.0).abs() < 1e-6);
    assert_eq!(iou(a, b), iou(b, a));
    assert_eq!(iou(a, a), 1.0);
    assert_eq!(iou(a, [20.0, 20.0, 30.0, 30.0]), 0.0);
  }

  #[test]
  fn iou_of_degenerate_boxes() {
    let point = [5.0, 5.0, 5.0, 5.0];
    assert_eq!(iou(point, point), 1.0);
    assert_eq!(iou(point, [0.0, 0.0, 10.0, 10.0]), 0.0);
    assert_eq!(iou([0.0, 0.0, 10.0, 10.0], point), 0.0);
  }

  #[test]
  fn overlapping_duplicates_are_merged() {
    // 两个框 IoU 约为 0.9
    let candidates = vec![
      candidate([100.0, 100.0, 200.0, 200.0], 0.6, 0, 0),
      candidate([100.0, 100.0, 195.0, 200.0], 0.9, 0, 1),
    ];
    let kept = suppress(&candidates, 0.5, 300);
    assert_eq!(kept.len(), 1);
    assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    assert_eq!(kept[0].x2, 195.0);
  }

  #[test]
  fn different_classes_do_not_suppress_each_other() {
    let candidates = vec![
      candidate([0.0, 0.0, 10.0, 10.0], 0.9, 0, 0),
      candidate([0.0, 0.0, 10.0, 10.0], 0.8, 1, 1),
    ];
    assert_eq!(suppress(&candidates, 0.5, 300).len(), 2);

    let agnostic = Suppressor::new(0.5, 300).agnostic(true);
    let kept = agnostic.suppress(&candidates);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].class_id, 0);
  }

  #[test]
  fn iou_equal_to_threshold_is_kept() {
    // IoU 正好为 0.5
    let candidates = vec![
      candidate([0.0, 0.0, 10.0, 10.0], 0.9, 0, 0),
      candidate([0.0, 0.0, 10.0, 20.0], 0.8, 0, 1),
    ];
    assert_eq!(suppress(&candidates, 0.5, 300).len(), 2);
  }

  #[test]
  fn ties_keep_the_earlier_candidate() {
    let candidates = vec![
      candidate([0.0, 0.0, 10.0, 10.0], 0.7, 0, 0),
      candidate([1.0, 0.0, 11.0, 10.0], 0.7, 0, 1),
    ];
    let kept = suppress(&candidates, 0.5, 300);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].x1, 0.0);
  }

  #[test]
  fn global_cap_keeps_the_most_confident() {
    let candidates: Vec<Candidate> = (0..10)
      .map(|i| {
        let x = i as f32 * 20.0;
        candidate([x, 0.0, x + 10.0, 10.0], 0.1 + i as f32 * 0.05, i % 3, i)
      })
      .collect();
    let kept = suppress(&candidates, 0.5, 4);
    assert_eq!(kept.len(), 4);
    let x1: Vec<f32> = kept.iter().map(|b| b.x1).collect();
    assert_eq!(x1, vec![180.0, 160.0, 140.0, 120.0]);
    assert!(suppress(&candidates, 0.5, 0).is_empty());
  }

  #[test]
  fn suppression_is_idempotent() {
    let candidates = vec![
      candidate([0.0, 0.0, 10.0, 10.0], 0.9, 0, 0),
      candidate([1.0, 1.0, 11.0, 11.0], 0.85, 0, 1),
      candidate([8.0, 8.0, 18.0, 18.0], 0.8, 0, 2),
      candidate([0.0, 0.0, 10.0, 10.0], 0.7, 1, 3),
      candidate([50.0, 50.0, 60.0, 60.0], 0.3, 2, 4),
    ];
    let nms = Suppressor::new(0.45, 3);
    let once = nms.suppress(&candidates);
    let twice = nms.suppress_boxes(&once);
    assert_eq!(once, twice);
    assert_eq!(once.len(), 3);
  }
}
