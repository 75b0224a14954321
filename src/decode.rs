// 该文件是 Linzhi （林芝） 项目的一部分。
// src/decode.rs - 模型原始输出解码
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

//! 把检测头的原始激活值解码为候选框。
//!
//! 不同检测器家族的网格、锚框、步长编码各不相同，这些差异由 [`HeadDecoder`]
//! 策略承担；本模块只负责批维度校验、置信度阈值与数值异常过滤。

use tracing::{debug, error, warn};

use crate::{
  error::{DetectError, Result},
  model::ModelMetadata,
  tensor::Tensor,
};

mod anchor_grid;
mod distance_grid;
mod flat;

pub use self::anchor_grid::{AnchorGridHead, AnchorLevel, BoxEncoding};
pub use self::distance_grid::DistanceGridHead;
pub use self::flat::FlatHead;

/// 有界激活函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
  /// 导出的计算图已经完成激活
  #[default]
  Identity,
  Sigmoid,
}

impl Activation {
  #[inline]
  pub fn apply(self, x: f32) -> f32 {
    match self {
      Activation::Identity => x,
      Activation::Sigmoid => sigmoid(x),
    }
  }
}

#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 解码得到的候选框，坐标位于模型输入像素空间
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub center_x: f32,
  pub center_y: f32,
  pub width: f32,
  pub height: f32,
  pub objectness: f32,
  /// 与类别名称一一对应的类别概率
  pub class_scores: Vec<f32>,
  /// 在一张图像的所有检测层、锚框中唯一的网格编号
  pub source_cell_index: usize,
}

impl Candidate {
  /// 最高分类别及其分数，分数相同取编号较小者，NaN 不参与比较
  pub fn best_class(&self) -> (usize, f32) {
    best_class(&self.class_scores)
  }

  pub fn class_id(&self) -> usize {
    self.best_class().0
  }

  /// objectness × max(class_scores)，截断到 [0, 1]
  pub fn confidence(&self) -> f32 {
    confidence(self.objectness, self.best_class().1)
  }

  /// [x1, y1, x2, y2]
  pub fn corners(&self) -> [f32; 4] {
    let (hw, hh) = (self.width / 2.0, self.height / 2.0);
    [
      self.center_x - hw,
      self.center_y - hh,
      self.center_x + hw,
      self.center_y + hh,
    ]
  }
}

fn best_class(scores: &[f32]) -> (usize, f32) {
  let mut best = (0usize, f32::NAN);
  for (i, &score) in scores.iter().enumerate() {
    if score.is_nan() {
      continue;
    }
    if best.1.is_nan() || score > best.1 {
      best = (i, score);
    }
  }
  best
}

// 两个因子先各自截断到 [0, 1]，负的原始值不会相乘得到正的置信度
fn confidence(objectness: f32, best_score: f32) -> f32 {
  let unit = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { v };
  unit(objectness) * unit(best_score)
}

/// 候选框收集器，检测头策略把每个网格的结果交给它。
///
/// 低于阈值的候选立即丢弃；置信度或几何量为 NaN / 无穷的候选被静默丢弃并计数。
#[derive(Debug)]
pub struct CandidateSink {
  threshold: f32,
  candidates: Vec<Candidate>,
  non_finite: usize,
}

impl CandidateSink {
  pub fn new(confidence_threshold: f32) -> Self {
    Self {
      threshold: confidence_threshold,
      candidates: Vec::new(),
      non_finite: 0,
    }
  }

  /// 提交一个网格的结果，`geometry` 只在候选通过阈值后才计算，返回 (cx, cy, w, h)。
  pub fn offer<F>(&mut self, cell: usize, objectness: f32, class_scores: &[f32], geometry: F) -> bool
  where
    F: FnOnce() -> [f32; 4],
  {
    let (_, best) = best_class(class_scores);
    let conf = confidence(objectness, best);
    if !conf.is_finite() || !objectness.is_finite() {
      self.non_finite += 1;
      return false;
    }
    if conf < self.threshold {
      return false;
    }

    let [cx, cy, w, h] = geometry();
    if !(cx.is_finite() && cy.is_finite() && w.is_finite() && h.is_finite()) {
      self.non_finite += 1;
      return false;
    }

    self.candidates.push(Candidate {
      center_x: cx,
      center_y: cy,
      width: w.max(0.0),
      height: h.max(0.0),
      objectness,
      class_scores: class_scores.to_vec(),
      source_cell_index: cell,
    });
    true
  }

  pub fn len(&self) -> usize {
    self.candidates.len()
  }

  pub fn is_empty(&self) -> bool {
    self.candidates.is_empty()
  }

  pub fn non_finite(&self) -> usize {
    self.non_finite
  }

  pub fn finish(self) -> Vec<Candidate> {
    self.candidates
  }
}

/// 检测头解码策略，与模型一起提供。
///
/// 实现负责校验输出张量的维度与类别数，并把批中第 `batch_index` 张图像的每个
/// 网格 / 锚框交给 [`CandidateSink`]。
pub trait HeadDecoder: Send + Sync {
  fn name(&self) -> &str;

  fn decode_into(
    &self,
    outputs: &[Tensor],
    batch_index: usize,
    metadata: &ModelMetadata,
    sink: &mut CandidateSink,
  ) -> Result<()>;
}

impl<H: HeadDecoder + ?Sized> HeadDecoder for Box<H> {
  fn name(&self) -> &str {
    (**self).name()
  }

  fn decode_into(
    &self,
    outputs: &[Tensor],
    batch_index: usize,
    metadata: &ModelMetadata,
    sink: &mut CandidateSink,
  ) -> Result<()> {
    (**self).decode_into(outputs, batch_index, metadata, sink)
  }
}

/// 解码批大小为 1 的模型输出
pub fn decode<H: HeadDecoder + ?Sized>(
  head: &H,
  outputs: &[Tensor],
  metadata: &ModelMetadata,
  confidence_threshold: f32,
) -> Result<Vec<Candidate>> {
  let mut batches = decode_batch(head, outputs, metadata, confidence_threshold, 1)?;
  Ok(batches.pop().unwrap_or_default())
}

/// 解码批输出，第 i 个结果对应批中第 i 张图像
pub fn decode_batch<H: HeadDecoder + ?Sized>(
  head: &H,
  outputs: &[Tensor],
  metadata: &ModelMetadata,
  confidence_threshold: f32,
  batch: usize,
) -> Result<Vec<Vec<Candidate>>> {
  if outputs.is_empty() {
    error!("检测头 {} 没有收到任何输出", head.name());
    return Err(DetectError::contract("模型没有输出"));
  }
  for (i, tensor) in outputs.iter().enumerate() {
    if tensor.shape().first() != Some(&batch) {
      error!(
        "输出 {} 的批维度不匹配: 期望 {}, 实际形状 {:?}",
        i,
        batch,
        tensor.shape()
      );
      return Err(DetectError::shape_mismatch(
        format!("输出 {} 批维度", i),
        &[batch],
        tensor.shape(),
      ));
    }
  }

  (0..batch)
    .map(|b| {
      let mut sink = CandidateSink::new(confidence_threshold);
      head.decode_into(outputs, b, metadata, &mut sink)?;
      if sink.non_finite() > 0 {
        warn!("丢弃 {} 个数值异常的候选框", sink.non_finite());
      }
      debug!("检测头 {}: 图像 {} 得到 {} 个候选框", head.name(), b, sink.len());
      Ok(sink.finish())
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn best_class_prefers_lower_index_and_skips_nan() {
    assert_eq!(best_class(&[0.2, 0.7, 0.7]), (1, 0.7));
    assert_eq!(best_class(&[f32::NAN, 0.3]), (1, 0.3));
    assert!(best_class(&[f32::NAN]).1.is_nan());
  }

  #[test]
  fn sink_applies_threshold() {
    let mut sink = CandidateSink::new(0.25);
    assert!(!sink.offer(0, 1.0, &[0.1, 0.05], || [1.0, 1.0, 2.0, 2.0]));
    assert!(sink.offer(1, 0.5, &[0.1, 0.6], || [1.0, 1.0, 2.0, 2.0]));
    let candidates = sink.finish();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].source_cell_index, 1);
    assert_eq!(candidates[0].class_id(), 1);
    assert!((candidates[0].confidence() - 0.3).abs() < 1e-6);
  }

  #[test]
  fn sink_skips_geometry_for_rejected_candidates() {
    let mut sink = CandidateSink::new(0.5);
    sink.offer(0, 0.1, &[0.9], || panic!("不应计算几何量"));
    assert!(sink.is_empty());
  }

  #[test]
  fn sink_drops_non_finite_values() {
    let mut sink = CandidateSink::new(0.0);
    assert!(!sink.offer(0, f32::NAN, &[0.9], || [0.0; 4]));
    assert!(!sink.offer(1, 1.0, &[f32::INFINITY], || [0.0; 4]));
    assert!(!sink.offer(2, 1.0, &[0.9], || [f32::NAN, 0.0, 1.0, 1.0]));
    assert!(sink.offer(3, 1.0, &[0.9], || [0.0, 0.0, 1.0, 1.0]));
    assert_eq!(sink.non_finite(), 3);
    assert_eq!(sink.len(), 1);
  }

  #[test]
  fn negative_raw_scores_do_not_multiply_into_confidence() {
    assert_eq!(confidence(-2.0, -0.9), 0.0);
    assert_eq!(confidence(3.0, 0.5), 0.5);

    let mut sink = CandidateSink::new(0.25);
    assert!(!sink.offer(0, -2.0, &[-0.9, -1.5], || [1.0, 1.0, 2.0, 2.0]));
    assert!(sink.is_empty());
    assert_eq!(sink.non_finite(), 0);
  }

  #[test]
  fn corners_from_center() {
    let candidate = Candidate {
      center_x: 150.0,
      center_y: 150.0,
      width: 100.0,
      height: 50.0,
      objectness: 1.0,
      class_scores: vec![0.9],
      source_cell_index: 0,
    };
    assert_eq!(candidate.corners(), [100.0, 125.0, 200.0, 175.0]);
  }
}
