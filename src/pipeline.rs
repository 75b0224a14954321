// 该文件是 Linzhi （林芝） 项目的一部分。
// src/pipeline.rs - 单次检测流程编排
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

//! 预处理 → 推理 → 解码 → 抑制 → 坐标映射。
//!
//! 每次调用只读共享的 [`Model`] 与配置，不保留任何跨调用状态，
//! 因此同一个 [`Detector`] 可以在多个线程中同时使用。

use std::time::Instant;

use ndarray::{Axis, concatenate};
use rayon::prelude::*;
use tracing::{debug, error, info};

use crate::{
  decode::{Candidate, HeadDecoder, decode_batch},
  detection::DetectionSet,
  error::{DetectError, Result},
  frame::Frame,
  mapper::remap,
  model::Model,
  nms::Suppressor,
  preprocess::{Letterbox, PreprocessConfig, Preprocessor},
  tensor::Tensor,
};

/// 检测参数
#[derive(Debug, Clone, PartialEq)]
pub struct DetectConfig {
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
  pub max_detections: usize,
  /// 只保留这些类别，`None` 表示全部
  pub classes: Option<Vec<usize>>,
  /// 抑制时不区分类别
  pub agnostic: bool,
}

impl Default for DetectConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: 0.25,
      iou_threshold: 0.45,
      max_detections: 300,
      classes: None,
      agnostic: false,
    }
  }
}

impl DetectConfig {
  pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn with_max_detections(mut self, max: usize) -> Self {
    self.max_detections = max;
    self
  }

  pub fn with_classes(mut self, classes: Option<Vec<usize>>) -> Self {
    self.classes = classes;
    self
  }

  pub fn with_agnostic(mut self, agnostic: bool) -> Self {
    self.agnostic = agnostic;
    self
  }

  /// 阈值必须是 [0, 1] 内的有限值
  pub fn validate(&self) -> Result<()> {
    for (name, value) in [
      ("置信度阈值", self.confidence_threshold),
      ("IoU 阈值", self.iou_threshold),
    ] {
      if !(0.0..=1.0).contains(&value) {
        error!("{}无效: {}", name, value);
        return Err(DetectError::config(format!("{}必须在 [0, 1] 内: {}", name, value)));
      }
    }
    Ok(())
  }

  fn suppressor(&self) -> Suppressor {
    Suppressor::new(self.iou_threshold, self.max_detections).agnostic(self.agnostic)
  }
}

/// 绑定了模型、检测头与参数的检测器
pub struct Detector {
  model: Model,
  head: Box<dyn HeadDecoder>,
  preprocessor: Preprocessor,
  config: DetectConfig,
}

impl std::fmt::Debug for Detector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Detector")
      .field("model", &self.model)
      .field("head", &self.head.name())
      .field("preprocessor", &self.preprocessor)
      .field("config", &self.config)
      .finish()
  }
}

impl Detector {
  pub fn new<H: HeadDecoder + 'static>(model: Model, head: H) -> Self {
    Self {
      model,
      head: Box::new(head),
      preprocessor: Preprocessor::default(),
      config: DetectConfig::default(),
    }
  }

  pub fn with_config(mut self, config: DetectConfig) -> Self {
    self.config = config;
    self
  }

  pub fn with_preprocess(mut self, config: PreprocessConfig) -> Self {
    self.preprocessor = Preprocessor::new(config);
    self
  }

  pub fn model(&self) -> &Model {
    &self.model
  }

  pub fn config(&self) -> &DetectConfig {
    &self.config
  }

  pub fn class_names(&self) -> &[String] {
    self.model.class_names()
  }

  /// 检测一张图像
  pub fn detect(&self, frame: &Frame) -> Result<DetectionSet> {
    run(frame, &self.model, &*self.head, &self.preprocessor, &self.config)
  }

  /// 检测一批图像，结果顺序与输入一致。
  ///
  /// 批维度可变的模型一次前向推理整批图像；固定批大小为 n 的模型每 n 张推理一次，
  /// 最后不足一批时重复最后一张补齐。
  pub fn detect_batch(&self, frames: &[Frame]) -> Result<Vec<DetectionSet>> {
    self.config.validate()?;
    if frames.is_empty() {
      return Ok(Vec::new());
    }

    let shape = self.model.input_shape();
    let chunk = shape.batch.unwrap_or(frames.len()).max(1);
    if chunk == 1 {
      return frames.iter().map(|frame| self.detect(frame)).collect();
    }

    let now = Instant::now();
    let prepared = frames
      .par_iter()
      .map(|frame| self.preprocessor.preprocess(frame, shape))
      .collect::<Result<Vec<(Tensor, Letterbox)>>>()?;
    debug!("批预处理: {} 张图像, 耗时: {:.2?}", frames.len(), now.elapsed());

    let mut results = Vec::with_capacity(frames.len());
    for group in prepared.chunks(chunk) {
      results.extend(infer(group, &self.model, &*self.head, &self.config)?);
    }
    info!("批检测完成: {} 张图像, 耗时: {:.2?}", frames.len(), now.elapsed());
    Ok(results)
  }
}

/// 使用默认预处理检测一张图像
pub fn detect<H: HeadDecoder + ?Sized>(
  frame: &Frame,
  model: &Model,
  head: &H,
  config: &DetectConfig,
) -> Result<DetectionSet> {
  run(frame, model, head, &Preprocessor::default(), config)
}

fn run<H: HeadDecoder + ?Sized>(
  frame: &Frame,
  model: &Model,
  head: &H,
  preprocessor: &Preprocessor,
  config: &DetectConfig,
) -> Result<DetectionSet> {
  config.validate()?;
  let now = Instant::now();
  let prepared = preprocessor.preprocess(frame, model.input_shape())?;
  let preprocess_time = now.elapsed();

  let result = infer(std::slice::from_ref(&prepared), model, head, config)?
    .pop()
    .unwrap_or_default();
  debug!(
    "检测完成: {} 个目标, 预处理 {:.2?}, 总计 {:.2?}",
    result.len(),
    preprocess_time,
    now.elapsed()
  );
  Ok(result)
}

/// 对一组已预处理的图像做一次前向推理。
///
/// 组大小不能超过模型的固定批大小；不足时用最后一张补齐，补齐部分的结果被丢弃。
fn infer<H: HeadDecoder + ?Sized>(
  prepared: &[(Tensor, Letterbox)],
  model: &Model,
  head: &H,
  config: &DetectConfig,
) -> Result<Vec<DetectionSet>> {
  let shape = model.input_shape();
  let count = prepared.len();
  let batch = shape.batch.unwrap_or(count);
  if count == 0 || count > batch {
    return Err(DetectError::shape_mismatch(
      "批输入",
      &shape.dims(batch),
      &shape.dims(count),
    ));
  }

  let stacked;
  let input = if batch == 1 {
    &prepared[0].0
  } else {
    let mut views: Vec<_> = prepared.iter().map(|(tensor, _)| tensor.view()).collect();
    if let Some(last) = views.last().cloned() {
      views.resize(batch, last);
    }
    stacked = concatenate(Axis(0), &views).map_err(|e| {
      error!("无法拼接批输入: {}", e);
      DetectError::shape_mismatch("批输入", &shape.dims(batch), prepared[0].0.shape())
    })?;
    &stacked
  };
  if batch > count {
    debug!("批输入补齐: {} -> {}", count, batch);
  }

  let outputs = model.forward(input)?;
  let mut batches = decode_batch(
    head,
    &outputs,
    model.metadata(),
    config.confidence_threshold,
    batch,
  )?;
  batches.truncate(count);

  Ok(
    batches
      .into_par_iter()
      .zip(prepared.par_iter())
      .map(|(candidates, (_, letterbox))| postprocess(candidates, letterbox, config))
      .collect(),
  )
}

fn postprocess(candidates: Vec<Candidate>, letterbox: &Letterbox, config: &DetectConfig) -> DetectionSet {
  let candidates: Vec<Candidate> = match &config.classes {
    Some(classes) => candidates
      .into_iter()
      .filter(|c| classes.contains(&c.class_id()))
      .collect(),
    None => candidates,
  };

  let kept = config.suppressor().suppress(&candidates);
  debug!("抑制: {} 个候选框保留 {} 个", candidates.len(), kept.len());

  DetectionSet::new(remap(
    &kept,
    letterbox,
    letterbox.original_width,
    letterbox.original_height,
  ))
}
