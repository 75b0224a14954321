// 该文件是 Linzhi （林芝） 项目的一部分。
// src/task.rs - 检测任务
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

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::{detection::DetectionSet, output::Render, pipeline::Detector};

// 计算平均耗时时跳过的预热次数
const WARMUP_RUNS: usize = 2;

pub trait Task<I, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, detector: &Detector, output: &O) -> Result<Self::Output, Self::Error>;
}

/// 对输入的第一帧检测一次
pub struct OneShotTask;

impl<I, O, RE> Task<I, O> for OneShotTask
where
  I: Iterator<Item = crate::frame::Frame>,
  O: Render<Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  type Output = DetectionSet;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, detector: &Detector, output: &O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = detector.detect(&frame)?;
    info!("推理完成，检测到 {} 个目标，耗时: {:.2?}", result.len(), now.elapsed());
    output.render_result(&frame, &result, detector.class_names())?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(result)
  }
}

/// 对同一帧重复检测，统计平均耗时
pub struct RepeatShotTask {
  pub times: usize,
}

/// 重复检测的统计结果
#[derive(Debug, Clone)]
pub struct RepeatReport {
  pub result: DetectionSet,
  pub durations: Vec<Duration>,
}

impl RepeatReport {
  /// 跳过预热后的平均耗时，次数不足时使用全部样本
  pub fn mean(&self) -> Duration {
    let samples = if self.durations.len() > WARMUP_RUNS {
      &self.durations[WARMUP_RUNS..]
    } else {
      &self.durations[..]
    };
    if samples.is_empty() {
      return Duration::ZERO;
    }
    samples.iter().sum::<Duration>() / samples.len() as u32
  }
}

impl<I, O, RE> Task<I, O> for RepeatShotTask
where
  I: Iterator<Item = crate::frame::Frame>,
  O: Render<Error = RE>,
  RE: std::error::Error + Send + Sync + 'static,
{
  type Output = RepeatReport;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, detector: &Detector, output: &O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");

    let times = self.times.max(1);
    let mut durations = Vec::with_capacity(times);
    let mut result = DetectionSet::default();
    for i in 0..times {
      let now = Instant::now();
      result = detector.detect(&frame)?;
      let elapsed = now.elapsed();
      info!("({})推理完成，耗时: {:.2?}", i, elapsed);
      durations.push(elapsed);
    }
    output.render_result(&frame, &result, detector.class_names())?;

    let report = RepeatReport { result, durations };
    warn!("平均推理时间: {:.2?}", report.mean());
    Ok(report)
  }
}
