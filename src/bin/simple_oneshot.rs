// 该文件是 Linzhi （林芝） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像检测
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

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use url::Url;

use linzhi::{
  DetectConfig, Detector, FromUrl, HeadDecoder, ModelResolver,
  decode::{AnchorGridHead, DistanceGridHead, FlatHead},
  input::ImageFileInput,
  model::OnnxResolver,
  output::SaveImageFileOutput,
  task::{OneShotTask, RepeatShotTask, Task},
};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum HeadKind {
  /// YOLOv8 / YOLO11 展平输出
  Yolov8,
  /// 导出时已合并检测层的 YOLOv5
  Yolov5Flat,
  /// YOLOv5 / YOLOv7 原始检测层
  Yolov5,
  /// YOLOv3 原始检测层
  Yolov3,
  /// 回归 / 分类分离的无锚框检测层
  Distance,
}

impl HeadKind {
  fn decoder(self) -> Box<dyn HeadDecoder> {
    match self {
      HeadKind::Yolov8 => Box::new(FlatHead::yolov8()),
      HeadKind::Yolov5Flat => Box::new(FlatHead::yolov5()),
      HeadKind::Yolov5 => Box::new(AnchorGridHead::yolov5()),
      HeadKind::Yolov3 => Box::new(AnchorGridHead::yolov3()),
      HeadKind::Distance => Box::new(DistanceGridHead::default()),
    }
  }
}

/// Linzhi 单张图像检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 onnx:///models/waste.onnx?labels=/models/waste.txt&size=640
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:///data/bottle.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出图像，例如 image:///data/out.png?record=name
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 额外写出 JSON 格式的检测结果
  #[arg(long, value_name = "FILE")]
  pub json: Option<PathBuf>,
  /// 检测头类型
  #[arg(long, value_enum, default_value = "yolov8")]
  pub head: HeadKind,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// NMS IoU 阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub iou: f32,
  /// 最多保留的检测数量
  #[arg(long, default_value = "300", value_name = "COUNT")]
  pub max_det: usize,
  /// 只保留这些类别编号
  #[arg(long, value_delimiter = ',', value_name = "IDS")]
  pub classes: Vec<usize>,
  /// NMS 不区分类别
  #[arg(long)]
  pub agnostic: bool,
  /// 重复推理次数，用于统计平均耗时
  #[arg(long, value_name = "TIMES")]
  pub repeat: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = ImageFileInput::from_url(&args.input)?;
  let model = OnnxResolver.resolve(&args.model)?;
  let output = SaveImageFileOutput::from_url(&args.output)?;

  let config = DetectConfig::default()
    .with_confidence_threshold(args.confidence)
    .with_iou_threshold(args.iou)
    .with_max_detections(args.max_det)
    .with_classes((!args.classes.is_empty()).then_some(args.classes))
    .with_agnostic(args.agnostic);
  let detector = Detector::new(model, args.head.decoder()).with_config(config);
  info!("检测头: {}, 参数: {:?}", args.head.decoder().name(), detector.config());

  let result = match args.repeat {
    Some(times) => RepeatShotTask { times }.run_task(input, &detector, &output)?.result,
    None => OneShotTask.run_task(input, &detector, &output)?,
  };

  for item in result.iter() {
    info!(
      "{} {:.2} [{}, {}, {}, {}]",
      detector
        .class_names()
        .get(item.class_id)
        .map(String::as_str)
        .unwrap_or("?"),
      item.confidence,
      item.x1,
      item.y1,
      item.x2,
      item.y2
    );
  }

  if let Some(path) = &args.json {
    let json = result.to_json(detector.class_names());
    std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
    info!("检测结果写入: {}", path.display());
  }

  Ok(())
}
