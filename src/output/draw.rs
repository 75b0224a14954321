// 该文件是 Linzhi （林芝） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontArc, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  detection::{BoundingBox, DetectionSet},
  error::DetectError,
  frame::Frame,
};

const FONT_DATA: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Error, Debug)]
pub enum RenderError {
  #[error("无法加载字体: {0}")]
  Font(#[from] InvalidFont),
  #[error(transparent)]
  Detect(#[from] DetectError),
}

/// 在图像上绘制检测框与标签，每个类别一种颜色
#[derive(Debug, Clone)]
pub struct Renderer {
  font: FontArc,
  scale: PxScale,
  thickness: i32,
}

impl Renderer {
  /// 使用内置的 DejaVu Sans 字体
  pub fn new() -> Result<Self, RenderError> {
    let font = FontArc::try_from_slice(FONT_DATA)?;
    Ok(Self::with_font(font))
  }

  pub fn with_font(font: FontArc) -> Self {
    Self {
      font,
      scale: PxScale::from(LABEL_FONT_SIZE),
      thickness: BOX_THICKNESS,
    }
  }

  pub fn font_size(mut self, size: f32) -> Self {
    self.scale = PxScale::from(size);
    self
  }

  pub fn thickness(mut self, thickness: u32) -> Self {
    self.thickness = thickness.max(1) as i32;
    self
  }

  /// 返回绘制了检测结果的新图像，原图不变
  pub fn render(
    &self,
    frame: &Frame,
    detections: &DetectionSet,
    class_names: &[String],
  ) -> Result<RgbImage, RenderError> {
    let mut image = frame.to_rgb_image()?;
    self.draw_detections(&mut image, detections, class_names);
    Ok(image)
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &DetectionSet, class_names: &[String]) {
    if image.width() == 0 || image.height() == 0 {
      return;
    }

    let colors = palette(class_names.len().max(1));
    // 置信度低的先画，高置信度的标签位于最上层
    for item in detections.iter().rev() {
      let color = colors[item.class_id % colors.len()];
      let name = match class_names.get(item.class_id) {
        Some(name) => name.clone(),
        None => {
          warn!("类别编号 {} 没有对应的名称", item.class_id);
          format!("#{}", item.class_id)
        }
      };

      let bounds = self.draw_box(image, item, color);
      let label = format!("{} {:.2}", name, item.confidence);
      self.draw_label(image, bounds, &label, color);
    }
    debug!("绘制 {} 个检测框", detections.len());
  }

  // 返回裁剪后的像素范围 (x_min, y_min, x_max, y_max)，均为闭区间
  fn draw_box(&self, image: &mut RgbImage, item: &BoundingBox, color: Rgb<u8>) -> (i32, i32, i32, i32) {
    let (w, h) = (image.width() as i32, image.height() as i32);

    let x_min = (item.x1.floor() as i32).clamp(0, w - 1);
    let y_min = (item.y1.floor() as i32).clamp(0, h - 1);
    let x_max = (item.x2.ceil() as i32 - 1).clamp(x_min, w - 1);
    let y_max = (item.y2.ceil() as i32 - 1).clamp(y_min, h - 1);

    for t in 0..self.thickness {
      let (x0, y0, x1, y1) = (x_min + t, y_min + t, x_max - t, y_max - t);
      if x0 > x1 || y0 > y1 {
        break;
      }
      let rect = Rect::at(x0, y0).of_size((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    (x_min, y_min, x_max, y_max)
  }

  fn draw_label(&self, image: &mut RgbImage, bounds: (i32, i32, i32, i32), label: &str, color: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let (x_min, y_min, _, _) = bounds;

    let (text_w, text_h) = text_size(self.scale, &self.font, label);
    let label_w = (text_w as i32 + 2 * LABEL_PADDING).min(w);
    let label_h = (text_h as i32 + 2 * LABEL_PADDING).min(h);

    // 优先放在框的上方，空间不足时放在框内顶部
    let label_y = if y_min >= label_h { y_min - label_h } else { y_min };
    let label_y = label_y.min(h - label_h).max(0);
    let label_x = x_min.min(w - label_w).max(0);

    let rect = Rect::at(label_x, label_y).of_size(label_w as u32, label_h as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      TEXT_COLOR,
      label_x + LABEL_PADDING,
      label_y + LABEL_PADDING,
      self.scale,
      &self.font,
      label,
    );
  }
}

/// 在色相环上均匀取 `n` 种颜色
fn palette(n: usize) -> Vec<Rgb<u8>> {
  (0..n)
    .map(|i| hsv_to_rgb((i as f32 / n as f32) * 360.0, 0.8, 0.9))
    .collect()
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = match (h / 60.0) as u32 {
    0 => (c, x, 0.0),
    1 => (x, c, 0.0),
    2 => (0.0, c, x),
    3 => (0.0, x, c),
    4 => (x, 0.0, c),
    _ => (c, 0.0, x),
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

/// 使用默认样式绘制检测结果
pub fn visualize(
  frame: &Frame,
  detections: &DetectionSet,
  class_names: &[String],
) -> Result<RgbImage, RenderError> {
  Renderer::new()?.render(frame, detections, class_names)
}

#[cfg(test)]
mod tests {
  use super::*;

  const BACKGROUND: Rgb<u8> = Rgb([10, 20, 30]);

  fn frame(w: u32, h: u32) -> Frame {
    Frame::from(RgbImage::from_pixel(w, h, BACKGROUND))
  }

  fn names() -> Vec<String> {
    vec!["plastic".to_string(), "paper".to_string()]
  }

  #[test]
  fn palette_is_distinct() {
    let colors = palette(6);
    assert_eq!(colors.len(), 6);
    assert_ne!(colors[0], colors[1]);
    assert_eq!(colors[0], hsv_to_rgb(0.0, 0.8, 0.9));
  }

  #[test]
  fn draws_box_outline() {
    let detections = DetectionSet::new(vec![BoundingBox::new([40.0, 60.0, 100.0, 120.0], 0.9, 1)]);
    let image = visualize(&frame(160, 160), &detections, &names()).unwrap();
    let color = palette(2)[1];

    // 底边与右边不会被标签覆盖
    assert_eq!(*image.get_pixel(70, 119), color);
    assert_eq!(*image.get_pixel(99, 90), color);
    assert_eq!(*image.get_pixel(98, 90), color);
    // 框内部与外部保持原样
    assert_eq!(*image.get_pixel(70, 100), BACKGROUND);
    assert_eq!(*image.get_pixel(150, 150), BACKGROUND);
  }

  #[test]
  fn label_sits_above_the_box() {
    let detections = DetectionSet::new(vec![BoundingBox::new([40.0, 60.0, 100.0, 120.0], 0.9, 0)]);
    let image = visualize(&frame(160, 160), &detections, &names()).unwrap();
    let color = palette(2)[0];
    // 标签背景左上角紧贴框的左上方
    assert_eq!(*image.get_pixel(40, 59), color);
  }

  #[test]
  fn boxes_at_the_border_do_not_panic() {
    let detections = DetectionSet::new(vec![
      BoundingBox::new([0.0, 0.0, 32.0, 32.0], 0.9, 0),
      BoundingBox::new([30.0, 30.0, 32.0, 32.0], 0.8, 5),
      BoundingBox::new([31.0, 0.0, 31.0, 0.0], 0.7, 1),
    ]);
    let image = visualize(&frame(32, 32), &detections, &names()).unwrap();
    assert_eq!(image.dimensions(), (32, 32));
  }

  #[test]
  fn invalid_frame_is_rejected() {
    let frame = Frame::new(Vec::new(), 0, 0, 3).unwrap();
    let result = visualize(&frame, &DetectionSet::default(), &names());
    assert!(matches!(result, Err(RenderError::Detect(DetectError::InvalidImage(_)))));
  }
}
