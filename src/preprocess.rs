// 该文件是 Linzhi （林芝） 项目的一部分。
// src/preprocess.rs - 图像预处理（等比缩放与填充）
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

use image::{Rgb, RgbImage, imageops::FilterType};
use ndarray::Array4;
use tracing::{debug, error};

use crate::{
  error::{DetectError, Result},
  frame::Frame,
  tensor::{InputShape, Tensor, TensorLayout},
};

const DEFAULT_FILL: [u8; 3] = [114, 114, 114];
const DEFAULT_PIXEL_SCALE: f32 = 1.0 / 255.0;

/// 填充区域的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
  /// 图像居中，两侧均匀填充
  #[default]
  Center,
  /// 图像贴左上角，只在右侧与下侧填充
  TopLeft,
}

#[derive(Debug, Clone)]
pub struct PreprocessConfig {
  pub fill: [u8; 3],
  /// 像素值乘以该系数后进入模型
  pub pixel_scale: f32,
  /// 可选的逐通道 (mean, std) 归一化，在 `pixel_scale` 之后应用
  pub normalize: Option<([f32; 3], [f32; 3])>,
  pub padding: Padding,
  pub filter: FilterType,
}

impl Default for PreprocessConfig {
  fn default() -> Self {
    Self {
      fill: DEFAULT_FILL,
      pixel_scale: DEFAULT_PIXEL_SCALE,
      normalize: None,
      padding: Padding::default(),
      filter: FilterType::Triangle,
    }
  }
}

impl PreprocessConfig {
  pub fn fill(mut self, fill: [u8; 3]) -> Self {
    self.fill = fill;
    self
  }

  pub fn pixel_scale(mut self, scale: f32) -> Self {
    self.pixel_scale = scale;
    self
  }

  pub fn normalize(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
    self.normalize = Some((mean, std));
    self
  }

  pub fn padding(mut self, padding: Padding) -> Self {
    self.padding = padding;
    self
  }

  pub fn filter(mut self, filter: FilterType) -> Self {
    self.filter = filter;
    self
  }
}

/// 预处理记录下的几何变换，用于把模型输入坐标还原到原图。
///
/// 模型坐标 = 原图坐标 × scale + pad
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale_x: f32,
  pub scale_y: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  pub original_width: u32,
  pub original_height: u32,
}

impl Letterbox {
  /// 计算把 `width x height` 放入 `target_width x target_height` 的变换
  pub fn fit(
    width: u32,
    height: u32,
    target_width: u32,
    target_height: u32,
    padding: Padding,
  ) -> Result<Self> {
    if width == 0 || height == 0 {
      return Err(DetectError::invalid_image(format!(
        "图像尺寸为零: {}x{}",
        width, height
      )));
    }
    if target_width == 0 || target_height == 0 {
      return Err(DetectError::contract(format!(
        "模型输入尺寸为零: {}x{}",
        target_width, target_height
      )));
    }

    let (resized_w, resized_h) = resized_dims(width, height, target_width, target_height);
    let (pad_x, pad_y) = match padding {
      Padding::Center => ((target_width - resized_w) / 2, (target_height - resized_h) / 2),
      Padding::TopLeft => (0, 0),
    };

    Ok(Self {
      scale_x: (resized_w as f64 / width as f64) as f32,
      scale_y: (resized_h as f64 / height as f64) as f32,
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
      original_width: width,
      original_height: height,
    })
  }

  pub fn resized_width(&self) -> u32 {
    (self.original_width as f32 * self.scale_x).round() as u32
  }

  pub fn resized_height(&self) -> u32 {
    (self.original_height as f32 * self.scale_y).round() as u32
  }

  pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
    (x * self.scale_x + self.pad_x, y * self.scale_y + self.pad_y)
  }

  pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
    ((x - self.pad_x) / self.scale_x, (y - self.pad_y) / self.scale_y)
  }
}

fn resized_dims(width: u32, height: u32, target_width: u32, target_height: u32) -> (u32, u32) {
  let scale = (target_width as f64 / width as f64).min(target_height as f64 / height as f64);
  let w = ((width as f64 * scale).round() as u32).clamp(1, target_width);
  let h = ((height as f64 * scale).round() as u32).clamp(1, target_height);
  (w, h)
}

/// 把任意尺寸的图像转换为模型固定形状的输入张量
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
  config: PreprocessConfig,
}

impl Preprocessor {
  pub fn new(config: PreprocessConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PreprocessConfig {
    &self.config
  }

  /// 预处理单张图像，返回批大小为 1 的张量与逆变换所需的 [`Letterbox`]
  pub fn preprocess(&self, frame: &Frame, shape: &InputShape) -> Result<(Tensor, Letterbox)> {
    if let Err(e) = frame.validate() {
      error!("输入图像无效: {}", e);
      return Err(e);
    }
    if shape.channels != 1 && shape.channels != 3 {
      return Err(DetectError::contract(format!(
        "模型输入通道数不受支持: {}",
        shape.channels
      )));
    }

    let (target_w, target_h) = (shape.width as u32, shape.height as u32);
    let letterbox = Letterbox::fit(
      frame.width(),
      frame.height(),
      target_w,
      target_h,
      self.config.padding,
    )?;

    let rgb = frame.to_rgb_image()?;
    let (resized_w, resized_h) = (letterbox.resized_width(), letterbox.resized_height());
    let resized = if (resized_w, resized_h) == rgb.dimensions() {
      rgb
    } else {
      image::imageops::resize(&rgb, resized_w, resized_h, self.config.filter)
    };

    let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb(self.config.fill));
    image::imageops::replace(
      &mut canvas,
      &resized,
      letterbox.pad_x as i64,
      letterbox.pad_y as i64,
    );

    debug!(
      "预处理: {}x{} -> {}x{}, 填充 ({}, {})",
      frame.width(),
      frame.height(),
      resized_w,
      resized_h,
      letterbox.pad_x,
      letterbox.pad_y
    );

    Ok((self.to_tensor(&canvas, shape), letterbox))
  }

  fn to_tensor(&self, canvas: &RgbImage, shape: &InputShape) -> Tensor {
    let (channels, height, width) = (shape.channels, shape.height, shape.width);
    let mut tensor = match shape.layout {
      TensorLayout::Nchw => Array4::<f32>::zeros((1, channels, height, width)),
      TensorLayout::Nhwc => Array4::<f32>::zeros((1, height, width, channels)),
    };

    for (x, y, pixel) in canvas.enumerate_pixels() {
      let (x, y) = (x as usize, y as usize);
      for c in 0..channels {
        let raw = if channels == 1 {
          (pixel[0] as f32 + pixel[1] as f32 + pixel[2] as f32) / 3.0
        } else {
          pixel[c] as f32
        };
        let mut value = raw * self.config.pixel_scale;
        if let Some((mean, std)) = &self.config.normalize {
          value = (value - mean[c]) / std[c];
        }
        match shape.layout {
          TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
          TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
        }
      }
    }

    tensor.into_dyn()
  }
}

/// 使用默认配置预处理到 `target_width x target_height` 的 NCHW 张量
pub fn preprocess(frame: &Frame, target_width: usize, target_height: usize) -> Result<(Tensor, Letterbox)> {
  let shape = InputShape::nchw(Some(1), 3, target_height, target_width);
  Preprocessor::default().preprocess(frame, &shape)
}
