// 该文件是 Linzhi （林芝） 项目的一部分。
// src/frame.rs - 输入图像帧定义
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

use image::{DynamicImage, GrayImage, ImageBuffer, Rgb, RgbImage, RgbaImage};

use crate::error::{DetectError, Result};

const GRAY_CHANNELS: usize = 1;
const RGB_CHANNELS: usize = 3;
const RGBA_CHANNELS: usize = 4;

/// 交错存储（HWC）的 8 位图像帧。
///
/// 构造后不可变，检测流程只读取它。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  channels: usize,
}

impl Frame {
  /// 由原始像素构造帧，数据长度必须等于 `width * height * channels`
  pub fn new(data: Vec<u8>, width: u32, height: u32, channels: usize) -> Result<Self> {
    let expected = width as usize * height as usize * channels;
    if data.len() != expected {
      return Err(DetectError::invalid_image(format!(
        "数据长度不匹配: 期望长度 {}, 实际长度 {}",
        expected,
        data.len()
      )));
    }

    Ok(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      channels,
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn as_hwc(&self) -> &[u8] {
    &self.data
  }

  /// 检查帧能否进入检测流程：尺寸非零且通道数受支持（灰度、RGB、RGBA）
  pub fn validate(&self) -> Result<()> {
    if self.width == 0 || self.height == 0 {
      return Err(DetectError::invalid_image(format!(
        "图像尺寸为零: {}x{}",
        self.width, self.height
      )));
    }

    match self.channels {
      GRAY_CHANNELS | RGB_CHANNELS | RGBA_CHANNELS => Ok(()),
      other => Err(DetectError::invalid_image(format!(
        "不支持的通道数: {}",
        other
      ))),
    }
  }

  /// 转为 RGB 图像，灰度通道复制到三个通道，透明通道被丢弃
  pub fn to_rgb_image(&self) -> Result<RgbImage> {
    self.validate()?;

    let channels = self.channels;
    let width = self.width as usize;
    let data = &self.data;

    Ok(ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let idx = (y as usize * width + x as usize) * channels;
      if channels == GRAY_CHANNELS {
        let v = data[idx];
        Rgb([v, v, v])
      } else {
        Rgb([data[idx], data[idx + 1], data[idx + 2]])
      }
    }))
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into_boxed_slice(),
      width,
      height,
      channels: RGB_CHANNELS,
    }
  }
}

impl From<RgbaImage> for Frame {
  fn from(image: RgbaImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into_boxed_slice(),
      width,
      height,
      channels: RGBA_CHANNELS,
    }
  }
}

impl From<GrayImage> for Frame {
  fn from(image: GrayImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw().into_boxed_slice(),
      width,
      height,
      channels: GRAY_CHANNELS,
    }
  }
}

impl From<DynamicImage> for Frame {
  fn from(image: DynamicImage) -> Self {
    match image {
      DynamicImage::ImageLuma8(gray) => gray.into(),
      DynamicImage::ImageRgb8(rgb) => rgb.into(),
      DynamicImage::ImageRgba8(rgba) => rgba.into(),
      // 16 位与浮点格式统一降为 8 位
      other if other.color().has_alpha() => other.to_rgba8().into(),
      other => other.to_rgb8().into(),
    }
  }
}
