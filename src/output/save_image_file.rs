// 该文件是 Linzhi （林芝） 项目的一部分。
// src/output/save_image_file.rs - 保存可视化结果到图像文件
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  detection::DetectionSet,
  frame::Frame,
  output::{
    Render,
    draw::{RenderError, Renderer},
    record::{Record, RecordFormat},
  },
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("绘制错误: {0}")]
  RenderError(#[from] RenderError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `image:///path/to/out.png?record=name|id|json`
#[derive(Debug)]
pub struct SaveImageFileOutput {
  path: PathBuf,
  renderer: Renderer,
  record: Option<Record>,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!("URI 方案不匹配: 期望 '{}', 实际 '{}'", Self::SCHEME, url.scheme());
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let record = url
      .query_pairs()
      .find(|(k, _)| k == "record")
      .map(|(_, v)| match v.as_ref() {
        "id" => Record {
          label_with_name: false,
          format: RecordFormat::Text,
        },
        "json" => Record {
          label_with_name: true,
          format: RecordFormat::Json,
        },
        _ => Record {
          label_with_name: true,
          format: RecordFormat::Text,
        },
      });

    let path = urlencoding::decode(url.path())
      .map(|p| PathBuf::from(p.into_owned()))
      .unwrap_or_else(|_| PathBuf::from(url.path()));

    Ok(Self::new(path, Renderer::new()?).with_record(record))
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>, renderer: Renderer) -> Self {
    Self {
      path: path.into(),
      renderer,
      record: None,
    }
  }

  pub fn with_record(mut self, record: Option<Record>) -> Self {
    self.record = record;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Render for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &Frame,
    result: &DetectionSet,
    class_names: &[String],
  ) -> Result<(), Self::Error> {
    let image = self.renderer.render(frame, result, class_names)?;

    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    image.save(&self.path)?;
    info!("保存图像到文件: {}", self.path.display());

    if let Some(record) = &self.record {
      record.record(result, class_names, &self.path)?;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::detection::BoundingBox;
  use image::RgbImage;

  #[test]
  fn scheme_is_checked() {
    let url = Url::parse("video:///tmp/out.mp4").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn saves_image_and_record() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("nested").join("out.png");
    let url = Url::from_file_path(&target).unwrap();
    let url = Url::parse(&format!("image://{}?record=id", url.path())).unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();
    assert_eq!(output.path(), target.as_path());

    let frame = Frame::from(RgbImage::new(48, 32));
    let result = DetectionSet::new(vec![BoundingBox::new([4.0, 4.0, 20.0, 20.0], 0.75, 0)]);
    output
      .render_result(&frame, &result, &["metal".to_string()])
      .unwrap();

    let saved = image::open(&target).unwrap();
    assert_eq!((saved.width(), saved.height()), (48, 32));
    let text = std::fs::read_to_string(target.with_extension("txt")).unwrap();
    assert_eq!(text, "0, 0.7500, 4.0, 4.0, 20.0, 20.0");
  }
}
