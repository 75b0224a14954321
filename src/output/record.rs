// 该文件是 Linzhi （林芝） 项目的一部分。
// src/output/record.rs - 检测结果文本记录
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

use tracing::info;

use crate::detection::DetectionSet;

/// 记录格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
  /// 每行 `name, score, x1, y1, x2, y2`
  #[default]
  Text,
  Json,
}

#[derive(Debug, Clone, Default)]
pub struct Record {
  /// 文本格式下用类别名称代替编号
  pub label_with_name: bool,
  pub format: RecordFormat,
}

impl Record {
  pub fn format_text(&self, result: &DetectionSet, class_names: &[String]) -> String {
    result
      .iter()
      .map(|item| {
        let name = match class_names.get(item.class_id) {
          Some(name) if self.label_with_name => name.clone(),
          _ => item.class_id.to_string(),
        };
        format!(
          "{}, {:.4}, {:.1}, {:.1}, {:.1}, {:.1}",
          name, item.confidence, item.x1, item.y1, item.x2, item.y2
        )
      })
      .collect::<Vec<_>>()
      .join("\n")
  }

  /// 写入与 `path` 同名、扩展名为 `txt` 或 `json` 的文件，返回实际路径
  pub fn record(
    &self,
    result: &DetectionSet,
    class_names: &[String],
    path: &Path,
  ) -> Result<PathBuf, std::io::Error> {
    let (target, content) = match self.format {
      RecordFormat::Text => (path.with_extension("txt"), self.format_text(result, class_names)),
      RecordFormat::Json => (
        path.with_extension("json"),
        result.to_json(class_names).to_string(),
      ),
    };
    std::fs::write(&target, content)?;
    info!("记录 {} 个检测结果到 {}", result.len(), target.display());
    Ok(target)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::detection::BoundingBox;

  fn result() -> DetectionSet {
    DetectionSet::new(vec![
      BoundingBox::new([10.0, 20.0, 30.0, 40.0], 0.5, 1),
      BoundingBox::new([0.0, 0.0, 5.0, 5.0], 0.875, 0),
    ])
  }

  fn names() -> Vec<String> {
    vec!["cardboard".to_string(), "glass".to_string()]
  }

  #[test]
  fn text_lines() {
    let record = Record {
      label_with_name: true,
      ..Default::default()
    };
    assert_eq!(
      record.format_text(&result(), &names()),
      "cardboard, 0.8750, 0.0, 0.0, 5.0, 5.0\nglass, 0.5000, 10.0, 20.0, 30.0, 40.0"
    );

    let by_id = Record::default().format_text(&result(), &names());
    assert!(by_id.starts_with("0, 0.8750"));
  }

  #[test]
  fn writes_next_to_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let record = Record {
      label_with_name: false,
      format: RecordFormat::Json,
    };
    let written = record
      .record(&result(), &names(), &dir.path().join("frame.png"))
      .unwrap();
    assert_eq!(written, dir.path().join("frame.json"));

    let value: serde_json::Value =
      serde_json::from_str(&std::fs::read_to_string(written).unwrap()).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 2);
    assert_eq!(value[0]["class_name"], "cardboard");
  }
}
