// 该文件是 Linzhi （林芝） 项目的一部分。
// src/decode/distance_grid.rs - 回归 / 分类分离的无锚框检测头
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

use ndarray::{ArrayView3, Axis, Ix3};
use tracing::{debug, error};

use crate::{
  decode::{Activation, CandidateSink, HeadDecoder},
  error::{DetectError, Result},
  model::ModelMetadata,
  tensor::{Tensor, expect_rank_batch},
};

const DEFAULT_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
const REG_CHANNELS: usize = 4;

/// 每个检测层两个输出：回归 `[N, 4, H, W]`（以步长为单位的左、上、右、下距离）
/// 与分类 `[N, C, H, W]`。两者的先后顺序不固定，按通道数匹配。
#[derive(Debug, Clone)]
pub struct DistanceGridHead {
  strides: Vec<f32>,
  class_activation: Activation,
}

impl Default for DistanceGridHead {
  fn default() -> Self {
    Self::new(DEFAULT_STRIDES.to_vec())
  }
}

impl DistanceGridHead {
  pub fn new(strides: Vec<f32>) -> Self {
    Self {
      strides,
      class_activation: Activation::Sigmoid,
    }
  }

  pub fn class_activation(mut self, activation: Activation) -> Self {
    self.class_activation = activation;
    self
  }
}

/// 根据通道数匹配回归和分类输出
/// 返回 (reg, cls) 元组，如果形状不匹配则返回 None
fn match_reg_cls_tensors<'a>(
  tensor1: &'a Tensor,
  tensor2: &'a Tensor,
  num_classes: usize,
  head_idx: usize,
) -> Option<(&'a Tensor, &'a Tensor)> {
  let (s1, s2) = (tensor1.shape(), tensor2.shape());
  if s1.len() != 4 || s2.len() != 4 || s1[2..] != s2[2..] {
    return None;
  }

  if s1[1] == REG_CHANNELS && s2[1] == num_classes {
    debug!("检测头 {}: 输出顺序正常", head_idx);
    Some((tensor1, tensor2))
  } else if s1[1] == num_classes && s2[1] == REG_CHANNELS {
    debug!("检测头 {}: 输出顺序交换", head_idx);
    Some((tensor2, tensor1))
  } else {
    None
  }
}

fn batch_view<'a>(tensor: &'a Tensor, batch_index: usize) -> Result<ArrayView3<'a, f32>> {
  tensor
    .index_axis(Axis(0), batch_index)
    .into_dimensionality::<Ix3>()
    .map_err(|_| DetectError::shape_mismatch("距离检测层输出", &[0, 0, 0], tensor.shape()))
}

impl HeadDecoder for DistanceGridHead {
  fn name(&self) -> &str {
    "distance-grid"
  }

  fn decode_into(
    &self,
    outputs: &[Tensor],
    batch_index: usize,
    metadata: &ModelMetadata,
    sink: &mut CandidateSink,
  ) -> Result<()> {
    let expected_outputs = self.strides.len() * 2;
    if outputs.len() != expected_outputs {
      error!(
        "预期模型输出数量为 {}, 实际为 {}",
        expected_outputs,
        outputs.len()
      );
      return Err(DetectError::contract(format!(
        "预期模型输出数量为 {}, 实际为 {}",
        expected_outputs,
        outputs.len()
      )));
    }

    let num_classes = metadata.class_names.len();
    let mut scores = vec![0.0f32; num_classes];
    let mut cell_offset = 0usize;

    for (head_idx, &stride) in self.strides.iter().enumerate() {
      let tensor1 = &outputs[head_idx * 2];
      let tensor2 = &outputs[head_idx * 2 + 1];
      let batch = tensor1.shape()[0];
      expect_rank_batch(tensor1, 4, batch, "距离检测层输出")?;
      expect_rank_batch(tensor2, 4, batch, "距离检测层输出")?;

      let (reg, cls) = match match_reg_cls_tensors(tensor1, tensor2, num_classes, head_idx) {
        Some(tensors) => tensors,
        None => {
          error!(
            "检测头 {}: 输出形状不匹配 - 张量1: {:?}, 张量2: {:?}, 类别数: {}",
            head_idx,
            tensor1.shape(),
            tensor2.shape(),
            num_classes
          );
          // 一个是 4 通道回归，另一个通道数与类别数不同
          let other = if tensor1.shape()[1] == REG_CHANNELS {
            Some(tensor2)
          } else if tensor2.shape()[1] == REG_CHANNELS {
            Some(tensor1)
          } else {
            None
          };
          return Err(match other {
            Some(cls) if cls.shape()[2..] == tensor1.shape()[2..] && cls.shape()[2..] == tensor2.shape()[2..] => {
              DetectError::contract(format!(
                "检测头 {} 的类别维度为 {}, 类别名称有 {} 个",
                head_idx,
                cls.shape()[1],
                num_classes
              ))
            }
            _ => DetectError::shape_mismatch(
              format!("检测头 {}", head_idx),
              &[batch, REG_CHANNELS, tensor1.shape()[2], tensor1.shape()[3]],
              tensor2.shape(),
            ),
          });
        }
      };

      let reg = batch_view(reg, batch_index)?;
      let cls = batch_view(cls, batch_index)?;
      let (map_h, map_w) = (reg.shape()[1], reg.shape()[2]);
      debug!(
        "检测头 {}: 空间大小={}x{}, 步长={}",
        head_idx, map_h, map_w, stride
      );

      for h in 0..map_h {
        for w in 0..map_w {
          for (c, score) in scores.iter_mut().enumerate() {
            *score = self.class_activation.apply(cls[[c, h, w]]);
          }

          let cell = cell_offset + h * map_w + w;
          sink.offer(cell, 1.0, &scores, || {
            let grid_x = (w as f32) + 0.5;
            let grid_y = (h as f32) + 0.5;

            let xmin = (grid_x - reg[[0, h, w]]) * stride;
            let ymin = (grid_y - reg[[1, h, w]]) * stride;
            let xmax = (grid_x + reg[[2, h, w]]) * stride;
            let ymax = (grid_y + reg[[3, h, w]]) * stride;

            [
              (xmin + xmax) / 2.0,
              (ymin + ymax) / 2.0,
              xmax - xmin,
              ymax - ymin,
            ]
          });
        }
      }

      cell_offset += map_h * map_w;
    }

    Ok(())
  }
}
