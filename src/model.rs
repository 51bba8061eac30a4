// 该文件是 Guanfeng （观风） 项目的一部分。
// src/model.rs - 检测模型
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

use crate::frame::{ChannelOrder, DecodedFrame};

mod labels;
pub use self::labels::COCO_LABELS;

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error};

pub const UNKNOWN_LABEL: &str = "unknown";

/// 目标检测器
///
/// 所有连接共享同一个实例，`infer` 会在阻塞线程池中被并发调用。
/// 不可重入的后端需要自行加锁，或者把推理工作者数量设为 1。
pub trait Detector: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(&self, frame: &DecodedFrame) -> Result<DetectResult, Self::Error>;

  /// 类别索引到名称的映射表
  fn labels(&self) -> &[&str];

  /// 模型期望的输入通道顺序
  fn channel_order(&self) -> ChannelOrder {
    ChannelOrder::Rgb
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，归一化坐标
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectItem> {
    self.items.iter()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 越界的类别索引映射为 `unknown`
pub fn label_of<'a>(labels: &[&'a str], class_id: u32) -> &'a str {
  labels
    .get(class_id as usize)
    .copied()
    .unwrap_or(UNKNOWN_LABEL)
}
