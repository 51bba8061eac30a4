// 该文件是 Guanfeng （观风） 项目的一部分。
// src/protocol.rs - 应答报文定义
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

//! 每个二进制请求帧对应一条 JSON 文本应答：
//!
//! ```json
//! {"status":"success","detections":[{"label":"person","confidence":0.91,
//!   "x":0.1,"y":0.2,"width":0.3,"height":0.4}],"inference_time":0.042}
//! {"status":"error","detections":[],"message":"empty frame"}
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{DetectItem, label_of};

/// 单个检测目标，坐标均归一化到 [0, 1]，原点在左上角
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub label: String,
  pub confidence: f32,
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl Detection {
  /// 角点形式转换为左上角加宽高；宽高为负说明上游坐标顺序有误，截断为 0
  ///
  /// 非有限值（NaN、无穷）按 0 处理，JSON 中不会出现 `null`。
  pub fn from_item(item: &DetectItem, labels: &[&str]) -> Self {
    let [x1, y1, x2, y2] = item.bbox;
    Self {
      label: label_of(labels, item.class_id).to_string(),
      confidence: finite_or_zero(item.score).clamp(0.0, 1.0),
      x: finite_or_zero(x1),
      y: finite_or_zero(y1),
      width: finite_or_zero(x2 - x1).max(0.0),
      height: finite_or_zero(y2 - y1).max(0.0),
    }
  }
}

fn finite_or_zero(v: f32) -> f32 {
  if v.is_finite() { v } else { 0.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  Success,
  Error,
}

/// `detections` 总是存在，出错时为空列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub status: Status,
  pub detections: Vec<Detection>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub inference_time: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl Response {
  pub fn success(detections: Vec<Detection>, inference_time: f64) -> Self {
    Self {
      status: Status::Success,
      detections,
      inference_time: Some(inference_time),
      message: None,
    }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self {
      status: Status::Error,
      detections: Vec::new(),
      inference_time: None,
      message: Some(message.into()),
    }
  }

  pub fn is_success(&self) -> bool {
    self.status == Status::Success
  }

  pub fn to_json(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }
}
