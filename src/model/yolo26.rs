// 该文件是 Guanfeng （观风） 项目的一部分。
// src/model/yolo26.rs - YOLO26 RKNPU 检测后端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Mutex;

use image::imageops::{self, FilterType};
use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{ChannelOrder, DecodedFrame},
  model::{COCO_LABELS, DetectItem, DetectResult, Detector},
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_W: f32 = 640.0;
const YOLO26_INPUT_H: f32 = 640.0;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
const YOLO26_OBJECT_THRESH: f32 = 0.5;

#[derive(Error, Debug)]
pub enum Yolo26Error {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("推理上下文已损坏")]
  ContextPoisoned,
}

impl Yolo26Error {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    Yolo26Error::ModelInvalid(msg.to_string(), e)
  }
}

/// RKNN 上下文不可重入，推理时独占
pub struct Yolo26 {
  context: Mutex<Context>,
  threshold: f32,
}

pub struct Yolo26Builder {
  model_path: String,
  flags: InitFlags,
  threshold: f32,
}

impl FromUrlWithScheme for Yolo26Builder {
  const SCHEME: &'static str = "yolo26";
}

/// `yolo26:///path/to/model.rknn?threshold=0.4`
impl FromUrl for Yolo26Builder {
  type Error = Yolo26Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolo26Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut threshold = YOLO26_OBJECT_THRESH;
    for (key, value) in url.query_pairs() {
      if key == "threshold" {
        threshold = value
          .parse()
          .map_err(|_| Yolo26Error::ModelPathError(format!("置信度阈值无效: {}", value)))?;
      }
    }

    Ok(Yolo26Builder {
      model_path: url.path().to_string(),
      flags: InitFlags::default(),
      threshold,
    })
  }
}

impl Yolo26Builder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn build(self) -> Result<Yolo26, Yolo26Error> {
    info!("加载模型文件: {}", self.model_path);
    let mode_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      mode_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&mode_data, self.flags)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(Yolo26Error::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(Yolo26Error::invalid(&msg, rknpu::Error::InvalidModel));
    }

    info!("模型加载完成, 置信度阈值: {}", self.threshold);
    Ok(Yolo26 {
      context: Mutex::new(context),
      threshold: self.threshold,
    })
  }
}

impl Detector for Yolo26 {
  type Error = Yolo26Error;

  fn infer(&self, frame: &DecodedFrame) -> Result<DetectResult, Self::Error> {
    // 整幅拉伸到模型输入尺寸，归一化坐标可直接对应原图
    let resized = imageops::resize(
      frame.pixels(),
      YOLO26_INPUT_W as u32,
      YOLO26_INPUT_H as u32,
      FilterType::Triangle,
    );

    let context = self
      .context
      .lock()
      .map_err(|_| Yolo26Error::ContextPoisoned)?;

    debug!("设置模型输入");
    context.set_input(0, resized.as_raw(), TensorFormat::NHWC, TensorType::UInt8)?;

    debug!("执行模型推理");
    context.run()?;

    let output = context.get_outputs()?;
    Ok(postprocess(output, self.threshold))
  }

  fn labels(&self) -> &[&str] {
    &COCO_LABELS
  }

  fn channel_order(&self) -> ChannelOrder {
    ChannelOrder::Rgb
  }
}

/// 根据张量大小区分回归和分类输出，返回 (reg, cls)
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

fn postprocess(output: rknpu::Output, threshold: f32) -> DetectResult {
  let mut items = Vec::new();

  for (head_idx, (&(map_h, map_w), stride)) in
    YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
  {
    let spatial = map_h * map_w;
    let reg_expected = 4 * spatial;
    let cls_expected = YOLO26_CLASS_NUM * spatial;

    // RKNN 输出顺序不固定，每个检测头占两个输出
    let (tensor1, tensor2) = match (output.get_f32(head_idx * 2), output.get_f32(head_idx * 2 + 1)) {
      (Ok(t1), Ok(t2)) => (t1, t2),
      (Err(e), _) | (_, Err(e)) => {
        error!("获取检测头 {} 的输出失败: {}", head_idx, e);
        continue;
      }
    };

    let Some((reg, cls)) = match_reg_cls_tensors(tensor1, tensor2, reg_expected, cls_expected)
    else {
      error!(
        "检测头 {}: 输出大小不匹配 - {} / {}, 期望回归 {}, 期望分类 {}",
        head_idx,
        tensor1.len(),
        tensor2.len(),
        reg_expected,
        cls_expected
      );
      continue;
    };

    for h in 0..map_h {
      for w in 0..map_w {
        let idx = h * map_w + w;

        let (score, class_id) = {
          let mut max_logit = f32::MIN;
          let mut cls_idx = 0usize;
          for c in 0..YOLO26_CLASS_NUM {
            let logit = cls[c * spatial + idx];
            if logit > max_logit {
              max_logit = logit;
              cls_idx = c;
            }
          }
          (sigmoid(max_logit), cls_idx as u32)
        };

        if score <= threshold {
          continue;
        }

        let grid_x = (w as f32) + 0.5;
        let grid_y = (h as f32) + 0.5;

        let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
        let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);
        let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
        let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);

        items.push(DetectItem {
          class_id,
          score,
          bbox: [
            xmin / YOLO26_INPUT_W,
            ymin / YOLO26_INPUT_H,
            xmax / YOLO26_INPUT_W,
            ymax / YOLO26_INPUT_H,
          ],
        });
      }
    }
  }

  debug!("检测到 {} 个物体", items.len());
  DetectResult::from(items)
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_reads_path_and_threshold() {
    let url = Url::parse("yolo26:///opt/models/yolo26n.rknn?threshold=0.3").unwrap();
    let builder = Yolo26Builder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, "/opt/models/yolo26n.rknn");
    assert_eq!(builder.threshold, 0.3);
  }

  #[test]
  fn builder_rejects_other_schemes() {
    let url = Url::parse("onnx:///opt/models/yolo.onnx").unwrap();
    assert!(Yolo26Builder::from_url(&url).is_err());
  }

  #[test]
  fn tensors_matched_by_size_in_either_order() {
    let reg = vec![0.0; 4];
    let cls = vec![0.0; 80];
    assert!(match_reg_cls_tensors(&reg, &cls, 4, 80).is_some());
    let (r, c) = match_reg_cls_tensors(&cls, &reg, 4, 80).unwrap();
    assert_eq!((r.len(), c.len()), (4, 80));
    assert!(match_reg_cls_tensors(&reg, &reg, 4, 80).is_none());
  }
}
