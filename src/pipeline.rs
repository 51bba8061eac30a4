// 该文件是 Guanfeng （观风） 项目的一部分。
// src/pipeline.rs - 单帧处理流水线
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

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::info;

use crate::{
  input::FrameDecoder,
  model::Detector,
  protocol::{Detection, Response},
};

mod gate;
pub use self::gate::{GateError, InferenceGate};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 单帧处理失败的原因，只以文本形式出现在应答中
#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("failed to decode frame: {0}")]
  Decode(#[source] BoxError),
  #[error("detection failed: {0}")]
  Detect(#[source] BoxError),
  #[error(transparent)]
  Worker(#[from] GateError),
  #[error("expected a binary image frame, got a text message")]
  NotBinary,
}

/// 一帧的检测结果
#[derive(Debug, Clone)]
pub struct Detected {
  pub detections: Vec<Detection>,
  pub elapsed: Duration,
}

impl From<Detected> for Response {
  fn from(detected: Detected) -> Self {
    Response::success(detected.detections, detected.elapsed.as_secs_f64())
  }
}

impl From<ProcessError> for Response {
  fn from(err: ProcessError) -> Self {
    Response::error(err.to_string())
  }
}

/// 解码、通道转换、推理、结果映射
///
/// 检测器和解码器在所有连接之间共享；阻塞部分经由 [`InferenceGate`] 执行。
pub struct Pipeline<D, F> {
  detector: Arc<D>,
  decoder: Arc<F>,
  gate: InferenceGate,
}

impl<D, F> Clone for Pipeline<D, F> {
  fn clone(&self) -> Self {
    Self {
      detector: Arc::clone(&self.detector),
      decoder: Arc::clone(&self.decoder),
      gate: self.gate.clone(),
    }
  }
}

impl<D: Detector, F: FrameDecoder> Pipeline<D, F> {
  pub fn new(detector: D, decoder: F, workers: usize) -> Self {
    Self {
      detector: Arc::new(detector),
      decoder: Arc::new(decoder),
      gate: InferenceGate::new(workers),
    }
  }

  /// 处理一帧；耗时从开始解码算起，不含排队等待许可的时间
  pub async fn process(&self, frame: Vec<u8>) -> Result<Detected, ProcessError> {
    let detector = Arc::clone(&self.detector);
    let decoder = Arc::clone(&self.decoder);

    let detected = self
      .gate
      .run(move || detect_frame(detector.as_ref(), decoder.as_ref(), &frame))
      .await??;

    if !detected.detections.is_empty() {
      info!(
        "检测到 {} 个对象, 耗时 {:.3}s",
        detected.detections.len(),
        detected.elapsed.as_secs_f64()
      );
    }
    Ok(detected)
  }
}

fn detect_frame<D: Detector, F: FrameDecoder>(
  detector: &D,
  decoder: &F,
  bytes: &[u8],
) -> Result<Detected, ProcessError> {
  let start = Instant::now();

  let frame = decoder
    .decode(bytes)
    .map_err(|e| ProcessError::Decode(Box::new(e)))?
    .into_order(detector.channel_order());

  let result = detector
    .infer(&frame)
    .map_err(|e| ProcessError::Detect(Box::new(e)))?;

  let labels = detector.labels();
  let detections = result
    .iter()
    .map(|item| Detection::from_item(item, labels))
    .collect();

  Ok(Detected {
    detections,
    elapsed: start.elapsed(),
  })
}
