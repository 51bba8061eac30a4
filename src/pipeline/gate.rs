// 该文件是 Guanfeng （观风） 项目的一部分。
// src/pipeline/gate.rs - 推理工作者闸门
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

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Error, Debug)]
pub enum GateError {
  #[error("inference gate closed")]
  Closed,
  #[error("inference worker panicked: {0}")]
  Panicked(String),
  #[error("inference worker cancelled")]
  Cancelled,
}

impl From<tokio::task::JoinError> for GateError {
  fn from(err: tokio::task::JoinError) -> Self {
    if err.is_panic() {
      let payload = err.into_panic();
      let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
      GateError::Panicked(message)
    } else {
      GateError::Cancelled
    }
  }
}

/// 把阻塞的解码和推理放到阻塞线程池执行，并限制同时运行的数量
///
/// 许可随任务一起移入工作线程，调用方放弃等待时许可也要等任务真正结束才归还。
#[derive(Debug, Clone)]
pub struct InferenceGate {
  permits: Arc<Semaphore>,
  workers: usize,
}

impl InferenceGate {
  pub fn new(workers: usize) -> Self {
    let workers = workers.max(1);
    Self {
      permits: Arc::new(Semaphore::new(workers)),
      workers,
    }
  }

  pub fn workers(&self) -> usize {
    self.workers
  }

  pub fn available(&self) -> usize {
    self.permits.available_permits()
  }

  pub async fn run<F, T>(&self, job: F) -> Result<T, GateError>
  where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
  {
    let permit = Arc::clone(&self.permits)
      .acquire_owned()
      .await
      .map_err(|_| GateError::Closed)?;
    debug!("获得推理许可, 剩余 {}", self.permits.available_permits());

    let output = tokio::task::spawn_blocking(move || {
      let _permit = permit;
      job()
    })
    .await?;
    Ok(output)
  }
}
