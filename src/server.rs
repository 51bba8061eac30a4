// 该文件是 Guanfeng （观风） 项目的一部分。
// src/server.rs - WebSocket 检测服务
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

use std::{net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{config::ServerConfig, input::FrameDecoder, model::Detector, pipeline::Pipeline};

mod handler;
mod registry;
pub use self::registry::{ConnectionGuard, ConnectionId, ConnectionInfo, ConnectionRegistry};

/// 接受连接出错（如文件描述符耗尽）后的等待时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("无法监听 {addr}: {source}")]
  Bind {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },
  #[error("无法获取监听地址: {0}")]
  LocalAddr(#[source] std::io::Error),
}

/// 已绑定端口、尚未开始接受连接的服务
pub struct Server<D, F> {
  listener: TcpListener,
  pipeline: Pipeline<D, F>,
  registry: ConnectionRegistry,
  ws_config: WebSocketConfig,
}

impl<D: Detector, F: FrameDecoder> Server<D, F> {
  /// 绑定监听地址；失败时直接返回，不会进入接受循环
  pub async fn bind(config: ServerConfig, detector: D, decoder: F) -> Result<Self, ServerError> {
    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|source| ServerError::Bind { addr, source })?;

    // 超过上限的消息在协议层被拒绝，连接随之断开
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);

    let server = Self {
      listener,
      pipeline: Pipeline::new(detector, decoder, config.inference_workers),
      registry: ConnectionRegistry::new(),
      ws_config,
    };
    info!(
      "服务已就绪: ws://{}, 最大消息 {} 字节, 推理工作者 {}",
      server.local_addr()?,
      config.max_message_size,
      config.inference_workers
    );
    Ok(server)
  }

  pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
    self.listener.local_addr().map_err(ServerError::LocalAddr)
  }

  pub fn registry(&self) -> ConnectionRegistry {
    self.registry.clone()
  }

  /// 接受连接直到 `shutdown` 被取消，然后等待所有连接处理结束
  pub async fn run(self, shutdown: CancellationToken) {
    let Self {
      listener,
      pipeline,
      registry,
      ws_config,
    } = self;
    let mut handlers = JoinSet::new();

    loop {
      tokio::select! {
        biased;
        _ = shutdown.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            if let Err(e) = stream.set_nodelay(true) {
              debug!("设置 TCP_NODELAY 失败 ({}): {}", peer, e);
            }
            let guard = registry.register(peer);
            handlers.spawn(handler::handle_connection(
              stream,
              guard,
              pipeline.clone(),
              ws_config,
              shutdown.child_token(),
            ));
          }
          Err(e) => {
            warn!("接受连接失败: {}", e);
            if accept_backoff(&shutdown).await {
              break;
            }
          }
        },
        Some(joined) = handlers.join_next(), if !handlers.is_empty() => reap(joined),
      }
    }

    info!("停止接受新连接, 等待 {} 个连接结束", handlers.len());
    drop(listener);
    while let Some(joined) = handlers.join_next().await {
      reap(joined);
    }
    info!("服务已停止");
  }
}

/// 绑定并运行直到 `shutdown` 被取消
pub async fn start<D: Detector, F: FrameDecoder>(
  config: ServerConfig,
  detector: D,
  decoder: F,
  shutdown: CancellationToken,
) -> Result<(), ServerError> {
  Server::bind(config, detector, decoder)
    .await?
    .run(shutdown)
    .await;
  Ok(())
}

/// 等待 [`ACCEPT_BACKOFF`] 再重试接受；期间收到关闭信号时返回 `true`
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
  tokio::select! {
    _ = shutdown.cancelled() => true,
    _ = tokio::time::sleep(ACCEPT_BACKOFF) => false,
  }
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
  if let Err(e) = joined {
    error!("连接处理任务异常退出: {}", e);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Instant;

  #[tokio::test]
  async fn accept_errors_pause_before_retrying() {
    let shutdown = CancellationToken::new();
    let start = Instant::now();
    assert!(!accept_backoff(&shutdown).await);
    assert!(start.elapsed() >= ACCEPT_BACKOFF);
  }

  #[tokio::test]
  async fn shutdown_interrupts_the_accept_pause() {
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let stopped = tokio::time::timeout(ACCEPT_BACKOFF / 2, accept_backoff(&shutdown))
      .await
      .unwrap();
    assert!(stopped);
  }

  #[tokio::test]
  async fn shutdown_during_the_pause_wakes_it_early() {
    let shutdown = CancellationToken::new();
    let canceller = shutdown.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      canceller.cancel();
    });
    let start = Instant::now();
    assert!(accept_backoff(&shutdown).await);
    assert!(start.elapsed() < ACCEPT_BACKOFF);
  }
}
