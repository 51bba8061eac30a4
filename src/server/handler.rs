// 该文件是 Guanfeng （观风） 项目的一部分。
// src/server/handler.rs - 单连接处理循环
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

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
  WebSocketStream,
  tungstenite::{self, Message, protocol::WebSocketConfig},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  input::FrameDecoder,
  model::Detector,
  pipeline::{Pipeline, ProcessError},
  protocol::Response,
  server::registry::ConnectionGuard,
};

/// 连接结束的原因
#[derive(Debug)]
enum Closed {
  Peer,
  Shutdown,
  Internal,
  Transport(tungstenite::Error),
}

/// 驱动一个连接：读一帧、处理、回一条应答，直到连接关闭
///
/// 一帧的应答写完之前不会读取下一帧。`guard` 在函数返回时注销连接。
pub(crate) async fn handle_connection<D: Detector, F: FrameDecoder>(
  stream: TcpStream,
  guard: ConnectionGuard,
  pipeline: Pipeline<D, F>,
  ws_config: WebSocketConfig,
  shutdown: CancellationToken,
) {
  let peer = guard.peer();

  let handshake = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config));
  let mut ws = tokio::select! {
    _ = shutdown.cancelled() => {
      debug!("握手期间服务关闭: {}", peer);
      return;
    }
    ws = handshake => match ws {
      Ok(ws) => ws,
      Err(e) => {
        warn!("WebSocket 握手失败 ({}): {}", peer, e);
        return;
      }
    },
  };
  info!("客户端已连接: {} (#{})", peer, guard.id());

  let mut frames = 0u64;
  let closed = serve_frames(&mut ws, &pipeline, &shutdown, &mut frames).await;

  let lifetime = Utc::now() - guard.info().connected_at;
  match closed {
    Closed::Peer | Closed::Shutdown | Closed::Internal => {
      if let Err(e) = ws.close(None).await {
        debug!("关闭连接失败 ({}): {}", peer, e);
      }
    }
    Closed::Transport(tungstenite::Error::Capacity(e)) => {
      warn!("消息超出大小限制, 断开 {}: {}", peer, e);
    }
    Closed::Transport(e) => {
      warn!("连接异常 ({}): {}", peer, e);
    }
  }
  info!(
    "客户端断开: {} (#{}), 持续 {:.3}s, 处理 {} 帧",
    peer,
    guard.id(),
    lifetime.num_milliseconds() as f64 / 1000.0,
    frames
  );
}

async fn serve_frames<D: Detector, F: FrameDecoder>(
  ws: &mut WebSocketStream<TcpStream>,
  pipeline: &Pipeline<D, F>,
  shutdown: &CancellationToken,
  frames: &mut u64,
) -> Closed {
  loop {
    // 只在两帧之间响应关闭信号，处理中的帧总会得到应答
    let message = tokio::select! {
      biased;
      _ = shutdown.cancelled() => return Closed::Shutdown,
      message = ws.next() => message,
    };

    let outcome = match message {
      None => return Closed::Peer,
      Some(Err(e)) => return classify(e),
      Some(Ok(Message::Binary(frame))) => pipeline.process(frame).await,
      Some(Ok(Message::Text(_))) => Err(ProcessError::NotBinary),
      Some(Ok(Message::Close(frame))) => {
        debug!("收到关闭帧: {:?}", frame);
        return Closed::Peer;
      }
      // ping/pong 由协议层自动处理
      Some(Ok(_)) => continue,
    };
    *frames += 1;

    let response = match outcome {
      Ok(detected) => Response::from(detected),
      Err(e) => {
        warn!("处理帧失败: {}", e);
        Response::from(e)
      }
    };

    let text = match response.to_json() {
      Ok(text) => text,
      Err(e) => {
        error!("应答序列化失败: {}", e);
        return Closed::Internal;
      }
    };

    if let Err(e) = ws.send(Message::Text(text)).await {
      return classify(e);
    }
  }
}

/// 对端断开不算错误
fn classify(err: tungstenite::Error) -> Closed {
  use tungstenite::error::ProtocolError;

  match err {
    tungstenite::Error::ConnectionClosed
    | tungstenite::Error::AlreadyClosed
    | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Closed::Peer,
    tungstenite::Error::Io(ref e)
      if matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
      ) =>
    {
      Closed::Peer
    }
    e => Closed::Transport(e),
  }
}
