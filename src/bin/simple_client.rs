// 该文件是 Guanfeng （观风） 项目的一部分。
// src/bin/simple_client.rs - 发送图片并打印检测结果
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use guanfeng::protocol::Response;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::info;
use url::Url;

/// 向检测服务发送图片文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 服务地址
  #[arg(long, default_value = "ws://127.0.0.1:8765", value_name = "SERVER")]
  pub server: Url,
  /// 图片文件，可重复指定，按顺序发送
  #[arg(long, value_name = "IMAGE", required = true)]
  pub input: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("服务地址: {}", args.server);

  let (mut ws, _response) = connect_async(args.server.as_str())
    .await
    .with_context(|| format!("无法连接到 {}", args.server))?;

  for path in &args.input {
    let bytes = std::fs::read(path).with_context(|| format!("无法读取 {}", path.display()))?;
    info!("发送 {} ({} 字节)", path.display(), bytes.len());
    ws.send(Message::Binary(bytes)).await.context("发送失败")?;

    // 服务端每帧只回一条文本应答
    let text = loop {
      match ws.next().await {
        Some(Ok(Message::Text(text))) => break text,
        Some(Ok(Message::Close(frame))) => return Err(anyhow!("服务端关闭连接: {:?}", frame)),
        Some(Ok(_)) => continue,
        Some(Err(e)) => return Err(e).context("接收失败"),
        None => return Err(anyhow!("连接已断开")),
      }
    };

    let response: Response = serde_json::from_str(&text).context("应答格式无效")?;
    match response.inference_time {
      Some(elapsed) => info!(
        "{}: {} 个对象, 耗时 {:.3}s",
        path.display(),
        response.detections.len(),
        elapsed
      ),
      None => info!(
        "{}: 处理失败: {}",
        path.display(),
        response.message.as_deref().unwrap_or_default()
      ),
    }
    println!("{}", text);
  }

  ws.close(None).await.context("关闭连接失败")?;
  Ok(())
}
