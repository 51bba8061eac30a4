// 该文件是 Guanfeng （观风） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::{thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use guanfeng::config::ServerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();
  let config = args.server_config().context("监听参数无效")?;

  info!("Guanfeng 检测服务");
  info!("模型地址: {}", args.model);
  info!("监听地址: ws://{}", config.socket_addr());
  info!("最大消息: {} 字节", config.max_message_size);
  info!("推理工作者: {}", config.inference_workers);

  let shutdown = CancellationToken::new();
  {
    let shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      shutdown.cancel();
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .context("无法设置 Ctrl-C 处理")?;
  }

  serve(&args.model, config, shutdown).await
}

#[cfg(feature = "model_yolo26")]
async fn serve(model: &Url, config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
  use guanfeng::{
    FromUrl, FromUrlWithScheme, input::ImageDecoder, model::Yolo26Builder, server,
  };

  if model.scheme() != Yolo26Builder::SCHEME {
    anyhow::bail!("不支持的模型方案: {}", model.scheme());
  }

  info!("正在加载模型...");
  let detector = Yolo26Builder::from_url(model)?.build()?;
  server::start(config, detector, ImageDecoder, shutdown).await?;
  Ok(())
}

#[cfg(not(feature = "model_yolo26"))]
async fn serve(model: &Url, _config: ServerConfig, _shutdown: CancellationToken) -> Result<()> {
  anyhow::bail!(
    "未启用任何模型后端, 无法加载 {}; 请使用 --features model_yolo26 重新编译",
    model
  )
}
