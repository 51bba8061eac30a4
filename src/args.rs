// 该文件是 Guanfeng （观风） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::Parser;
use guanfeng::{
  FromUrl,
  config::{ConfigError, ServerConfig},
};
use url::Url;

/// Guanfeng 检测服务参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址
  /// 支持格式:
  /// - yolo26:///path/to/model.rknn?threshold=0.5
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 监听地址，可附带 max_message_size 与 workers 参数
  #[arg(long, default_value = "ws://0.0.0.0:8765", value_name = "LISTEN")]
  pub listen: Url,

  /// 覆盖监听端口
  #[arg(long, value_name = "PORT")]
  pub port: Option<u16>,

  /// 覆盖单条消息的最大字节数
  #[arg(long, value_name = "BYTES")]
  pub max_message_size: Option<usize>,

  /// 覆盖推理工作者数量（不可重入的模型应设为 1）
  #[arg(long, value_name = "COUNT")]
  pub workers: Option<usize>,
}

impl Args {
  pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::from_url(&self.listen)?;
    if let Some(port) = self.port {
      config = config.with_port(port);
    }
    if let Some(max_message_size) = self.max_message_size {
      config = config.with_max_message_size(max_message_size);
    }
    if let Some(workers) = self.workers {
      config = config.with_inference_workers(workers);
    }
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_override_listen_url() {
    let args = Args::parse_from([
      "guanfeng",
      "--model",
      "yolo26:///models/yolo26n.rknn",
      "--listen",
      "ws://127.0.0.1:9000?workers=4",
      "--port",
      "9100",
      "--workers",
      "1",
    ]);
    let config = args.server_config().unwrap();
    assert_eq!(config.socket_addr().to_string(), "127.0.0.1:9100");
    assert_eq!(config.inference_workers, 1);
  }

  #[test]
  fn defaults_follow_server_config() {
    let args = Args::parse_from(["guanfeng", "--model", "yolo26:///models/yolo26n.rknn"]);
    let config = args.server_config().unwrap();
    assert_eq!(config.socket_addr().to_string(), "0.0.0.0:8765");
    assert_eq!(config.max_message_size, 10 * 1024 * 1024);
  }
}
