// 该文件是 Guanfeng （观风） 项目的一部分。
// src/config.rs - 服务端配置
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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配: 期望 {expected}, 实际 {found}")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("监听地址无效: {0}")]
  InvalidHost(String),
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
}

/// 服务端启动配置，在构造服务时一次性给定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
  /// 监听地址
  pub bind_address: IpAddr,
  /// 监听端口，0 表示由系统分配
  pub port: u16,
  /// 单条消息的最大字节数，超过则在传输层拒绝
  pub max_message_size: usize,
  /// 同时运行的解码/推理任务数
  pub inference_workers: usize,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      port: DEFAULT_PORT,
      max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
      inference_workers: default_inference_workers(),
    }
  }
}

impl ServerConfig {
  pub fn socket_addr(&self) -> SocketAddr {
    SocketAddr::new(self.bind_address, self.port)
  }

  pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
    self.bind_address = bind_address;
    self
  }

  pub fn with_port(mut self, port: u16) -> Self {
    self.port = port;
    self
  }

  pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
    self.max_message_size = max_message_size;
    self
  }

  /// 至少保留一个工作者
  pub fn with_inference_workers(mut self, inference_workers: usize) -> Self {
    self.inference_workers = inference_workers.max(1);
    self
  }
}

pub fn default_inference_workers() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
}

impl FromUrlWithScheme for ServerConfig {
  const SCHEME: &'static str = "ws";
}

/// 解析形如 `ws://0.0.0.0:8765?max_message_size=10485760&workers=2` 的监听地址
impl FromUrl for ServerConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let mut config = ServerConfig::default();

    if let Some(host) = url.host_str() {
      let host = host.trim_start_matches('[').trim_end_matches(']');
      config.bind_address = host
        .parse()
        .map_err(|_| ConfigError::InvalidHost(host.to_string()))?;
    }
    if let Some(port) = url.port() {
      config.port = port;
    }

    for (key, value) in url.query_pairs() {
      let invalid = || ConfigError::InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
      };
      match key.as_ref() {
        "max_message_size" => {
          config.max_message_size = value.parse().map_err(|_| invalid())?;
        }
        "workers" => {
          let workers: usize = value.parse().map_err(|_| invalid())?;
          if workers == 0 {
            return Err(invalid());
          }
          config.inference_workers = workers;
        }
        _ => return Err(invalid()),
      }
    }

    Ok(config)
  }
}
