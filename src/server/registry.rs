// 该文件是 Guanfeng （观风） 项目的一部分。
// src/server/registry.rs - 活动连接登记表
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
  collections::HashMap,
  net::SocketAddr,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
  pub id: ConnectionId,
  pub peer: SocketAddr,
  pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
  connections: Mutex<HashMap<ConnectionId, ConnectionInfo>>,
  next_id: AtomicU64,
  count: watch::Sender<usize>,
}

/// 只做记账，不持有连接本身
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
  inner: Arc<Inner>,
}

impl Default for ConnectionRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl ConnectionRegistry {
  pub fn new() -> Self {
    let (count, _) = watch::channel(0);
    Self {
      inner: Arc::new(Inner {
        connections: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        count,
      }),
    }
  }

  /// 登记一个新连接；返回的守卫被丢弃时注销
  pub fn register(&self, peer: SocketAddr) -> ConnectionGuard {
    let info = ConnectionInfo {
      id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
      peer,
      connected_at: Utc::now(),
    };

    let mut connections = self.lock();
    connections.insert(info.id, info.clone());
    self.inner.count.send_replace(connections.len());
    drop(connections);

    debug!("登记连接 #{} ({})", info.id, peer);
    ConnectionGuard {
      registry: self.clone(),
      info,
    }
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(&self, id: ConnectionId) -> bool {
    self.lock().contains_key(&id)
  }

  /// 按登记顺序返回当前连接
  pub fn snapshot(&self) -> Vec<ConnectionInfo> {
    let mut connections: Vec<_> = self.lock().values().cloned().collect();
    connections.sort_by_key(|info| info.id);
    connections
  }

  /// 订阅活动连接数的变化
  pub fn subscribe(&self) -> watch::Receiver<usize> {
    self.inner.count.subscribe()
  }

  fn deregister(&self, id: ConnectionId) -> Option<ConnectionInfo> {
    let mut connections = self.lock();
    let removed = connections.remove(&id);
    self.inner.count.send_replace(connections.len());
    removed
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, ConnectionInfo>> {
    self
      .inner
      .connections
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

/// 连接处理期间一直持有；无论从哪条路径退出都只注销一次
#[derive(Debug)]
pub struct ConnectionGuard {
  registry: ConnectionRegistry,
  info: ConnectionInfo,
}

impl ConnectionGuard {
  pub fn info(&self) -> &ConnectionInfo {
    &self.info
  }

  pub fn id(&self) -> ConnectionId {
    self.info.id
  }

  pub fn peer(&self) -> SocketAddr {
    self.info.peer
  }
}

impl Drop for ConnectionGuard {
  fn drop(&mut self) {
    if self.registry.deregister(self.info.id).is_some() {
      debug!("注销连接 #{} ({})", self.info.id, self.info.peer);
    }
  }
}
