// 该文件是 Guanfeng （观风） 项目的一部分。
// src/input.rs - 帧解码输入
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

use crate::frame::DecodedFrame;

mod image_decoder;
pub use self::image_decoder::{DecodeError, ImageDecoder};

/// 把一帧编码后的字节解码为像素缓冲区
///
/// 解码在阻塞线程池中执行，实现必须可以跨线程共享。
pub trait FrameDecoder: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn decode(&self, bytes: &[u8]) -> Result<DecodedFrame, Self::Error>;
}
