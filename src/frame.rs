// 该文件是 Guanfeng （观风） 项目的一部分。
// src/frame.rs - 解码后的 NHWC 帧定义
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

use image::RgbImage;

const RGB_CHANNELS: usize = 3;

/// 像素通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

pub trait AsNhwcFrame {
  fn as_nhwc(&self) -> &[u8];
}

/// 解码后的三通道交错帧，通道顺序由 `order` 指明
#[derive(Debug, Clone)]
pub struct DecodedFrame {
  image: RgbImage,
  order: ChannelOrder,
}

impl From<RgbImage> for DecodedFrame {
  fn from(image: RgbImage) -> Self {
    Self {
      image,
      order: ChannelOrder::Rgb,
    }
  }
}

impl DecodedFrame {
  pub fn height(&self) -> usize {
    self.image.height() as usize
  }

  pub fn width(&self) -> usize {
    self.image.width() as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn order(&self) -> ChannelOrder {
    self.order
  }

  /// 像素缓冲区，`order` 决定每个像素内三个字节的含义
  pub fn pixels(&self) -> &RgbImage {
    &self.image
  }

  /// 转换到目标通道顺序；顺序相同时原样返回
  pub fn into_order(mut self, order: ChannelOrder) -> Self {
    if self.order != order {
      for pixel in self.image.pixels_mut() {
        pixel.0.swap(0, 2);
      }
      self.order = order;
    }
    self
  }
}

impl AsNhwcFrame for DecodedFrame {
  fn as_nhwc(&self) -> &[u8] {
    self.image.as_raw()
  }
}
