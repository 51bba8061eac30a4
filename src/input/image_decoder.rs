// 该文件是 Guanfeng （观风） 项目的一部分。
// src/input/image_decoder.rs - 基于 image 库的内存图像解码
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

use std::io::Cursor;

use image::ImageReader;
use thiserror::Error;
use tracing::debug;

use crate::{frame::DecodedFrame, input::FrameDecoder};

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("empty frame")]
  Empty,
  #[error("unrecognized image format: {0}")]
  UnknownFormat(std::io::Error),
  #[error("image decoding error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 按内容猜测格式（JPEG、PNG、BMP、WebP）后解码，输出 RGB 顺序
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageDecoder;

impl FrameDecoder for ImageDecoder {
  type Error = DecodeError;

  fn decode(&self, bytes: &[u8]) -> Result<DecodedFrame, Self::Error> {
    if bytes.is_empty() {
      return Err(DecodeError::Empty);
    }

    let reader = ImageReader::new(Cursor::new(bytes))
      .with_guessed_format()
      .map_err(DecodeError::UnknownFormat)?;
    debug!("帧格式: {:?}, 大小: {} 字节", reader.format(), bytes.len());

    let image = reader.decode()?;
    Ok(DecodedFrame::from(image.into_rgb8()))
  }
}
