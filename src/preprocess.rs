// 该文件是 Shanan DNN 项目的一部分。
// src/preprocess.rs - 图像预处理：缩放、信箱填充与张量打包
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

use image::{Rgb, RgbImage, imageops};
use thiserror::Error;
use tracing::{debug, trace};

use crate::tensor::{PackedTensor, RGB_CHANNELS};

/// 信箱填充颜色（中灰）
pub const LETTERBOX_FILL: u8 = 114;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreprocessError {
  #[error("前置条件不满足: {0}")]
  PreconditionViolation(String),
}

impl PreprocessError {
  pub fn violation(msg: impl Into<String>) -> Self {
    PreprocessError::PreconditionViolation(msg.into())
  }
}

/// 张量打包参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobOptions {
  /// 每个输出通道的标准差
  pub std: [f32; 3],
  /// 每个输出通道的均值
  pub mean: [f32; 3],
  /// 是否交换红蓝通道
  pub swap_rb: bool,
  /// 是否先乘以 1/255
  pub normalize: bool,
}

impl Default for BlobOptions {
  fn default() -> Self {
    Self {
      std: [1.0; 3],
      mean: [0.0; 3],
      swap_rb: true,
      normalize: true,
    }
  }
}

impl BlobOptions {
  pub fn with_std_mean(std: [f32; 3], mean: [f32; 3]) -> Self {
    Self {
      std,
      mean,
      ..Self::default()
    }
  }
}

/// 信箱变换的几何参数，预处理与解码必须使用同一份
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxGeometry {
  pub scale: f32,
  pub src_width: u32,
  pub src_height: u32,
  pub resized_width: u32,
  pub resized_height: u32,
  pub left: u32,
  pub top: u32,
  pub right: u32,
  pub bottom: u32,
}

impl LetterboxGeometry {
  pub fn compute(
    src_width: u32,
    src_height: u32,
    target_width: u32,
    target_height: u32,
  ) -> Result<Self, PreprocessError> {
    if src_width == 0 || src_height == 0 {
      return Err(PreprocessError::violation(format!(
        "源图像尺寸无效: {}x{}",
        src_width, src_height
      )));
    }
    if target_width == 0 || target_height == 0 {
      return Err(PreprocessError::violation(format!(
        "目标尺寸无效: {}x{}",
        target_width, target_height
      )));
    }

    let scale = (target_width as f32 / src_width as f32)
      .min(target_height as f32 / src_height as f32);
    let resized_width = ((src_width as f32 * scale).round() as u32).clamp(1, target_width);
    let resized_height = ((src_height as f32 * scale).round() as u32).clamp(1, target_height);

    let (left, right) = split_padding(target_width - resized_width);
    let (top, bottom) = split_padding(target_height - resized_height);

    Ok(Self {
      scale,
      src_width,
      src_height,
      resized_width,
      resized_height,
      left,
      top,
      right,
      bottom,
    })
  }

  pub fn target_width(&self) -> u32 {
    self.left + self.resized_width + self.right
  }

  pub fn target_height(&self) -> u32 {
    self.top + self.resized_height + self.bottom
  }

  pub fn pad_x(&self) -> f32 {
    self.left as f32
  }

  pub fn pad_y(&self) -> f32 {
    self.top as f32
  }

  /// 将模型输入坐标映射回原图坐标（未裁剪）
  pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
    ((x - self.pad_x()) / self.scale, (y - self.pad_y()) / self.scale)
  }

  /// 将原图坐标映射到模型输入坐标
  pub fn to_input(&self, x: f32, y: f32) -> (f32, f32) {
    (x * self.scale + self.pad_x(), y * self.scale + self.pad_y())
  }
}

// 奇数像素时右/下侧多一像素
fn split_padding(total: u32) -> (u32, u32) {
  let half = total as f32 / 2.0;
  let before = (half - 0.1).round().max(0.0) as u32;
  let after = (half + 0.1).round().max(0.0) as u32;
  (before, after)
}

/// 计算几何参数并对图像进行信箱变换
pub fn letterbox(
  image: &RgbImage,
  target_width: u32,
  target_height: u32,
) -> Result<(RgbImage, LetterboxGeometry), PreprocessError> {
  let geometry =
    LetterboxGeometry::compute(image.width(), image.height(), target_width, target_height)?;
  let output = letterbox_with(image, &geometry)?;
  Ok((output, geometry))
}

/// 使用已有的几何参数进行信箱变换，图像尺寸必须与几何参数的源尺寸一致
pub fn letterbox_with(
  image: &RgbImage,
  geometry: &LetterboxGeometry,
) -> Result<RgbImage, PreprocessError> {
  if image.dimensions() != (geometry.src_width, geometry.src_height) {
    return Err(PreprocessError::violation(format!(
      "图像尺寸 {}x{} 与信箱参数的源尺寸 {}x{} 不一致",
      image.width(),
      image.height(),
      geometry.src_width,
      geometry.src_height
    )));
  }

  trace!(
    "信箱变换: {}x{} -> {}x{}, 缩放 {:.4}, 填充 (l={}, t={}, r={}, b={})",
    geometry.src_width,
    geometry.src_height,
    geometry.target_width(),
    geometry.target_height(),
    geometry.scale,
    geometry.left,
    geometry.top,
    geometry.right,
    geometry.bottom
  );

  let resized = resize_area(image, geometry.resized_width, geometry.resized_height);
  let mut canvas = RgbImage::from_pixel(
    geometry.target_width(),
    geometry.target_height(),
    Rgb([LETTERBOX_FILL; 3]),
  );
  imageops::replace(
    &mut canvas,
    &resized,
    geometry.left as i64,
    geometry.top as i64,
  );
  Ok(canvas)
}

/// 一维覆盖权重：每个目标像素所覆盖的源像素及其占比
fn area_weights(src: u32, dst: u32) -> Vec<Vec<(usize, f32)>> {
  let scale = src as f64 / dst as f64;
  (0..dst)
    .map(|d| {
      let start = d as f64 * scale;
      let end = (start + scale).min(src as f64);
      let first = start.floor() as usize;
      let last = (end.ceil() as usize).min(src as usize);
      (first..last)
        .filter_map(|s| {
          let overlap = end.min((s + 1) as f64) - start.max(s as f64);
          (overlap > 1e-9).then(|| (s, (overlap / scale) as f32))
        })
        .collect()
    })
    .collect()
}

/// 区域平均插值缩放
///
/// 每个目标像素取其在源图像上覆盖区域内像素的加权平均，权重为覆盖长度。
/// 放大时退化为相邻像素的覆盖混合。
pub fn resize_area(image: &RgbImage, width: u32, height: u32) -> RgbImage {
  let (src_width, src_height) = image.dimensions();
  if (src_width, src_height) == (width, height) {
    return image.clone();
  }
  if width == 0 || height == 0 || src_width == 0 || src_height == 0 {
    return RgbImage::new(width, height);
  }

  let x_weights = area_weights(src_width, width);
  let y_weights = area_weights(src_height, height);

  // 先水平后垂直
  let row_len = width as usize * RGB_CHANNELS;
  let mut horizontal = vec![0f32; src_height as usize * row_len];
  for y in 0..src_height {
    let row = &mut horizontal[y as usize * row_len..(y as usize + 1) * row_len];
    for (dx, weights) in x_weights.iter().enumerate() {
      let mut acc = [0f32; RGB_CHANNELS];
      for &(sx, w) in weights {
        let pixel = image.get_pixel(sx as u32, y);
        for c in 0..RGB_CHANNELS {
          acc[c] += pixel[c] as f32 * w;
        }
      }
      row[dx * RGB_CHANNELS..(dx + 1) * RGB_CHANNELS].copy_from_slice(&acc);
    }
  }

  let mut output = RgbImage::new(width, height);
  for (dy, weights) in y_weights.iter().enumerate() {
    for dx in 0..width as usize {
      let mut acc = [0f32; RGB_CHANNELS];
      for &(sy, w) in weights {
        let offset = sy * row_len + dx * RGB_CHANNELS;
        for c in 0..RGB_CHANNELS {
          acc[c] += horizontal[offset + c] * w;
        }
      }
      let pixel = Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8));
      output.put_pixel(dx as u32, dy as u32, pixel);
    }
  }
  output
}

/// 将单张图像打包为平面张量
pub fn blob_from_image(
  image: &RgbImage,
  options: &BlobOptions,
) -> Result<PackedTensor, PreprocessError> {
  blob_from_images(std::slice::from_ref(image), options)
}

/// 将一批同尺寸图像打包为平面张量，逐张按通道平面拼接
pub fn blob_from_images(
  images: &[RgbImage],
  options: &BlobOptions,
) -> Result<PackedTensor, PreprocessError> {
  let first = images
    .first()
    .ok_or_else(|| PreprocessError::violation("批次为空"))?;
  let (width, height) = first.dimensions();

  if let Some((idx, image)) = images
    .iter()
    .enumerate()
    .find(|(_, image)| image.dimensions() != (width, height))
  {
    return Err(PreprocessError::violation(format!(
      "批次中第 {} 张图像尺寸 {}x{} 与首张 {}x{} 不一致",
      idx,
      image.width(),
      image.height(),
      width,
      height
    )));
  }

  if options.std.iter().any(|&s| s == 0.0 || !s.is_finite()) {
    return Err(PreprocessError::violation(format!(
      "标准差必须为非零有限值: {:?}",
      options.std
    )));
  }

  debug!(
    "打包张量: 批次 {}, 尺寸 {}x{}, 交换红蓝 {}, 归一化 {}",
    images.len(),
    width,
    height,
    options.swap_rb,
    options.normalize
  );

  let factor = if options.normalize { 1.0 / 255.0 } else { 1.0 };
  let mut tensor = PackedTensor::zeros(
    images.len(),
    RGB_CHANNELS,
    height as usize,
    width as usize,
  );

  for (b, image) in images.iter().enumerate() {
    for c in 0..RGB_CHANNELS {
      let src_channel = if options.swap_rb { RGB_CHANNELS - 1 - c } else { c };
      let (mean, std) = (options.mean[c], options.std[c]);
      let plane = tensor.plane_mut(b, c);
      for (value, pixel) in plane.iter_mut().zip(image.pixels()) {
        *value = (pixel[src_channel] as f32 * factor - mean) / std;
      }
    }
  }

  Ok(tensor)
}
