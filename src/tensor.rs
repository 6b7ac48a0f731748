// 该文件是 Shanan DNN 项目的一部分。
// src/tensor.rs - 张量形状与平面布局定义
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

use std::fmt;

pub const RGB_CHANNELS: usize = 3;

/// 张量形状（不含批次维度）
///
/// - 检测/特征模型输入: `[channels, height, width]`
/// - 检测模型输出: `[attributes, candidates]`
/// - 特征模型输出: `[embedding_dim]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorShape {
  dims: Box<[usize]>,
}

impl TensorShape {
  pub fn new(dims: impl Into<Box<[usize]>>) -> Self {
    Self { dims: dims.into() }
  }

  pub fn dims(&self) -> &[usize] {
    &self.dims
  }

  pub fn rank(&self) -> usize {
    self.dims.len()
  }

  pub fn dim(&self, index: usize) -> Option<usize> {
    self.dims.get(index).copied()
  }

  /// 单个样本的元素数量
  pub fn volume(&self) -> usize {
    self.dims.iter().product()
  }
}

impl From<Vec<usize>> for TensorShape {
  fn from(dims: Vec<usize>) -> Self {
    Self::new(dims)
  }
}

impl<const N: usize> From<[usize; N]> for TensorShape {
  fn from(dims: [usize; N]) -> Self {
    Self::new(dims.to_vec())
  }
}

impl fmt::Display for TensorShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self.dims)
  }
}

/// 模型输入尺寸，`[channels, height, width]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputDims {
  pub channels: usize,
  pub height: usize,
  pub width: usize,
}

impl InputDims {
  pub fn from_shape(shape: &TensorShape) -> Option<Self> {
    match shape.dims() {
      &[channels, height, width] => Some(Self {
        channels,
        height,
        width,
      }),
      _ => None,
    }
  }

  pub fn plane_len(&self) -> usize {
    self.height * self.width
  }
}

/// 按通道平面（NCHW）排列的 f32 输入张量
///
/// 第 `b` 张图像第 `c` 个通道的平面起点为
/// `(b * channels + c) * height * width`，平面内按行优先存储。
#[derive(Debug, Clone, PartialEq)]
pub struct PackedTensor {
  data: Vec<f32>,
  batch: usize,
  channels: usize,
  height: usize,
  width: usize,
}

impl PackedTensor {
  pub fn zeros(batch: usize, channels: usize, height: usize, width: usize) -> Self {
    Self {
      data: vec![0.0; batch * channels * height * width],
      batch,
      channels,
      height,
      width,
    }
  }

  pub fn batch(&self) -> usize {
    self.batch
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  /// `[batch, channels, height, width]`
  pub fn shape(&self) -> [usize; 4] {
    [self.batch, self.channels, self.height, self.width]
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  fn plane_range(&self, batch: usize, channel: usize) -> std::ops::Range<usize> {
    assert!(
      batch < self.batch && channel < self.channels,
      "平面索引越界: ({}, {}) 超出 ({}, {})",
      batch,
      channel,
      self.batch,
      self.channels
    );
    let plane = self.height * self.width;
    let start = (batch * self.channels + channel) * plane;
    start..start + plane
  }

  pub fn plane(&self, batch: usize, channel: usize) -> &[f32] {
    let range = self.plane_range(batch, channel);
    &self.data[range]
  }

  pub fn plane_mut(&mut self, batch: usize, channel: usize) -> &mut [f32] {
    let range = self.plane_range(batch, channel);
    &mut self.data[range]
  }

  pub fn into_inner(self) -> Vec<f32> {
    self.data
  }
}

impl AsRef<[f32]> for PackedTensor {
  fn as_ref(&self) -> &[f32] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_plane_offsets() {
    let mut tensor = PackedTensor::zeros(2, 3, 2, 2);
    assert_eq!(tensor.len(), 2 * 3 * 2 * 2);

    tensor.plane_mut(1, 2).fill(7.0);
    let data = tensor.as_ref();
    assert!(data[..20].iter().all(|&v| v == 0.0));
    assert!(data[20..24].iter().all(|&v| v == 7.0));
  }

  #[test]
  fn test_input_dims_from_shape() {
    let dims = InputDims::from_shape(&TensorShape::from([3, 480, 640])).unwrap();
    assert_eq!(dims.channels, 3);
    assert_eq!(dims.height, 480);
    assert_eq!(dims.width, 640);
    assert_eq!(dims.plane_len(), 480 * 640);

    assert!(InputDims::from_shape(&TensorShape::from([5, 8400])).is_none());
  }

  #[test]
  #[should_panic]
  fn test_plane_out_of_bounds() {
    let tensor = PackedTensor::zeros(1, 3, 2, 2);
    let _ = tensor.plane(1, 0);
  }
}
