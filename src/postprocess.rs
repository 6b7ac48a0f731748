// 该文件是 Shanan DNN 项目的一部分。
// src/postprocess.rs - 检测模型输出解码
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

use thiserror::Error;
use tracing::{debug, error};

use crate::{preprocess::LetterboxGeometry, tensor::TensorShape};

/// 每个候选框的基础属性数: x_center, y_center, width, height, confidence
pub const XYWHS_ATTRIBUTES: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("不支持的检测输出格式: 属性维度为 {attributes}（带类别分数的 xywhsc 格式尚未实现）")]
  UnsupportedOutputFormat { attributes: usize },
  #[error("检测输出形状无效: {0}")]
  InvalidOutputShape(String),
  #[error("输出缓冲区长度不匹配: 期望至少 {expected}, 实际 {actual}")]
  OutputLengthMismatch { expected: usize, actual: usize },
}

/// 检测模型输出编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionFormat {
  /// `{xc, yc, w, h, confidence}`，单类别
  Xywhs,
  /// `{xc, yc, w, h, confidence, class_0, ..}`，暂未实现
  XywhsClasses { num_classes: usize },
}

impl DetectionFormat {
  pub fn from_attributes(attributes: usize) -> Result<Self, DecodeError> {
    match attributes {
      XYWHS_ATTRIBUTES => Ok(DetectionFormat::Xywhs),
      n if n > XYWHS_ATTRIBUTES => Ok(DetectionFormat::XywhsClasses {
        num_classes: n - XYWHS_ATTRIBUTES,
      }),
      n => Err(DecodeError::InvalidOutputShape(format!(
        "属性维度至少为 {}, 实际为 {}",
        XYWHS_ATTRIBUTES, n
      ))),
    }
  }

  pub fn attributes(&self) -> usize {
    match self {
      DetectionFormat::Xywhs => XYWHS_ATTRIBUTES,
      DetectionFormat::XywhsClasses { num_classes } => XYWHS_ATTRIBUTES + num_classes,
    }
  }
}

/// 检测输出布局，`[attributes, candidates]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionLayout {
  pub attributes: usize,
  pub candidates: usize,
}

impl DetectionLayout {
  pub fn from_shape(shape: &TensorShape) -> Result<Self, DecodeError> {
    match shape.dims() {
      &[attributes, candidates] => Ok(Self {
        attributes,
        candidates,
      }),
      dims => Err(DecodeError::InvalidOutputShape(format!(
        "期望 [attributes, candidates], 实际为 {:?}",
        dims
      ))),
    }
  }

  /// 单张图像的输出长度
  pub fn image_len(&self) -> usize {
    self.attributes * self.candidates
  }

  pub fn format(&self) -> Result<DetectionFormat, DecodeError> {
    DetectionFormat::from_attributes(self.attributes)
  }
}

/// 原图坐标系下的整数矩形，`[x1, y1)` 到 `[x2, y2)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundingBox {
  pub x1: i32,
  pub y1: i32,
  pub x2: i32,
  pub y2: i32,
}

impl BoundingBox {
  pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  pub fn width(&self) -> i32 {
    (self.x2 - self.x1).max(0)
  }

  pub fn height(&self) -> i32 {
    (self.y2 - self.y1).max(0)
  }

  pub fn area(&self) -> f32 {
    self.width() as f32 * self.height() as f32
  }
}

/// 解码后、抑制前的候选框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub bbox: BoundingBox,
  pub score: f32,
  /// 在原始输出中的候选索引
  pub index: usize,
}

/// 解码单张图像的检测输出
///
/// `raw` 按 `[attributes][candidates]` 排列，属性 `a` 的第 `i` 个候选位于
/// `a * candidates + i`。
pub fn decode(
  raw: &[f32],
  layout: &DetectionLayout,
  confidence_threshold: f32,
  geometry: &LetterboxGeometry,
  orig_width: u32,
  orig_height: u32,
) -> Result<Vec<Candidate>, DecodeError> {
  match layout.format()? {
    DetectionFormat::Xywhs => {}
    DetectionFormat::XywhsClasses { .. } => {
      error!("不支持的检测输出格式, 属性维度: {}", layout.attributes);
      return Err(DecodeError::UnsupportedOutputFormat {
        attributes: layout.attributes,
      });
    }
  }

  if raw.len() < layout.image_len() {
    return Err(DecodeError::OutputLengthMismatch {
      expected: layout.image_len(),
      actual: raw.len(),
    });
  }

  let n = layout.candidates;
  let (max_x, max_y) = (orig_width as f32, orig_height as f32);
  let mut candidates = Vec::new();

  for i in 0..n {
    let score = raw[4 * n + i];
    if score <= confidence_threshold {
      continue;
    }

    let xc = raw[i];
    let yc = raw[n + i];
    let half_w = raw[2 * n + i] / 2.0;
    let half_h = raw[3 * n + i] / 2.0;

    let (x1, y1) = geometry.to_original(xc - half_w, yc - half_h);
    let (x2, y2) = geometry.to_original(xc + half_w, yc + half_h);

    candidates.push(Candidate {
      bbox: BoundingBox {
        x1: x1.clamp(0.0, max_x).round() as i32,
        y1: y1.clamp(0.0, max_y).round() as i32,
        x2: x2.clamp(0.0, max_x).round() as i32,
        y2: y2.clamp(0.0, max_y).round() as i32,
      },
      score,
      index: i,
    });
  }

  debug!("解码得到 {} 个候选框（共 {} 个）", candidates.len(), n);
  Ok(candidates)
}

/// 按图像切分批次输出并逐张解码
pub fn decode_batch(
  raw: &[f32],
  layout: &DetectionLayout,
  batch_size: usize,
  confidence_threshold: f32,
  geometry: &LetterboxGeometry,
  orig_width: u32,
  orig_height: u32,
) -> Result<Vec<Vec<Candidate>>, DecodeError> {
  let expected = batch_size * layout.image_len();
  if raw.len() < expected {
    return Err(DecodeError::OutputLengthMismatch {
      expected,
      actual: raw.len(),
    });
  }

  (0..batch_size)
    .map(|b| {
      let start = b * layout.image_len();
      decode(
        &raw[start..start + layout.image_len()],
        layout,
        confidence_threshold,
        geometry,
        orig_width,
        orig_height,
      )
    })
    .collect()
}
