// 该文件是 Shanan DNN 项目的一部分。
// src/model.rs - 模型流水线
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

use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::{
  postprocess::{BoundingBox, DecodeError},
  preprocess::PreprocessError,
};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 经过抑制后的检测结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub bbox: BoundingBox,
  pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 置信度阈值与 NMS IoU 阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  pub confidence: f32,
  pub nms: f32,
}

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      confidence: DEFAULT_CONFIDENCE_THRESHOLD,
      nms: DEFAULT_NMS_THRESHOLD,
    }
  }
}

impl Thresholds {
  pub fn new(confidence: f32, nms: f32) -> Self {
    Self { confidence, nms }
  }
}

#[derive(Error, Debug)]
pub enum DnnError<E> {
  #[error("预处理错误: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("前置条件不满足: {0}")]
  PreconditionViolation(String),
  #[error("推理引擎错误: {0}")]
  Engine(#[source] E),
}

impl<E> DnnError<E> {
  pub fn violation(msg: impl Into<String>) -> Self {
    DnnError::PreconditionViolation(msg.into())
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelConfigError {
  #[error("模型路径必须使用 {expected} 方案, 实际为 {found}")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("模型参数 {key} 的值无效: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("未知的模型参数: {0}")]
  UnknownParameter(String),
}

/// 检查方案并拒绝未知的查询参数
pub(crate) fn check_model_url(
  url: &Url,
  scheme: &'static str,
  known: &[&str],
) -> Result<(), ModelConfigError> {
  if url.scheme() != scheme {
    return Err(ModelConfigError::SchemeMismatch {
      expected: scheme,
      found: url.scheme().to_string(),
    });
  }
  if let Some((key, _)) = url.query_pairs().find(|(key, _)| !known.contains(&key.as_ref())) {
    return Err(ModelConfigError::UnknownParameter(key.into_owned()));
  }
  Ok(())
}

pub(crate) fn query_param<T: FromStr>(url: &Url, key: &str) -> Result<Option<T>, ModelConfigError> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .map(|(_, value)| {
      value
        .parse::<T>()
        .map_err(|_| ModelConfigError::InvalidParameter {
          key: key.to_string(),
          value: value.into_owned(),
        })
    })
    .transpose()
}

/// 解析形如 `0.485,0.456,0.406` 的三通道参数
pub(crate) fn query_triplet(url: &Url, key: &str) -> Result<Option<[f32; 3]>, ModelConfigError> {
  let Some(raw) = query_param::<String>(url, key)? else {
    return Ok(None);
  };
  let invalid = || ModelConfigError::InvalidParameter {
    key: key.to_string(),
    value: raw.clone(),
  };
  let values = raw
    .split(',')
    .map(|v| v.trim().parse::<f32>().map_err(|_| invalid()))
    .collect::<Result<Vec<_>, _>>()?;
  let triplet: [f32; 3] = values.try_into().map_err(|_| invalid())?;
  Ok(Some(triplet))
}

mod feature_extractor;
mod yolo;

pub use self::feature_extractor::{Embeddings, FeatureExtractor, FeatureExtractorBuilder};
pub use self::yolo::{Yolo, YoloBuilder};
