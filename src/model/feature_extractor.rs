// 该文件是 Shanan DNN 项目的一部分。
// src/model/feature_extractor.rs - 特征提取流水线
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

use std::path::PathBuf;

use image::RgbImage;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  engine::InferenceEngine,
  model::{DnnError, Model, ModelConfigError, check_model_url, query_param, query_triplet},
  preprocess::{BlobOptions, blob_from_images, resize_area},
  tensor::{InputDims, RGB_CHANNELS},
};

const FEATURE_DEFAULT_INPUT_SIZE: u32 = 224;
const FEATURE_DEFAULT_MAX_BATCH: usize = 512;

/// 特征向量批次，按图像顺序连续存放，原样保留引擎输出
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
  data: Vec<f32>,
  dim: usize,
}

impl Embeddings {
  pub fn dim(&self) -> usize {
    self.dim
  }

  /// 向量个数
  pub fn len(&self) -> usize {
    if self.dim == 0 { 0 } else { self.data.len() / self.dim }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn get(&self, index: usize) -> Option<&[f32]> {
    let start = index.checked_mul(self.dim)?;
    let end = start.checked_add(self.dim)?;
    self.data.get(start..end)
  }

  pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
    self.data.chunks_exact(self.dim.max(1))
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn into_inner(self) -> Vec<f32> {
    self.data
  }
}

pub struct FeatureExtractor<E> {
  engine: E,
  input: InputDims,
  embedding_dim: usize,
  std: [f32; 3],
  mean: [f32; 3],
}

impl<E: InferenceEngine> FeatureExtractor<E> {
  pub fn new(engine: E) -> Result<Self, DnnError<E::Error>> {
    let input = InputDims::from_shape(engine.input_shape())
      .filter(|dims| dims.channels == RGB_CHANNELS && dims.height > 0 && dims.width > 0)
      .ok_or_else(|| {
        DnnError::violation(format!(
          "特征模型输入形状应为 [3, H, W], 实际为 {}",
          engine.input_shape()
        ))
      })?;
    let embedding_dim = engine.output_shape().volume();
    if engine.output_shape().rank() == 0 || embedding_dim == 0 {
      return Err(DnnError::violation(format!(
        "特征模型输出形状无效: {}",
        engine.output_shape()
      )));
    }

    info!(
      "特征模型输入: {}x{}, 特征维度: {}",
      input.width, input.height, embedding_dim
    );

    let defaults = BlobOptions::default();
    Ok(Self {
      engine,
      input,
      embedding_dim,
      std: defaults.std,
      mean: defaults.mean,
    })
  }

  pub fn with_normalization(mut self, std: [f32; 3], mean: [f32; 3]) -> Self {
    self.std = std;
    self.mean = mean;
    self
  }

  pub fn input_dims(&self) -> InputDims {
    self.input
  }

  pub fn embedding_dim(&self) -> usize {
    self.embedding_dim
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  /// 将图像直接缩放到模型输入尺寸（不保持宽高比）并提取特征
  pub fn embed(
    &self,
    images: &[RgbImage],
    std: [f32; 3],
    mean: [f32; 3],
  ) -> Result<Embeddings, DnnError<E::Error>> {
    if images.is_empty() {
      return Err(DnnError::violation("批次为空"));
    }
    let max = self.engine.max_batch_size();
    if images.len() > max {
      return Err(DnnError::violation(format!(
        "批次大小 {} 超出模型最大批次 {}",
        images.len(),
        max
      )));
    }

    let (width, height) = (self.input.width as u32, self.input.height as u32);
    let resized: Vec<RgbImage> = images
      .iter()
      .map(|image| resize_area(image, width, height))
      .collect();
    let blob = blob_from_images(&resized, &BlobOptions::with_std_mean(std, mean))?;

    let data = self
      .engine
      .run(&blob, images.len())
      .map_err(DnnError::Engine)?;

    let expected = images.len() * self.embedding_dim;
    if data.len() != expected {
      return Err(DnnError::violation(format!(
        "特征输出长度 {} 与期望 {} 不一致",
        data.len(),
        expected
      )));
    }
    debug!("提取 {} 个 {} 维特征", images.len(), self.embedding_dim);

    Ok(Embeddings {
      data,
      dim: self.embedding_dim,
    })
  }

  pub fn embed_one(
    &self,
    image: &RgbImage,
    std: [f32; 3],
    mean: [f32; 3],
  ) -> Result<Embeddings, DnnError<E::Error>> {
    self.embed(std::slice::from_ref(image), std, mean)
  }
}

impl<E: InferenceEngine> Model for FeatureExtractor<E> {
  type Input = Vec<RgbImage>;
  type Output = Embeddings;
  type Error = DnnError<E::Error>;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.embed(input, self.std, self.mean)
  }
}

/// 从 `feature:///path/model.onnx?width=224&height=224&max_batch=512&std=..&mean=..` 构造
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureExtractorBuilder {
  model_path: PathBuf,
  width: u32,
  height: u32,
  max_batch_size: usize,
  std: [f32; 3],
  mean: [f32; 3],
}

impl FromUrlWithScheme for FeatureExtractorBuilder {
  const SCHEME: &'static str = "feature";
}

impl FromUrl for FeatureExtractorBuilder {
  type Error = ModelConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_model_url(
      url,
      Self::SCHEME,
      &["width", "height", "max_batch", "std", "mean"],
    )?;

    let defaults = BlobOptions::default();
    Ok(FeatureExtractorBuilder {
      model_path: PathBuf::from(url.path()),
      width: query_param(url, "width")?.unwrap_or(FEATURE_DEFAULT_INPUT_SIZE),
      height: query_param(url, "height")?.unwrap_or(FEATURE_DEFAULT_INPUT_SIZE),
      max_batch_size: query_param(url, "max_batch")?.unwrap_or(FEATURE_DEFAULT_MAX_BATCH),
      std: query_triplet(url, "std")?.unwrap_or(defaults.std),
      mean: query_triplet(url, "mean")?.unwrap_or(defaults.mean),
    })
  }
}

impl FeatureExtractorBuilder {
  pub fn model_path(&self) -> &std::path::Path {
    &self.model_path
  }

  pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
    self.max_batch_size = max_batch_size;
    self
  }

  pub fn build_with<E: InferenceEngine>(
    self,
    engine: E,
  ) -> Result<FeatureExtractor<E>, DnnError<E::Error>> {
    Ok(FeatureExtractor::new(engine)?.with_normalization(self.std, self.mean))
  }

  #[cfg(feature = "tract")]
  pub fn build(
    self,
  ) -> Result<
    FeatureExtractor<crate::engine::TractEngine>,
    DnnError<crate::engine::TractEngineError>,
  > {
    let dims = InputDims {
      channels: RGB_CHANNELS,
      height: self.height as usize,
      width: self.width as usize,
    };
    let engine = crate::engine::TractEngine::load(&self.model_path, dims, self.max_batch_size)
      .map_err(DnnError::Engine)?;
    self.build_with(engine)
  }
}
