// 该文件是 Shanan DNN 项目的一部分。
// src/model/yolo.rs - YOLO 检测流水线
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
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  engine::InferenceEngine,
  model::{
    DetectResult, DnnError, Model, ModelConfigError, Thresholds, check_model_url, query_param,
  },
  nms::suppress,
  postprocess::{DetectionFormat, DetectionLayout, decode, decode_batch},
  preprocess::{BlobOptions, LetterboxGeometry, blob_from_images, letterbox_with},
  tensor::{InputDims, PackedTensor, RGB_CHANNELS},
};

const YOLO_DEFAULT_INPUT_SIZE: u32 = 640;
const YOLO_DEFAULT_MAX_BATCH: usize = 1;

/// YOLO 检测模型
///
/// 输入 `[3, H, W]`，输出 `[attributes, candidates]`，属性顺序为
/// `{xc, yc, w, h, confidence}`。
pub struct Yolo<E> {
  engine: E,
  input: InputDims,
  layout: DetectionLayout,
  thresholds: Thresholds,
}

impl<E: InferenceEngine> Yolo<E> {
  pub fn new(engine: E) -> Result<Self, DnnError<E::Error>> {
    let input = InputDims::from_shape(engine.input_shape())
      .filter(|dims| dims.channels == RGB_CHANNELS && dims.height > 0 && dims.width > 0)
      .ok_or_else(|| {
        DnnError::violation(format!(
          "检测模型输入形状应为 [3, H, W], 实际为 {}",
          engine.input_shape()
        ))
      })?;
    let layout = DetectionLayout::from_shape(engine.output_shape())?;

    match DetectionFormat::from_attributes(layout.attributes)? {
      DetectionFormat::Xywhs => {}
      DetectionFormat::XywhsClasses { num_classes } => {
        warn!(
          "模型输出包含 {} 个类别分数，该格式尚未支持，解码时将报错",
          num_classes
        );
      }
    }

    info!(
      "检测模型输入: {}x{}, 输出: {} 属性 x {} 候选",
      input.width, input.height, layout.attributes, layout.candidates
    );

    Ok(Self {
      engine,
      input,
      layout,
      thresholds: Thresholds::default(),
    })
  }

  pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }

  pub fn thresholds(&self) -> Thresholds {
    self.thresholds
  }

  pub fn input_dims(&self) -> InputDims {
    self.input
  }

  pub fn layout(&self) -> DetectionLayout {
    self.layout
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  fn geometry_for(&self, width: u32, height: u32) -> Result<LetterboxGeometry, DnnError<E::Error>> {
    Ok(LetterboxGeometry::compute(
      width,
      height,
      self.input.width as u32,
      self.input.height as u32,
    )?)
  }

  fn execute(
    &self,
    blob: &PackedTensor,
    batch_size: usize,
  ) -> Result<Vec<f32>, DnnError<E::Error>> {
    let max = self.engine.max_batch_size();
    if batch_size > max {
      return Err(DnnError::violation(format!(
        "批次大小 {} 超出模型最大批次 {}",
        batch_size, max
      )));
    }
    self
      .engine
      .run(blob, batch_size)
      .map_err(DnnError::Engine)
  }

  /// 单张图像检测
  pub fn predict(
    &self,
    image: &RgbImage,
    thresholds: Thresholds,
  ) -> Result<DetectResult, DnnError<E::Error>> {
    let (width, height) = image.dimensions();
    let geometry = self.geometry_for(width, height)?;
    let input = letterbox_with(image, &geometry)?;
    let blob = blob_from_images(std::slice::from_ref(&input), &BlobOptions::default())?;

    let raw = self.execute(&blob, 1)?;
    let candidates = decode(
      &raw,
      &self.layout,
      thresholds.confidence,
      &geometry,
      width,
      height,
    )?;
    let detections = suppress(&candidates, thresholds.confidence, thresholds.nms);
    debug!("检测到 {} 个物体", detections.len());

    Ok(detections.into())
  }

  /// 批量检测，批次内图像尺寸必须一致
  pub fn predict_batch(
    &self,
    images: &[RgbImage],
    thresholds: Thresholds,
  ) -> Result<Vec<DetectResult>, DnnError<E::Error>> {
    let first = images
      .first()
      .ok_or_else(|| DnnError::violation("批次为空"))?;
    let (width, height) = first.dimensions();
    let geometry = self.geometry_for(width, height)?;

    let inputs = images
      .iter()
      .map(|image| letterbox_with(image, &geometry))
      .collect::<Result<Vec<_>, _>>()?;
    let blob = blob_from_images(&inputs, &BlobOptions::default())?;

    let raw = self.execute(&blob, images.len())?;
    let results = decode_batch(
      &raw,
      &self.layout,
      images.len(),
      thresholds.confidence,
      &geometry,
      width,
      height,
    )?
    .iter()
    .map(|candidates| {
      DetectResult::from(suppress(
        candidates,
        thresholds.confidence,
        thresholds.nms,
      ))
    })
    .collect::<Vec<_>>();

    debug!(
      "批量检测完成: {} 张图像, 共 {} 个物体",
      results.len(),
      results.iter().map(|r| r.items.len()).sum::<usize>()
    );
    Ok(results)
  }
}

impl<E: InferenceEngine> Model for Yolo<E> {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = DnnError<E::Error>;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.predict(input, self.thresholds)
  }
}

/// 从 `yolo:///path/model.onnx?width=640&height=640&max_batch=1&confidence=0.25&nms=0.45` 构造
#[derive(Debug, Clone, PartialEq)]
pub struct YoloBuilder {
  model_path: PathBuf,
  width: u32,
  height: u32,
  max_batch_size: usize,
  thresholds: Thresholds,
}

impl FromUrlWithScheme for YoloBuilder {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for YoloBuilder {
  type Error = ModelConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_model_url(
      url,
      Self::SCHEME,
      &["width", "height", "max_batch", "confidence", "nms"],
    )?;

    let defaults = Thresholds::default();
    Ok(YoloBuilder {
      model_path: PathBuf::from(url.path()),
      width: query_param(url, "width")?.unwrap_or(YOLO_DEFAULT_INPUT_SIZE),
      height: query_param(url, "height")?.unwrap_or(YOLO_DEFAULT_INPUT_SIZE),
      max_batch_size: query_param(url, "max_batch")?.unwrap_or(YOLO_DEFAULT_MAX_BATCH),
      thresholds: Thresholds {
        confidence: query_param(url, "confidence")?.unwrap_or(defaults.confidence),
        nms: query_param(url, "nms")?.unwrap_or(defaults.nms),
      },
    })
  }
}

impl YoloBuilder {
  pub fn model_path(&self) -> &std::path::Path {
    &self.model_path
  }

  pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
    self.max_batch_size = max_batch_size;
    self
  }

  pub fn thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }

  pub fn input_size(mut self, width: u32, height: u32) -> Self {
    self.width = width;
    self.height = height;
    self
  }

  /// 使用外部提供的引擎构造
  pub fn build_with<E: InferenceEngine>(self, engine: E) -> Result<Yolo<E>, DnnError<E::Error>> {
    Ok(Yolo::new(engine)?.with_thresholds(self.thresholds))
  }

  #[cfg(feature = "tract")]
  pub fn build(
    self,
  ) -> Result<Yolo<crate::engine::TractEngine>, DnnError<crate::engine::TractEngineError>> {
    let dims = InputDims {
      channels: RGB_CHANNELS,
      height: self.height as usize,
      width: self.width as usize,
    };
    let engine = crate::engine::TractEngine::load(&self.model_path, dims, self.max_batch_size)
      .map_err(DnnError::Engine)?;
    info!(
      "YOLO 模型就绪: 置信度阈值 {}, NMS 阈值 {}",
      self.thresholds.confidence, self.thresholds.nms
    );
    self.build_with(engine)
  }
}
