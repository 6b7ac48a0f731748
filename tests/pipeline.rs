// 该文件是 Shanan DNN 项目的一部分。
// tests/pipeline.rs - 检测与特征提取流水线测试
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

use std::cell::RefCell;

use image::{Rgb, RgbImage};
use thiserror::Error;

use shanan_dnn::{
  engine::InferenceEngine,
  model::{DnnError, FeatureExtractor, Model, Thresholds, Yolo},
  postprocess::{BoundingBox, DecodeError},
  preprocess::{LETTERBOX_FILL, PreprocessError},
  tensor::{PackedTensor, TensorShape},
};

#[derive(Error, Debug)]
#[error("模拟引擎故障")]
struct MockError;

/// 返回固定输出的引擎，每次调用按批次复制单张图像的输出
struct MockEngine {
  input_shape: TensorShape,
  output_shape: TensorShape,
  max_batch_size: usize,
  per_image: Vec<f32>,
  fail: bool,
  last_input: RefCell<Option<PackedTensor>>,
}

impl MockEngine {
  fn new(
    input: [usize; 3],
    output: Vec<usize>,
    max_batch_size: usize,
    per_image: Vec<f32>,
  ) -> Self {
    Self {
      input_shape: TensorShape::from(input),
      output_shape: TensorShape::from(output),
      max_batch_size,
      per_image,
      fail: false,
      last_input: RefCell::new(None),
    }
  }

  fn failing(mut self) -> Self {
    self.fail = true;
    self
  }

  fn last_input(&self) -> PackedTensor {
    self
      .last_input
      .borrow()
      .clone()
      .expect("引擎尚未被调用")
  }
}

impl InferenceEngine for MockEngine {
  type Error = MockError;

  fn input_shape(&self) -> &TensorShape {
    &self.input_shape
  }

  fn output_shape(&self) -> &TensorShape {
    &self.output_shape
  }

  fn max_batch_size(&self) -> usize {
    self.max_batch_size
  }

  fn run(&self, input: &PackedTensor, batch_size: usize) -> Result<Vec<f32>, Self::Error> {
    if self.fail {
      return Err(MockError);
    }
    assert_eq!(input.batch(), batch_size);
    *self.last_input.borrow_mut() = Some(input.clone());
    Ok(
      std::iter::repeat_n(self.per_image.iter().copied(), batch_size)
        .flatten()
        .collect(),
    )
  }
}

/// 按 `[attributes][candidates]` 排列候选框
fn raw_from_boxes(boxes: &[[f32; 5]]) -> Vec<f32> {
  let n = boxes.len();
  let mut raw = vec![0.0; 5 * n];
  for (i, b) in boxes.iter().enumerate() {
    for (a, value) in b.iter().enumerate() {
      raw[a * n + i] = *value;
    }
  }
  raw
}

// 64x64 输入；128x64 原图缩放 0.5，上下各填充 16 行
fn detection_boxes() -> Vec<[f32; 5]> {
  vec![
    // 原图 (20, 10, 60, 30)
    [20.0, 26.0, 20.0, 10.0, 0.9],
    // 与第一个高度重叠
    [21.0, 26.0, 20.0, 10.0, 0.8],
    // 原图 (0, 0, 10, 10)，低分
    [2.5, 18.5, 5.0, 5.0, 0.2],
    // 原图 (80, 20, 120, 60)
    [50.0, 36.0, 20.0, 20.0, 0.5],
  ]
}

fn yolo_engine(max_batch_size: usize) -> MockEngine {
  MockEngine::new(
    [3, 64, 64],
    vec![5, 4],
    max_batch_size,
    raw_from_boxes(&detection_boxes()),
  )
}

fn boxes_of(result: &shanan_dnn::model::DetectResult) -> Vec<(BoundingBox, f32)> {
  result.items.iter().map(|d| (d.bbox, d.score)).collect()
}

#[test]
fn test_yolo_predict_maps_back_to_original() {
  let engine = yolo_engine(1);
  let yolo = Yolo::new(&engine).unwrap();
  let image = RgbImage::from_pixel(128, 64, Rgb([255, 0, 0]));

  let result = yolo.predict(&image, Thresholds::default()).unwrap();
  assert_eq!(
    boxes_of(&result),
    vec![
      (BoundingBox::new(20, 10, 60, 30), 0.9),
      (BoundingBox::new(80, 20, 120, 60), 0.5),
    ]
  );

  // 信箱填充后再打包：上方填充行为灰色，内容区域红蓝交换
  let input = engine.last_input();
  assert_eq!(input.shape(), [1, 3, 64, 64]);
  let fill = LETTERBOX_FILL as f32 / 255.0;
  assert!((input.plane(0, 2)[0] - fill).abs() < 1e-6);
  assert!((input.plane(0, 2)[63 * 64] - fill).abs() < 1e-6);
  assert!((input.plane(0, 2)[20 * 64 + 5] - 1.0).abs() < 1e-6);
  assert!(input.plane(0, 0)[20 * 64 + 5].abs() < 1e-6);
}

#[test]
fn test_yolo_predict_uneven_padding() {
  // 128x62 -> 64x31，共 33 行填充：上 16 下 17
  let engine = yolo_engine(1);
  let yolo = Yolo::new(&engine).unwrap();
  let image = RgbImage::from_pixel(128, 62, Rgb([255, 0, 0]));

  let result = yolo.predict(&image, Thresholds::default()).unwrap();
  let expected = [
    (BoundingBox::new(20, 10, 60, 30), 0.9),
    (BoundingBox::new(80, 20, 120, 60), 0.5),
  ];
  let decoded = boxes_of(&result);
  assert_eq!(decoded.len(), expected.len());
  for ((got, score), (want, want_score)) in decoded.iter().zip(expected.iter()) {
    assert_eq!(score, want_score);
    assert!((got.x1 - want.x1).abs() <= 1);
    assert!((got.y1 - want.y1).abs() <= 1);
    assert!((got.x2 - want.x2).abs() <= 1);
    assert!((got.y2 - want.y2).abs() <= 1);
  }

  // 第 16 行起为内容，第 47 行起为底部填充
  let input = engine.last_input();
  let fill = LETTERBOX_FILL as f32 / 255.0;
  assert!((input.plane(0, 2)[15 * 64] - fill).abs() < 1e-6);
  assert!((input.plane(0, 2)[16 * 64] - 1.0).abs() < 1e-6);
  assert!((input.plane(0, 2)[46 * 64] - 1.0).abs() < 1e-6);
  assert!((input.plane(0, 2)[47 * 64] - fill).abs() < 1e-6);
}

#[test]
fn test_yolo_thresholds_are_respected() {
  let engine = yolo_engine(1);
  let yolo = Yolo::new(&engine).unwrap();
  let image = RgbImage::new(128, 64);

  let loose = yolo.predict(&image, Thresholds::new(0.1, 0.45)).unwrap();
  assert_eq!(
    boxes_of(&loose),
    vec![
      (BoundingBox::new(20, 10, 60, 30), 0.9),
      (BoundingBox::new(80, 20, 120, 60), 0.5),
      (BoundingBox::new(0, 0, 10, 10), 0.2),
    ]
  );

  let no_suppress = yolo.predict(&image, Thresholds::new(0.25, 0.95)).unwrap();
  assert_eq!(no_suppress.items.len(), 3);
  assert_eq!(no_suppress.items[1].bbox, BoundingBox::new(22, 10, 62, 30));

  let strict = yolo.predict(&image, Thresholds::new(0.9, 0.45)).unwrap();
  assert!(strict.items.is_empty());
}

#[test]
fn test_yolo_model_uses_configured_thresholds() {
  let engine = yolo_engine(1);
  let yolo = Yolo::new(&engine)
    .unwrap()
    .with_thresholds(Thresholds::new(0.6, 0.45));
  let result = yolo.infer(&RgbImage::new(128, 64)).unwrap();
  assert_eq!(
    boxes_of(&result),
    vec![(BoundingBox::new(20, 10, 60, 30), 0.9)]
  );
}

#[test]
fn test_yolo_predict_batch() {
  let engine = yolo_engine(2);
  let yolo = Yolo::new(&engine).unwrap();
  let images = vec![RgbImage::new(128, 64), RgbImage::new(128, 64)];

  let results = yolo.predict_batch(&images, Thresholds::default()).unwrap();
  assert_eq!(results.len(), 2);
  for result in &results {
    assert_eq!(
      boxes_of(result),
      vec![
        (BoundingBox::new(20, 10, 60, 30), 0.9),
        (BoundingBox::new(80, 20, 120, 60), 0.5),
      ]
    );
  }
  assert_eq!(engine.last_input().shape(), [2, 3, 64, 64]);
}

#[test]
fn test_yolo_batch_preconditions() {
  let engine = yolo_engine(1);
  let yolo = Yolo::new(&engine).unwrap();

  let too_many = vec![RgbImage::new(128, 64), RgbImage::new(128, 64)];
  assert!(matches!(
    yolo.predict_batch(&too_many, Thresholds::default()),
    Err(DnnError::PreconditionViolation(_))
  ));

  assert!(matches!(
    yolo.predict_batch(&[], Thresholds::default()),
    Err(DnnError::PreconditionViolation(_))
  ));

  let engine = yolo_engine(2);
  let yolo = Yolo::new(&engine).unwrap();
  let mixed = vec![RgbImage::new(128, 64), RgbImage::new(64, 64)];
  assert!(matches!(
    yolo.predict_batch(&mixed, Thresholds::default()),
    Err(DnnError::Preprocess(PreprocessError::PreconditionViolation(_)))
  ));
}

#[test]
fn test_yolo_rejects_class_scores() {
  let engine = MockEngine::new([3, 64, 64], vec![85, 4], 1, vec![0.0; 85 * 4]);
  let yolo = Yolo::new(&engine).unwrap();
  assert!(matches!(
    yolo.predict(&RgbImage::new(64, 64), Thresholds::default()),
    Err(DnnError::Decode(DecodeError::UnsupportedOutputFormat { attributes: 85 }))
  ));
}

#[test]
fn test_yolo_rejects_invalid_shapes() {
  let engine = MockEngine::new([1, 64, 64], vec![5, 4], 1, vec![]);
  assert!(matches!(
    Yolo::new(&engine),
    Err(DnnError::PreconditionViolation(_))
  ));

  let engine = MockEngine::new([3, 64, 64], vec![4, 4], 1, vec![]);
  assert!(matches!(
    Yolo::new(&engine),
    Err(DnnError::Decode(DecodeError::InvalidOutputShape(_)))
  ));
}

#[test]
fn test_yolo_engine_error_propagates() {
  let engine = yolo_engine(1).failing();
  let yolo = Yolo::new(&engine).unwrap();
  assert!(matches!(
    yolo.predict(&RgbImage::new(64, 64), Thresholds::default()),
    Err(DnnError::Engine(MockError))
  ));
}

fn feature_engine(max_batch_size: usize) -> MockEngine {
  MockEngine::new(
    [3, 8, 4],
    vec![6],
    max_batch_size,
    vec![0.5, -1.0, 2.0, 0.0, 3.5, -0.25],
  )
}

#[test]
fn test_feature_embed_returns_engine_output() {
  let engine = feature_engine(4);
  let extractor = FeatureExtractor::new(&engine).unwrap();
  assert_eq!(extractor.embedding_dim(), 6);

  let images = vec![
    RgbImage::from_pixel(16, 10, Rgb([100, 150, 200])),
    RgbImage::from_pixel(16, 10, Rgb([100, 150, 200])),
  ];
  let std = [0.5, 0.5, 0.5];
  let mean = [0.1, 0.2, 0.3];
  let embeddings = extractor.embed(&images, std, mean).unwrap();

  assert_eq!(embeddings.len(), 2);
  assert_eq!(embeddings.dim(), 6);
  assert_eq!(
    embeddings.get(1),
    Some(&[0.5, -1.0, 2.0, 0.0, 3.5, -0.25][..])
  );

  // 直接缩放到 4x8，逐通道减均值除标准差，红蓝交换
  let input = engine.last_input();
  assert_eq!(input.shape(), [2, 3, 8, 4]);
  let expected = [
    (200.0 / 255.0 - 0.1) / 0.5,
    (150.0 / 255.0 - 0.2) / 0.5,
    (100.0 / 255.0 - 0.3) / 0.5,
  ];
  for b in 0..2 {
    for (c, value) in expected.iter().enumerate() {
      assert!(
        input
          .plane(b, c)
          .iter()
          .all(|v| (v - value).abs() < 1e-5)
      );
    }
  }
}

#[test]
fn test_feature_model_uses_configured_normalization() {
  let engine = feature_engine(1);
  let extractor = FeatureExtractor::new(&engine)
    .unwrap()
    .with_normalization([2.0, 2.0, 2.0], [0.0, 0.0, 0.0]);
  let embeddings = extractor
    .infer(&vec![RgbImage::from_pixel(4, 8, Rgb([255, 255, 255]))])
    .unwrap();
  assert_eq!(embeddings.len(), 1);
  assert!(
    engine
      .last_input()
      .as_ref()
      .iter()
      .all(|v| (v - 0.5).abs() < 1e-6)
  );
}

#[test]
fn test_feature_preconditions() {
  let engine = feature_engine(1);
  let extractor = FeatureExtractor::new(&engine).unwrap();
  let one = [1.0; 3];
  let zero = [0.0; 3];

  assert!(matches!(
    extractor.embed(&[], one, zero),
    Err(DnnError::PreconditionViolation(_))
  ));

  let images = vec![RgbImage::new(4, 8), RgbImage::new(4, 8)];
  assert!(matches!(
    extractor.embed(&images, one, zero),
    Err(DnnError::PreconditionViolation(_))
  ));

  assert!(matches!(
    extractor.embed_one(&RgbImage::new(4, 8), zero, zero),
    Err(DnnError::Preprocess(_))
  ));
}

#[test]
fn test_feature_output_length_mismatch() {
  let engine = MockEngine::new([3, 8, 4], vec![6], 1, vec![0.0; 5]);
  let extractor = FeatureExtractor::new(&engine).unwrap();
  assert!(matches!(
    extractor.embed_one(&RgbImage::new(4, 8), [1.0; 3], [0.0; 3]),
    Err(DnnError::PreconditionViolation(_))
  ));
}

#[test]
fn test_feature_engine_error_propagates() {
  let engine = feature_engine(1).failing();
  let extractor = FeatureExtractor::new(&engine).unwrap();
  assert!(matches!(
    extractor.embed_one(&RgbImage::new(4, 8), [1.0; 3], [0.0; 3]),
    Err(DnnError::Engine(MockError))
  ));
}
