// 该文件是 Shanan DNN 项目的一部分。
// src/engine/tract_engine.rs - 基于 tract 的 ONNX 推理引擎
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

use std::{
  cell::RefCell,
  collections::HashMap,
  path::{Path, PathBuf},
  time::Instant,
};

use thiserror::Error;
use tracing::{debug, error, info};
use tract_onnx::prelude::{
  Datum, Framework, Graph, InferenceFact, InferenceModel, InferenceModelExt, SimplePlan, Tensor,
  TypedFact, TypedOp, tvec,
};

use crate::{
  engine::InferenceEngine,
  tensor::{InputDims, PackedTensor, TensorShape},
};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Error, Debug)]
pub enum TractEngineError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("tract 错误: {0}")]
  TractError(anyhow::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("批次大小 {batch} 超出上限 {max}")]
  BatchTooLarge { batch: usize, max: usize },
  #[error("输入张量形状 {actual:?} 与期望 {expected:?} 不一致")]
  InputMismatch {
    expected: [usize; 4],
    actual: [usize; 4],
  },
}

impl From<anyhow::Error> for TractEngineError {
  fn from(err: anyhow::Error) -> Self {
    TractEngineError::TractError(err)
  }
}

/// tract ONNX 推理引擎
///
/// 每个批次大小在首次使用时编译一次执行计划并缓存。内部使用 `RefCell`，
/// 因此只能在单线程内顺序使用。
pub struct TractEngine {
  model: InferenceModel,
  input_dims: InputDims,
  input_shape: TensorShape,
  output_shape: TensorShape,
  max_batch_size: usize,
  plans: RefCell<HashMap<usize, RunnableModel>>,
}

impl TractEngine {
  pub fn load<P: AsRef<Path>>(
    model_path: P,
    input_dims: InputDims,
    max_batch_size: usize,
  ) -> Result<Self, TractEngineError> {
    let path = model_path.as_ref();
    if !path.exists() {
      error!("模型文件不存在: {}", path.display());
      return Err(TractEngineError::ModelNotFound(path.to_path_buf()));
    }

    info!("加载模型文件: {}", path.display());
    let model = tract_onnx::onnx().model_for_path(path)?;
    Self::from_model(model, input_dims, max_batch_size)
  }

  /// 使用已构建的推理图，输入固定为 `[batch, C, H, W]`
  pub fn from_model(
    model: InferenceModel,
    input_dims: InputDims,
    max_batch_size: usize,
  ) -> Result<Self, TractEngineError> {
    if max_batch_size == 0 {
      return Err(TractEngineError::ModelInvalid("最大批次必须大于 0".into()));
    }

    let input_shape = TensorShape::from([
      input_dims.channels,
      input_dims.height,
      input_dims.width,
    ]);
    let engine = Self {
      model,
      input_dims,
      input_shape,
      output_shape: TensorShape::from([0usize]),
      max_batch_size,
      plans: RefCell::new(HashMap::new()),
    };

    let plan = engine.compile(1)?;
    let output_shape = {
      let fact = plan.model().output_fact(0)?;
      let dims = fact.shape.as_concrete().ok_or_else(|| {
        TractEngineError::ModelInvalid(format!("输出形状不是静态形状: {:?}", fact.shape))
      })?;
      match dims.split_first() {
        Some((&1, rest)) if !rest.is_empty() => TensorShape::new(rest.to_vec()),
        _ => {
          return Err(TractEngineError::ModelInvalid(format!(
            "输出形状缺少批次维度: {:?}",
            dims
          )));
        }
      }
    };

    info!(
      "模型加载完成: 输入 {}, 输出 {}, 最大批次 {}",
      engine.input_shape, output_shape, max_batch_size
    );

    engine.plans.borrow_mut().insert(1, plan);
    Ok(Self {
      output_shape,
      ..engine
    })
  }

  fn compile(&self, batch_size: usize) -> Result<RunnableModel, TractEngineError> {
    let InputDims {
      channels,
      height,
      width,
    } = self.input_dims;
    debug!(
      "编译执行计划: [{}, {}, {}, {}]",
      batch_size, channels, height, width
    );
    let now = Instant::now();
    let plan = self
      .model
      .clone()
      .with_input_fact(
        0,
        InferenceFact::dt_shape(f32::datum_type(), tvec!(batch_size, channels, height, width)),
      )?
      .into_optimized()?
      .into_runnable()?;
    debug!("执行计划编译完成，耗时: {:.2?}", now.elapsed());
    Ok(plan)
  }
}

impl InferenceEngine for TractEngine {
  type Error = TractEngineError;

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
    if batch_size > self.max_batch_size {
      return Err(TractEngineError::BatchTooLarge {
        batch: batch_size,
        max: self.max_batch_size,
      });
    }
    let expected = [
      batch_size,
      self.input_dims.channels,
      self.input_dims.height,
      self.input_dims.width,
    ];
    if input.shape() != expected {
      return Err(TractEngineError::InputMismatch {
        expected,
        actual: input.shape(),
      });
    }

    let mut plans = self.plans.borrow_mut();
    if !plans.contains_key(&batch_size) {
      let plan = self.compile(batch_size)?;
      plans.insert(batch_size, plan);
    }
    let plan = &plans[&batch_size];

    let tensor = Tensor::from_shape(&expected, input.as_ref())?;
    let outputs = plan.run(tvec!(tensor.into()))?;
    let output = outputs
      .first()
      .ok_or_else(|| TractEngineError::ModelInvalid("模型没有输出".into()))?;
    Ok(output.as_slice::<f32>()?.to_vec())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const DIMS: InputDims = InputDims {
    channels: 3,
    height: 2,
    width: 2,
  };

  // 输出直接返回输入
  fn identity_model() -> InferenceModel {
    let mut model = InferenceModel::default();
    let input = model.add_source("input", InferenceFact::default()).unwrap();
    model.set_output_outlets(&[input]).unwrap();
    model
  }

  fn filled(batch: usize) -> PackedTensor {
    let mut tensor = PackedTensor::zeros(batch, DIMS.channels, DIMS.height, DIMS.width);
    for b in 0..batch {
      for c in 0..DIMS.channels {
        for (i, v) in tensor.plane_mut(b, c).iter_mut().enumerate() {
          *v = (b * 100 + c * 10 + i) as f32;
        }
      }
    }
    tensor
  }

  #[test]
  fn test_output_shape_drops_batch() {
    let engine = TractEngine::from_model(identity_model(), DIMS, 2).unwrap();
    assert_eq!(engine.input_shape().dims(), &[3, 2, 2]);
    assert_eq!(engine.output_shape().dims(), &[3, 2, 2]);
    assert_eq!(engine.max_batch_size(), 2);
  }

  #[test]
  fn test_run_caches_plan_per_batch() {
    let engine = TractEngine::from_model(identity_model(), DIMS, 2).unwrap();
    assert_eq!(engine.plans.borrow().len(), 1);

    let single = filled(1);
    assert_eq!(engine.run(&single, 1).unwrap(), single.as_ref());
    assert_eq!(engine.plans.borrow().len(), 1);

    let pair = filled(2);
    assert_eq!(engine.run(&pair, 2).unwrap(), pair.as_ref());
    assert_eq!(engine.run(&pair, 2).unwrap(), pair.as_ref());
    let mut cached: Vec<usize> = engine.plans.borrow().keys().copied().collect();
    cached.sort_unstable();
    assert_eq!(cached, vec![1, 2]);
  }

  #[test]
  fn test_run_rejects_bad_input() {
    let engine = TractEngine::from_model(identity_model(), DIMS, 2).unwrap();

    assert!(matches!(
      engine.run(&filled(3), 3),
      Err(TractEngineError::BatchTooLarge { batch: 3, max: 2 })
    ));

    let wrong = PackedTensor::zeros(1, 3, 4, 4);
    assert!(matches!(
      engine.run(&wrong, 1),
      Err(TractEngineError::InputMismatch {
        expected: [1, 3, 2, 2],
        actual: [1, 3, 4, 4],
      })
    ));
    assert_eq!(engine.plans.borrow().len(), 1);
  }

  #[test]
  fn test_load_errors() {
    assert!(matches!(
      TractEngine::from_model(identity_model(), DIMS, 0),
      Err(TractEngineError::ModelInvalid(_))
    ));
    assert!(matches!(
      TractEngine::load("/nonexistent/model.onnx", DIMS, 1),
      Err(TractEngineError::ModelNotFound(_))
    ));
  }
}
