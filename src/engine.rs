// 该文件是 Shanan DNN 项目的一部分。
// src/engine.rs - 推理引擎抽象
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

use crate::tensor::{PackedTensor, TensorShape};

/// 推理引擎
///
/// 形状均不含批次维度，并在流水线构造时查询一次。`run` 同步执行，
/// 返回长度为 `batch_size * output_shape().volume()` 的扁平输出。
pub trait InferenceEngine {
  type Error: std::error::Error + Send + Sync + 'static;

  fn input_shape(&self) -> &TensorShape;
  fn output_shape(&self) -> &TensorShape;

  /// 引擎允许的最大批次
  fn max_batch_size(&self) -> usize;

  fn run(&self, input: &PackedTensor, batch_size: usize) -> Result<Vec<f32>, Self::Error>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for &E {
  type Error = E::Error;

  fn input_shape(&self) -> &TensorShape {
    (**self).input_shape()
  }

  fn output_shape(&self) -> &TensorShape {
    (**self).output_shape()
  }

  fn max_batch_size(&self) -> usize {
    (**self).max_batch_size()
  }

  fn run(&self, input: &PackedTensor, batch_size: usize) -> Result<Vec<f32>, Self::Error> {
    (**self).run(input, batch_size)
  }
}

#[cfg(feature = "tract")]
mod tract_engine;
#[cfg(feature = "tract")]
pub use self::tract_engine::{TractEngine, TractEngineError};
