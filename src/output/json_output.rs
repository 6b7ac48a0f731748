// 该文件是 Shanan DNN 项目的一部分。
// src/output/json_output.rs - JSON 结果输出
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

use std::{io::Write, path::PathBuf};

use image::RgbImage;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectResult, Embeddings},
  output::Render,
};

#[derive(Error, Debug)]
pub enum JsonOutputError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `json:` 输出到标准输出，`json:///path/result.json` 写入文件
pub struct JsonOutput {
  path: Option<PathBuf>,
}

impl FromUrlWithScheme for JsonOutput {
  const SCHEME: &'static str = "json";
}

impl FromUrl for JsonOutput {
  type Error = JsonOutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(JsonOutputError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let path = match uri.path() {
      "" | "-" => None,
      path => Some(PathBuf::from(path)),
    };
    Ok(JsonOutput { path })
  }
}

impl JsonOutput {
  fn write_value(&self, value: &Value) -> Result<(), JsonOutputError> {
    match &self.path {
      Some(path) => {
        if let Some(parent) = path.parent()
          && !parent.as_os_str().is_empty()
        {
          std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
        info!("保存结果到文件: {}", path.display());
      }
      None => {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, value)?;
        writeln!(stdout)?;
      }
    }
    Ok(())
  }
}

pub fn detections_to_json(frame: &RgbImage, result: &DetectResult) -> Value {
  let items: Vec<Value> = result
    .items
    .iter()
    .map(|det| {
      json!({
        "score": det.score,
        "bbox": [det.bbox.x1, det.bbox.y1, det.bbox.x2, det.bbox.y2],
      })
    })
    .collect();
  json!({
    "width": frame.width(),
    "height": frame.height(),
    "detections": items,
  })
}

pub fn embeddings_to_json(result: &Embeddings) -> Value {
  json!({
    "dim": result.dim(),
    "embeddings": result.iter().map(|v| v.to_vec()).collect::<Vec<_>>(),
  })
}

impl Render<RgbImage, DetectResult> for JsonOutput {
  type Error = JsonOutputError;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<(), Self::Error> {
    self.write_value(&detections_to_json(frame, result))
  }
}

impl Render<Vec<RgbImage>, Embeddings> for JsonOutput {
  type Error = JsonOutputError;

  fn render_result(&self, _frame: &Vec<RgbImage>, result: &Embeddings) -> Result<(), Self::Error> {
    self.write_value(&embeddings_to_json(result))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{model::Detection, postprocess::BoundingBox};

  #[test]
  fn test_json_output_target() {
    let stdout = JsonOutput::from_url(&Url::parse("json:").unwrap()).unwrap();
    assert!(stdout.path.is_none());
    let file = JsonOutput::from_url(&Url::parse("json:///tmp/out.json").unwrap()).unwrap();
    assert_eq!(file.path, Some(PathBuf::from("/tmp/out.json")));
    assert!(JsonOutput::from_url(&Url::parse("image:///tmp/out.png").unwrap()).is_err());
  }

  #[test]
  fn test_detections_to_json() {
    let frame = RgbImage::new(64, 32);
    let result = DetectResult::from(vec![Detection {
      bbox: BoundingBox::new(1, 2, 30, 20),
      score: 0.5,
    }]);
    let value = detections_to_json(&frame, &result);
    assert_eq!(value["width"], 64);
    assert_eq!(value["height"], 32);
    assert_eq!(value["detections"][0]["bbox"], json!([1, 2, 30, 20]));
    assert_eq!(value["detections"][0]["score"], 0.5);
  }
}
