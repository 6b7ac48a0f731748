// 该文件是 Shanan DNN 项目的一部分。
// src/bin/feature_single.rs - 单张图像特征提取
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

use anyhow::{Context, Result};
use clap::Parser;
use url::Url;

use shanan_dnn::{
  FromUrl,
  engine::InferenceEngine,
  input::ImageFileInput,
  model::{FeatureExtractorBuilder, Model},
  output::{JsonOutput, Render},
};
use tracing::info;

const PREVIEW_LEN: usize = 10;

/// Shanan DNN 特征提取示例：将同一张图像复制为一个批次
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 feature:///models/resnet50.onnx?max_batch=512
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 批次大小
  #[arg(short, long, default_value = "2", value_name = "BATCH")]
  pub batch: usize,
  /// 可选的 JSON 输出，例如 json:///data/embeddings.json
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("批次大小: {}", args.batch);

  let image = ImageFileInput::from_url(&args.input)?
    .next()
    .context("没有输入图像")?;
  let model = FeatureExtractorBuilder::from_url(&args.model)?.build()?;
  anyhow::ensure!(
    args.batch >= 1 && args.batch <= model.engine().max_batch_size(),
    "批次大小 {} 必须在 1 到最大批次 {} 之间",
    args.batch,
    model.engine().max_batch_size()
  );

  let batch = vec![image; args.batch];
  let embeddings = model.infer(&batch)?;

  println!("{} x {}", embeddings.len(), embeddings.dim());
  for embedding in embeddings.iter() {
    let preview: Vec<String> = embedding
      .iter()
      .take(PREVIEW_LEN)
      .map(|v| v.to_string())
      .collect();
    println!("{}", preview.join(" "));
  }

  if let Some(url) = args.output {
    JsonOutput::from_url(&url)?.render_result(&batch, &embeddings)?;
  }

  Ok(())
}
