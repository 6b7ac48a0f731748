// 该文件是 Shanan DNN 项目的一部分。
// src/nms.rs - 非极大值抑制
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

use std::cmp::Ordering;

use tracing::trace;

use crate::{
  model::Detection,
  postprocess::{BoundingBox, Candidate},
};

/// 计算两个边界框的 IoU
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
  let x1 = a.x1.max(b.x1);
  let y1 = a.y1.max(b.y1);
  let x2 = a.x2.min(b.x2);
  let y2 = a.y2.min(b.y2);

  let intersection = (x2 - x1).max(0) as f32 * (y2 - y1).max(0) as f32;
  let union = a.area() + b.area() - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 贪心非极大值抑制
///
/// 置信度不高于 `confidence_threshold` 的候选不参与；其余按置信度降序（同分保持原顺序）
/// 依次保留，并剔除与已保留框 IoU 大于 `overlap_threshold` 的候选。
pub fn suppress(
  candidates: &[Candidate],
  confidence_threshold: f32,
  overlap_threshold: f32,
) -> Vec<Detection> {
  if candidates.is_empty() {
    return Vec::new();
  }

  let mut order: Vec<usize> = (0..candidates.len())
    .filter(|&i| candidates[i].score > confidence_threshold)
    .collect();
  // sort_by 为稳定排序
  order.sort_by(|&a, &b| {
    candidates[b]
      .score
      .partial_cmp(&candidates[a].score)
      .unwrap_or(Ordering::Equal)
  });

  let mut kept: Vec<Detection> = Vec::new();
  for i in order {
    let candidate = &candidates[i];
    if kept
      .iter()
      .all(|det| iou(&det.bbox, &candidate.bbox) <= overlap_threshold)
    {
      kept.push(Detection {
        bbox: candidate.bbox,
        score: candidate.score,
      });
    }
  }

  trace!("NMS: {} 个候选保留 {} 个", candidates.len(), kept.len());
  kept
}
