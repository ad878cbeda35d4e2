//! 模型统一接口与实现
//!
//! ## 核心流程
//! ```text
//! 原始图片 → preprocess → ndarray张量
//!          ↓
//!     推理引擎 run
//!          ↓
//!     原始输出 → postprocess → 模型空间检测框(+掩码)
//! ```
//!
//! 两个实现:
//! - `MTDetr`: 主模型, 多任务 (检测框 + 分割掩码), 文件: `mtdetr.rs`
//! - `YoloV10`: 辅助模型, 端到端检测 (NMS-Free), 文件: `yolov10.rs`
//!
//! 模型内部不做类别重映射, 输出保持各自的原始标签空间, 由融合层
//! 经类别注册表统一。

use anyhow::{anyhow, Result};
use image::{imageops, DynamicImage, GenericImageView, GrayImage, Luma};
use ndarray::{Array, ArrayD, IxDyn};
use std::path::Path;
use std::time::Instant;

use crate::registry::MaskKind;
use crate::Bbox;

pub mod mtdetr;
pub mod yolov10;

pub use mtdetr::MTDetr;
pub use yolov10::YoloV10;

/// 模型空间的单帧原始输出 (融合前)
#[derive(Debug, Default)]
pub struct RawOutput {
    pub bboxes: Vec<Bbox>,
    pub masks: Vec<(MaskKind, GrayImage)>,
}

/// 统一的深度学习模型接口
pub trait Model {
    /// 预处理: 图片 → NCHW 张量
    fn preprocess(&self, image: &DynamicImage) -> Result<Array<f32, IxDyn>>;

    /// 推理: 执行模型前向传播
    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<ArrayD<f32>>>;

    /// 后处理: 原始输出 → 检测框/掩码 (坐标还原到原图)
    fn postprocess(&self, ys: Vec<ArrayD<f32>>, original: &DynamicImage) -> Result<RawOutput>;

    /// 完整推理流程: preprocess → run → postprocess
    fn forward(&mut self, image: &DynamicImage) -> Result<RawOutput> {
        let t_pre = Instant::now();
        let xs = self.preprocess(image)?;
        let t_run = Instant::now();
        let ys = self.run(xs)?;
        let t_post = Instant::now();
        let out = self.postprocess(ys, image)?;
        log::debug!(
            "[{}] 预处理 {:?} | 推理 {:?} | 后处理 {:?}",
            self.model_path().display(),
            t_run.duration_since(t_pre),
            t_post.duration_since(t_run),
            t_post.elapsed()
        );
        Ok(out)
    }

    /// 模型权重路径 (帧结果与历史记录中引用)
    fn model_path(&self) -> &Path;
}

/// 等比缩放参数: 返回 (缩放比, 缩放后宽, 缩放后高)
pub(crate) fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// 等比缩放 + 灰边填充, 输出 [1,3,H,W] 归一化张量
pub(crate) fn letterbox_tensor(
    image: &DynamicImage,
    width: u32,
    height: u32,
) -> Result<Array<f32, IxDyn>> {
    let (w0, h0) = image.dimensions();
    let (_, w_new, h_new) = scale_wh(w0 as f32, h0 as f32, width as f32, height as f32);
    let resized = image.resize_exact(
        w_new as u32,
        h_new as u32,
        image::imageops::FilterType::Triangle,
    );

    let mut ys = Array::ones((1, 3, height as usize, width as usize)).into_dyn();
    ys.fill(144.0 / 255.0);
    for (x, y, rgb) in resized.pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b, _] = rgb.0;
        ys[[0, 0, y, x]] = (r as f32) / 255.0;
        ys[[0, 1, y, x]] = (g as f32) / 255.0;
        ys[[0, 2, y, x]] = (b as f32) / 255.0;
    }
    Ok(ys)
}

/// 解码端到端检测输出
///
/// 输出格式: [batch, num_boxes, 6], 其中 6 = [x1, y1, x2, y2, confidence, class_id],
/// 坐标在模型输入尺度, 按等比缩放比还原并裁剪到原图边界。
pub(crate) fn decode_e2e_dets(
    preds: &ArrayD<f32>,
    conf_threshold: f32,
    (input_w, input_h): (u32, u32),
    (orig_w, orig_h): (u32, u32),
) -> Result<Vec<Bbox>> {
    let shape = preds.shape();
    if shape.len() != 3 || shape[2] != 6 {
        return Err(anyhow!("检测输出形状异常: {:?} (期望 [batch, n, 6])", shape));
    }

    let ratio = (input_w as f32 / orig_w as f32).min(input_h as f32 / orig_h as f32);
    let mut bboxes = Vec::new();
    for i in 0..shape[1] {
        let confidence = preds[[0, i, 4]];
        if confidence < conf_threshold {
            continue;
        }
        let class_id = preds[[0, i, 5]] as usize;

        let x1 = preds[[0, i, 0]] / ratio;
        let y1 = preds[[0, i, 1]] / ratio;
        let x2 = preds[[0, i, 2]] / ratio;
        let y2 = preds[[0, i, 3]] / ratio;
        let width = x2 - x1;
        let height = y2 - y1;
        if width <= 0.0 || height <= 0.0 {
            continue;
        }

        bboxes.push(
            Bbox::new(x1, y1, width, height, class_id, confidence)
                .clip(orig_w as f32, orig_h as f32),
        );
    }
    Ok(bboxes)
}

/// 解码分割掩码输出
///
/// 输出格式: [batch, num_channels, mh, mw] 概率图; 每个通道按 `MaskKind`
/// 通道序解释, 超出已知类型的通道忽略。阈值二值化后裁掉灰边填充区,
/// 还原到原图分辨率。同一类型出现多个通道时后者覆盖前者 (last-wins)。
pub(crate) fn decode_mask_channels(
    masks: &ArrayD<f32>,
    mask_threshold: f32,
    (orig_w, orig_h): (u32, u32),
) -> Result<Vec<(MaskKind, GrayImage)>> {
    let shape = masks.shape();
    if shape.len() != 4 {
        return Err(anyhow!("掩码输出形状异常: {:?} (期望 [batch, c, h, w])", shape));
    }
    let (channels, mh, mw) = (shape[1], shape[2], shape[3]);

    let mut out: Vec<(MaskKind, GrayImage)> = Vec::new();
    for c in 0..channels {
        let kind = match MaskKind::from_channel(c) {
            Some(k) => k,
            None => {
                log::warn!("掩码通道 {} 没有对应的类型, 已忽略", c);
                continue;
            }
        };

        // 概率图 → 二值灰度图 (模型输入尺度)
        let mut binary = GrayImage::new(mw as u32, mh as u32);
        for y in 0..mh {
            for x in 0..mw {
                if masks[[0, c, y, x]] > mask_threshold {
                    binary.put_pixel(x as u32, y as u32, Luma([255u8]));
                }
            }
        }

        // 裁掉灰边填充区, 还原到原图分辨率
        let (_, w_mask, h_mask) = scale_wh(orig_w as f32, orig_h as f32, mw as f32, mh as f32);
        let cropped =
            imageops::crop_imm(&binary, 0, 0, w_mask as u32, h_mask as u32).to_image();
        let mut resized = imageops::resize(
            &cropped,
            orig_w,
            orig_h,
            image::imageops::FilterType::Triangle,
        );
        for p in resized.pixels_mut() {
            p.0[0] = if p.0[0] > 127 { 255 } else { 0 };
        }

        if let Some(slot) = out.iter_mut().find(|(k, _)| *k == kind) {
            slot.1 = resized;
        } else {
            out.push((kind, resized));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn dets_tensor(rows: &[[f32; 6]]) -> ArrayD<f32> {
        let mut arr = Array3::<f32>::zeros((1, rows.len(), 6));
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                arr[[0, i, j]] = *v;
            }
        }
        arr.into_dyn()
    }

    #[test]
    fn test_decode_filters_below_threshold() {
        let preds = dets_tensor(&[
            [10.0, 10.0, 100.0, 100.0, 0.9, 0.0],
            [20.0, 20.0, 80.0, 80.0, 0.1, 0.0],
        ]);
        let boxes = decode_e2e_dets(&preds, 0.25, (640, 640), (640, 640)).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].id(), 0);
    }

    #[test]
    fn test_decode_restores_letterbox_scale() {
        // 原图 1280x720, 输入 640x640 → ratio = 0.5
        let preds = dets_tensor(&[[100.0, 50.0, 300.0, 250.0, 0.8, 2.0]]);
        let boxes = decode_e2e_dets(&preds, 0.25, (640, 640), (1280, 720)).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert!((b.xmin() - 200.0).abs() < 1e-3);
        assert!((b.ymin() - 100.0).abs() < 1e-3);
        assert!((b.xmax() - 600.0).abs() < 1e-3);
        assert!((b.ymax() - 500.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let preds = ArrayD::<f32>::zeros(IxDyn(&[1, 5]));
        assert!(decode_e2e_dets(&preds, 0.25, (640, 640), (640, 640)).is_err());
    }

    #[test]
    fn test_mask_channels_threshold_and_kind() {
        let mut masks = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 64, 64]));
        // 通道0 (可驾驶区域) 左上角高置信
        for y in 0..32 {
            for x in 0..32 {
                masks[[0, 0, y, x]] = 0.9;
            }
        }
        let decoded = decode_mask_channels(&masks, 0.45, (64, 64)).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, MaskKind::DrivableArea);
        assert!(decoded[0].1.get_pixel(5, 5).0[0] > 0);
        assert_eq!(decoded[0].1.get_pixel(60, 60).0[0], 0);
        // 通道1 全零 → 空掩码
        assert_eq!(decoded[1].0, MaskKind::LaneLine);
        assert!(decoded[1].1.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_letterbox_tensor_shape() {
        let img = DynamicImage::new_rgb8(320, 240);
        let t = letterbox_tensor(&img, 640, 640).unwrap();
        assert_eq!(t.shape(), &[1, 3, 640, 640]);
    }
}
