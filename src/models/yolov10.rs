//! 辅助模型: YOLOv10 端到端检测 (NMS-Free)
//!
//! 输出格式: [batch, num_boxes, 6], 6 = [x1, y1, x2, y2, confidence, class_id],
//! 模型内部已完成 NMS, 直接解码即可。类别为 COCO 原始编号
//! (0=person, 9=traffic light), 关注类别的过滤与重映射在推理工作器/融合层完成。

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{Array, ArrayD, IxDyn};
use std::path::{Path, PathBuf};

use super::{decode_e2e_dets, letterbox_tensor, Model, RawOutput};
use crate::config::InferOptions;
use crate::ort_backend::{OrtBackend, OrtConfig};

pub struct YoloV10 {
    engine: OrtBackend,
    height: u32,
    width: u32,
    conf: f32,
    model_path: PathBuf,
}

impl YoloV10 {
    /// 加载辅助模型
    pub fn load(path: &Path, opts: &InferOptions) -> Result<Self> {
        let engine = OrtBackend::build(OrtConfig {
            model_path: path.to_path_buf(),
            device: opts.device,
            image_size: (opts.image_size.1, opts.image_size.0),
        })
        .with_context(|| format!("辅助模型构建失败: {}", path.display()))?;

        let (height, width) = (engine.height(), engine.width());
        log::info!(
            "辅助模型加载成功: {} (输入 {}x{}, EP {:?})",
            path.display(),
            width,
            height,
            engine.ep()
        );

        Ok(Self {
            engine,
            height,
            width,
            conf: opts.confidence_threshold,
            model_path: path.to_path_buf(),
        })
    }
}

impl Model for YoloV10 {
    fn preprocess(&self, image: &DynamicImage) -> Result<Array<f32, IxDyn>> {
        letterbox_tensor(image, self.width, self.height)
    }

    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<ArrayD<f32>>> {
        self.engine.run(xs)
    }

    fn postprocess(&self, ys: Vec<ArrayD<f32>>, original: &DynamicImage) -> Result<RawOutput> {
        let (orig_w, orig_h) = original.dimensions();
        let dets = ys.first().context("辅助模型缺少检测输出")?;
        let bboxes = decode_e2e_dets(
            dets,
            self.conf,
            (self.width, self.height),
            (orig_w, orig_h),
        )?;
        Ok(RawOutput {
            bboxes,
            masks: Vec::new(),
        })
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }
}
