//! 主模型: 多任务检测 (MTDetr)
//!
//! 单次前向同时产出:
//! - 端到端检测框 (NMS-Free, 输出 [batch, n, 6])
//! - 多类别分割掩码 (可驾驶区域/车道线, 输出 [batch, c, h, w])
//!
//! 检测框类别在主模型自己的标签空间 (0=Vehicle, 1=Drivable, 2=Lane)。

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use ndarray::{Array, ArrayD, IxDyn};
use std::path::{Path, PathBuf};

use super::{decode_e2e_dets, decode_mask_channels, letterbox_tensor, Model, RawOutput};
use crate::config::InferOptions;
use crate::ort_backend::{OrtBackend, OrtConfig};

pub struct MTDetr {
    engine: OrtBackend,
    height: u32,
    width: u32,
    conf: f32,
    mask_threshold: f32,
    model_path: PathBuf,
}

impl MTDetr {
    /// 加载主模型
    pub fn load(path: &Path, opts: &InferOptions) -> Result<Self> {
        let engine = OrtBackend::build(OrtConfig {
            model_path: path.to_path_buf(),
            device: opts.device,
            image_size: (opts.image_size.1, opts.image_size.0),
        })
        .with_context(|| format!("主模型构建失败: {}", path.display()))?;

        let (height, width) = (engine.height(), engine.width());
        log::info!(
            "主模型加载成功: {} (输入 {}x{}, EP {:?})",
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
            mask_threshold: opts.mask_threshold,
            model_path: path.to_path_buf(),
        })
    }

    pub fn conf(&self) -> f32 {
        self.conf
    }

    pub fn mask_threshold(&self) -> f32 {
        self.mask_threshold
    }
}

impl Model for MTDetr {
    fn preprocess(&self, image: &DynamicImage) -> Result<Array<f32, IxDyn>> {
        letterbox_tensor(image, self.width, self.height)
    }

    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<ArrayD<f32>>> {
        self.engine.run(xs)
    }

    fn postprocess(&self, ys: Vec<ArrayD<f32>>, original: &DynamicImage) -> Result<RawOutput> {
        let (orig_w, orig_h) = original.dimensions();
        let mut outputs = ys.into_iter();

        let dets = outputs.next().context("主模型缺少检测输出")?;
        let bboxes = decode_e2e_dets(
            &dets,
            self.conf,
            (self.width, self.height),
            (orig_w, orig_h),
        )?;

        // 第二个输出为分割掩码; 纯检测导出的模型没有该输出, 不视为错误
        let masks = match outputs.next() {
            Some(seg) => decode_mask_channels(&seg, self.mask_threshold, (orig_w, orig_h))?,
            None => Vec::new(),
        };

        Ok(RawOutput { bboxes, masks })
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }
}
