#![allow(clippy::type_complexity)]
//! 多任务交通视觉感知核心
//!
//! 双模型推理流水线: 主模型(多任务: 检测框+分割掩码) + 辅助模型(行人/红绿灯专用),
//! 融合为统一的帧结果,供渲染、交通语义分析与历史记录三个只读消费者使用。

pub mod analyzer; // 交通语义分析 (行人风险/红绿灯颜色)
pub mod config; // 推理配置参数
pub mod error; // 错误分类
pub mod fusion; // 双模型结果融合
pub mod history; // 历史记录数据库
pub mod models; // 模型接口与具体实现
pub mod monitor; // 性能采样 (外围监控)
pub mod ort_backend; // ONNX Runtime 推理引擎封装
pub mod registry; // 类别注册表 (统一标签空间)
pub mod renderer; // 结果渲染与标签文件输出
pub mod source; // 输入源识别与扫描
pub mod worker; // 推理工作器与批处理调度

pub use crate::config::{Args, Device, DisplayOptions, InferOptions};
pub use crate::error::VisionError;
pub use crate::fusion::fuse;
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
pub use crate::registry::{CategoryRegistry, MaskKind, SourceModel};

use image::GrayImage;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 生成时间字符串 (用于时间戳派生的输出目录名)
pub fn gen_time_string(delimiter: &str) -> String {
    let offset = chrono::FixedOffset::east_opt(8 * 60 * 60).unwrap(); // Beijing
    let t_now = chrono::Utc::now().with_timezone(&offset);
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

/// 模型空间检测框 (模型解码的原始输出, 融合前)
///
/// 坐标为原图像素坐标, 构造后由 `clip` 保证落在帧边界内。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    /// 裁剪到帧边界内, 保证 x1<x2, y1<y2
    pub fn clip(mut self, frame_w: f32, frame_h: f32) -> Self {
        let x1 = self.xmin.clamp(0.0, frame_w - 1.0);
        let y1 = self.ymin.clamp(0.0, frame_h - 1.0);
        let x2 = (self.xmin + self.width).clamp(x1 + 1.0, frame_w);
        let y2 = (self.ymin + self.height).clamp(y1 + 1.0, frame_h);
        self.xmin = x1;
        self.ymin = y1;
        self.width = x2 - x1;
        self.height = y2 - y1;
        self
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// 统一标签空间下的单个检测结果 (融合后)
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    class_id: usize,
    class_label: String,
    confidence: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    source: SourceModel,
}

impl Detection {
    /// 构造时裁剪到帧边界, 维持 x1<x2, y1<y2 不变量
    pub fn new(
        class_id: usize,
        class_label: impl Into<String>,
        confidence: f32,
        (x1, y1, x2, y2): (f32, f32, f32, f32),
        (frame_w, frame_h): (u32, u32),
        source: SourceModel,
    ) -> Self {
        let fw = frame_w as f32;
        let fh = frame_h as f32;
        let cx1 = x1.clamp(0.0, fw - 1.0);
        let cy1 = y1.clamp(0.0, fh - 1.0);
        Self {
            class_id,
            class_label: class_label.into(),
            confidence,
            x1: cx1,
            y1: cy1,
            x2: x2.clamp(cx1 + 1.0, fw),
            y2: y2.clamp(cy1 + 1.0, fh),
            source,
        }
    }

    pub fn class_id(&self) -> usize {
        self.class_id
    }

    pub fn class_label(&self) -> &str {
        &self.class_label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn xyxy(&self) -> (f32, f32, f32, f32) {
        (self.x1, self.y1, self.x2, self.y2)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// 检测框中心点
    pub fn centroid(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn source(&self) -> SourceModel {
        self.source
    }

    /// 归一化 (cx, cy, w, h), 用于标签文件输出
    pub fn cxcywh_normalized(&self, (frame_w, frame_h): (u32, u32)) -> (f32, f32, f32, f32) {
        let fw = frame_w as f32;
        let fh = frame_h as f32;
        let (cx, cy) = self.centroid();
        (cx / fw, cy / fh, self.width() / fw, self.height() / fh)
    }
}

/// 帧分辨率下的分割掩码, 每种类型每帧至多一张
#[derive(Debug, Clone)]
pub struct SegmentationMask {
    kind: MaskKind,
    bitmap: GrayImage,
}

impl SegmentationMask {
    pub fn new(kind: MaskKind, bitmap: GrayImage) -> Self {
        Self { kind, bitmap }
    }

    pub fn kind(&self) -> MaskKind {
        self.kind
    }

    pub fn bitmap(&self) -> &GrayImage {
        &self.bitmap
    }

    /// 判断像素坐标是否落在掩码内 (越界视为掩码外)
    pub fn contains(&self, x: f32, y: f32) -> bool {
        if x < 0.0 || y < 0.0 {
            return false;
        }
        let (xi, yi) = (x as u32, y as u32);
        if xi >= self.bitmap.width() || yi >= self.bitmap.height() {
            return false;
        }
        self.bitmap.get_pixel(xi, yi).0[0] > 0
    }

    /// 掩码覆盖率 (命中像素占比)
    pub fn coverage(&self) -> f32 {
        let total = (self.bitmap.width() * self.bitmap.height()) as f32;
        if total == 0.0 {
            return 0.0;
        }
        let hit = self.bitmap.pixels().filter(|p| p.0[0] > 0).count() as f32;
        hit / total
    }
}

/// 单帧的融合结果
///
/// 融合完成后不可变; 渲染/语义分析/历史记录三个消费者各取只读视图,
/// 可以任意顺序并发消费。
#[derive(Debug, Clone)]
pub struct FrameResult {
    detections: Vec<Detection>,
    masks: BTreeMap<MaskKind, SegmentationMask>,
    frame_size: (u32, u32),
    inference_time_ms: f64,
    primary_model: PathBuf,
    auxiliary_model: Option<PathBuf>,
}

impl FrameResult {
    pub fn new(
        detections: Vec<Detection>,
        masks: BTreeMap<MaskKind, SegmentationMask>,
        frame_size: (u32, u32),
        inference_time_ms: f64,
        primary_model: PathBuf,
        auxiliary_model: Option<PathBuf>,
    ) -> Self {
        Self {
            detections,
            masks,
            frame_size,
            inference_time_ms,
            primary_model,
            auxiliary_model,
        }
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    /// 按固定类型顺序迭代掩码 (绘制顺序与插入顺序无关)
    pub fn masks(&self) -> impl Iterator<Item = &SegmentationMask> {
        self.masks.values()
    }

    pub fn mask(&self, kind: MaskKind) -> Option<&SegmentationMask> {
        self.masks.get(&kind)
    }

    pub fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    pub fn inference_time_ms(&self) -> f64 {
        self.inference_time_ms
    }

    pub fn primary_model(&self) -> &PathBuf {
        &self.primary_model
    }

    pub fn auxiliary_model(&self) -> Option<&PathBuf> {
        self.auxiliary_model.as_ref()
    }

    pub fn num_detections(&self) -> usize {
        self.detections.len()
    }
}
