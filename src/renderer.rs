//! 结果渲染与标签文件输出
//!
//! 在原始帧上绘制检测框/标签/置信度/多类别掩码与风险横幅, 并产出
//! 归一化标签文件文本。掩码按类型固定顺序绘制 (与插入顺序无关),
//! 保证多次运行的视觉稳定性。

use ab_glyph::{FontVec, PxScale};
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::analyzer::TrafficSemantics;
use crate::config::DisplayOptions;
use crate::registry::{CategoryRegistry, PERSON_CLASS_ID, TRAFFIC_LIGHT_CLASS_ID};
use crate::{Detection, FrameResult};

/// 渲染样式
#[derive(Debug, Clone)]
pub struct RenderStyle {
    pub box_thickness: u32,
    pub font_height: f32,
    pub label_padding: i32,
    pub mask_alpha: f32,
    pub banner_height: u32,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            box_thickness: 2,
            font_height: 16.0,
            label_padding: 2,
            mask_alpha: 0.3,
            banner_height: 40,
        }
    }
}

/// 候选字体路径 (中文横幅需要; 全部缺失时退化为只画框)
const FONT_PATHS: [&str; 5] = [
    "C:/Windows/Fonts/msyh.ttc",
    "C:/Windows/Fonts/simhei.ttf",
    "/System/Library/Fonts/PingFang.ttc",
    "/usr/share/fonts/truetype/droid/DroidSansFallbackFull.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
];

/// 检测结果渲染器
pub struct DetectionRenderer {
    style: RenderStyle,
    font: Option<FontVec>,
}

impl DetectionRenderer {
    pub fn new() -> Self {
        Self::with_style(RenderStyle::default())
    }

    pub fn with_style(style: RenderStyle) -> Self {
        let font = load_system_font();
        if font.is_none() {
            log::warn!("未找到可用字体, 标签文本与横幅文字将被省略");
        }
        Self { style, font }
    }

    /// 渲染一帧: 掩码 → 检测框/标签 → 风险/状态横幅
    ///
    /// 语义结果存在时, 道路上的行人重着色为红色并标注 `Person-OnRoad`,
    /// 红绿灯按颜色状态着色并标注 `Light-<Color>`。
    pub fn render(
        &self,
        frame: &RgbImage,
        result: &FrameResult,
        semantics: Option<&TrafficSemantics>,
        registry: &CategoryRegistry,
        display: &DisplayOptions,
    ) -> RgbImage {
        let mut img = frame.clone();

        // 1. 掩码叠加 (BTreeMap 迭代顺序 = 类型声明顺序)
        for mask in result.masks() {
            self.blend_mask(&mut img, mask.bitmap(), mask.kind().color());
        }

        // 2. 检测框与标签
        for (idx, det) in result.detections().iter().enumerate() {
            let (color, label_text) = self.detection_style(idx, det, semantics, registry);

            if display.show_boxes {
                self.draw_box(&mut img, det, color);
            }
            if display.show_labels {
                let label = if display.show_conf {
                    format!("{} {:.2}", label_text, det.confidence())
                } else {
                    label_text
                };
                self.draw_label(&mut img, det, &label, color);
            }
        }

        // 3. 横幅: 顶部警告 + 底部状态
        if let Some(sem) = semantics {
            let mut warnings = Vec::new();
            if sem.pedestrian_risk() {
                warnings.push("警告: 行人出现在道路区域内!".to_string());
            }
            if sem
                .traffic_light_colors()
                .iter()
                .any(|(_, c)| *c == crate::analyzer::LightColor::Red)
            {
                warnings.push("提示: 检测到红灯".to_string());
            }

            let mut info_items = Vec::new();
            if !sem.traffic_light_colors().is_empty() {
                let states: Vec<&str> = sem
                    .traffic_light_colors()
                    .iter()
                    .map(|(_, c)| c.label())
                    .collect();
                info_items.push(format!("红绿灯: {}", states.join(", ")));
            }
            if sem.pedestrian_risk() {
                info_items.push(format!("道路上行人: {} 人", sem.pedestrians_on_road().len()));
            }

            if !warnings.is_empty() {
                img = self.stack_banner(&img, &warnings, (139, 0, 0), true);
            }
            if !info_items.is_empty() {
                img = self.stack_banner(&img, &[info_items.join(" | ")], (60, 60, 60), false);
            }
        }

        img
    }

    /// 单个检测的显示颜色与标签文本
    fn detection_style(
        &self,
        idx: usize,
        det: &Detection,
        semantics: Option<&TrafficSemantics>,
        registry: &CategoryRegistry,
    ) -> ((u8, u8, u8), String) {
        if det.class_id() == PERSON_CLASS_ID {
            if let Some(sem) = semantics {
                if sem.is_pedestrian_on_road(idx) {
                    return ((255, 0, 0), "Person-OnRoad".to_string());
                }
            }
        }
        if det.class_id() == TRAFFIC_LIGHT_CLASS_ID {
            if let Some(color) = semantics.and_then(|s| s.light_color_of(idx)) {
                return (color.color(), format!("Light-{}", color.label()));
            }
        }
        let color = registry
            .lookup_unified(det.class_id())
            .map(|c| c.color)
            .unwrap_or((255, 0, 255));
        (color, det.class_label().to_string())
    }

    fn draw_box(&self, img: &mut RgbImage, det: &Detection, color: (u8, u8, u8)) {
        let (x1, y1, x2, y2) = det.xyxy();
        let rgb = Rgb([color.0, color.1, color.2]);
        for t in 0..self.style.box_thickness as i32 {
            let w = (x2 - x1) as i32 - 2 * t;
            let h = (y2 - y1) as i32 - 2 * t;
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(
                img,
                Rect::at(x1 as i32 + t, y1 as i32 + t).of_size(w as u32, h as u32),
                rgb,
            );
        }
    }

    fn draw_label(&self, img: &mut RgbImage, det: &Detection, label: &str, color: (u8, u8, u8)) {
        let font = match &self.font {
            Some(f) => f,
            None => return,
        };
        let scale = PxScale::from(self.style.font_height);
        let (tw, th) = text_size(scale, font, label);
        let (tw, th) = (tw as i32, th as i32);
        let padding = self.style.label_padding;

        let (x1, y1, _, _) = det.xyxy();
        let (x1, y1) = (x1 as i32, y1 as i32);
        let bg_top = (y1 - th - 2 * padding).max(0);

        draw_filled_rect_mut(
            img,
            Rect::at(x1, bg_top).of_size((tw + 2 * padding) as u32, (th + 2 * padding) as u32),
            Rgb([color.0, color.1, color.2]),
        );
        draw_text_mut(
            img,
            Rgb([255, 255, 255]),
            x1 + padding,
            bg_top + padding,
            scale,
            font,
            label,
        );
    }

    /// 半透明掩码叠加
    fn blend_mask(&self, img: &mut RgbImage, mask: &image::GrayImage, color: (u8, u8, u8)) {
        let alpha = self.style.mask_alpha;
        let (w, h) = (img.width().min(mask.width()), img.height().min(mask.height()));
        for y in 0..h {
            for x in 0..w {
                if mask.get_pixel(x, y).0[0] == 0 {
                    continue;
                }
                let p = img.get_pixel_mut(x, y);
                p.0[0] = (p.0[0] as f32 * (1.0 - alpha) + color.0 as f32 * alpha) as u8;
                p.0[1] = (p.0[1] as f32 * (1.0 - alpha) + color.1 as f32 * alpha) as u8;
                p.0[2] = (p.0[2] as f32 * (1.0 - alpha) + color.2 as f32 * alpha) as u8;
            }
        }
    }

    /// 在图像顶部/底部拼接文字横幅
    fn stack_banner(
        &self,
        img: &RgbImage,
        lines: &[String],
        bg: (u8, u8, u8),
        on_top: bool,
    ) -> RgbImage {
        let banner_h = self.style.banner_height * lines.len() as u32;
        let mut canvas = RgbImage::from_pixel(
            img.width(),
            img.height() + banner_h,
            Rgb([bg.0, bg.1, bg.2]),
        );
        let img_y = if on_top { banner_h as i64 } else { 0 };
        imageops::replace(&mut canvas, img, 0, img_y);

        if let Some(font) = &self.font {
            let scale = PxScale::from(self.style.banner_height as f32 * 0.6);
            let base_y = (if on_top { 0 } else { img.height() }) as i32;
            for (i, line) in lines.iter().enumerate() {
                draw_text_mut(
                    &mut canvas,
                    Rgb([255, 255, 255]),
                    10,
                    base_y + (i as u32 * self.style.banner_height) as i32 + 8,
                    scale,
                    font,
                    line,
                );
            }
        }
        canvas
    }
}

impl Default for DetectionRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn load_system_font() -> Option<FontVec> {
    for path in FONT_PATHS {
        if let Ok(bytes) = std::fs::read(path) {
            if let Ok(font) = FontVec::try_from_vec(bytes) {
                return Some(font);
            }
        }
    }
    None
}

/// 标签文件一行的解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct LabelEntry {
    pub class_id: usize,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: Option<f32>,
}

/// 产出归一化标签文件文本
///
/// 每个检测一行: `class_id cx cy w h confidence`, 空间值按帧尺寸归一化
/// 到 [0,1], 行序与融合后的检测序列一致。
pub fn to_label_text(result: &FrameResult) -> String {
    let mut text = String::new();
    for det in result.detections() {
        let (cx, cy, w, h) = det.cxcywh_normalized(result.frame_size());
        text.push_str(&format!(
            "{} {:.6} {:.6} {:.6} {:.6} {:.6}\n",
            det.class_id(),
            cx,
            cy,
            w,
            h,
            det.confidence()
        ));
    }
    text
}

/// 解析归一化标签文本 (下游工具/测试用)
pub fn parse_label_text(text: &str) -> Vec<LabelEntry> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            Some(LabelEntry {
                class_id: fields[0].parse().ok()?,
                cx: fields[1].parse().ok()?,
                cy: fields[2].parse().ok()?,
                w: fields[3].parse().ok()?,
                h: fields[4].parse().ok()?,
                confidence: fields.get(5).and_then(|v| v.parse().ok()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::fusion::fuse;
    use crate::models::RawOutput;
    use crate::registry::MaskKind;
    use crate::Bbox;
    use image::{GrayImage, Luma};
    use std::path::PathBuf;

    fn sample_result() -> FrameResult {
        let primary = RawOutput {
            bboxes: vec![
                Bbox::new(10.0, 20.0, 100.0, 50.0, 0, 0.91),
                Bbox::new(200.0, 100.0, 60.0, 40.0, 0, 0.72),
            ],
            masks: Vec::new(),
        };
        let auxiliary = vec![Bbox::new(300.0, 150.0, 30.0, 80.0, 0, 0.66)];
        fuse(
            &CategoryRegistry::new(),
            (640, 480),
            primary,
            Some(auxiliary),
            8.0,
            PathBuf::from("best.onnx"),
            Some(PathBuf::from("yolov10n.onnx")),
        )
        .unwrap()
    }

    #[test]
    fn test_label_text_roundtrip_within_tolerance() {
        let result = sample_result();
        let text = to_label_text(&result);
        let entries = parse_label_text(&text);

        assert_eq!(entries.len(), result.num_detections());
        let registry = CategoryRegistry::new();
        for (entry, det) in entries.iter().zip(result.detections()) {
            assert_eq!(entry.class_id, det.class_id());
            // 类别身份经注册表往返
            let class = registry.lookup_unified(entry.class_id).unwrap();
            assert_eq!(class.label, det.class_label());

            let (cx, cy, w, h) = det.cxcywh_normalized(result.frame_size());
            assert!((entry.cx - cx).abs() < 1e-4);
            assert!((entry.cy - cy).abs() < 1e-4);
            assert!((entry.w - w).abs() < 1e-4);
            assert!((entry.h - h).abs() < 1e-4);
            assert!((entry.confidence.unwrap() - det.confidence()).abs() < 1e-4);
        }
    }

    #[test]
    fn test_label_lines_follow_fusion_order() {
        let result = sample_result();
        let entries = parse_label_text(&to_label_text(&result));
        assert_eq!(entries[0].class_id, 0);
        assert_eq!(entries[1].class_id, 0);
        assert_eq!(entries[2].class_id, crate::registry::PERSON_CLASS_ID);
    }

    #[test]
    fn test_render_without_banner_keeps_dimensions() {
        let frame = RgbImage::new(640, 480);
        let result = sample_result();
        let renderer = DetectionRenderer::new();
        let out = renderer.render(
            &frame,
            &result,
            None,
            &CategoryRegistry::new(),
            &DisplayOptions::default(),
        );
        assert_eq!((out.width(), out.height()), (640, 480));
    }

    #[test]
    fn test_render_mask_overlay_changes_pixels() {
        let frame = RgbImage::new(64, 64);
        let mut mask = GrayImage::new(64, 64);
        for y in 40..64 {
            for x in 0..64 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let result = fuse(
            &CategoryRegistry::new(),
            (64, 64),
            RawOutput {
                bboxes: Vec::new(),
                masks: vec![(MaskKind::DrivableArea, mask)],
            },
            None,
            1.0,
            PathBuf::from("best.onnx"),
            None,
        )
        .unwrap();

        let renderer = DetectionRenderer::new();
        let out = renderer.render(
            &frame,
            &result,
            None,
            &CategoryRegistry::new(),
            &DisplayOptions::default(),
        );
        // 掩码区域被染色, 掩码外保持原样
        assert_ne!(out.get_pixel(10, 50).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(10, 10).0, [0, 0, 0]);
    }

    #[test]
    fn test_render_risk_banner_extends_height() {
        // 行人位于可驾驶区域 → 顶部警告横幅 + 底部信息横幅
        let mut mask = GrayImage::new(64, 64);
        for y in 0..64 {
            for x in 0..64 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let result = fuse(
            &CategoryRegistry::new(),
            (64, 64),
            RawOutput {
                bboxes: Vec::new(),
                masks: vec![(MaskKind::DrivableArea, mask)],
            },
            Some(vec![Bbox::new(20.0, 20.0, 10.0, 20.0, 0, 0.9)]),
            1.0,
            PathBuf::from("best.onnx"),
            Some(PathBuf::from("yolov10n.onnx")),
        )
        .unwrap();

        let frame = RgbImage::new(64, 64);
        let semantics = analyze(&frame, &result);
        assert!(semantics.pedestrian_risk());

        let renderer = DetectionRenderer::new();
        let out = renderer.render(
            &frame,
            &result,
            Some(&semantics),
            &CategoryRegistry::new(),
            &DisplayOptions::default(),
        );
        assert_eq!(out.width(), 64);
        assert!(out.height() > 64);
    }
}
