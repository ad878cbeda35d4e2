//! 交通语义分析
//!
//! 从融合后的帧结果推导交通语义事件:
//! - 行人风险: 行人检测框中心点落在可驾驶区域掩码内
//! - 红绿灯颜色: 对红绿灯框内像素做 HSV 色段统计 (纯像素函数, 不涉及模型)

use image::RgbImage;

use crate::registry::{MaskKind, PERSON_CLASS_ID, TRAFFIC_LIGHT_CLASS_ID};
use crate::FrameResult;

/// 红绿灯颜色分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightColor {
    Red,
    Yellow,
    Green,
    Unknown,
}

impl LightColor {
    pub fn label(&self) -> &'static str {
        match self {
            LightColor::Red => "Red",
            LightColor::Yellow => "Yellow",
            LightColor::Green => "Green",
            LightColor::Unknown => "Unknown",
        }
    }

    /// 状态显示色 (RGB)
    pub fn color(&self) -> (u8, u8, u8) {
        match self {
            LightColor::Red => (255, 0, 0),
            LightColor::Yellow => (255, 255, 0),
            LightColor::Green => (0, 255, 0),
            LightColor::Unknown => (128, 128, 128),
        }
    }
}

/// 一帧的交通语义 (派生值, 不回写帧结果)
#[derive(Debug, Clone, Default)]
pub struct TrafficSemantics {
    /// 落在可驾驶区域内的行人检测下标
    pedestrians_on_road: Vec<usize>,
    /// (红绿灯检测下标, 颜色), 按检测序列顺序
    traffic_light_colors: Vec<(usize, LightColor)>,
}

impl TrafficSemantics {
    /// 行人风险: 至少一个行人位于可驾驶区域内
    pub fn pedestrian_risk(&self) -> bool {
        !self.pedestrians_on_road.is_empty()
    }

    pub fn pedestrians_on_road(&self) -> &[usize] {
        &self.pedestrians_on_road
    }

    pub fn traffic_light_colors(&self) -> &[(usize, LightColor)] {
        &self.traffic_light_colors
    }

    pub fn is_pedestrian_on_road(&self, detection_idx: usize) -> bool {
        self.pedestrians_on_road.contains(&detection_idx)
    }

    pub fn light_color_of(&self, detection_idx: usize) -> Option<LightColor> {
        self.traffic_light_colors
            .iter()
            .find(|(i, _)| *i == detection_idx)
            .map(|(_, c)| *c)
    }
}

/// 分析一帧融合结果
///
/// 可驾驶区域掩码缺失时行人风险一律为 false (证据缺失时退化为否,
/// 保证确定性), 红绿灯颜色不受掩码影响。
pub fn analyze(frame: &RgbImage, result: &FrameResult) -> TrafficSemantics {
    let drivable = result.mask(MaskKind::DrivableArea);
    let mut semantics = TrafficSemantics::default();

    for (idx, det) in result.detections().iter().enumerate() {
        if det.class_id() == PERSON_CLASS_ID {
            if let Some(mask) = drivable {
                let (cx, cy) = det.centroid();
                if mask.contains(cx, cy) {
                    semantics.pedestrians_on_road.push(idx);
                }
            }
        } else if det.class_id() == TRAFFIC_LIGHT_CLASS_ID {
            let color = classify_light_color(frame, det.xyxy());
            semantics.traffic_light_colors.push((idx, color));
        }
    }
    semantics
}

/// 红绿灯颜色识别
///
/// 裁剪框内区域, 统计红/黄/绿三个 HSV 色段的像素数, 取最多者;
/// 最多色段不足 max(10, 区域1%) 像素时返回 Unknown。
/// 色段并列时按 红 > 黄 > 绿 的固定优先级取值, 保证结果确定。
pub fn classify_light_color(img: &RgbImage, (x1, y1, x2, y2): (f32, f32, f32, f32)) -> LightColor {
    let (w, h) = (img.width(), img.height());
    let x1 = (x1.max(0.0) as u32).min(w);
    let y1 = (y1.max(0.0) as u32).min(h);
    let x2 = (x2.max(0.0) as u32).min(w);
    let y2 = (y2.max(0.0) as u32).min(h);
    if x2 <= x1 || y2 <= y1 {
        return LightColor::Unknown;
    }

    let mut red = 0usize;
    let mut yellow = 0usize;
    let mut green = 0usize;
    for y in y1..y2 {
        for x in x1..x2 {
            let [r, g, b] = img.get_pixel(x, y).0;
            let (hue, sat, val) = rgb_to_hsv(r, g, b);
            // 色段范围与 OpenCV H∈[0,180) 标定一致; 黄/绿段有意重叠,
            // 单个像素可同时计入两段
            if (hue <= 10.0 || hue >= 160.0) && sat >= 70.0 && val >= 70.0 {
                red += 1;
            }
            if (15.0..=40.0).contains(&hue) && sat >= 70.0 && val >= 70.0 {
                yellow += 1;
            }
            if (35.0..=95.0).contains(&hue) && sat >= 40.0 && val >= 40.0 {
                green += 1;
            }
        }
    }

    let total = ((x2 - x1) * (y2 - y1)) as usize;
    let min_pixels = 10.max(total / 100);

    let (best_count, best_color) = [
        (red, LightColor::Red),
        (yellow, LightColor::Yellow),
        (green, LightColor::Green),
    ]
    .into_iter()
    .fold((0usize, LightColor::Unknown), |acc, (count, color)| {
        if count > acc.0 {
            (count, color)
        } else {
            acc
        }
    });

    if best_count < min_pixels {
        LightColor::Unknown
    } else {
        best_color
    }
}

/// RGB → HSV, 取值域与 OpenCV 对齐: H∈[0,180), S,V∈[0,255]
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let sat = if max == 0.0 { 0.0 } else { delta / max };
    (hue / 2.0, sat * 255.0, max * 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::fuse;
    use crate::models::RawOutput;
    use crate::registry::CategoryRegistry;
    use crate::{Bbox, MaskKind};
    use image::{GrayImage, Luma, Rgb};
    use std::path::PathBuf;

    fn solid_region(img: &mut RgbImage, (x1, y1, x2, y2): (u32, u32, u32, u32), rgb: [u8; 3]) {
        for y in y1..y2 {
            for x in x1..x2 {
                img.put_pixel(x, y, Rgb(rgb));
            }
        }
    }

    #[test]
    fn test_light_color_red_dominant() {
        let mut img = RgbImage::new(64, 64);
        solid_region(&mut img, (10, 10, 30, 50), [220, 20, 20]);
        assert_eq!(
            classify_light_color(&img, (10.0, 10.0, 30.0, 50.0)),
            LightColor::Red
        );
    }

    #[test]
    fn test_light_color_green_dominant() {
        let mut img = RgbImage::new(64, 64);
        solid_region(&mut img, (0, 0, 20, 40), [20, 200, 40]);
        assert_eq!(
            classify_light_color(&img, (0.0, 0.0, 20.0, 40.0)),
            LightColor::Green
        );
    }

    #[test]
    fn test_light_color_yellow_dominant() {
        let mut img = RgbImage::new(64, 64);
        solid_region(&mut img, (0, 0, 20, 40), [230, 200, 20]);
        assert_eq!(
            classify_light_color(&img, (0.0, 0.0, 20.0, 40.0)),
            LightColor::Yellow
        );
    }

    #[test]
    fn test_light_color_low_saturation_is_unknown() {
        // 纯灰色区域不属于任何色段
        let mut img = RgbImage::new(64, 64);
        solid_region(&mut img, (0, 0, 20, 40), [120, 120, 120]);
        assert_eq!(
            classify_light_color(&img, (0.0, 0.0, 20.0, 40.0)),
            LightColor::Unknown
        );
    }

    #[test]
    fn test_light_color_degenerate_box_is_unknown() {
        let img = RgbImage::new(64, 64);
        assert_eq!(
            classify_light_color(&img, (30.0, 30.0, 30.0, 30.0)),
            LightColor::Unknown
        );
    }

    fn drivable_mask_covering(w: u32, h: u32, (x1, y1, x2, y2): (u32, u32, u32, u32)) -> GrayImage {
        let mut mask = GrayImage::new(w, h);
        for y in y1..y2 {
            for x in x1..x2 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        mask
    }

    #[test]
    fn test_risk_false_without_drivable_mask() {
        // 没有可驾驶区域掩码时, 无论行人在哪都不报风险
        let result = fuse(
            &CategoryRegistry::new(),
            (128, 128),
            RawOutput::default(),
            Some(vec![Bbox::new(40.0, 40.0, 20.0, 40.0, 0, 0.9)]),
            1.0,
            PathBuf::from("best.onnx"),
            Some(PathBuf::from("yolov10n.onnx")),
        )
        .unwrap();
        let frame = RgbImage::new(128, 128);
        let semantics = analyze(&frame, &result);
        assert!(!semantics.pedestrian_risk());
    }

    #[test]
    fn test_dual_model_scenario_risk_and_red_light() {
        // 主模型 2 辆车; 辅助模型 1 个行人(中心点在可驾驶区域内) + 1 个红灯
        let primary = RawOutput {
            bboxes: vec![
                Bbox::new(5.0, 60.0, 30.0, 20.0, 0, 0.9),
                Bbox::new(80.0, 60.0, 30.0, 20.0, 0, 0.85),
            ],
            masks: vec![(
                MaskKind::DrivableArea,
                drivable_mask_covering(128, 128, (0, 50, 128, 128)),
            )],
        };
        let auxiliary = vec![
            Bbox::new(50.0, 70.0, 16.0, 32.0, 0, 0.8), // 行人, 中心 (58, 86)
            Bbox::new(100.0, 5.0, 10.0, 24.0, 9, 0.7), // 红绿灯
        ];

        let result = fuse(
            &CategoryRegistry::new(),
            (128, 128),
            primary,
            Some(auxiliary),
            5.0,
            PathBuf::from("best.onnx"),
            Some(PathBuf::from("yolov10n.onnx")),
        )
        .unwrap();
        assert_eq!(result.num_detections(), 4);

        let mut frame = RgbImage::new(128, 128);
        solid_region(&mut frame, (100, 5, 110, 29), [230, 10, 10]);

        let semantics = analyze(&frame, &result);
        assert!(semantics.pedestrian_risk());
        assert_eq!(semantics.traffic_light_colors().len(), 1);
        assert_eq!(semantics.traffic_light_colors()[0].1, LightColor::Red);
        assert!(semantics.is_pedestrian_on_road(2));
    }

    #[test]
    fn test_auxiliary_disabled_no_light_colors() {
        let result = fuse(
            &CategoryRegistry::new(),
            (128, 128),
            RawOutput {
                bboxes: vec![Bbox::new(5.0, 60.0, 30.0, 20.0, 0, 0.9)],
                masks: Vec::new(),
            },
            None,
            1.0,
            PathBuf::from("best.onnx"),
            None,
        )
        .unwrap();
        assert_eq!(result.num_detections(), 1);
        let frame = RgbImage::new(128, 128);
        let semantics = analyze(&frame, &result);
        assert!(semantics.traffic_light_colors().is_empty());
        assert!(!semantics.pedestrian_risk());
    }
}
