//! 双模型结果融合
//!
//! 把主模型的检测框/掩码与辅助模型重映射后的检测框合并为一个有序检测
//! 序列。顺序是对外契约 (渲染与标签文件都按此顺序输出):
//! 主模型检测在前 (保持模型原始顺序), 辅助模型检测依次追加。
//!
//! 空间上重叠的主/辅检测不做去重 —— 两个模型标签空间不相交
//! (辅助模型只负责主模型不擅长的类别), 这是刻意的融合策略而非遗漏。

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::VisionError;
use crate::models::RawOutput;
use crate::registry::{CategoryRegistry, SourceModel};
use crate::{Bbox, Detection, FrameResult, SegmentationMask};

/// 融合主/辅模型原始输出为一帧结果
///
/// 主模型类别经注册表恒等映射; 辅助模型类别重映射进特殊ID段,
/// 映射表缺失条目时整帧失败 (`UnmappedAuxiliaryClass`), 不静默丢弃。
/// 掩码按类型归并, 同类型后出现者覆盖先出现者。
pub fn fuse(
    registry: &CategoryRegistry,
    frame_size: (u32, u32),
    primary: RawOutput,
    auxiliary: Option<Vec<Bbox>>,
    inference_time_ms: f64,
    primary_model: PathBuf,
    auxiliary_model: Option<PathBuf>,
) -> Result<FrameResult, VisionError> {
    let mut detections =
        Vec::with_capacity(primary.bboxes.len() + auxiliary.as_ref().map_or(0, |a| a.len()));

    for bbox in &primary.bboxes {
        let class = registry.resolve(bbox.id(), SourceModel::Primary)?;
        detections.push(Detection::new(
            class.unified_id,
            class.label.clone(),
            bbox.confidence(),
            (bbox.xmin(), bbox.ymin(), bbox.xmax(), bbox.ymax()),
            frame_size,
            SourceModel::Primary,
        ));
    }

    if let Some(aux_bboxes) = &auxiliary {
        for bbox in aux_bboxes {
            let class = registry.resolve(bbox.id(), SourceModel::Auxiliary)?;
            detections.push(Detection::new(
                class.unified_id,
                class.label.clone(),
                bbox.confidence(),
                (bbox.xmin(), bbox.ymin(), bbox.xmax(), bbox.ymax()),
                frame_size,
                SourceModel::Auxiliary,
            ));
        }
    }

    let mut masks = BTreeMap::new();
    for (kind, bitmap) in primary.masks {
        // 同类型 last-wins
        masks.insert(kind, SegmentationMask::new(kind, bitmap));
    }

    Ok(FrameResult::new(
        detections,
        masks,
        frame_size,
        inference_time_ms,
        primary_model,
        auxiliary_model,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MaskKind, PERSON_CLASS_ID, TRAFFIC_LIGHT_CLASS_ID};
    use image::GrayImage;

    fn vehicle(x: f32) -> Bbox {
        Bbox::new(x, 10.0, 50.0, 40.0, 0, 0.9)
    }

    fn fuse_simple(
        primary: Vec<Bbox>,
        auxiliary: Option<Vec<Bbox>>,
    ) -> Result<FrameResult, VisionError> {
        fuse(
            &CategoryRegistry::new(),
            (640, 480),
            RawOutput {
                bboxes: primary,
                masks: Vec::new(),
            },
            auxiliary,
            12.5,
            PathBuf::from("best.onnx"),
            Some(PathBuf::from("yolov10n.onnx")),
        )
    }

    #[test]
    fn test_fusion_order_primary_then_auxiliary() {
        let primary = vec![vehicle(10.0), vehicle(100.0), vehicle(200.0)];
        let auxiliary = vec![
            Bbox::new(30.0, 30.0, 20.0, 50.0, 0, 0.8),
            Bbox::new(300.0, 40.0, 15.0, 35.0, 9, 0.7),
        ];
        let result = fuse_simple(primary, Some(auxiliary)).unwrap();

        assert_eq!(result.num_detections(), 5);
        for d in &result.detections()[..3] {
            assert_eq!(d.source(), SourceModel::Primary);
            assert_eq!(d.class_id(), 0);
        }
        assert_eq!(result.detections()[3].class_id(), PERSON_CLASS_ID);
        assert_eq!(result.detections()[4].class_id(), TRAFFIC_LIGHT_CLASS_ID);
        // 主模型原始顺序保持
        assert!(result.detections()[0].xyxy().0 < result.detections()[1].xyxy().0);
    }

    #[test]
    fn test_fusion_without_auxiliary_matches_primary_len() {
        let result = fuse_simple(vec![vehicle(10.0), vehicle(50.0)], None).unwrap();
        assert_eq!(result.num_detections(), 2);
        assert!(result
            .detections()
            .iter()
            .all(|d| d.source() == SourceModel::Primary));
    }

    #[test]
    fn test_fusion_unmapped_auxiliary_class_fails() {
        // COCO 类别 2 (car) 不在特殊ID映射表中 → 版本不匹配错误
        let aux = vec![Bbox::new(10.0, 10.0, 30.0, 30.0, 2, 0.9)];
        let err = fuse_simple(vec![vehicle(10.0)], Some(aux)).unwrap_err();
        assert!(matches!(err, VisionError::UnmappedAuxiliaryClass(2)));
    }

    #[test]
    fn test_fusion_keeps_overlapping_detections() {
        // 主/辅模型在同一区域各报一个目标: 不去重, 两个都保留
        let primary = vec![Bbox::new(100.0, 100.0, 60.0, 120.0, 0, 0.9)];
        let aux = vec![Bbox::new(102.0, 98.0, 58.0, 122.0, 0, 0.85)];
        let result = fuse_simple(primary, Some(aux)).unwrap();
        assert_eq!(result.num_detections(), 2);
    }

    #[test]
    fn test_fusion_mask_last_wins_per_kind() {
        let mut first = GrayImage::new(8, 8);
        first.put_pixel(0, 0, image::Luma([255]));
        let second = GrayImage::new(8, 8);

        let result = fuse(
            &CategoryRegistry::new(),
            (8, 8),
            RawOutput {
                bboxes: Vec::new(),
                masks: vec![
                    (MaskKind::DrivableArea, first),
                    (MaskKind::DrivableArea, second),
                ],
            },
            None,
            1.0,
            PathBuf::from("best.onnx"),
            None,
        )
        .unwrap();

        // 后声明的空掩码覆盖了先前的
        let mask = result.mask(MaskKind::DrivableArea).unwrap();
        assert!(!mask.contains(0.0, 0.0));
    }
}
