//! 类别注册表
//!
//! 统一标签空间: 主模型类别按固定表做恒等映射, 辅助模型类别经特殊ID
//! 映射表重映射到与主模型不冲突的编号段。注册表在启动时构造一次,
//! 之后只读, 可被多个推理调用并发访问, 无需加锁。

use crate::error::VisionError;

/// 行人特殊类别ID (辅助模型 person 重映射目标)
pub const PERSON_CLASS_ID: usize = 999;
/// 红绿灯特殊类别ID (辅助模型 traffic light 重映射目标)
pub const TRAFFIC_LIGHT_CLASS_ID: usize = 998;

/// 辅助模型原始类别ID
pub const AUX_PERSON_RAW_ID: usize = 0;
pub const AUX_TRAFFIC_LIGHT_RAW_ID: usize = 9;

/// 检测结果的来源模型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceModel {
    /// 主模型 (多任务: 检测框 + 分割掩码)
    Primary,
    /// 辅助模型 (行人/红绿灯专用)
    Auxiliary,
}

/// 分割掩码类型
///
/// 枚举声明顺序即固定绘制顺序 (可驾驶区域在下, 车道线在上)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MaskKind {
    DrivableArea,
    LaneLine,
}

impl MaskKind {
    /// 对应的主模型类别ID
    pub fn class_id(&self) -> usize {
        match self {
            MaskKind::DrivableArea => 1,
            MaskKind::LaneLine => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MaskKind::DrivableArea => "Drivable",
            MaskKind::LaneLine => "Lane",
        }
    }

    /// 掩码叠加色 (RGB)
    pub fn color(&self) -> (u8, u8, u8) {
        match self {
            MaskKind::DrivableArea => (255, 255, 0),
            MaskKind::LaneLine => (255, 0, 0),
        }
    }

    /// 主模型分割输出的通道序
    pub fn from_channel(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(MaskKind::DrivableArea),
            1 => Some(MaskKind::LaneLine),
            _ => None,
        }
    }
}

/// 统一标签空间中的一个类别
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub unified_id: usize,
    pub label: String,
    /// 绘制颜色 (RGB)
    pub color: (u8, u8, u8),
}

impl ClassDef {
    fn new(unified_id: usize, label: &str, color: (u8, u8, u8)) -> Self {
        Self {
            unified_id,
            label: label.to_string(),
            color,
        }
    }
}

/// 特殊ID映射表条目: 辅助模型原始类别 → 统一类别
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialClassDef {
    pub raw_id: usize,
    pub class: ClassDef,
}

/// 类别注册表 (构造后不可变)
#[derive(Debug, Clone)]
pub struct CategoryRegistry {
    primary: Vec<ClassDef>,
    special: Vec<SpecialClassDef>,
}

impl CategoryRegistry {
    /// 内置类别表: 主模型 Vehicle/Drivable/Lane, 辅助模型 Person/TrafficLight
    pub fn new() -> Self {
        let primary = vec![
            ClassDef::new(0, "Vehicle", (0, 0, 255)),
            ClassDef::new(1, "Drivable", (0, 255, 0)),
            ClassDef::new(2, "Lane", (255, 0, 0)),
        ];
        let special = vec![
            SpecialClassDef {
                raw_id: AUX_PERSON_RAW_ID,
                class: ClassDef::new(PERSON_CLASS_ID, "Person", (0, 255, 0)),
            },
            SpecialClassDef {
                raw_id: AUX_TRAFFIC_LIGHT_RAW_ID,
                class: ClassDef::new(TRAFFIC_LIGHT_CLASS_ID, "TrafficLight", (255, 165, 0)),
            },
        ];
        // 内置表满足不冲突不变量, 校验不会失败
        Self::from_parts(primary, special).expect("builtin category tables are consistent")
    }

    /// 由外部配置提供的类别表构造, 校验特殊ID与主模型ID不冲突
    pub fn from_parts(
        primary: Vec<ClassDef>,
        special: Vec<SpecialClassDef>,
    ) -> Result<Self, VisionError> {
        for s in &special {
            if primary.iter().any(|p| p.unified_id == s.class.unified_id) {
                return Err(VisionError::InvalidConfig(format!(
                    "特殊类别ID {} 与主模型类别冲突",
                    s.class.unified_id
                )));
            }
            if special
                .iter()
                .filter(|o| o.raw_id == s.raw_id || o.class.unified_id == s.class.unified_id)
                .count()
                > 1
            {
                return Err(VisionError::InvalidConfig(format!(
                    "特殊ID映射表存在重复条目 (raw_id={})",
                    s.raw_id
                )));
            }
        }
        Ok(Self { primary, special })
    }

    /// 解析原始类别ID到统一标签空间
    ///
    /// 主模型: 恒等映射, 超出范围返回 `UnknownClass`。
    /// 辅助模型: 查特殊ID映射表, 缺失条目返回 `UnmappedAuxiliaryClass`
    /// (版本不匹配, 不允许静默丢弃)。
    pub fn resolve(&self, raw_id: usize, source: SourceModel) -> Result<&ClassDef, VisionError> {
        match source {
            SourceModel::Primary => self
                .primary
                .iter()
                .find(|c| c.unified_id == raw_id)
                .ok_or(VisionError::UnknownClass(raw_id)),
            SourceModel::Auxiliary => self
                .special
                .iter()
                .find(|s| s.raw_id == raw_id)
                .map(|s| &s.class)
                .ok_or(VisionError::UnmappedAuxiliaryClass(raw_id)),
        }
    }

    /// 按统一ID反查类别 (标签文件往返/渲染用)
    pub fn lookup_unified(&self, unified_id: usize) -> Option<&ClassDef> {
        self.primary
            .iter()
            .find(|c| c.unified_id == unified_id)
            .or_else(|| {
                self.special
                    .iter()
                    .map(|s| &s.class)
                    .find(|c| c.unified_id == unified_id)
            })
    }

    /// 辅助模型关注的原始类别集合 (推理后过滤用)
    pub fn auxiliary_raw_ids(&self) -> Vec<usize> {
        self.special.iter().map(|s| s.raw_id).collect()
    }

    pub fn primary_classes(&self) -> &[ClassDef] {
        &self.primary
    }

    pub fn special_classes(&self) -> &[SpecialClassDef] {
        &self.special
    }
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_ids_disjoint_from_primary() {
        let reg = CategoryRegistry::new();
        for s in reg.special_classes() {
            let resolved = reg.resolve(s.raw_id, SourceModel::Auxiliary).unwrap();
            assert!(
                reg.primary_classes()
                    .iter()
                    .all(|p| p.unified_id != resolved.unified_id),
                "special id {} collides with primary table",
                resolved.unified_id
            );
        }
    }

    #[test]
    fn test_resolve_primary_identity() {
        let reg = CategoryRegistry::new();
        let c = reg.resolve(0, SourceModel::Primary).unwrap();
        assert_eq!(c.unified_id, 0);
        assert_eq!(c.label, "Vehicle");
    }

    #[test]
    fn test_resolve_primary_out_of_range() {
        let reg = CategoryRegistry::new();
        assert!(matches!(
            reg.resolve(7, SourceModel::Primary),
            Err(VisionError::UnknownClass(7))
        ));
    }

    #[test]
    fn test_resolve_auxiliary_remaps_person_and_light() {
        let reg = CategoryRegistry::new();
        let person = reg
            .resolve(AUX_PERSON_RAW_ID, SourceModel::Auxiliary)
            .unwrap();
        assert_eq!(person.unified_id, PERSON_CLASS_ID);
        let light = reg
            .resolve(AUX_TRAFFIC_LIGHT_RAW_ID, SourceModel::Auxiliary)
            .unwrap();
        assert_eq!(light.unified_id, TRAFFIC_LIGHT_CLASS_ID);
    }

    #[test]
    fn test_resolve_unmapped_auxiliary_is_error() {
        let reg = CategoryRegistry::new();
        assert!(matches!(
            reg.resolve(3, SourceModel::Auxiliary),
            Err(VisionError::UnmappedAuxiliaryClass(3))
        ));
    }

    #[test]
    fn test_from_parts_rejects_collision() {
        let primary = vec![ClassDef::new(0, "Vehicle", (0, 0, 255))];
        let special = vec![SpecialClassDef {
            raw_id: 0,
            class: ClassDef::new(0, "Person", (0, 255, 0)),
        }];
        assert!(CategoryRegistry::from_parts(primary, special).is_err());
    }

    #[test]
    fn test_mask_kind_draw_order_fixed() {
        assert!(MaskKind::DrivableArea < MaskKind::LaneLine);
        assert_eq!(MaskKind::from_channel(0), Some(MaskKind::DrivableArea));
        assert_eq!(MaskKind::from_channel(1), Some(MaskKind::LaneLine));
        assert_eq!(MaskKind::from_channel(9), None);
    }
}
