//! 推理配置参数
//!
//! CLI 参数 (`Args`) 与校验后的不可变推理配置 (`InferOptions`) 分离:
//! 核心组件只接受校验过的 `InferOptions`, 不做任何松散的字典式取值。

use crate::error::VisionError;
use crate::gen_time_string;
use clap::Parser;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "trafficvision",
    about = "多任务交通视觉感知: 双模型推理、融合、语义分析与历史记录"
)]
pub struct Args {
    /// 主模型权重路径 (多任务模型, ONNX)
    #[arg(long, default_value = "best.onnx")]
    pub model: String,

    /// 辅助模型权重路径 (行人/红绿灯检测, ONNX)
    #[arg(long, default_value = "yolov10n.onnx")]
    pub aux_model: String,

    /// 输入源: 图片文件或文件夹
    #[arg(long)]
    pub source: String,

    /// 推理输入尺寸 (正方形)
    #[arg(long, default_value_t = 640)]
    pub imgsz: u32,

    /// 置信度阈值
    #[arg(long, default_value_t = 0.25)]
    pub conf: f32,

    /// 分割掩码二值化阈值
    #[arg(long, default_value_t = 0.45)]
    pub mask_threshold: f32,

    /// 计算设备: auto / cpu / cuda:N
    #[arg(long, default_value = "auto")]
    pub device: String,

    /// 启用辅助模型 (行人与红绿灯检测)
    #[arg(long, default_value_t = false)]
    pub enable_aux: bool,

    /// 不保存渲染结果与标签文件
    #[arg(long, default_value_t = false)]
    pub no_save: bool,

    /// 输出项目目录
    #[arg(long, default_value = "runs")]
    pub project: String,

    /// 输出子目录名 (缺省按时间戳派生)
    #[arg(long)]
    pub name: Option<String>,

    /// 历史记录数据库路径
    #[arg(long, default_value = "database/history.db")]
    pub db: String,

    /// 隐藏检测框
    #[arg(long, default_value_t = false)]
    pub hide_boxes: bool,

    /// 隐藏类别标签
    #[arg(long, default_value_t = false)]
    pub hide_labels: bool,

    /// 隐藏置信度
    #[arg(long, default_value_t = false)]
    pub hide_conf: bool,

    /// 打印各阶段耗时
    #[arg(long, default_value_t = false)]
    pub profile: bool,
}

/// 计算设备选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// 运行时探测: CUDA 可用则用 GPU, 否则回退 CPU
    Auto,
    Cpu,
    Cuda(i32),
}

impl FromStr for Device {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "auto" {
            return Ok(Device::Auto);
        }
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        if let Some(rest) = s.strip_prefix("cuda") {
            let id = rest.strip_prefix(':').unwrap_or("0");
            let id = if id.is_empty() { "0" } else { id };
            return id
                .parse::<i32>()
                .map(Device::Cuda)
                .map_err(|_| VisionError::InvalidConfig(format!("无效设备号: {}", s)));
        }
        Err(VisionError::InvalidConfig(format!("无效设备: {}", s)))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Auto => write!(f, "auto"),
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// 渲染显示开关
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DisplayOptions {
    pub show_boxes: bool,
    pub show_labels: bool,
    pub show_conf: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            show_boxes: true,
            show_labels: true,
            show_conf: true,
        }
    }
}

/// 校验后的推理配置 (构造后不可变)
#[derive(Debug, Clone, Serialize)]
pub struct InferOptions {
    pub image_size: (u32, u32),
    pub confidence_threshold: f32,
    pub mask_threshold: f32,
    pub device: Device,
    pub enable_auxiliary: bool,
    pub save_outputs: bool,
    pub output_dir: PathBuf,
    pub primary_model: PathBuf,
    pub auxiliary_model: Option<PathBuf>,
    pub display: DisplayOptions,
}

impl InferOptions {
    pub fn from_args(args: &Args) -> Result<Self, VisionError> {
        let device = Device::from_str(&args.device)?;
        let name = args
            .name
            .clone()
            .unwrap_or_else(|| format!("predict-{}", gen_time_string("-")));
        let opts = Self {
            image_size: (args.imgsz, args.imgsz),
            confidence_threshold: args.conf,
            mask_threshold: args.mask_threshold,
            device,
            enable_auxiliary: args.enable_aux,
            save_outputs: !args.no_save,
            output_dir: PathBuf::from(&args.project).join(name),
            primary_model: PathBuf::from(&args.model),
            auxiliary_model: if args.enable_aux {
                Some(PathBuf::from(&args.aux_model))
            } else {
                None
            },
            display: DisplayOptions {
                show_boxes: !args.hide_boxes,
                show_labels: !args.hide_labels,
                show_conf: !args.hide_conf,
            },
        };
        opts.validate()
    }

    /// 参数范围校验
    pub fn validate(self) -> Result<Self, VisionError> {
        if self.image_size.0 == 0 || self.image_size.1 == 0 {
            return Err(VisionError::InvalidConfig("推理尺寸必须大于0".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(VisionError::InvalidConfig(format!(
                "置信度阈值超出 [0,1]: {}",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.mask_threshold) {
            return Err(VisionError::InvalidConfig(format!(
                "掩码阈值超出 [0,1]: {}",
                self.mask_threshold
            )));
        }
        Ok(self)
    }

    /// 序列化为历史记录的 parameters 字段
    pub fn to_parameters_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["trafficvision", "--source", "dataset"])
    }

    #[test]
    fn test_device_parse() {
        assert_eq!(Device::from_str("cpu").unwrap(), Device::Cpu);
        assert_eq!(Device::from_str("auto").unwrap(), Device::Auto);
        assert_eq!(Device::from_str("cuda:1").unwrap(), Device::Cuda(1));
        assert_eq!(Device::from_str("cuda").unwrap(), Device::Cuda(0));
        assert!(Device::from_str("tpu").is_err());
    }

    #[test]
    fn test_from_args_defaults() {
        let opts = InferOptions::from_args(&base_args()).unwrap();
        assert_eq!(opts.image_size, (640, 640));
        assert!(opts.save_outputs);
        assert!(!opts.enable_auxiliary);
        assert!(opts.auxiliary_model.is_none());
        assert!(opts.output_dir.starts_with("runs"));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut args = base_args();
        args.conf = 1.5;
        assert!(InferOptions::from_args(&args).is_err());
    }

    #[test]
    fn test_parameters_json_roundtrip() {
        let opts = InferOptions::from_args(&base_args()).unwrap();
        let v = opts.to_parameters_json();
        assert_eq!(v["device"], serde_json::json!("auto"));
        assert_eq!(v["confidence_threshold"], serde_json::json!(0.25));
    }
}
