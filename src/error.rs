//! 错误分类
//!
//! 按错误来源划分: 模型加载/类别解析/持久化/输入帧/IO。
//! 批处理中的单任务错误被捕获进该任务的记录 (success=false),
//! 只有模型加载失败会中止整次运行。

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    /// 主模型加载失败 (致命, 携带尝试加载的路径)
    #[error("模型加载失败: {path}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// 主模型未加载就发起推理
    #[error("主模型未加载")]
    ModelNotLoaded,

    /// 主模型类别 id 超出注册表范围
    #[error("未知类别 id={0}")]
    UnknownClass(usize),

    /// 辅助模型类别 id 不在特殊ID映射表中
    ///
    /// 表示模型与注册表版本不匹配, 绝不能静默丢弃检测。
    #[error("辅助模型类别 id={0} 不在特殊ID映射表中 (模型/注册表版本不匹配)")]
    UnmappedAuxiliaryClass(usize),

    /// 历史记录持久化失败 (上抛给调用方, 不回滚已完成的推理)
    #[error("历史记录持久化失败: {0}")]
    Persistence(String),

    /// 输入帧损坏或无法解码 (批处理中跳过该任务并继续)
    #[error("无效输入帧: {path}")]
    InvalidFrame {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// 渲染结果写盘失败
    #[error("图像写出失败: {0}")]
    ImageWrite(#[from] image::ImageError),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    /// 推理引擎内部错误
    #[error(transparent)]
    Inference(#[from] anyhow::Error),

    /// 配置校验失败
    #[error("配置无效: {0}")]
    InvalidConfig(String),
}

impl From<rusqlite::Error> for VisionError {
    fn from(e: rusqlite::Error) -> Self {
        VisionError::Persistence(e.to_string())
    }
}
