//! ONNX Runtime 推理引擎封装
//!
//! 模型被视作黑盒推理服务: 输入 NCHW f32 张量, 输出若干 f32 张量。
//! 加载失败携带模型路径上抛, 绝不让宿主进程崩溃。

use anyhow::{anyhow, Context, Result};
use ndarray::{Array, ArrayD, IxDyn};
use ort::{CUDAExecutionProvider, ExecutionProvider, GraphOptimizationLevel, Session};
use std::path::PathBuf;

use crate::config::Device;

/// 实际生效的执行后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    Cpu,
    Cuda(i32),
}

/// 引擎构建参数
#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub model_path: PathBuf,
    pub device: Device,
    /// 模型维度为动态时的回退输入尺寸 (height, width)
    pub image_size: (u32, u32),
}

/// ONNX Runtime 会话封装
pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    output_names: Vec<String>,
    height: u32,
    width: u32,
}

impl OrtBackend {
    /// 构建推理会话
    ///
    /// `Device::Auto` 时探测 CUDA, 不可用则回退 CPU;
    /// 显式指定 `cuda:N` 而设备不可用时同样回退并记录警告。
    pub fn build(config: OrtConfig) -> Result<Self> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?;

        let requested = match config.device {
            Device::Cpu => None,
            Device::Auto => Some(0),
            Device::Cuda(id) => Some(id),
        };
        let ep = match requested {
            Some(id) => {
                let cuda = CUDAExecutionProvider::default().with_device_id(id);
                if cuda.is_available().unwrap_or(false) && cuda.register(&builder).is_ok() {
                    OrtEP::Cuda(id)
                } else {
                    if config.device != Device::Auto {
                        log::warn!("CUDA 设备不可用, 回退 CPU 执行");
                    }
                    OrtEP::Cpu
                }
            }
            None => OrtEP::Cpu,
        };

        let session = builder
            .commit_from_file(&config.model_path)
            .with_context(|| format!("无法加载模型: {}", config.model_path.display()))?;

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.is_empty() {
            return Err(anyhow!("模型没有输出节点: {}", config.model_path.display()));
        }

        // 输入维度: 取模型声明的 NCHW, 动态维度回退到配置尺寸
        let (mut height, mut width) = config.image_size;
        if let Some(input) = session.inputs.first() {
            if let Some(dims) = input.input_type.tensor_dimensions() {
                if dims.len() == 4 {
                    if dims[2] > 0 {
                        height = dims[2] as u32;
                    }
                    if dims[3] > 0 {
                        width = dims[3] as u32;
                    }
                }
            }
        }

        Ok(Self {
            session,
            ep,
            output_names,
            height,
            width,
        })
    }

    /// 执行一次前向推理
    pub fn run(&self, xs: Array<f32, IxDyn>) -> Result<Vec<ArrayD<f32>>> {
        let ys = self.session.run(ort::inputs![xs.view()]?)?;
        let mut outputs = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let y = ys[name.as_str()]
                .try_extract_tensor::<f32>()
                .with_context(|| format!("输出张量 {} 提取失败", name))?
                .to_owned();
            outputs.push(y);
        }
        Ok(outputs)
    }

    pub fn ep(&self) -> OrtEP {
        self.ep
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn num_outputs(&self) -> usize {
        self.output_names.len()
    }
}
