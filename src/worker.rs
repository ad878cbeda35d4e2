//! 推理工作器与批处理调度
//!
//! 一次推理调用: 主模型必跑, 辅助模型可选; 两路前向在作用域线程中并发
//! 执行, 融合前有汇合屏障。调用耗时在百毫秒到秒级, 必须在交互线程之外
//! 发起。
//!
//! 批处理: 采集线程经有界队列向推理端供帧 (满则阻塞, 批处理路径绝不丢
//! 帧), 结果经重排序缓冲按提交顺序出列; 取消是协作式标志, 只在任务边界
//! 生效, 在飞任务允许跑完以避免残缺产物。

use anyhow::anyhow;
use crossbeam_channel::bounded;
use image::{DynamicImage, GenericImageView, RgbImage};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::analyzer::{analyze, TrafficSemantics};
use crate::config::InferOptions;
use crate::error::VisionError;
use crate::fusion::fuse;
use crate::models::{MTDetr, Model, YoloV10};
use crate::registry::CategoryRegistry;
use crate::renderer::{to_label_text, DetectionRenderer};
use crate::source;
use crate::FrameResult;

/// 协作式取消标志
///
/// 用户请求停止后, 批处理在下一个任务边界退出; 不强杀在飞的模型调用。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// 单任务处理产物
pub struct ProcessOutcome {
    pub result: FrameResult,
    pub semantics: TrafficSemantics,
    pub result_path: Option<PathBuf>,
}

/// 推理工作器: 持有两个模型句柄与渲染器, 逐帧产出融合结果
pub struct InferenceWorker {
    primary: MTDetr,
    auxiliary: Option<YoloV10>,
    registry: Arc<CategoryRegistry>,
    opts: InferOptions,
    renderer: DetectionRenderer,
}

impl InferenceWorker {
    /// 加载模型
    ///
    /// 主模型加载失败是致命错误 (`ModelLoad` 携带路径);
    /// 辅助模型加载失败仅告警并退化为单模型运行。
    pub fn load(
        opts: InferOptions,
        registry: Arc<CategoryRegistry>,
    ) -> Result<Self, VisionError> {
        let primary =
            MTDetr::load(&opts.primary_model, &opts).map_err(|source| VisionError::ModelLoad {
                path: opts.primary_model.clone(),
                source,
            })?;

        let auxiliary = if opts.enable_auxiliary {
            match &opts.auxiliary_model {
                Some(path) => match YoloV10::load(path, &opts) {
                    Ok(m) => Some(m),
                    Err(e) => {
                        log::warn!("辅助模型加载失败, 退化为仅主模型: {:#}", e);
                        None
                    }
                },
                None => {
                    log::warn!("启用了辅助检测但未提供模型路径, 退化为仅主模型");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            primary,
            auxiliary,
            registry,
            opts,
            renderer: DetectionRenderer::new(),
        })
    }

    pub fn options(&self) -> &InferOptions {
        &self.opts
    }

    /// 单帧推理: 主/辅两路并发前向 → 汇合 → 融合
    ///
    /// 辅助模型输出先按关注类别 (行人/红绿灯原始ID) 过滤再进融合,
    /// 其余辅助检测在融合前丢弃。
    pub fn infer(&mut self, frame: &DynamicImage) -> Result<FrameResult, VisionError> {
        let start = Instant::now();
        let interest = self.registry.auxiliary_raw_ids();
        let primary_path = self.opts.primary_model.clone();
        let auxiliary_path = self
            .auxiliary
            .as_ref()
            .map(|m| m.model_path().to_path_buf());
        let run_aux = self.opts.enable_auxiliary && self.auxiliary.is_some();

        let primary = &mut self.primary;
        let auxiliary = &mut self.auxiliary;

        // 两路模型互不共享可变状态, 可以并发; 融合必须等两路都完成
        let (p_out, a_out) = thread::scope(|scope| {
            let aux_handle = if run_aux {
                auxiliary
                    .as_mut()
                    .map(|aux| scope.spawn(move || aux.forward(frame)))
            } else {
                None
            };

            let p = primary.forward(frame);
            let a = aux_handle.map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow!("辅助模型推理线程崩溃")))
            });
            (p, a)
        });

        let p_out = p_out?;
        let a_filtered = match a_out {
            Some(raw) => Some(
                raw?.bboxes
                    .into_iter()
                    .filter(|b| interest.contains(&b.id()))
                    .collect::<Vec<_>>(),
            ),
            None => None,
        };

        let inference_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        fuse(
            &self.registry,
            frame.dimensions(),
            p_out,
            a_filtered,
            inference_time_ms,
            primary_path,
            auxiliary_path,
        )
    }

    /// 单帧完整处理: 推理 → 语义分析 → (可选) 渲染并落盘
    pub fn process(
        &mut self,
        frame: &DynamicImage,
        output_name: &str,
    ) -> Result<ProcessOutcome, VisionError> {
        let result = self.infer(frame)?;
        let rgb = frame.to_rgb8();
        let semantics = analyze(&rgb, &result);

        let result_path = if self.opts.save_outputs {
            let rendered = self.renderer.render(
                &rgb,
                &result,
                Some(&semantics),
                &self.registry,
                &self.opts.display,
            );
            let label_text = to_label_text(&result);
            Some(save_outputs_atomic(
                &self.opts.output_dir,
                output_name,
                &rendered,
                &label_text,
            )?)
        } else {
            None
        };

        Ok(ProcessOutcome {
            result,
            semantics,
            result_path,
        })
    }
}

/// 渲染图与标签文件成对落盘
///
/// 先写临时文件再成对改名, 从调用方视角两份产物要么都在要么都不在,
/// 避免中断后留下半套输出。
pub fn save_outputs_atomic(
    out_dir: &Path,
    filename: &str,
    rendered: &RgbImage,
    label_text: &str,
) -> Result<PathBuf, VisionError> {
    let labels_dir = out_dir.join("labels");
    fs::create_dir_all(&labels_dir)?;

    let file = Path::new(filename);
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("frame");
    let image_name = match source::SourceType::of(file) {
        source::SourceType::Image => filename.to_string(),
        _ => format!("{}.png", stem),
    };
    let image_path = out_dir.join(&image_name);
    let label_path = labels_dir.join(format!("{}.txt", stem));

    let tmp_image = out_dir.join(format!(".{}.tmp", image_name));
    let tmp_label = labels_dir.join(format!(".{}.txt.tmp", stem));

    let format =
        image::ImageFormat::from_path(&image_path).unwrap_or(image::ImageFormat::Png);
    if let Err(e) = rendered.save_with_format(&tmp_image, format) {
        let _ = fs::remove_file(&tmp_image);
        return Err(e.into());
    }
    if let Err(e) = fs::write(&tmp_label, label_text) {
        let _ = fs::remove_file(&tmp_image);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp_image, &image_path) {
        let _ = fs::remove_file(&tmp_image);
        let _ = fs::remove_file(&tmp_label);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp_label, &label_path) {
        let _ = fs::remove_file(&image_path);
        let _ = fs::remove_file(&tmp_label);
        return Err(e.into());
    }
    Ok(image_path)
}

/// 重排序缓冲: 乱序完成的结果按提交序号释放
pub struct Resequencer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Resequencer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// 提交一个完成结果, 返回当前可按序释放的连续前缀
    pub fn push(&mut self, seq: u64, item: T) -> Vec<T> {
        self.pending.insert(seq, item);
        let mut released = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            released.push(item);
            self.next += 1;
        }
        released
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for Resequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 单任务摘要 (进历史记录)
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub num_detections: usize,
    pub inference_time_ms: f64,
    pub result_path: Option<PathBuf>,
    pub pedestrian_risk: bool,
}

/// 单任务结果: 错误被捕获进任务而不是中止整批
#[derive(Debug)]
pub struct JobOutcome {
    pub index: usize,
    pub source: PathBuf,
    pub result: Result<JobSummary, VisionError>,
}

/// 批处理统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// 批处理主循环
///
/// 采集线程预取第 N+1 帧的同时推理第 N 帧, 队列有界以限制内存
/// (慢消费者令采集端阻塞, 绝不丢帧)。即使任务乱序完成, 结果也按
/// 提交顺序交给 `on_result`。单任务错误 (如损坏帧) 进该任务的结果,
/// 批处理继续。
pub fn run_batch<J, F>(
    sources: Vec<PathBuf>,
    cancel: &CancelToken,
    queue_depth: usize,
    mut job: J,
    mut on_result: F,
) -> BatchStats
where
    J: FnMut(usize, &Path, DynamicImage) -> Result<JobSummary, VisionError>,
    F: FnMut(JobOutcome),
{
    let mut stats = BatchStats {
        total: sources.len(),
        ..Default::default()
    };

    let (tx, rx) = bounded::<(usize, PathBuf, Result<DynamicImage, VisionError>)>(queue_depth);
    let acquisition = thread::spawn(move || {
        for (idx, path) in sources.into_iter().enumerate() {
            let frame = source::load_frame(&path);
            if tx.send((idx, path, frame)).is_err() {
                // 消费端提前退出 (取消)
                break;
            }
        }
    });

    let mut resequencer = Resequencer::new();
    for (idx, path, frame) in rx.iter() {
        if cancel.is_cancelled() {
            log::info!("收到停止请求, 剩余任务跳过");
            stats.cancelled = true;
            break;
        }

        let result = match frame {
            Ok(frame) => job(idx, &path, frame),
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => stats.succeeded += 1,
            Err(e) => {
                stats.failed += 1;
                log::error!("任务失败 [{}]: {}", path.display(), e);
            }
        }

        for outcome in resequencer.push(
            idx as u64,
            JobOutcome {
                index: idx,
                source: path,
                result,
            },
        ) {
            on_result(outcome);
        }
    }

    drop(rx);
    let _ = acquisition.join();
    stats
}
