//! 多任务交通视觉感知 CLI
//!
//! 运行架构:
//! 1. 采集线程: 读取并解码输入图片 (有界队列预取)
//! 2. 推理线程(主线程): 主/辅双模型并发前向 → 融合 → 语义分析 → 渲染落盘
//! 3. 每个任务落一条历史记录 (成功与失败都记, 供分析界面审计)
//!
//! 视频流的帧采集由外部采集组件负责, 此入口只接受图片与文件夹。

use anyhow::{bail, Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use traffic_vision::history::{HistoryRecord, HistoryStore};
use traffic_vision::monitor::PerformanceSampler;
use traffic_vision::source::{self, SourceType};
use traffic_vision::worker::{run_batch, CancelToken, InferenceWorker, JobSummary};
use traffic_vision::{Args, CategoryRegistry, InferOptions};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let opts = InferOptions::from_args(&args)?;

    // 输入源展开
    let source_path = PathBuf::from(&args.source);
    let source_type = SourceType::of(&source_path);
    let jobs: Vec<PathBuf> = match source_type {
        SourceType::Image => vec![source_path.clone()],
        SourceType::Folder => {
            let images = source::collect_images(&source_path)?;
            if images.is_empty() {
                bail!("文件夹中没有可识别的图片: {}", source_path.display());
            }
            images
        }
        SourceType::Video => {
            bail!("视频输入的帧采集由外部采集组件提供, CLI 只接受图片/文件夹")
        }
        SourceType::Unknown => bail!("无法识别的输入源: {}", source_path.display()),
    };
    log::info!("输入源: {} ({}, {} 个任务)", args.source, source_type, jobs.len());

    // 启动时构造一次, 之后只读共享
    let registry = Arc::new(CategoryRegistry::new());
    let history = HistoryStore::open(Path::new(&args.db))?;
    let sampler = PerformanceSampler::start(Duration::from_secs(1));

    let mut worker = InferenceWorker::load(opts.clone(), registry)
        .context("推理工作器初始化失败")?;

    // Ctrl-C → 协作式取消, 在任务边界生效
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::warn!("收到停止请求, 当前任务完成后退出");
            cancel.cancel();
        })?;
    }

    let parameters = opts.to_parameters_json();
    let model_path = opts.primary_model.display().to_string();
    let per_job_source_type = if source_type == SourceType::Folder {
        SourceType::Image
    } else {
        source_type
    };

    let stats = run_batch(
        jobs,
        &cancel,
        4,
        |_, path, frame| {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("frame.png");
            let outcome = worker.process(&frame, name)?;
            if outcome.semantics.pedestrian_risk() {
                log::warn!("[{}] 警告: 行人出现在道路区域内!", path.display());
            }
            for (_, color) in outcome.semantics.traffic_light_colors() {
                log::info!("[{}] 红绿灯: {}", path.display(), color.label());
            }
            Ok(JobSummary {
                num_detections: outcome.result.num_detections(),
                inference_time_ms: outcome.result.inference_time_ms(),
                result_path: outcome.result_path,
                pedestrian_risk: outcome.semantics.pedestrian_risk(),
            })
        },
        |outcome| {
            // 成败都落历史, 由 success 标志区分
            let (success, error_message, summary) = match &outcome.result {
                Ok(s) => (true, None, Some(s)),
                Err(e) => (false, Some(e.to_string()), None),
            };
            let record = HistoryRecord {
                id: None,
                timestamp: HistoryRecord::now_timestamp(),
                model_path: model_path.clone(),
                source_path: outcome.source.display().to_string(),
                source_type: per_job_source_type,
                result_path: summary
                    .and_then(|s| s.result_path.as_ref())
                    .map(|p| p.display().to_string()),
                parameters: parameters.clone(),
                success,
                error_message,
                inference_time_ms: summary.map_or(0.0, |s| s.inference_time_ms),
                num_detections: summary.map_or(0, |s| s.num_detections as i64),
            };
            // 历史写失败不回滚已完成的推理, 只上报
            if let Err(e) = history.record(&record) {
                log::error!("历史记录写入失败: {}", e);
            }
        },
    );

    log::info!(
        "批处理完成: 共 {} 个任务, 成功 {}, 失败 {}{}",
        stats.total,
        stats.succeeded,
        stats.failed,
        if stats.cancelled { " (用户中止)" } else { "" }
    );
    if opts.save_outputs {
        log::info!("输出目录: {}", opts.output_dir.display());
    }

    if let Some(snap) = sampler.latest() {
        log::info!(
            "资源占用: CPU {:.1}%, 内存 {:.1}% ({:.1}/{:.1} GB)",
            snap.cpu_percent,
            snap.mem_percent,
            snap.mem_used_gb,
            snap.mem_total_gb
        );
    }
    sampler.stop();

    let aggregate = history.aggregate(None)?;
    log::info!(
        "历史统计: 共 {} 条记录, 成功 {}, 平均耗时 {:.1} ms",
        aggregate.total,
        aggregate.success_count,
        aggregate.avg_inference_time_ms
    );

    Ok(())
}
