//! 历史记录数据库
//!
//! 每次推理调用落一条只追加记录, 作为分析界面的审计数据。
//! 单表 `prediction_history`, 标识为自增 id, 除整条删除外从不修改。
//! 写入经互斥锁串行化 (单写多读), 统计查询在单条 SQL 内完成,
//! 不会与半写入的记录交错。

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::VisionError;
use crate::source::SourceType;

/// 一条推理调用记录
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    /// 自增主键, 写入前为 None
    pub id: Option<i64>,
    /// RFC3339 时间戳 (UTC, 保证文本序与时间序一致)
    pub timestamp: String,
    pub model_path: String,
    pub source_path: String,
    pub source_type: SourceType,
    pub result_path: Option<String>,
    pub parameters: serde_json::Value,
    pub success: bool,
    pub error_message: Option<String>,
    pub inference_time_ms: f64,
    pub num_detections: i64,
}

impl HistoryRecord {
    pub fn now_timestamp() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

/// 查询过滤条件
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// 模糊匹配 source_path / model_path
    pub keyword: Option<String>,
    /// 时间范围 (RFC3339, 闭区间)
    pub since: Option<String>,
    pub until: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

/// 聚合统计
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryStats {
    pub total: i64,
    pub success_count: i64,
    pub failure_count: i64,
    /// 成功记录的平均推理耗时 (ms)
    pub avg_inference_time_ms: f64,
    pub total_detections: i64,
}

/// 历史记录存储 (SQLite)
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// 打开 (或创建) 历史数据库
    pub fn open(db_path: &Path) -> Result<Self, VisionError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// 内存数据库 (测试用)
    pub fn open_in_memory() -> Result<Self, VisionError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), VisionError> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS prediction_history (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp TEXT NOT NULL,
              model_path TEXT NOT NULL,
              source_path TEXT NOT NULL,
              source_type TEXT NOT NULL,
              result_path TEXT,
              parameters TEXT,
              success INTEGER NOT NULL,
              error_message TEXT,
              inference_time REAL,
              num_detections INTEGER,
              created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_history_timestamp
              ON prediction_history(timestamp);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, VisionError> {
        self.conn
            .lock()
            .map_err(|_| VisionError::Persistence("历史库互斥锁中毒".into()))
    }

    /// 追加一条记录, 返回自增 id
    ///
    /// 存储层失败直接上抛 —— 历史是审计数据, 静默吞掉会破坏可追溯性。
    pub fn record(&self, rec: &HistoryRecord) -> Result<i64, VisionError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO prediction_history
              (timestamp, model_path, source_path, source_type, result_path,
               parameters, success, error_message, inference_time, num_detections)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                rec.timestamp,
                rec.model_path,
                rec.source_path,
                rec.source_type.as_str(),
                rec.result_path,
                rec.parameters.to_string(),
                rec.success as i64,
                rec.error_message,
                rec.inference_time_ms,
                rec.num_detections,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 条件查询, 按时间倒序
    pub fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, VisionError> {
        let (clause, mut values) = filter_clause(filter);
        let limit = filter.limit.unwrap_or(100);
        values.push(Value::from(limit as i64));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT id, timestamp, model_path, source_path, source_type, result_path,
                   parameters, success, error_message, inference_time, num_detections
            FROM prediction_history
            {}
            ORDER BY timestamp DESC, id DESC
            LIMIT ?{}
            "#,
            clause,
            values.len()
        ))?;

        let rows = stmt.query_map(params_from_iter(values), row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// 按 id 取单条记录
    pub fn get(&self, id: i64) -> Result<Option<HistoryRecord>, VisionError> {
        let conn = self.conn()?;
        let rec = conn
            .query_row(
                r#"
                SELECT id, timestamp, model_path, source_path, source_type, result_path,
                       parameters, success, error_message, inference_time, num_detections
                FROM prediction_history WHERE id = ?1
                "#,
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(rec)
    }

    /// 整条删除
    pub fn delete(&self, id: i64) -> Result<(), VisionError> {
        self.conn()?
            .execute("DELETE FROM prediction_history WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// 清空所有记录
    pub fn clear(&self) -> Result<(), VisionError> {
        self.conn()?.execute("DELETE FROM prediction_history", [])?;
        Ok(())
    }

    /// 聚合统计 (可选过滤条件)
    ///
    /// 单条 SQL 完成全部聚合, 读取落在一个一致快照上,
    /// 不会与并发插入交错出半写状态。
    pub fn aggregate(&self, filter: Option<&HistoryFilter>) -> Result<HistoryStats, VisionError> {
        let default_filter = HistoryFilter::default();
        let (clause, values) = filter_clause(filter.unwrap_or(&default_filter));

        let conn = self.conn()?;
        let stats = conn.query_row(
            &format!(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(success), 0),
                       AVG(CASE WHEN success = 1 THEN inference_time END),
                       COALESCE(SUM(CASE WHEN success = 1 THEN num_detections ELSE 0 END), 0)
                FROM prediction_history
                {}
                "#,
                clause
            ),
            params_from_iter(values),
            |row| {
                let total: i64 = row.get(0)?;
                let success_count: i64 = row.get(1)?;
                let avg: Option<f64> = row.get(2)?;
                let total_detections: i64 = row.get(3)?;
                Ok(HistoryStats {
                    total,
                    success_count,
                    failure_count: total - success_count,
                    avg_inference_time_ms: avg.unwrap_or(0.0),
                    total_detections,
                })
            },
        )?;
        Ok(stats)
    }
}

/// 过滤条件 → WHERE 子句与绑定参数
fn filter_clause(filter: &HistoryFilter) -> (String, Vec<Value>) {
    let mut conds = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(keyword) = &filter.keyword {
        values.push(Value::from(format!("%{}%", keyword)));
        conds.push(format!(
            "(source_path LIKE ?{n} OR model_path LIKE ?{n})",
            n = values.len()
        ));
    }
    if let Some(since) = &filter.since {
        values.push(Value::from(since.clone()));
        conds.push(format!("timestamp >= ?{}", values.len()));
    }
    if let Some(until) = &filter.until {
        values.push(Value::from(until.clone()));
        conds.push(format!("timestamp <= ?{}", values.len()));
    }
    if let Some(success) = filter.success {
        values.push(Value::from(success as i64));
        conds.push(format!("success = ?{}", values.len()));
    }

    let clause = if conds.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conds.join(" AND "))
    };
    (clause, values)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let source_type: String = row.get(4)?;
    let parameters: Option<String> = row.get(6)?;
    Ok(HistoryRecord {
        id: Some(row.get(0)?),
        timestamp: row.get(1)?,
        model_path: row.get(2)?,
        source_path: row.get(3)?,
        source_type: source_type.parse().unwrap_or(SourceType::Unknown),
        result_path: row.get(5)?,
        parameters: parameters
            .and_then(|p| serde_json::from_str(&p).ok())
            .unwrap_or(serde_json::Value::Null),
        success: row.get::<_, i64>(7)? != 0,
        error_message: row.get(8)?,
        inference_time_ms: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
        num_detections: row.get::<_, Option<i64>>(10)?.unwrap_or(0),
    })
}
