// llmlb — request history ring & token accounting
//
// RequestRecords live only in memory: a bounded FIFO ring sized from the
// dashboard settings (default 10 000). The push path is a short O(1)
// critical section so the proxy never blocks on readers. Token usage is
// additionally rolled into durable daily buckets keyed
// (endpoint_id, model_id, day).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{RecordStatus, RequestRecord, Usage};

pub struct HistoryRing {
    inner: Mutex<VecDeque<Arc<RequestRecord>>>,
    capacity: usize,
}

#[derive(Debug, Default, Clone)]
pub struct HistoryQuery {
    pub offset: usize,
    pub limit: usize,
    pub model: Option<String>,
    pub errors_only: bool,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(16_384))),
            capacity: capacity.max(1),
        }
    }

    /// Non-blocking append; evicts the oldest record at capacity.
    pub fn record(&self, record: RequestRecord) {
        let mut ring = self.inner.lock().expect("history ring");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(Arc::new(record));
    }

    /// Reverse-chronological page. `limit == 0` means a default page of 50.
    pub fn query(&self, q: &HistoryQuery) -> (Vec<Arc<RequestRecord>>, usize) {
        let ring = self.inner.lock().expect("history ring");
        let matches = |r: &Arc<RequestRecord>| {
            if let Some(model) = &q.model {
                if &r.model != model {
                    return false;
                }
            }
            if q.errors_only && matches!(r.status, RecordStatus::Success) {
                return false;
            }
            true
        };
        let total = ring.iter().filter(|r| matches(r)).count();
        let limit = if q.limit == 0 { 50 } else { q.limit };
        let page = ring
            .iter()
            .rev()
            .filter(|r| matches(r))
            .skip(q.offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    /// Body retrieval; None when the record has been evicted.
    pub fn get(&self, id: &str) -> Option<Arc<RequestRecord>> {
        let ring = self.inner.lock().expect("history ring");
        ring.iter().rev().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("history ring").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full snapshot, oldest first, for export.
    pub fn export_snapshot(&self) -> Vec<Arc<RequestRecord>> {
        self.inner.lock().expect("history ring").iter().cloned().collect()
    }
}

pub fn export_csv(records: &[Arc<RequestRecord>]) -> String {
    let mut out = String::from(
        "id,timestamp,path,model,endpoint_id,status,duration_ms,prompt_tokens,completion_tokens,total_tokens\n",
    );
    for r in records {
        let status = match &r.status {
            RecordStatus::Success => "success".to_string(),
            RecordStatus::Error(msg) => format!("error: {}", msg.replace(',', ";")),
        };
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            r.id,
            r.timestamp.to_rfc3339(),
            r.path,
            r.model,
            r.endpoint_id.as_deref().unwrap_or(""),
            status,
            r.duration_ms,
            r.prompt_tokens,
            r.completion_tokens,
            r.total_tokens,
        ));
    }
    out
}

// ---------------------------------------------------------------------------
// Durable daily token buckets
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TokenStats {
    db: SqlitePool,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct DailyBucket {
    pub day: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub requests: i64,
}

impl TokenStats {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Upsert today's bucket. Called off the proxy hot path.
    pub async fn record(&self, endpoint_id: &str, model_id: &str, usage: Usage) {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let result = sqlx::query(
            "INSERT INTO token_usage_daily \
             (endpoint_id, model_id, day, prompt_tokens, completion_tokens, total_tokens, requests) \
             VALUES (?, ?, ?, ?, ?, ?, 1) \
             ON CONFLICT (endpoint_id, model_id, day) DO UPDATE SET \
               prompt_tokens = prompt_tokens + excluded.prompt_tokens, \
               completion_tokens = completion_tokens + excluded.completion_tokens, \
               total_tokens = total_tokens + excluded.total_tokens, \
               requests = requests + 1",
        )
        .bind(endpoint_id)
        .bind(model_id)
        .bind(&day)
        .bind(usage.prompt_tokens as i64)
        .bind(usage.completion_tokens as i64)
        .bind(usage.total_tokens as i64)
        .execute(&self.db)
        .await;
        if let Err(e) = result {
            tracing::warn!("token stats insert failed: {e}");
        }
    }

    pub async fn totals(&self) -> DailyBucket {
        sqlx::query_as(
            "SELECT 'all' AS day, \
                    COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens, \
                    COALESCE(SUM(completion_tokens), 0) AS completion_tokens, \
                    COALESCE(SUM(total_tokens), 0) AS total_tokens, \
                    COALESCE(SUM(requests), 0) AS requests \
             FROM token_usage_daily",
        )
        .fetch_one(&self.db)
        .await
        .unwrap_or(DailyBucket {
            day: "all".into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            requests: 0,
        })
    }

    pub async fn daily(&self, days: u32) -> Vec<DailyBucket> {
        sqlx::query_as(
            "SELECT day, \
                    SUM(prompt_tokens) AS prompt_tokens, \
                    SUM(completion_tokens) AS completion_tokens, \
                    SUM(total_tokens) AS total_tokens, \
                    SUM(requests) AS requests \
             FROM token_usage_daily \
             GROUP BY day ORDER BY day DESC LIMIT ?",
        )
        .bind(days as i64)
        .fetch_all(&self.db)
        .await
        .unwrap_or_default()
    }

    pub async fn monthly(&self, months: u32) -> Vec<DailyBucket> {
        sqlx::query_as(
            "SELECT substr(day, 1, 7) AS day, \
                    SUM(prompt_tokens) AS prompt_tokens, \
                    SUM(completion_tokens) AS completion_tokens, \
                    SUM(total_tokens) AS total_tokens, \
                    SUM(requests) AS requests \
             FROM token_usage_daily \
             GROUP BY substr(day, 1, 7) ORDER BY day DESC LIMIT ?",
        )
        .bind(months as i64)
        .fetch_all(&self.db)
        .await
        .unwrap_or_default()
    }
}
