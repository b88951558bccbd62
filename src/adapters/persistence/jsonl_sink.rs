//! JSONL Persistence Sink - Append-only Quote History
//!
//! Default `PersistenceSink`: every accepted quote is appended to a
//! daily `quotes/YYYY-MM-DD.jsonl` file (one self-contained record per
//! line, so the history doubles as a version log), and the latest
//! supervisor report is written atomically to `health.json`
//! (tmp file, then rename).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::domain::quote::Quote;
use crate::domain::state::HealthReport;
use crate::error::{IngestError, IngestResult};
use crate::ports::sinks::PersistenceSink;

/// One line of the quote history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub recorded_at: DateTime<Utc>,
    pub quote: Quote,
}

pub struct JsonlSink {
    quotes_dir: PathBuf,
    health_path: PathBuf,
    health_tmp: PathBuf,
    /// Serializes tmp-file writes of `health.json`.
    health_lock: Mutex<()>,
}

impl JsonlSink {
    /// Create the sink, creating `data_dir/quotes` if needed.
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        let quotes_dir = dir.join("quotes");
        fs::create_dir_all(&quotes_dir)
            .await
            .context("Failed to create quotes directory")?;

        Ok(Self {
            quotes_dir,
            health_path: dir.join("health.json"),
            health_tmp: dir.join("health.json.tmp"),
            health_lock: Mutex::new(()),
        })
    }

    fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.quotes_dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    async fn append_quote(&self, quote: &Quote) -> Result<()> {
        let record = QuoteRecord {
            recorded_at: Utc::now(),
            quote: quote.clone(),
        };
        let path = self.day_file(record.recorded_at.date_naive());

        let mut json = serde_json::to_string(&record).context("Failed to serialize quote record")?;
        json.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context("Failed to open quote log file")?;
        file.write_all(json.as_bytes())
            .await
            .context("Failed to write quote record")?;
        file.flush().await.context("Failed to flush quote log")?;
        Ok(())
    }

    async fn write_health(&self, report: &HealthReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report).context("Failed to serialize health report")?;
        let _guard = self.health_lock.lock().await;
        fs::write(&self.health_tmp, &json)
            .await
            .context("Failed to write tmp health file")?;
        fs::rename(&self.health_tmp, &self.health_path)
            .await
            .context("Failed to rename health file")?;
        Ok(())
    }

    /// Read one day of quote history, skipping malformed lines.
    #[instrument(skip(self))]
    pub async fn read_quotes(&self, date: NaiveDate) -> Result<Vec<QuoteRecord>> {
        let path = self.day_file(date);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<QuoteRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping malformed quote record"),
            }
        }
        Ok(records)
    }

    /// Last persisted supervisor report, if any.
    pub async fn read_health(&self) -> Result<Option<HealthReport>> {
        if !fs::try_exists(&self.health_path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.health_path)
            .await
            .context("Failed to read health file")?;
        let report = serde_json::from_str(&content).context("Failed to parse health file")?;
        Ok(Some(report))
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    async fn upsert_quote(&self, quote: &Quote) -> IngestResult<()> {
        self.append_quote(quote)
            .await
            .map_err(|e| IngestError::TransientIo(format!("{e:#}")))?;
        debug!(instrument = %quote.instrument_id, "Quote persisted");
        Ok(())
    }

    async fn upsert_service_state(&self, report: &HealthReport) -> IngestResult<()> {
        self.write_health(report)
            .await
            .map_err(|e| IngestError::TransientIo(format!("{e:#}")))
    }
}
