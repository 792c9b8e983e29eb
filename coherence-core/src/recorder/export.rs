//! Export formats and sinks
//!
//! Rendering turns a session into an [`ExportArtifact`]; delivering it is
//! the job of an [`ExportSink`] (a directory on disk, an in-memory list, or
//! whatever download mechanism the host provides).
//!
//! ## CSV
//!
//! ```text
//! timestamp,iso_datetime,<numeric fields...>,<categorical fields...>
//! 1718000000000,2024-06-10T06:13:20.000Z,0.5,inhale
//! ```
//!
//! Numeric and categorical columns are each sorted by name. Numbers use the
//! shortest decimal text that parses back to the same value. A sample that
//! lacks a field leaves the cell empty. Lines end with `\n`.
//!
//! ## JSON
//!
//! `{ "metadata": {...}, "summary": {...}, "data": [...] }`

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Sample, SessionSummary};
use crate::error::{Result, SyncError};

/// Serialization target for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(SyncError::invalid(format!(
                "unknown export format '{}' (expected csv or json)",
                other
            ))),
        }
    }
}

/// A rendered session, ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportArtifact {
    pub file_name: String,
    pub mime_type: String,
    pub content: String,
}

/// What `export()` did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExportOutcome {
    Exported { file_name: String, bytes: usize },
    /// The buffer was empty; nothing was rendered or delivered
    NothingToExport,
}

/// Destination for export artifacts
pub trait ExportSink: Send + Sync {
    fn deliver(&self, artifact: &ExportArtifact) -> Result<()>;

    /// Sink name (for logging)
    fn name(&self) -> &'static str;
}

/// Writes each artifact as a file in a directory
#[derive(Debug, Clone)]
pub struct FileExportSink {
    dir: PathBuf,
}

impl FileExportSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `artifact` would be written
    pub fn path_for(&self, artifact: &ExportArtifact) -> PathBuf {
        self.dir.join(&artifact.file_name)
    }
}

impl ExportSink for FileExportSink {
    fn deliver(&self, artifact: &ExportArtifact) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(artifact);
        std::fs::write(&path, artifact.content.as_bytes())?;
        tracing::info!(path = %path.display(), bytes = artifact.content.len(), "export written");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Keeps every artifact in memory
#[derive(Debug, Default)]
pub struct MemoryExportSink {
    artifacts: Mutex<Vec<ExportArtifact>>,
}

impl MemoryExportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<ExportArtifact> {
        self.artifacts.lock().clone()
    }

    pub fn last(&self) -> Option<ExportArtifact> {
        self.artifacts.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.lock().is_empty()
    }
}

impl ExportSink for MemoryExportSink {
    fn deliver(&self, artifact: &ExportArtifact) -> Result<()> {
        self.artifacts.lock().push(artifact.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Serialize)]
struct FieldNames<'a> {
    numeric: Vec<&'a str>,
    categorical: Vec<&'a str>,
}

#[derive(Serialize)]
struct ExportMetadata<'a> {
    session_id: &'a str,
    start_time: String,
    end_time: String,
    sample_count: usize,
    exported_at: String,
    generator: String,
    fields: FieldNames<'a>,
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    metadata: ExportMetadata<'a>,
    summary: &'a SessionSummary,
    data: &'a [Sample],
}

fn field_names(samples: &[Sample]) -> (Vec<&str>, Vec<&str>) {
    let numeric: BTreeSet<&str> = samples
        .iter()
        .flat_map(|s| s.values.keys().map(String::as_str))
        .collect();
    let categorical: BTreeSet<&str> = samples
        .iter()
        .flat_map(|s| s.labels.keys().map(String::as_str))
        .collect();
    (numeric.into_iter().collect(), categorical.into_iter().collect())
}

/// File name for a session export
pub fn file_name(summary: &SessionSummary, format: ExportFormat) -> String {
    let short_id: String = summary.session_id.chars().take(8).collect();
    format!(
        "coherence-session-{}-{}.{}",
        summary.start_time.format("%Y%m%dT%H%M%SZ"),
        short_id,
        format.extension()
    )
}

/// Render `samples` and `summary` in `format`
pub fn render(
    format: ExportFormat,
    summary: &SessionSummary,
    samples: &[Sample],
) -> Result<ExportArtifact> {
    let content = match format {
        ExportFormat::Csv => render_csv(samples),
        ExportFormat::Json => render_json(summary, samples)?,
    };
    Ok(ExportArtifact {
        file_name: file_name(summary, format),
        mime_type: format.mime_type().to_string(),
        content,
    })
}

/// CSV text for `samples`
pub fn render_csv(samples: &[Sample]) -> String {
    let (numeric, categorical) = field_names(samples);
    let mut out = String::new();

    let header: Vec<String> = ["timestamp", "iso_datetime"]
        .iter()
        .chain(numeric.iter())
        .chain(categorical.iter())
        .map(|name| csv_field(name))
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for sample in samples {
        let mut row = Vec::with_capacity(2 + numeric.len() + categorical.len());
        row.push(sample.timestamp.timestamp_millis().to_string());
        row.push(sample.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
        for field in &numeric {
            row.push(
                sample
                    .values
                    .get(*field)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        for field in &categorical {
            row.push(
                sample
                    .labels
                    .get(*field)
                    .map(|v| csv_field(v))
                    .unwrap_or_default(),
            );
        }
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn render_json(summary: &SessionSummary, samples: &[Sample]) -> Result<String> {
    let (numeric, categorical) = field_names(samples);
    let document = JsonDocument {
        metadata: ExportMetadata {
            session_id: &summary.session_id,
            start_time: summary.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            end_time: summary.end_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            sample_count: samples.len(),
            exported_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            generator: format!("coherence-core {}", crate::VERSION),
            fields: FieldNames {
                numeric,
                categorical,
            },
        },
        summary,
        data: samples,
    };
    serde_json::to_string_pretty(&document).map_err(|e| SyncError::ExportFailure {
        reason: format!("cannot serialize session: {}", e),
    })
}

/// Quote a CSV field when it contains a delimiter, quote or line break
fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}
