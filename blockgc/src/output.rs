//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use blockgc_core::{DeletionResult, GcStats, Pin};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// The `data` parameter must be a serializable struct that includes
    /// `success: bool` and `result_code: u8` fields.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(
        &self,
        data: &T,
        text_fn: impl FnOnce() -> String,
    ) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write one record of a streamed result.
    ///
    /// JSON mode emits one compact object per line so consumers can act on
    /// each record as it arrives.
    pub fn write_line<T: Serialize>(
        &self,
        data: &T,
        text_fn: impl FnOnce() -> String,
    ) -> Result<()> {
        let mut out = self.stdout.lock();
        match self.format {
            OutputFormat::Json => writeln!(out, "{}", serde_json::to_string(data)?)?,
            OutputFormat::Text => writeln!(out, "{}", text_fn())?,
        }
        out.flush()?;
        Ok(())
    }

    /// Write raw bytes to stdout regardless of format.
    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut out = self.stdout.lock();
        out.write_all(bytes)?;
        out.flush()?;
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    /// In text mode, writes the error message directly.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub algorithm: String,
    pub gc_concurrency: usize,
}

/// Output for `block put`.
#[derive(Debug, Serialize)]
pub struct BlockPutOutput {
    pub success: bool,
    pub result_code: u8,
    pub cid: String,
    pub size: usize,
}

/// Output for `block stat`.
#[derive(Debug, Serialize)]
pub struct BlockStatOutput {
    pub success: bool,
    pub result_code: u8,
    pub cid: String,
    pub codec: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned: Option<String>,
}

/// Output for `block rm`, `pin add`, `pin rm` and `files set-root`.
#[derive(Debug, Serialize)]
pub struct CidOutput {
    pub success: bool,
    pub result_code: u8,
    pub cid: String,
}

impl CidOutput {
    pub fn new(cid: impl ToString) -> Self {
        Self {
            success: true,
            result_code: 0,
            cid: cid.to_string(),
        }
    }
}

/// A listed pin.
#[derive(Debug, Clone, Serialize)]
pub struct PinInfo {
    pub cid: String,
    #[serde(rename = "type")]
    pub pin_type: String,
}

impl From<&Pin> for PinInfo {
    fn from(pin: &Pin) -> Self {
        Self {
            cid: pin.cid.to_string(),
            pin_type: pin.pin_type.to_string(),
        }
    }
}

/// Output for `pin ls`.
#[derive(Debug, Serialize)]
pub struct PinLsOutput {
    pub success: bool,
    pub result_code: u8,
    pub pins: Vec<PinInfo>,
}

/// Output for `files root`.
#[derive(Debug, Serialize)]
pub struct FilesRootOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: Option<String>,
}

/// Output for `refs`.
#[derive(Debug, Serialize)]
pub struct RefsOutput {
    pub success: bool,
    pub result_code: u8,
    pub refs: Vec<String>,
}

/// One streamed `gc` record: `{"cid": ...}` or `{"cid": ..., "err": ...}`.
#[derive(Debug, Serialize)]
pub struct GcResultLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl From<&DeletionResult> for GcResultLine {
    fn from(result: &DeletionResult) -> Self {
        let key = match result {
            DeletionResult::InvalidKey { key, .. } => Some(key.clone()),
            _ => None,
        };
        Self {
            cid: result.cid().map(|cid| cid.to_string()),
            key,
            err: result.error().map(|e| e.to_string()),
        }
    }
}

impl GcResultLine {
    /// Human-readable rendering of the record.
    pub fn text(&self, quiet: bool) -> String {
        let subject = self.cid.as_deref().or(self.key.as_deref());
        match (&self.err, subject) {
            (None, Some(cid)) if quiet => cid.to_string(),
            (None, Some(cid)) => format!("removed {}", cid),
            (Some(err), Some(subject)) => format!("error: {}: {}", subject, err),
            (Some(err), None) => format!("error: {}", err),
            (None, None) => String::new(),
        }
    }
}

/// Final `gc` summary record.
#[derive(Debug, Serialize)]
pub struct GcSummaryOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub marked: u64,
    pub visited: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
    pub invalid: u64,
    pub incomplete: bool,
}

impl From<GcStats> for GcSummaryOutput {
    fn from(stats: GcStats) -> Self {
        let clean = stats.failed == 0 && stats.invalid == 0 && !stats.incomplete;
        Self {
            success: clean,
            result_code: if clean { 0 } else { 1 },
            dry_run: stats.dry_run,
            marked: stats.marked,
            visited: stats.visited,
            skipped: stats.skipped,
            deleted: stats.deleted,
            failed: stats.failed,
            invalid: stats.invalid,
            incomplete: stats.incomplete,
        }
    }
}

impl GcSummaryOutput {
    pub fn text(&self) -> String {
        let verb = if self.dry_run { "Would delete" } else { "Deleted" };
        let mut text = format!(
            "{} {} of {} blocks ({} live)",
            verb, self.deleted, self.visited, self.skipped
        );
        if self.failed > 0 || self.invalid > 0 {
            text.push_str(&format!(
                "; {} failed, {} invalid keys",
                self.failed, self.invalid
            ));
        }
        if self.incomplete {
            text.push_str("; block listing failed, sweep incomplete");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockgc_core::{Algorithm, Codec, Error, block_cid};

    #[test]
    fn test_gc_line_shapes() {
        let cid = block_cid(Algorithm::Blake3, Codec::Raw, b"x").unwrap();

        let ok = GcResultLine::from(&DeletionResult::Deleted { cid });
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            format!(r#"{{"cid":"{}"}}"#, cid)
        );
        assert_eq!(ok.text(false), format!("removed {}", cid));
        assert_eq!(ok.text(true), cid.to_string());

        let failed = GcResultLine::from(&DeletionResult::DeleteFailed {
            cid,
            error: Error::block_not_found(cid.to_string()),
        });
        let value: serde_json::Value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["cid"], cid.to_string());
        assert!(value["err"].is_string());
        assert!(value.get("key").is_none());
    }

    #[test]
    fn test_invalid_key_line() {
        let line = GcResultLine::from(&DeletionResult::InvalidKey {
            key: "junk".to_string(),
            error: Error::invalid_cid("junk"),
        });
        let value: serde_json::Value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["key"], "junk");
        assert!(value.get("cid").is_none());
        assert!(line.text(false).starts_with("error: junk:"));
    }

    #[test]
    fn test_summary_flags_failures() {
        let stats = GcStats {
            visited: 3,
            deleted: 1,
            failed: 1,
            skipped: 1,
            ..GcStats::default()
        };
        let summary = GcSummaryOutput::from(stats);
        assert!(!summary.success);
        assert_eq!(summary.result_code, 1);
        assert!(summary.text().contains("1 failed"));
    }
}
