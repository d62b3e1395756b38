//! Command-line surface of the `skyarchive` binary.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sa_core::{ExportFormat, OperationKind};
use uuid::Uuid;

/// Archive an author's posts, profile and media, and export them later.
#[derive(Parser, Debug)]
#[command(name = "skyarchive", version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Settings file (default: ./skyarchive.toml when present).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Archive a subject and follow its progress. Ctrl-C cancels the run.
    Archive {
        /// DID or handle of the subject.
        did: String,

        /// initial, incremental or refresh.
        #[arg(short, long, default_value = "initial", value_parser = parse_kind)]
        kind: OperationKind,
    },

    /// Show a persisted archive operation.
    Status {
        operation_id: Uuid,
    },

    /// Mark operations left pending or running by a dead process as failed.
    Recover,

    /// Export a subject's archived posts.
    Export {
        did: String,

        /// csv, json or jsonl.
        #[arg(short, long, default_value = "csv", value_parser = parse_format)]
        format: ExportFormat,

        /// Output root (default: export_path from settings).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Copy linked media next to the posts file.
        #[arg(long)]
        include_media: bool,

        /// Only posts created at or after this date (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        since: Option<DateTime<Utc>>,

        /// Only posts created before this date (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_date)]
        until: Option<DateTime<Utc>>,

        /// Posts per batch (default: export_batch_size from settings).
        #[arg(long)]
        batch_size: Option<u64>,
    },
}

fn parse_kind(raw: &str) -> Result<OperationKind, String> {
    raw.parse().map_err(|e: sa_core::AppError| e.to_string())
}

fn parse_format(raw: &str) -> Result<ExportFormat, String> {
    raw.parse().map_err(|e: sa_core::AppError| e.to_string())
}

pub fn parse_date(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("'{raw}' is neither RFC 3339 nor YYYY-MM-DD"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_archive_defaults_to_initial() {
        let cli = Cli::try_parse_from(["skyarchive", "archive", "did:plc:alice"]).unwrap();
        match cli.command {
            Command::Archive { did, kind } => {
                assert_eq!(did, "did:plc:alice");
                assert_eq!(kind, OperationKind::Initial);
            }
            other => panic!("Expected Archive, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["skyarchive", "archive", "did:plc:alice", "--kind", "full"]).is_err());
    }

    #[test]
    fn test_cli_export_options() {
        let cli = Cli::try_parse_from([
            "skyarchive",
            "--config",
            "custom.toml",
            "export",
            "did:plc:alice",
            "--format",
            "ndjson",
            "--include-media",
            "--since",
            "2024-01-01",
            "--until",
            "2024-02-01T00:00:00Z",
            "--batch-size",
            "250",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        match cli.command {
            Command::Export { format, include_media, since, until, batch_size, out, .. } => {
                assert_eq!(format, ExportFormat::Jsonl);
                assert!(include_media);
                assert_eq!(since.unwrap().to_rfc3339(), "2024-01-01T00:00:00+00:00");
                assert_eq!(until.unwrap().to_rfc3339(), "2024-02-01T00:00:00+00:00");
                assert_eq!(batch_size, Some(250));
                assert!(out.is_none());
            }
            other => panic!("Expected Export, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_status_requires_uuid() {
        assert!(Cli::try_parse_from(["skyarchive", "status", "not-a-uuid"]).is_err());
        let id = Uuid::now_v7().to_string();
        assert!(Cli::try_parse_from(["skyarchive", "status", id.as_str()]).is_ok());
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(parse_date("yesterday").is_err());
        assert!(parse_date("2024-13-01").is_err());
    }
}
