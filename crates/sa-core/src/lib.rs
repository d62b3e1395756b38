//! skyarchive/crates/sa-core/src/lib.rs
//!
//! The domain models and interface definitions shared by every skyarchive crate.

pub mod error;
pub mod models;
pub mod traits;

// Re-exporting for easier access in other crates
pub use error::*;
pub use models::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::models::*;

    #[test]
    fn test_namespaced_uri() {
        assert!(is_namespaced_uri("at://did:plc:abc/app.bsky.feed.post/3k"));
        assert!(is_namespaced_uri("https://example.com"));
        assert!(!is_namespaced_uri("did:plc:abc"));
        assert!(!is_namespaced_uri("at:///nothing"));
        assert!(!is_namespaced_uri("://host/path"));
    }

    #[test]
    fn test_operation_state_machine() {
        let mut op = Operation::new("did:plc:alice", OperationKind::Initial);
        assert_eq!(op.status, OperationStatus::Pending);

        op.transition(OperationStatus::Running).unwrap();
        op.advance(10);
        op.complete().unwrap();

        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.progress_current, op.progress_total);
        assert!(op.completed_at.is_some());

        // Terminal states are final.
        assert!(op.transition(OperationStatus::Running).is_err());
        assert!(op.fail("late").is_err());
        assert!(op.error.is_none());
    }

    #[test]
    fn test_running_cannot_go_back_to_pending() {
        let mut op = Operation::new("did:plc:alice", OperationKind::Refresh);
        assert!(op.transition(OperationStatus::Completed).is_err());
        assert!(op.complete().is_err());
        assert_eq!(op.status, OperationStatus::Pending);

        op.transition(OperationStatus::Running).unwrap();
        assert!(op.transition(OperationStatus::Pending).is_err());
        assert!(op.transition(OperationStatus::Running).is_err());

        op.cancel("stopped").unwrap();
        assert_eq!(op.error.as_deref(), Some("stopped"));
    }

    #[test]
    fn test_progress_never_exceeds_known_total() {
        let mut op = Operation::new("did:plc:alice", OperationKind::Initial);
        op.estimate_total(5);
        op.advance(3);
        assert_eq!((op.progress_current, op.progress_total), (3, 5));
        op.advance(4);
        assert_eq!((op.progress_current, op.progress_total), (7, 7));
        op.estimate_total(2);
        assert_eq!(op.progress_total, 7);
    }

    #[test]
    fn test_enum_round_trips_through_strings() {
        for kind in [OperationKind::Initial, OperationKind::Incremental, OperationKind::Refresh] {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert_eq!("NDJSON".parse::<ExportFormat>().unwrap(), ExportFormat::Jsonl);
        assert!("xml".parse::<ExportFormat>().is_err());
        assert_eq!("record_with_media".parse::<EmbedType>().unwrap(), EmbedType::RecordWithMedia);
    }

    #[test]
    fn test_export_job_layout() {
        let job = ExportJob::new(ExportOptions {
            subject_did: "did:plc:alice".into(),
            format: ExportFormat::Json,
            output_root: "/tmp/exports".into(),
            include_media: false,
            since: None,
            until: None,
        });
        assert_eq!(job.status, ExportStatus::Queued);
        assert!(job.output_dir.starts_with("/tmp/exports"));
        assert!(job.output_dir.ends_with(format!("export-{}", job.id)));
    }
}
