/*!
Tests for the error types and the failure taxonomy.
*/

#[cfg(test)]
mod tests {
    use crate::error::{Failure, PersistError, RebindError};
    use crate::memento::ObjectKind;
    use std::io;
    use std::time::Duration;

    fn json_error() -> serde_json::Error {
        serde_json::from_str::<serde_json::Value>("{").unwrap_err()
    }

    #[test]
    fn test_persist_error_display() {
        let error = PersistError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = PersistError::compression("test compression error");
        assert_eq!(error.to_string(), "Compression error: test compression error");

        let error = PersistError::storage("bucket unreachable");
        assert_eq!(error.to_string(), "Storage error: bucket unreachable");
    }

    #[test]
    fn test_persist_error_from_io_and_json() {
        let persist_error = PersistError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(persist_error, PersistError::Io(_)));

        let persist_error = PersistError::from(json_error());
        assert!(matches!(persist_error, PersistError::Json(_)));
    }

    #[test]
    fn test_timeout_reports_elapsed_millis() {
        let error = PersistError::timeout("pending writes", Duration::from_millis(250));
        assert_eq!(
            error.to_string(),
            "Timed out after 250ms waiting for pending writes"
        );
    }

    #[test]
    fn test_interrupted_predicate() {
        assert!(PersistError::interrupted("mirror cancelled").is_interrupted());
        assert!(!PersistError::invalid_state("already started").is_interrupted());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PersistError>();
        assert_sync::<PersistError>();
        assert_send::<Failure>();
    }

    #[test]
    fn test_dangling_reference_labels() {
        let typed = Failure::DanglingReference {
            kind: Some(ObjectKind::Entity),
            id: "e1".to_string(),
        };
        assert_eq!(typed.to_string(), "no entity found with id e1");

        let catalog = Failure::DanglingReference {
            kind: Some(ObjectKind::CatalogItem),
            id: "c1".to_string(),
        };
        assert_eq!(catalog.to_string(), "no catalog item found with id c1");

        let untyped = Failure::DanglingReference {
            kind: None,
            id: "x".to_string(),
        };
        assert_eq!(untyped.to_string(), "no object found with id x");
    }

    #[test]
    fn test_failure_category_and_id() {
        let failure = Failure::AddPolicy {
            entity_id: "app".to_string(),
            adjunct_id: "p1".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(failure.category(), "add_policy");
        assert_eq!(failure.id(), "p1");

        let failure = Failure::RawPersist {
            target: "manifest".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(failure.category(), "raw_persist");
        assert_eq!(failure.id(), "manifest");
    }

    #[test]
    fn test_composite_rebind_error_lists_failures() {
        let failures = vec![
            Failure::Load {
                kind: ObjectKind::Entity,
                id: "e3".to_string(),
                reason: "bad json".to_string(),
            },
            Failure::NotFound {
                kind: ObjectKind::Location,
                id: "l1".to_string(),
            },
        ];
        let error = RebindError::composite(failures);
        let text = error.to_string();

        assert!(text.starts_with("Problems rebinding: "));
        assert!(text.contains("e3"));
        assert!(text.contains("l1"));
        assert_eq!(error.failures().len(), 2);
        assert!(!error.is_abort());
    }

    #[test]
    fn test_single_failure_composite_is_singular() {
        let error = RebindError::composite(vec![Failure::NotFound {
            kind: ObjectKind::Feed,
            id: "f1".to_string(),
        }]);
        assert!(error.to_string().starts_with("Problem rebinding: "));
    }

    #[test]
    fn test_aborted_rebind_error_mentions_cause_once() {
        let error = RebindError::aborted(Failure::Load {
            kind: ObjectKind::Entity,
            id: "corrupt-7".to_string(),
            reason: "EOF".to_string(),
        });
        let text = PersistError::from(error).to_string();

        assert!(text.starts_with("Rebind: aborting due to"));
        assert_eq!(text.matches("corrupt-7").count(), 1);
    }
}
