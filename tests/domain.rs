use assert_matches::assert_matches;
use dropstore::domain::{
    ArchivingStatus, DataSetCode, ExperimentIdentifier, ProcessingStatus, SampleIdentifier,
    Status, StatusUpdate, format_codes,
};
use dropstore::error::DropstoreError;

#[test]
fn parse_data_set_codes() {
    let code: DataSetCode = " 20240101120000-42 ".parse().unwrap();
    assert_eq!(code.as_str(), "20240101120000-42");
    assert_eq!("Mixed_Case.1".parse::<DataSetCode>().unwrap().as_str(), "Mixed_Case.1");

    for invalid in ["", ".hidden", "a/b", "with space"] {
        assert_matches!(
            invalid.parse::<DataSetCode>(),
            Err(DropstoreError::InvalidDataSetCode(_))
        );
    }
}

#[test]
fn parse_experiment_identifiers() {
    let identifier: ExperimentIdentifier = "/lab/proj/exp1".parse().unwrap();
    assert_eq!(identifier.to_string(), "/LAB/PROJ/EXP1");
    assert_eq!(identifier.code, "EXP1");

    assert_matches!(
        "/LAB/EXP1".parse::<ExperimentIdentifier>(),
        Err(DropstoreError::InvalidExperimentIdentifier(_))
    );
    assert_matches!(
        "/LAB//EXP1".parse::<ExperimentIdentifier>(),
        Err(DropstoreError::InvalidExperimentIdentifier(_))
    );
}

#[test]
fn sample_identifiers_are_upper_case() {
    let sample = SampleIdentifier::new("lab", "cp1");
    assert_eq!(sample.as_str(), "/LAB/CP1");
    assert_eq!(sample.code(), "CP1");
}

#[test]
fn archiving_status_round_trips_through_text() {
    assert_eq!("archived".parse::<ArchivingStatus>().unwrap(), ArchivingStatus::Archived);
    assert_eq!(ArchivingStatus::Available.to_string(), "AVAILABLE");
    assert_matches!(
        "LOCKED".parse::<ArchivingStatus>(),
        Err(DropstoreError::InvalidArchivingStatus(_))
    );

    let codes = vec!["ds1".parse().unwrap(), "ds2".parse().unwrap()];
    assert_eq!(format_codes(&codes), "[ds1, ds2]");
    let update = StatusUpdate::new(codes, ArchivingStatus::Archived, true);
    assert_eq!(update.to_string(), "[ds1, ds2] - ARCHIVED");
}

#[test]
fn processing_status_serializes_per_code() {
    let mut status = ProcessingStatus::new();
    let codes: Vec<DataSetCode> = vec!["ds1".parse().unwrap(), "ds2".parse().unwrap()];
    status.add_ok_all(&codes);
    status.add_error_all(&codes[1..], "Unarchiving failed: disk full");

    assert_eq!(status.error_statuses().len(), 1);
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "entries": [
                {"code": "ds1", "status": {"result": "OK"}},
                {"code": "ds2", "status": {"result": "ERROR", "message": "Unarchiving failed: disk full"}}
            ]
        })
    );
    assert!(Status::Error("x".to_string()).is_error());
}
