//! Tests for the vm-history-core library module.

use super::*;

#[test]
fn test_event_id_generation() {
    let id1 = EventId::new();
    let id2 = EventId::new();

    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
}

#[test]
fn test_event_id_round_trips_through_string() {
    let id = EventId::new();

    let parsed: EventId = id.as_str().parse().expect("valid ULID");

    assert_eq!(parsed, id);
}

#[test]
fn test_event_id_rejects_garbage() {
    let result = "not-a-ulid".parse::<EventId>();

    assert!(matches!(result, Err(ParseError::InvalidFormat { .. })));
}

#[test]
fn test_numeric_ids_parse_and_display() {
    let vm: VmId = " 17 ".parse().expect("numeric id");
    let user = UserId::new(3);
    let credential = CredentialId::new(99);

    assert_eq!(vm.as_u64(), 17);
    assert_eq!(user.to_string(), "3");
    assert_eq!(credential.as_u64(), 99);
    assert!("-1".parse::<UserId>().is_err());
}

#[test]
fn test_numeric_ids_serialize_as_plain_numbers() {
    let json = serde_json::to_value(VmId::new(5)).unwrap();

    assert_eq!(json, serde_json::json!(5));
}

#[test]
fn test_timestamp_start_of_day() {
    let ts = Timestamp::from_rfc3339("2024-03-05T17:45:12Z").unwrap();

    let midnight = ts.start_of_day();

    assert_eq!(midnight.to_rfc3339(), "2024-03-05T00:00:00+00:00");
    assert_eq!(midnight.date(), ts.date());
}

#[test]
fn test_timestamp_ordering_and_arithmetic() {
    let later = Timestamp::from_rfc3339("2024-03-05T17:45:12Z").unwrap();
    let earlier = later.subtract_duration(Duration::from_secs(90));

    assert!(later > earlier);
    assert_eq!(earlier.to_rfc3339(), "2024-03-05T17:43:42+00:00");
}
