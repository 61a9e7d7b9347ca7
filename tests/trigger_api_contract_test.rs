/// Trigger API contract tests
///
/// Validates the request/response shapes the trigger and status endpoints
/// exchange with external schedulers and dashboards:
/// - POST /api/reports/trigger request body
/// - trigger acknowledgement payload
/// - latest-result payload
///
/// NOTE: These tests validate wire structures and parsing rules. Full
/// end-to-end behavior is covered by the in-crate test modules.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    scheduled_date: String,
    report_type: String,
    trigger_source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TriggerAck {
    run_id: String,
    scheduled_date: NaiveDate,
    report_type: String,
    status: String,
}

const REPORT_TYPES: [&str; 5] = [
    "pre-market",
    "intraday",
    "end-of-day",
    "weekly",
    "sector-rotation",
];

#[test]
fn trigger_request_parses_with_and_without_source() {
    let body = json!({
        "scheduled_date": "2024-03-01",
        "report_type": "weekly",
        "trigger_source": "cron"
    });
    let req: TriggerRequest = serde_json::from_value(body).unwrap();
    assert_eq!(req.scheduled_date, "2024-03-01");
    assert_eq!(req.report_type, "weekly");
    assert_eq!(req.trigger_source.as_deref(), Some("cron"));

    let body = json!({
        "scheduled_date": "2024-03-01",
        "report_type": "weekly"
    });
    let req: TriggerRequest = serde_json::from_value(body).unwrap();
    assert!(req.trigger_source.is_none());
}

#[test]
fn scheduled_date_must_be_iso() {
    assert!("2024-03-01".parse::<NaiveDate>().is_ok());
    assert!("03/01/2024".parse::<NaiveDate>().is_err());
    assert!("2024-13-01".parse::<NaiveDate>().is_err());
    assert!("not-a-date".parse::<NaiveDate>().is_err());
}

#[test]
fn report_type_wire_names_are_kebab_case() {
    for name in REPORT_TYPES {
        assert_eq!(name, name.to_lowercase());
        assert!(!name.contains('_'), "wire name {} must use dashes", name);
    }
}

#[test]
fn trigger_ack_round_trips() {
    let ack = TriggerAck {
        run_id: "4be0643f-1d98-573b-97cd-ca98a65347dd".to_string(),
        scheduled_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        report_type: "weekly".to_string(),
        status: "accepted".to_string(),
    };
    let value = serde_json::to_value(&ack).unwrap();
    assert_eq!(value["status"], "accepted");
    assert_eq!(value["scheduled_date"], "2024-03-01");

    let back: TriggerAck = serde_json::from_value(value).unwrap();
    assert_eq!(back.run_id, ack.run_id);
}

#[test]
fn latest_result_payload_exposes_audit_fields() {
    // Shape a dashboard depends on: status plus verbatim errors/warnings
    let payload = json!({
        "scheduled_date": "2024-03-01",
        "report_type": "weekly",
        "latest_run_id": "run-1",
        "run_seq": 7,
        "status": "partial",
        "current_stage": "finalize",
        "errors": [],
        "warnings": ["provider X timeout"],
        "updated_at": "2024-03-01T17:10:00Z"
    });
    assert_eq!(payload["status"], "partial");
    assert_eq!(payload["warnings"][0], "provider X timeout");
    assert!(payload["errors"].as_array().unwrap().is_empty());
}
