//! Crate-level tests for the wire formats handlers and sockets commit to,
//! as opposed to the per-module unit tests living next to their services.

use crate::models::dto::{QueryRequest, StreamFrame};
use crate::models::domain::is_valid_tenant_id;

#[test]
fn stream_frame_tags_are_stable() {
    let token = serde_json::to_value(StreamFrame::Token { delta: "hi".to_string() }).unwrap();
    assert_eq!(token["type"], "token");
    assert_eq!(token["delta"], "hi");

    let done = serde_json::to_value(StreamFrame::Done { sources: vec![] }).unwrap();
    assert_eq!(done["type"], "done");
    assert!(done["sources"].as_array().unwrap().is_empty());

    let error = serde_json::to_value(StreamFrame::Error { message: "boom".to_string() }).unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "boom");
}

#[test]
fn query_request_accepts_optional_document_ids() {
    let with_ids = serde_json::json!({
        "tenantId": "acme",
        "question": "what is the refund window?",
        "documentIds": [1, 2, 3],
    });
    let parsed: QueryRequest = serde_json::from_value(with_ids).unwrap();
    assert_eq!(parsed.tenant_id, "acme");
    assert_eq!(parsed.document_ids, Some(vec![1, 2, 3]));

    let without_ids = serde_json::json!({
        "tenantId": "acme",
        "question": "what is the refund window?",
    });
    let parsed: QueryRequest = serde_json::from_value(without_ids).unwrap();
    assert_eq!(parsed.document_ids, None);
}

#[test]
fn query_request_rejects_malformed_tenant_ids_before_reaching_a_store() {
    for bad in ["", "../etc/passwd", "acme/prod", "a b", "x".repeat(101).as_str()] {
        assert!(!is_valid_tenant_id(bad), "expected '{bad}' to be rejected");
    }
    for good in ["acme", "acme-prod", "Acme_Corp_1"] {
        assert!(is_valid_tenant_id(good), "expected '{good}' to be accepted");
    }
}
