// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]

use axum::body::Body;
use axum::extract::Request;

use super::middleware::{extract_client_ip, secret_matches};

fn request_with_headers(headers: &[(&str, &str)]) -> Request {
    let mut builder = Request::builder().uri("/tasks");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

#[test]
fn secret_compare_accepts_exact_match_only() {
    assert!(secret_matches("s3cret", "s3cret"));
    assert!(!secret_matches("s3cret ", "s3cret"));
    assert!(!secret_matches("", "s3cret"));
    assert!(!secret_matches("S3CRET", "s3cret"));
}

#[test]
fn empty_configured_secret_never_matches() {
    // A deployment with no WORKER_SECRET must fail closed.
    assert!(!secret_matches("", ""));
    assert!(!secret_matches("anything", ""));
}

#[test]
fn client_ip_prefers_forwarded_for() {
    let request = request_with_headers(&[
        ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
        ("x-real-ip", "198.51.100.9"),
    ]);
    assert_eq!(extract_client_ip(&request), "203.0.113.7");
}

#[test]
fn client_ip_falls_back_to_real_ip_then_unknown() {
    let request = request_with_headers(&[("x-real-ip", "198.51.100.9")]);
    assert_eq!(extract_client_ip(&request), "198.51.100.9");

    let request = request_with_headers(&[]);
    assert_eq!(extract_client_ip(&request), "unknown");
}
