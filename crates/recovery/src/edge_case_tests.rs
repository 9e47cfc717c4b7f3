// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge-case tests spanning module boundaries
//!
//! Boundary conditions that sit between components: quota arithmetic against
//! the plan catalog, the retry schedule as absolute offsets, webhook routing
//! around the trust boundary, and sanitizer/template interplay.

#[cfg(test)]
mod quota_edges {
    use crate::plans;
    use crate::quota::QuotaCheck;

    #[test]
    fn free_plan_boundary_is_inclusive() {
        // 20th email on the FREE plan is the first one denied.
        let at_limit = QuotaCheck {
            used: plans::FREE.monthly_limit,
            limit: plans::FREE.monthly_limit,
        };
        assert!(at_limit.exceeded());

        let one_below = QuotaCheck {
            used: plans::FREE.monthly_limit - 1,
            limit: plans::FREE.monthly_limit,
        };
        assert!(!one_below.exceeded());
    }

    #[test]
    fn stale_plan_id_enforces_free_limits() {
        // A merchant whose platform subscription lapsed keeps a price id we
        // no longer sell; quota must clamp to FREE, not open up.
        let plan = plans::plan_for("price_launch_2019");
        assert_eq!(plan.monthly_limit, plans::FREE.monthly_limit);
        assert_eq!(plan.queue_limit, plans::FREE.queue_limit);
    }
}

#[cfg(test)]
mod schedule_edges {
    use crate::tasks::retry_delay;
    use time::{Duration, OffsetDateTime};

    #[test]
    fn delays_are_absolute_offsets_from_ingress() {
        let ingress = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let run_at = ingress + retry_delay(1);
        assert_eq!(run_at - ingress, Duration::days(3));
    }

    #[test]
    fn schedule_is_monotone_in_attempts() {
        let mut last = Duration::ZERO;
        for attempt in 1..=6 {
            let delay = retry_delay(attempt);
            assert!(delay >= last, "attempt {attempt} shortened the delay");
            last = delay;
        }
    }

    #[test]
    fn out_of_range_attempts_use_terminal_delay() {
        assert_eq!(retry_delay(-3), Duration::days(7));
        assert_eq!(retry_delay(1_000), Duration::days(7));
    }
}

#[cfg(test)]
mod webhook_edges {
    use crate::webhooks::{route_event, EventAction, EventData, ProviderEvent};

    fn event(event_type: &str, account: Option<&str>, object: serde_json::Value) -> ProviderEvent {
        ProviderEvent {
            id: "evt_edge".into(),
            event_type: event_type.into(),
            account: account.map(String::from),
            data: EventData { object },
        }
    }

    #[test]
    fn payment_failed_without_account_cannot_schedule() {
        let e = event(
            "invoice.payment_failed",
            None,
            serde_json::json!({ "id": "in_1", "billing_reason": "subscription_cycle" }),
        );
        assert!(matches!(route_event(&e).unwrap(), EventAction::Ignore(_)));
    }

    #[test]
    fn malformed_object_is_a_payload_error_not_a_panic() {
        let e = event(
            "invoice.payment_failed",
            Some("acct_A"),
            serde_json::json!({ "id": 42 }),
        );
        assert!(route_event(&e).is_err());
    }

    #[test]
    fn subscription_create_trust_boundary_matches_update() {
        let e = event(
            "customer.subscription.created",
            Some("acct_A"),
            serde_json::json!({ "status": "active", "customer": "cus_1" }),
        );
        assert!(matches!(
            route_event(&e).unwrap(),
            EventAction::Ignore("tenant-side subscription event")
        ));
    }

    #[test]
    fn active_subscription_without_plan_falls_back() {
        let e = event(
            "customer.subscription.updated",
            None,
            serde_json::json!({ "status": "active", "customer": "cus_1" }),
        );
        match route_event(&e).unwrap() {
            EventAction::SyncPlan { plan_id, .. } => assert_eq!(plan_id, "price_free"),
            other => panic!("unexpected action: {other:?}"),
        }
    }
}

#[cfg(test)]
mod template_edges {
    use crate::templates::{sanitize_html, MAX_SUBJECT_LEN};

    #[test]
    fn sanitized_body_keeps_all_three_tokens() {
        let body = "<div><p>{{customer_name}} owes {{amount}}: \
                    <a href=\"{{update_url}}\">pay</a></p></div>";
        let clean = sanitize_html(body);
        for token in ["{{customer_name}}", "{{amount}}", "{{update_url}}"] {
            assert!(clean.contains(token), "lost {token}");
        }
    }

    #[test]
    fn nested_disallowed_tags_unwrap_cleanly() {
        let body = "<form action=\"https://evil\"><p>keep me</p></form>";
        assert_eq!(sanitize_html(body), "<p>keep me</p>");
    }

    #[test]
    fn subject_limit_is_two_hundred() {
        assert_eq!(MAX_SUBJECT_LEN, 200);
    }
}
