//! End-to-end flow: define a sequence over HTTP, enroll prospects, drive the
//! scheduler across simulated days, report outcomes through the webhook and
//! read the funnel back from the analytics endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use outreach_analytics::aggregate;
use outreach_api::{router, AppState};
use outreach_channels::adapter::{AdapterRegistry, ScriptedAdapter};
use outreach_channels::email::EmailConfig;
use outreach_channels::EmailAdapter;
use outreach_core::config::AppConfig;
use outreach_core::directory::InMemoryDirectory;
use outreach_core::types::{Channel, EnrollmentStatus, Outcome, Prospect, SequenceStatus};
use outreach_sequences::SequenceEngine;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct Harness {
    app: Router,
    state: AppState,
    email: Arc<ScriptedAdapter>,
    sms: Arc<ScriptedAdapter>,
}

fn prospect(id: &str, first_name: &str, phone: Option<&str>) -> Prospect {
    Prospect {
        id: id.into(),
        first_name: first_name.into(),
        company_name: "Acme".into(),
        industry: "Logistics".into(),
        recent_news: "opened a new warehouse".into(),
        email: format!("{}@acme.io", first_name.to_lowercase()),
        phone: phone.map(str::to_string),
        social_handle: None,
    }
}

fn harness() -> Harness {
    let email = Arc::new(ScriptedAdapter::new(Channel::Email));
    let sms = Arc::new(ScriptedAdapter::new(Channel::Sms));
    let directory = Arc::new(InMemoryDirectory::with_prospects([
        prospect("p-dana", "Dana", Some("+15550001111")),
        prospect("p-sam", "Sam", None),
    ]));
    let engine = SequenceEngine::in_memory(
        &AppConfig::default(),
        directory,
        AdapterRegistry::new()
            .with_adapter(email.clone())
            .with_adapter(sms.clone()),
    );
    let state = AppState::new(
        engine,
        Arc::new(EmailAdapter::new(EmailConfig::default())),
        "node-it",
    );
    state.mark_ready();
    Harness {
        app: router(state.clone()),
        state,
        email,
        sms,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn id_of(value: &Value) -> Uuid {
    value["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_sequence_flow_end_to_end() {
    let h = harness();
    let t0 = Utc::now();

    // Define: intro email, SMS nudge two days later, breakup email a day after.
    let (status, seq) = call(
        &h.app,
        "POST",
        "/v1/sequences",
        Some(json!({ "name": "SaaS Decision Makers", "campaign_id": "saas-q3" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let seq_id = id_of(&seq);

    for step in [
        json!({
            "channel": "email",
            "subject": "Introduction to {{company_name}}",
            "body_template": "Hi {{first_name}}, congrats on {{recent_news}}.",
            "branch_conditions": [{ "on_outcome": "replied", "next": "stop" }]
        }),
        json!({
            "channel": "sms",
            "delay": { "amount": 2, "unit": "days" },
            "body_template": "Hi {{first_name}}, did my note reach you?"
        }),
        json!({
            "channel": "email",
            "delay": { "amount": 1, "unit": "days" },
            "subject": "Closing the loop",
            "body_template": "Last note from me, {{first_name}}."
        }),
    ] {
        let uri = format!("/v1/sequences/{}/steps", seq_id);
        let (status, _) = call(&h.app, "POST", &uri, Some(step)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let uri = format!("/v1/sequences/{}/activate", seq_id);
    let (status, seq) = call(&h.app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seq["status"], "active");
    let first_step: Uuid = seq["steps"][0]["id"].as_str().unwrap().parse().unwrap();

    // Enroll both prospects directly so both share the same anchor time.
    let dana = h.state.engine.enroll("p-dana", &seq_id, t0).unwrap();
    let sam = h.state.engine.enroll("p-sam", &seq_id, t0).unwrap();

    // Day 0: both intro emails go out.
    assert_eq!(h.state.engine.run_pass_to_completion(t0).await, 2);
    assert_eq!(h.email.sent_count(), 2);
    assert!(h.email.sent()[0].body.contains("opened a new warehouse"));

    // Dana replies to the intro; the branch stops her enrollment.
    let (status, updated) = call(
        &h.app,
        "POST",
        "/v1/webhooks/outcomes",
        Some(json!({
            "enrollment_id": dana.id,
            "step_id": first_step,
            "outcome": "replied"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"], "exited");

    // Nothing is due before day 2.
    assert_eq!(
        h.state.engine.run_pass_to_completion(t0 + Duration::days(1)).await,
        0
    );

    // Day 2: Sam has no phone, so the SMS step is skipped.
    h.state
        .engine
        .run_pass_to_completion(t0 + Duration::days(2))
        .await;
    assert_eq!(h.sms.sent_count(), 0);

    // Day 3: breakup email completes Sam's enrollment.
    h.state
        .engine
        .run_pass_to_completion(t0 + Duration::days(3))
        .await;
    let sam = h.state.engine.get_enrollment(&sam.id).unwrap();
    assert_eq!(sam.status, EnrollmentStatus::Completed);
    assert_eq!(sam.history.len(), 3);
    assert_eq!(h.email.sent_count(), 3);
    assert_eq!(
        h.state.engine.get_enrollment(&dana.id).unwrap().status,
        EnrollmentStatus::Exited
    );

    // The HTTP overview agrees with a direct fold over the event log.
    let events = h.state.engine.events();
    let direct = aggregate(&events);
    assert_eq!(direct.sent, 3);
    assert_eq!(direct.replied, 1);
    assert_eq!(direct.failed, 1);
    assert_eq!(direct.reply_rate, 33.33);

    let (status, overview) = call(&h.app, "GET", "/v1/analytics/overview", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(overview["metrics"]["sent"], 3);
    assert_eq!(overview["metrics"]["reply_rate"], 33.33);
    assert_eq!(overview["performance"]["reply"], "good");

    let (status, steps) = call(
        &h.app,
        "GET",
        &format!("/v1/analytics/sequences/{}/steps", seq_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(steps[0]["metrics"]["sent"], 2);
    assert_eq!(steps[1]["metrics"]["failed"], 1);
    assert_eq!(steps[2]["metrics"]["sent"], 1);

    let (status, summary) = call(
        &h.app,
        "GET",
        &format!("/v1/sequences/{}/summary", seq_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["prospects"], 2);
    assert_eq!(summary["enrollments"]["completed"], 1);
    assert_eq!(summary["enrollments"]["exited"], 1);
}

#[tokio::test]
async fn test_pause_blocks_dispatch_until_resume() {
    let h = harness();
    let t0 = Utc::now();
    let seq = h.state.engine.create_sequence("Enterprise Follow-up", None).unwrap();
    h.state
        .engine
        .add_step(
            &seq.id,
            outreach_core::types::Step::new(Channel::Email, "Hi {{first_name}}")
                .with_subject("Following up"),
            None,
        )
        .unwrap();
    h.state.engine.activate(&seq.id).unwrap();
    h.state.engine.enroll("p-sam", &seq.id, t0).unwrap();

    let pause_uri = format!("/v1/sequences/{}/pause", seq.id);
    let (status, paused) = call(&h.app, "POST", &pause_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["status"], "paused");
    assert_eq!(h.state.engine.run_pass_to_completion(t0).await, 0);
    assert_eq!(h.email.sent_count(), 0);

    // Pausing twice is a state conflict.
    let (status, body) = call(&h.app, "POST", &pause_uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_state");

    h.state.engine.resume(&seq.id).unwrap();
    assert_eq!(h.state.engine.run_pass_to_completion(t0).await, 1);
    assert_eq!(h.email.sent_count(), 1);
    assert_eq!(
        h.state.engine.get_sequence(&seq.id).unwrap().status,
        SequenceStatus::Active
    );

    let events = h.state.engine.events();
    assert!(events.iter().all(|e| e.outcome == Outcome::Sent));
}
