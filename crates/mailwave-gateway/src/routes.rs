//! API route handlers for the gateway.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use mailwave_core::error::MailwaveError;
use mailwave_core::types::{Campaign, CampaignStatus, DeliveryStatus, NewCampaign};

use super::server::AppState;

type ApiResponse = (StatusCode, Json<Value>);

/// Map an engine error onto a status code + JSON body.
fn error_response(e: &MailwaveError) -> ApiResponse {
    let status = match e {
        MailwaveError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MailwaveError::Conflict(_) => StatusCode::CONFLICT,
        MailwaveError::NotFound(_) => StatusCode::NOT_FOUND,
        MailwaveError::Source(_) | MailwaveError::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "ok": false, "error": e.to_string() })))
}

fn ok(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

/// Campaign plus the derived fields the UI wants alongside the counters.
fn campaign_json(c: &Campaign) -> Value {
    json!({
        "campaign": c,
        "emails_skipped": c.emails_skipped(),
        "success_rate": c.success_rate(),
        "failure_rate": c.failure_rate(),
        "is_active": c.is_active(),
        "is_terminal": c.is_terminal(),
    })
}

#[derive(Deserialize)]
pub struct StatusFilter {
    pub status: Option<String>,
}

/// `POST /api/v1/campaigns`
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewCampaign>,
) -> ApiResponse {
    match state.store.create_campaign(&new, Utc::now()) {
        Ok(c) => (StatusCode::CREATED, Json(campaign_json(&c))),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/campaigns?status=sending`
pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<StatusFilter>,
) -> ApiResponse {
    let status = match filter.status.as_deref() {
        None => None,
        Some(s) => match CampaignStatus::parse(s) {
            Some(parsed) => Some(parsed),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "ok": false, "error": format!("invalid status filter: {s}") })),
                );
            }
        },
    };
    match state.store.list_campaigns(status) {
        Ok(campaigns) => {
            let items: Vec<Value> = campaigns.iter().map(campaign_json).collect();
            ok(json!({ "campaigns": items }))
        }
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/campaigns/{id}`
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state.store.campaign(id) {
        Ok(c) => ok(campaign_json(&c)),
        Err(e) => error_response(&e),
    }
}

/// `PUT /api/v1/campaigns/{id}` — edits allowed until dispatch.
pub async fn update_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(new): Json<NewCampaign>,
) -> ApiResponse {
    match state.store.update_draft(id, &new, Utc::now()) {
        Ok(c) => ok(campaign_json(&c)),
        Err(e) => error_response(&e),
    }
}

/// `DELETE /api/v1/campaigns/{id}`
pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state.store.delete_campaign(id) {
        Ok(()) => ok(json!({ "ok": true, "deleted": id })),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/v1/campaigns/{id}/send` — trigger dispatch. A second trigger
/// of the same campaign is a 409.
pub async fn send_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state.dispatcher.dispatch(id, Utc::now()).await {
        Ok(report) => ok(json!({
            "ok": true,
            "campaign_id": id,
            "scheduled": report.scheduled,
            "skipped_invalid": report.skipped_invalid,
            "first_at": report.first_at,
            "last_at": report.last_at,
        })),
        Err(e) => error_response(&e),
    }
}

/// `POST /api/v1/campaigns/{id}/stop` — cancel a sending campaign. Pending
/// rows are skipped immediately; their queued tasks are cancelled
/// best-effort (a task that slips through no-ops against the settled row).
pub async fn stop_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResponse {
    let report = match state.store.cancel_campaign(id, Utc::now()) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    for task_id in &report.task_ids {
        if let Err(e) = state.queue.cancel(task_id).await {
            tracing::warn!("⚠️ Could not cancel queued task {task_id}: {e}");
        }
    }
    ok(json!({
        "ok": true,
        "campaign_id": id,
        "skipped": report.skipped,
    }))
}

/// `POST /api/v1/campaigns/{id}/reset` — operator recovery for a campaign
/// stuck mid-dispatch: abort-and-clear back to draft.
pub async fn reset_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResponse {
    match state
        .store
        .reset_stuck(id, "reset by operator", Utc::now())
    {
        Ok(()) => ok(json!({ "ok": true, "campaign_id": id, "status": "draft" })),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/campaigns/{id}/deliveries?status=failed`
pub async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(filter): Query<StatusFilter>,
) -> ApiResponse {
    // 404 for an unknown campaign, not an empty list
    if let Err(e) = state.store.campaign(id) {
        return error_response(&e);
    }
    let status = match filter.status.as_deref() {
        None => None,
        Some(s) => match DeliveryStatus::parse(s) {
            Some(parsed) => Some(parsed),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "ok": false, "error": format!("invalid status filter: {s}") })),
                );
            }
        },
    };
    match state.store.deliveries_for(id, status) {
        Ok(rows) => ok(json!({ "campaign_id": id, "deliveries": rows })),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailwave_engine::Dispatcher;
    use mailwave_queue::{DeliveryTask, TaskQueue};
    use mailwave_recipients::StaticSource;

    use async_trait::async_trait;
    use chrono::DateTime;
    use mailwave_core::Result;

    struct NullQueue;

    #[async_trait]
    impl TaskQueue for NullQueue {
        async fn schedule(
            &self,
            task: DeliveryTask,
            _not_before: DateTime<Utc>,
        ) -> Result<String> {
            Ok(format!("task-{}", task.delivery_id))
        }
        async fn cancel(&self, _task_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_state(name: &str) -> (Arc<AppState>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("mailwave-gateway-{name}"));
        std::fs::create_dir_all(&dir).ok();
        let store = Arc::new(
            mailwave_engine::CampaignStore::open(&dir.join("campaigns.db")).unwrap(),
        );
        let source = Arc::new(StaticSource::from_pairs(&[
            ("ada@acme.com", Some("Ada")),
            ("grace@acme.com", None),
        ]));
        let queue: Arc<dyn TaskQueue> = Arc::new(NullQueue);
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), source, queue.clone()));
        (
            Arc::new(AppState {
                store,
                dispatcher,
                queue,
                start_time: std::time::Instant::now(),
            }),
            dir,
        )
    }

    fn new_campaign() -> NewCampaign {
        NewCampaign {
            name: "API test".into(),
            description: None,
            subject: "Hi {{name}}".into(),
            message: "Hello {{name}}".into(),
            sheet_id: "1AbCdEfGhIjKl".into(),
            sheet_range: "A:Z".into(),
            use_delay: false,
            delay_min_minutes: 4,
            delay_max_minutes: 7,
            respect_business_hours: false,
            business_hours_start: 9,
            business_hours_end: 17,
            business_days_only: true,
            timezone: "UTC".into(),
            max_send_attempts: 3,
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (state, dir) = test_state("create");
        let (status, body) =
            create_campaign(State(state.clone()), Json(new_campaign())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body.0["campaign"]["id"].as_i64().unwrap();

        let (status, body) = get_campaign(State(state), Path(id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["campaign"]["name"], "API test");
        assert_eq!(body.0["campaign"]["status"], "draft");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_create_rejects_bad_config() {
        let (state, dir) = test_state("badcfg");
        let mut bad = new_campaign();
        bad.business_hours_start = 17;
        bad.business_hours_end = 9;
        let (status, body) = create_campaign(State(state), Json(bad)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.0["ok"], false);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_send_twice_conflicts() {
        let (state, dir) = test_state("conflict");
        let (_, body) = create_campaign(State(state.clone()), Json(new_campaign())).await;
        let id = body.0["campaign"]["id"].as_i64().unwrap();

        let (status, body) = send_campaign(State(state.clone()), Path(id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["scheduled"], 2);

        let (status, _) = send_campaign(State(state), Path(id)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_stop_then_deliveries_filtered() {
        let (state, dir) = test_state("stop");
        let (_, body) = create_campaign(State(state.clone()), Json(new_campaign())).await;
        let id = body.0["campaign"]["id"].as_i64().unwrap();
        send_campaign(State(state.clone()), Path(id)).await;

        let (status, body) = stop_campaign(State(state.clone()), Path(id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["skipped"], 2);

        let (status, body) = list_deliveries(
            State(state.clone()),
            Path(id),
            Query(StatusFilter {
                status: Some("skipped".into()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["deliveries"].as_array().unwrap().len(), 2);

        let (status, _) = list_deliveries(
            State(state),
            Path(id),
            Query(StatusFilter {
                status: Some("bogus".into()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_404() {
        let (state, dir) = test_state("missing");
        let (status, _) = get_campaign(State(state.clone()), Path(999)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = list_deliveries(
            State(state),
            Path(999),
            Query(StatusFilter { status: None }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let (state, dir) = test_state("list");
        create_campaign(State(state.clone()), Json(new_campaign())).await;
        let (_, body) = create_campaign(State(state.clone()), Json(new_campaign())).await;
        let id = body.0["campaign"]["id"].as_i64().unwrap();
        send_campaign(State(state.clone()), Path(id)).await;

        let (_, body) = list_campaigns(
            State(state.clone()),
            Query(StatusFilter {
                status: Some("sending".into()),
            }),
        )
        .await;
        assert_eq!(body.0["campaigns"].as_array().unwrap().len(), 1);

        let (_, body) =
            list_campaigns(State(state), Query(StatusFilter { status: None })).await;
        assert_eq!(body.0["campaigns"].as_array().unwrap().len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }
}
