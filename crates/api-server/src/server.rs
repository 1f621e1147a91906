//! HTTP server for the dashboard REST API, adapter webhooks and health checks.

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post, put};
use axum::Router;
use outreach_core::config::AppConfig;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::analytics_rest;
use crate::rest::{self, AppState};
use crate::webhook_rest;

/// Every route the engine serves.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Sequence definitions
        .route(
            "/v1/sequences",
            get(rest::list_sequences).post(rest::create_sequence),
        )
        .route(
            "/v1/sequences/:id",
            get(rest::get_sequence)
                .put(rest::update_sequence)
                .delete(rest::delete_sequence),
        )
        .route("/v1/sequences/:id/steps", post(rest::add_step))
        .route(
            "/v1/sequences/:id/steps/:step_id",
            put(rest::update_step).delete(rest::remove_step),
        )
        .route("/v1/sequences/:id/activate", post(rest::activate_sequence))
        .route("/v1/sequences/:id/pause", post(rest::pause_sequence))
        .route("/v1/sequences/:id/resume", post(rest::resume_sequence))
        .route("/v1/sequences/:id/archive", post(rest::archive_sequence))
        .route("/v1/sequences/:id/duplicate", post(rest::duplicate_sequence))
        .route("/v1/sequences/:id/enrollments", get(rest::sequence_enrollments))
        .route("/v1/sequences/:id/summary", get(analytics_rest::sequence_summary))
        // Enrollments
        .route("/v1/enrollments", post(rest::enroll))
        .route("/v1/enrollments/:id", get(rest::get_enrollment))
        // Adapter callbacks
        .route("/v1/webhooks/outcomes", post(webhook_rest::handle_outcome))
        .route("/v1/webhooks/email", post(webhook_rest::handle_email_webhook))
        .route("/v1/webhooks/sms/status", post(webhook_rest::handle_sms_status))
        .route("/v1/webhooks/sms/inbound", post(webhook_rest::handle_sms_inbound))
        // Analytics
        .route("/v1/analytics/overview", get(analytics_rest::overview))
        .route("/v1/analytics/campaigns", get(analytics_rest::campaign_metrics))
        .route("/v1/analytics/weekdays", get(analytics_rest::weekday_metrics))
        .route(
            "/v1/analytics/sequences/:id",
            get(analytics_rest::sequence_metrics),
        )
        .route(
            "/v1/analytics/sequences/:id/steps",
            get(analytics_rest::step_metrics),
        )
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API server for one engine node.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve HTTP until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the Prometheus exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::tests::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_router_serves_health_and_json() {
        let (state, _) = test_state();
        state.mark_ready();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/sequences")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"SaaS Decision Makers"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/sequences/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
