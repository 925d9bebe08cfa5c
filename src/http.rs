//! HTTP boundary
//!
//! Thin axum adapter over the producer and the drain endpoint:
//!
//! | Route | Action |
//! |-------|--------|
//! | `GET /users` | welcome text |
//! | `POST /users/register` | publish a registration event |
//! | `GET /consumers/send` | drain waiting events and send their confirmations |

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::consumer::{ConfirmationEmailHandler, DrainEndpoint, EventHandler};
use crate::envelope::{User, UserRegistered};
use crate::error::PublishError;
use crate::producer::EventProducer;

/// Reply to `GET /users`
pub const WELCOME_MESSAGE: &str = "Welcome to Kafka Events : User Event Service !";
/// Reply to a successful registration
pub const REGISTERED_MESSAGE: &str =
    "User registration event published, check your email for confirmation !";

/// Shared state behind the routes.
#[derive(Clone)]
pub struct AppState {
    /// Registration event producer
    pub producer: Arc<EventProducer>,
    /// Manual drain over the registration topic
    pub drain: DrainEndpoint,
    /// Handler applied to drained events
    pub handler: Arc<ConfirmationEmailHandler>,
    /// Topic drained by `GET /consumers/send`
    pub topic: String,
    /// Upper bound on events per drain
    pub drain_max_records: usize,
    /// Upper bound on one drain
    pub drain_timeout: Duration,
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", get(welcome))
        .route("/users/register", post(register))
        .route("/consumers/send", get(drain_and_send))
        .with_state(state)
}

async fn welcome() -> &'static str {
    WELCOME_MESSAGE
}

async fn register(State(state): State<AppState>, Json(user): Json<User>) -> Response {
    let event = UserRegistered::from(user);
    match state.producer.publish(event).await {
        Ok(ack) => {
            info!(event_id = %ack.event_id, partition = ack.partition, offset = ack.offset, "Registration published");
            (StatusCode::OK, REGISTERED_MESSAGE).into_response()
        }
        Err(err) => publish_failure(err),
    }
}

fn publish_failure(err: PublishError) -> Response {
    let status = match err {
        PublishError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        PublishError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!(status = status.as_u16(), error = %err, "Registration publish failed");
    (status, format!("User registration event was not published: {}", err)).into_response()
}

async fn drain_and_send(State(state): State<AppState>) -> Response {
    let events = match state
        .drain
        .drain_once::<UserRegistered>(&state.topic, state.drain_max_records, state.drain_timeout)
        .await
    {
        Ok(events) => events,
        Err(err) => {
            error!(topic = %state.topic, error = %err, "Drain failed");
            return (StatusCode::SERVICE_UNAVAILABLE, format!("Drain failed: {}", err))
                .into_response();
        }
    };

    let mut sent = 0;
    let mut failed = 0;
    for event in &events {
        match state.handler.handle(event).await {
            Ok(()) => sent += 1,
            Err(e) => {
                warn!(event_id = %event.id(), error = %e, "Confirmation failed for drained event");
                failed += 1;
            }
        }
    }

    let body = if failed == 0 {
        format!(
            "All Messages Consumed : All remaining emails are sent ({} sent)",
            sent
        )
    } else {
        format!(
            "Messages Consumed : {} emails sent, {} failed",
            sent, failed
        )
    };
    (StatusCode::OK, body).into_response()
}
