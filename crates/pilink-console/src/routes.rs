//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{
        Html, IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::bridge::{Bridge, LogEntry, SendError};

const DASHBOARD: &str = include_str!("dashboard.html");

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

pub fn routes(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/send_command", post(send_command))
        .route("/logs", get(logs))
        .route("/events", get(events))
        .with_state(bridge)
}

async fn index() -> Html<&'static str> {
    Html(DASHBOARD)
}

async fn send_command(
    State(bridge): State<Arc<Bridge>>,
    Json(request): Json<CommandRequest>,
) -> Response {
    match bridge.send(&request.command).await {
        Ok(cmd) => Json(serde_json::json!({ "status": "sent", "cmd": cmd })).into_response(),
        Err(e) => {
            let status = match e {
                SendError::Empty | SendError::MultiLine => StatusCode::BAD_REQUEST,
                SendError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
                SendError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
                SendError::Io(_) => StatusCode::BAD_GATEWAY,
            };
            tracing::warn!(command = %request.command, error = %e, "Command not sent");
            (
                status,
                Json(serde_json::json!({ "status": "error", "msg": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn logs(State(bridge): State<Arc<Bridge>>) -> Json<Vec<LogEntry>> {
    Json(bridge.history())
}

async fn events(
    State(bridge): State<Arc<Bridge>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = bridge.subscribe();
    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(entry) => {
                    let event = Event::default().data(entry.line);
                    return Some((Ok(event), receiver));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, lines skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::io::AsyncReadExt;
    use tower::ServiceExt;

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_command(body: &str) -> Request<Body> {
        Request::post("/send_command")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn index_serves_dashboard() {
        let app = routes(Arc::new(Bridge::simulated(10)));
        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("CMD:GPIO:ON"));
        assert!(html.contains("/events"));
    }

    #[tokio::test]
    async fn send_command_writes_to_link() {
        let (mut far, near) = tokio::io::duplex(1024);
        let app = routes(Arc::new(Bridge::new(Some(Box::new(near)), 10)));

        let response = app
            .oneshot(post_command(r#"{"command":"CMD:SPI:CREATE:test.txt"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "sent");
        assert_eq!(json["cmd"], "CMD:SPI:CREATE:test.txt");

        let mut buf = [0u8; 64];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"CMD:SPI:CREATE:test.txt\n");
    }

    #[tokio::test]
    async fn send_command_rejects_empty() {
        let (_far, near) = tokio::io::duplex(1024);
        let app = routes(Arc::new(Bridge::new(Some(Box::new(near)), 10)));

        let response = app.oneshot(post_command(r#"{"command":""}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["status"], "error");
    }

    #[tokio::test]
    async fn send_command_in_simulation_mode() {
        let app = routes(Arc::new(Bridge::simulated(10)));

        let response = app
            .oneshot(post_command(r#"{"command":"CMD:GPIO:ON"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = response_json(response).await;
        assert_eq!(json["msg"], "Serial not connected");
    }

    #[tokio::test]
    async fn logs_lists_history_oldest_first() {
        let bridge = Arc::new(Bridge::simulated(10));
        bridge.record("LOG:Pi System Ready");
        bridge.record("LOG:PWM Stopped");
        let app = routes(bridge);

        let response = app
            .oneshot(Request::get("/logs").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = response_json(response).await;
        assert_eq!(json[0]["line"], "LOG:Pi System Ready");
        assert_eq!(json[1]["line"], "LOG:PWM Stopped");
        assert!(json[0]["received_at"].is_string());
    }

    #[tokio::test]
    async fn events_stream_new_lines() {
        let bridge = Arc::new(Bridge::simulated(10));
        let app = routes(bridge.clone());

        let response = app
            .oneshot(Request::get("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        bridge.record("LOG:Task finished.");

        let mut body = response.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("no event")
            .unwrap()
            .unwrap();
        let data = frame.into_data().unwrap();
        assert_eq!(&data[..], b"data: LOG:Task finished.\n\n");
    }
}
