//! Webhook variant: an HTTP endpoint that echoes text messages back.
//!
//! Nothing is archived in this mode.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use teloxide::{
    prelude::*,
    types::{MessageId, UpdateKind},
};
use tokio::signal;

use tab_core::config::Config;

/// Sends the echo reply.
#[async_trait]
pub trait EchoReplier: Send + Sync {
    async fn reply_text(&self, chat_id: i64, reply_to: i32, text: &str) -> anyhow::Result<()>;
}

pub struct BotReplier {
    bot: Bot,
}

impl BotReplier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl EchoReplier for BotReplier {
    async fn reply_text(&self, chat_id: i64, reply_to: i32, text: &str) -> anyhow::Result<()> {
        self.bot
            .send_message(teloxide::types::ChatId(chat_id), text)
            .reply_to_message_id(MessageId(reply_to))
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
struct HookState {
    replier: Arc<dyn EchoReplier>,
}

/// A text message to echo: `(chat_id, message_id, text)`.
pub fn echo_target(update: &Update) -> Option<(i64, i32, String)> {
    let UpdateKind::Message(msg) = &update.kind else {
        return None;
    };
    let text = msg.text()?;
    Some((msg.chat.id.0, msg.id.0, text.to_string()))
}

pub fn build_router(replier: Arc<dyn EchoReplier>) -> Router {
    Router::new()
        .route("/hook", post(hook))
        .route("/health", get(health))
        .with_state(HookState { replier })
}

async fn health() -> &'static str {
    "ok"
}

async fn hook(
    State(state): State<HookState>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, &'static str) {
    let update: Update = match serde_json::from_value(body) {
        Ok(u) => u,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting malformed update");
            return (StatusCode::BAD_REQUEST, "invalid update");
        }
    };

    if let Some((chat_id, message_id, text)) = echo_target(&update) {
        if let Err(e) = state.replier.reply_text(chat_id, message_id, &text).await {
            tracing::warn!(chat_id, error = %e, "echo reply failed");
        }
    }

    (StatusCode::OK, "ok")
}

/// Serve the webhook on `cfg.webhook_addr` until Ctrl-C or SIGTERM.
pub async fn run_webhook(cfg: Arc<Config>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let app = build_router(Arc::new(BotReplier::new(bot)));

    let listener = tokio::net::TcpListener::bind(cfg.webhook_addr).await?;
    tracing::info!(addr = %cfg.webhook_addr, "webhook echo server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl+C, shutting down"),
            Err(e) => {
                tracing::warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("received SIGTERM, shutting down");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::util::ServiceExt;

    #[derive(Default)]
    struct RecordingReplier {
        sent: Mutex<Vec<(i64, i32, String)>>,
    }

    #[async_trait]
    impl EchoReplier for RecordingReplier {
        async fn reply_text(&self, chat_id: i64, reply_to: i32, text: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id, reply_to, text.to_string()));
            Ok(())
        }
    }

    fn text_update(text: &str) -> serde_json::Value {
        serde_json::json!({
            "update_id": 9001,
            "message": {
                "message_id": 5,
                "date": 1_700_000_000,
                "chat": {"id": 321, "type": "private", "first_name": "Lin"},
                "from": {"id": 321, "is_bot": false, "first_name": "Lin"},
                "text": text
            }
        })
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn post_json(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/hook")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let app = build_router(Arc::new(RecordingReplier::default()));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        assert_eq!(call(app, req).await, (StatusCode::OK, "ok".to_string()));
    }

    #[tokio::test]
    async fn text_message_is_echoed_as_reply() {
        let replier = Arc::new(RecordingReplier::default());
        let app = build_router(replier.clone());

        let (status, body) = call(app, post_json(text_update("ping").to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
        assert_eq!(
            *replier.sent.lock().unwrap(),
            vec![(321, 5, "ping".to_string())]
        );
    }

    #[tokio::test]
    async fn non_text_update_is_acknowledged_silently() {
        let replier = Arc::new(RecordingReplier::default());
        let app = build_router(replier.clone());

        let mut update = text_update("x");
        update["message"].as_object_mut().unwrap().remove("text");
        update["message"]["photo"] = serde_json::json!([
            {"file_id": "p1", "file_unique_id": "u1", "width": 64, "height": 64}
        ]);

        let (status, _) = call(app, post_json(update.to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(replier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let replier = Arc::new(RecordingReplier::default());
        let app = build_router(replier.clone());

        let (status, _) = call(app, post_json("{not json".to_string())).await;
        assert!(status.is_client_error());
        assert!(replier.sent.lock().unwrap().is_empty());
    }
}
