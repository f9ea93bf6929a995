use crate::server::SharedState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use serde_json::json;
use threat_detection::{AnalyzeOptions, InferenceError};
use tracing::instrument;

#[instrument(skip(ws, state))]
pub async fn ws_feed(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_feed(socket, state))
}

/// What the feed loop does with one incoming message.
#[derive(Debug, PartialEq)]
enum FeedReply {
    Send(String),
    Ignore,
    Close,
}

/// One detection response per binary frame until the client goes away.
async fn handle_feed(mut socket: WebSocket, state: SharedState) {
    tracing::info!("Feed client connected");
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Feed receive failed: {}", e);
                break;
            }
        };
        match reply_to(&state, message).await {
            FeedReply::Send(reply) => {
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            FeedReply::Ignore => continue,
            FeedReply::Close => break,
        }
    }
    tracing::info!("Feed client disconnected");
}

async fn reply_to(state: &SharedState, message: Message) -> FeedReply {
    let frame = match message {
        Message::Binary(frame) => frame,
        Message::Text(_) => Bytes::new(),
        Message::Close(_) => return FeedReply::Close,
        _ => return FeedReply::Ignore,
    };
    state.metrics.record_request("/ws/feed");
    FeedReply::Send(analyze_frame(state, frame).await)
}

async fn analyze_frame(state: &SharedState, frame: Bytes) -> String {
    let pipeline = state.pipeline.clone();
    let result = tokio::task::spawn_blocking(move || {
        pipeline.analyze_bytes(&frame, AnalyzeOptions::default())
    })
    .await;

    match result {
        Ok(Ok(analysis)) => {
            state.metrics.record_stage_timings(&analysis.timings, "/ws/feed");
            serde_json::to_string(&analysis.into_response())
                .unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string())
        }
        Ok(Err(InferenceError::InvalidInput(_))) => json!({ "error": "invalid frame" }).to_string(),
        Ok(Err(e)) => {
            tracing::error!("Feed frame failed: {}", e);
            json!({ "error": e.to_string() }).to_string()
        }
        Err(e) => {
            tracing::error!("Feed worker failed: {}", e);
            json!({ "error": "internal error" }).to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing::{airplane_at_90, drone_classifier, png_bytes, state_with};
    use serde_json::Value;

    fn sent_json(reply: FeedReply) -> Value {
        match reply {
            FeedReply::Send(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn every_frame_gets_one_reply_and_bad_frames_do_not_end_the_feed() {
        let state = state_with(airplane_at_90(), Some(drone_classifier()));

        let good = sent_json(reply_to(&state, Message::Binary(png_bytes(64, 48).into())).await);
        assert_eq!(good["detections"][0]["status"], "threat");
        assert_eq!(good["imageWidth"], 64);

        let garbage = sent_json(reply_to(&state, Message::Binary(Bytes::from_static(b"xx"))).await);
        assert_eq!(garbage, serde_json::json!({ "error": "invalid frame" }));

        let text = sent_json(reply_to(&state, Message::Text("hello".into())).await);
        assert_eq!(text["error"], "invalid frame");

        let again = sent_json(reply_to(&state, Message::Binary(png_bytes(32, 32).into())).await);
        assert_eq!(again["detections"].as_array().unwrap().len(), 1);
        assert_eq!(again["imageWidth"], 32);
    }

    #[tokio::test]
    async fn control_messages_are_not_answered() {
        let state = state_with(Vec::new(), None);
        assert_eq!(
            reply_to(&state, Message::Ping(Bytes::from_static(b"p"))).await,
            FeedReply::Ignore
        );
        assert_eq!(reply_to(&state, Message::Close(None)).await, FeedReply::Close);
    }
}
