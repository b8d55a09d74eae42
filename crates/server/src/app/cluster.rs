use super::AppState;
use crate::transport::Outbound;
use crate::util::now_millis;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use wiregate_proto::{Envelope, FrameType};
use wiregate_storage::ControlMessage;

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Listens on this instance's control topic for kicks and pushes from
/// the rest of the cluster. The subscription is re-established after
/// any Redis hiccup.
pub fn run_control_listener(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let pubsub = match state
                .storage
                .subscribe_control(&state.config.instance_id)
                .await
            {
                Ok(pubsub) => pubsub,
                Err(error) => {
                    warn!(%error, "control subscribe failed");
                    sleep(RECONNECT_PAUSE).await;
                    continue;
                }
            };
            info!(instance = %state.config.instance_id, "control listener subscribed");
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let payload = match message.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                match serde_json::from_str::<ControlMessage>(&payload) {
                    Ok(control) => handle_control(&state, control).await,
                    Err(_) => {
                        debug!("unparseable control payload dropped");
                    }
                }
            }
            warn!("control stream ended, resubscribing");
            sleep(RECONNECT_PAUSE).await;
        }
    })
}

async fn handle_control(state: &Arc<AppState>, message: ControlMessage) {
    match message {
        ControlMessage::Kick {
            user_id,
            connection_id,
            reason,
            ..
        } => kick_local(state, user_id, connection_id.as_deref(), &reason).await,
        ControlMessage::Push {
            user_ids, envelope, ..
        } => push_local(state, &user_ids, envelope).await,
    }
}

/// Closes the named local connection. A kick without a connection id
/// applies to every connection the user holds here.
async fn kick_local(
    state: &Arc<AppState>,
    user_id: i64,
    connection_id: Option<&str>,
    reason_code: &str,
) {
    let entries = match connection_id {
        Some(expected) => match state.sessions.find(user_id, expected).await {
            Some(entry) => vec![entry],
            None => {
                debug!(user_id, "kick targeted a connection no longer bound");
                return;
            }
        },
        None => state.sessions.get_all(user_id).await,
    };
    if entries.is_empty() {
        return;
    }
    info!(user_id, reason = reason_code, "kicked by control message");
    let mut frame = Envelope::of(FrameType::Error);
    frame.reason = Some(reason_code.to_string());
    frame.ts = Some(now_millis());
    let text = frame.encode().ok();
    for entry in &entries {
        if let Some(text) = &text {
            let _ = entry.sender.try_send(Outbound::Text(text.clone()));
        }
        state.metrics.mark_kick();
        entry.request_close();
    }
}

/// Delivers a pushed envelope to local sessions only. Users who moved
/// away again are dropped here rather than re-routed, so a stale route
/// cannot bounce a frame between instances.
async fn push_local(state: &Arc<AppState>, user_ids: &[i64], envelope: serde_json::Value) {
    let envelope = match serde_json::from_value::<Envelope>(envelope) {
        Ok(envelope) => envelope,
        Err(_) => {
            debug!("push with unparseable envelope dropped");
            return;
        }
    };
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(_) => return,
    };
    for user_id in user_ids {
        let mut delivered = false;
        for entry in state.sessions.get_all(*user_id).await {
            delivered |= state.deliver_local_text(&entry, &text);
        }
        if delivered {
            state.metrics.mark_delivered();
        }
    }
}
