use super::AppState;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use wiregate_proto::{ChatKind, Envelope, FrameType, MessageStatus};
use wiregate_storage::{
    AcceptedEvent, MessageRecord, StorageError, ACCEPTED_STREAM, DELIVER_GROUP, DELIVER_LEASE_KEY,
    SAVE_GROUP, SAVE_LEASE_KEY, SAVE_STREAM,
};

const BATCH_COUNT: usize = 50;
const BLOCK_MS: usize = 200;
const LEASE_TTL_MS: i64 = 2_000;
const FOLLOWER_PAUSE: Duration = Duration::from_millis(500);
const FAILURE_PAUSE: Duration = Duration::from_millis(1_000);

/// Drains the accepted log: pushes each event to its recipient, then
/// hands it to the save log. Only the lease holder reads; the other
/// instances idle as warm standbys. Runs only under deliver-first
/// ordering; in save-first ordering the save worker owns the push.
pub fn run_deliver_worker(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = state
            .storage
            .ensure_stream_group(ACCEPTED_STREAM, DELIVER_GROUP)
            .await
        {
            warn!(%error, "deliver group setup failed");
        }
        let consumer = format!("{}-deliver", state.config.instance_id);
        let mut leading = false;
        loop {
            if !hold_lease(&state, DELIVER_LEASE_KEY, &mut leading).await {
                sleep(FOLLOWER_PAUSE).await;
                continue;
            }
            let batch = match state
                .storage
                .read_stream_batch(
                    ACCEPTED_STREAM,
                    DELIVER_GROUP,
                    &consumer,
                    BATCH_COUNT,
                    BLOCK_MS,
                )
                .await
            {
                Ok(batch) => batch,
                Err(error) => {
                    warn!(%error, "accepted log read failed");
                    sleep(FAILURE_PAUSE).await;
                    continue;
                }
            };
            let mut done = Vec::with_capacity(batch.len());
            for (entry_id, event) in batch {
                if state
                    .deliver_to_user(event.recipient_id, &event_envelope(&event))
                    .await
                {
                    state.metrics.mark_delivered();
                }
                // An event that cannot reach the save log stays unacked
                // and is re-read later, so persistence is never skipped.
                match state.storage.append_stream(SAVE_STREAM, &event).await {
                    Ok(_) => done.push(entry_id),
                    Err(error) => {
                        warn!(%error, server_msg_id = %event.server_msg_id, "save hand-off failed");
                    }
                }
            }
            if let Err(error) = state
                .storage
                .ack_stream(ACCEPTED_STREAM, DELIVER_GROUP, &done)
                .await
            {
                warn!(%error, "accepted log ack failed");
            }
        }
    })
}

/// Drains the save log into Postgres under its own lease. In
/// save-first ordering it reads the accepted log directly and owns the
/// push to the recipient, so the two workers never both deliver.
pub fn run_save_worker(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deliver_first = state.config.pipeline_deliver_first;
        let stream = if deliver_first {
            SAVE_STREAM
        } else {
            ACCEPTED_STREAM
        };
        if let Err(error) = state.storage.ensure_stream_group(stream, SAVE_GROUP).await {
            warn!(%error, "save group setup failed");
        }
        let consumer = format!("{}-save", state.config.instance_id);
        let mut leading = false;
        loop {
            if !hold_lease(&state, SAVE_LEASE_KEY, &mut leading).await {
                sleep(FOLLOWER_PAUSE).await;
                continue;
            }
            let batch = match state
                .storage
                .read_stream_batch(stream, SAVE_GROUP, &consumer, BATCH_COUNT, BLOCK_MS)
                .await
            {
                Ok(batch) => batch,
                Err(error) => {
                    warn!(%error, "save log read failed");
                    sleep(FAILURE_PAUSE).await;
                    continue;
                }
            };
            let mut done = Vec::with_capacity(batch.len());
            for (entry_id, event) in batch {
                match save_event(&state, &event).await {
                    Ok(msg_seq) => {
                        if !deliver_first {
                            let mut frame = event_envelope(&event);
                            frame.msg_seq = Some(msg_seq);
                            if state.deliver_to_user(event.recipient_id, &frame).await {
                                state.metrics.mark_delivered();
                            }
                        }
                        done.push(entry_id);
                    }
                    Err(error) => {
                        warn!(%error, server_msg_id = %event.server_msg_id, "message save failed");
                    }
                }
            }
            if let Err(error) = state.storage.ack_stream(stream, SAVE_GROUP, &done).await {
                warn!(%error, "save log ack failed");
            }
        }
    })
}

/// Single-node stand-in for the leader workers: one task drains an
/// in-process queue, delivering and saving each event in the configured
/// order.
pub fn spawn_local_pipeline(
    state: Arc<AppState>,
    mut queue: mpsc::Receiver<AcceptedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deliver_first = state.config.pipeline_deliver_first;
        info!("local pipeline worker started");
        while let Some(event) = queue.recv().await {
            if deliver_first
                && state
                    .deliver_to_user(event.recipient_id, &event_envelope(&event))
                    .await
            {
                state.metrics.mark_delivered();
            }
            match save_event(&state, &event).await {
                Ok(msg_seq) => {
                    if !deliver_first {
                        let mut frame = event_envelope(&event);
                        frame.msg_seq = Some(msg_seq);
                        if state.deliver_to_user(event.recipient_id, &frame).await {
                            state.metrics.mark_delivered();
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, server_msg_id = %event.server_msg_id, "message save failed");
                    // Drop the claim so the client's retry can go through.
                    if let Some(client_msg_id) = event.client_msg_id.as_deref() {
                        let _ = state
                            .storage
                            .forget_msg_id(
                                event.sender_id,
                                ChatKind::Single.as_str(),
                                client_msg_id,
                            )
                            .await;
                    }
                }
            }
        }
    })
}

async fn hold_lease(state: &Arc<AppState>, key: &str, leading: &mut bool) -> bool {
    let owner = state.config.instance_id.as_str();
    if *leading {
        match state.storage.renew_lease(key, owner, LEASE_TTL_MS).await {
            Ok(true) => true,
            Ok(false) => {
                info!(lease = key, "leadership lost");
                *leading = false;
                false
            }
            Err(error) => {
                warn!(lease = key, %error, "lease renew failed");
                *leading = false;
                false
            }
        }
    } else {
        match state
            .storage
            .try_acquire_lease(key, owner, LEASE_TTL_MS)
            .await
        {
            Ok(true) => {
                info!(lease = key, "leadership acquired");
                *leading = true;
                true
            }
            Ok(false) => false,
            Err(error) => {
                warn!(lease = key, %error, "lease acquire failed");
                false
            }
        }
    }
}

/// Wire form of an accepted event. The sequence number is absent until
/// the save phase allocates it.
fn event_envelope(event: &AcceptedEvent) -> Envelope {
    let mut frame = Envelope::of(FrameType::SingleChat);
    frame.server_msg_id = Some(event.server_msg_id.clone());
    frame.client_msg_id = event.client_msg_id.clone();
    frame.from = Some(event.sender_id);
    frame.to = Some(event.recipient_id);
    frame.msg_type = Some(event.msg_type.clone());
    frame.body = event.body.clone();
    frame.status = Some(MessageStatus::Saved.as_str().to_string());
    frame.ts = Some(event.send_ts);
    frame
}

async fn save_event(state: &Arc<AppState>, event: &AcceptedEvent) -> Result<i64, StorageError> {
    let storage = &state.storage;
    let conversation = storage
        .ensure_single_conversation(event.sender_id, event.recipient_id)
        .await?;
    let msg_seq = storage.next_sequence(conversation.conversation_id).await?;
    let created_at = Utc
        .timestamp_millis_opt(event.send_ts)
        .single()
        .unwrap_or_else(Utc::now);
    let record = MessageRecord {
        server_msg_id: event.server_msg_id.clone(),
        conversation_id: conversation.conversation_id,
        sender_id: event.sender_id,
        recipient_id: Some(event.recipient_id),
        group_id: None,
        msg_type: event.msg_type.clone(),
        body: event.body.clone(),
        status: MessageStatus::Saved.as_str().to_string(),
        msg_seq,
        client_msg_id: event.client_msg_id.clone(),
        created_at,
    };
    storage.insert_message(&record).await?;
    state
        .coalescer
        .record_touch(conversation.conversation_id, created_at);
    Ok(msg_seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_envelope_has_no_sequence() {
        let event = AcceptedEvent {
            server_msg_id: "s1".to_string(),
            sender_id: 1,
            recipient_id: 2,
            client_msg_id: Some("c1".to_string()),
            msg_type: "text".to_string(),
            body: Some("hello".to_string()),
            send_ts: 1_000,
            producer_instance: "gw-1".to_string(),
        };
        let frame = event_envelope(&event);
        assert_eq!(frame.kind, "SINGLE_CHAT");
        assert_eq!(frame.from, Some(1));
        assert_eq!(frame.to, Some(2));
        assert!(frame.msg_seq.is_none());
        assert_eq!(frame.status.as_deref(), Some("saved"));
    }
}
