use super::{message_envelope, ConnectionContext, Pipeline};
use crate::util::{generate_id, now_millis, sanitize_text};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use wiregate_proto::{reason, AckKind, ChatKind, Envelope, FrameType, MessageStatus, MAX_BODY_LEN};
use wiregate_storage::{
    idempotency_key, AcceptedEvent, ClaimOutcome, EnqueueOutcome, MessageRecord, StorageError,
};

#[derive(Debug)]
pub(crate) struct SendRequest {
    pub client_msg_id: String,
    pub recipient: i64,
    pub body: String,
    pub msg_type: String,
}

/// Field gate for a single-chat send. Checks run in a fixed order so a
/// frame with several problems always reports the same one.
pub(crate) fn validate(sender_id: i64, envelope: &Envelope) -> Result<SendRequest, &'static str> {
    let client_msg_id = match envelope.client_msg_id.as_deref() {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => return Err(reason::MISSING_MSG_ID),
    };
    let recipient = match envelope.to {
        Some(to) if to > 0 => to,
        _ => return Err(reason::MISSING_TO),
    };
    let body = match envelope.body.as_deref() {
        Some(body) if !body.trim().is_empty() => sanitize_text(body),
        _ => return Err(reason::MISSING_BODY),
    };
    if body.chars().count() > MAX_BODY_LEN {
        return Err(reason::BODY_TOO_LONG);
    }
    if recipient == sender_id {
        return Err(reason::CANNOT_SEND_TO_SELF);
    }
    let msg_type = envelope
        .msg_type
        .as_deref()
        .filter(|value| !value.is_empty())
        .unwrap_or("text")
        .to_string();
    Ok(SendRequest {
        client_msg_id,
        recipient,
        body,
        msg_type,
    })
}

pub(crate) async fn handle(ctx: &Arc<ConnectionContext>, envelope: Envelope) {
    let request = match validate(ctx.user_id, &envelope) {
        Ok(request) => request,
        Err(code) => {
            ctx.send_error(code, Some(&envelope)).await;
            return;
        }
    };
    match &ctx.state.pipeline {
        Pipeline::Direct => accept_direct(ctx, &envelope, request).await,
        Pipeline::Stream => accept_stream(ctx, &envelope, request).await,
        Pipeline::Local(queue) => {
            let queue = queue.clone();
            accept_local(ctx, &envelope, request, queue).await;
        }
    }
}

/// Inline pipeline: claim, persist, acknowledge, deliver, all on the
/// sender's connection task.
async fn accept_direct(ctx: &Arc<ConnectionContext>, envelope: &Envelope, request: SendRequest) {
    let state = &ctx.state;
    let server_msg_id = generate_id("msg");
    match state
        .storage
        .claim_msg_id(
            ctx.user_id,
            ChatKind::Single.as_str(),
            &request.client_msg_id,
            &server_msg_id,
            state.config.idempotency_ttl_seconds,
        )
        .await
    {
        Ok(ClaimOutcome::New) => {}
        Ok(ClaimOutcome::Existing(existing)) => {
            // Duplicate send: repeat the original acknowledgement, do
            // not persist or deliver again.
            ctx.send(&saved_ack(&request.client_msg_id, &existing, None))
                .await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "idempotency claim failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
            return;
        }
    }

    let record = match persist(ctx, &request, &server_msg_id).await {
        Ok(record) => record,
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "message persist failed");
            rollback_claim(ctx, &request.client_msg_id).await;
            ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
            return;
        }
    };
    state.metrics.mark_accepted();
    ctx.send(&saved_ack(
        &request.client_msg_id,
        &server_msg_id,
        Some(record.msg_seq),
    ))
    .await;

    let mut delivery = message_envelope(&record);
    delivery.mentions = envelope.mentions.clone();
    delivery.reply_to_server_msg_id = envelope.reply_to_server_msg_id.clone();
    delivery.important = envelope.important;
    if state.deliver_to_user(request.recipient, &delivery).await {
        state.metrics.mark_delivered();
    }
}

/// Shared-log pipeline: one script claims the client id and appends the
/// accepted event; leader workers do the rest.
async fn accept_stream(ctx: &Arc<ConnectionContext>, envelope: &Envelope, request: SendRequest) {
    let state = &ctx.state;
    let server_msg_id = generate_id("msg");
    let event = accepted_event(ctx, &request, &server_msg_id);
    let claim_key = idempotency_key(
        ctx.user_id,
        ChatKind::Single.as_str(),
        &request.client_msg_id,
    );
    match state
        .storage
        .enqueue_accepted(&claim_key, state.config.idempotency_ttl_seconds, &event)
        .await
    {
        Ok(EnqueueOutcome::New { .. }) => {
            state.metrics.mark_accepted();
            ctx.send(&saved_ack(&request.client_msg_id, &server_msg_id, None))
                .await;
        }
        Ok(EnqueueOutcome::Existing { server_msg_id }) => {
            ctx.send(&saved_ack(&request.client_msg_id, &server_msg_id, None))
                .await;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "accepted log append failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
        }
    }
}

/// Single-node variant of the log pipeline over an in-process queue.
async fn accept_local(
    ctx: &Arc<ConnectionContext>,
    envelope: &Envelope,
    request: SendRequest,
    queue: tokio::sync::mpsc::Sender<AcceptedEvent>,
) {
    let state = &ctx.state;
    let server_msg_id = generate_id("msg");
    match state
        .storage
        .claim_msg_id(
            ctx.user_id,
            ChatKind::Single.as_str(),
            &request.client_msg_id,
            &server_msg_id,
            state.config.idempotency_ttl_seconds,
        )
        .await
    {
        Ok(ClaimOutcome::New) => {}
        Ok(ClaimOutcome::Existing(existing)) => {
            ctx.send(&saved_ack(&request.client_msg_id, &existing, None))
                .await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "idempotency claim failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
            return;
        }
    }
    let event = accepted_event(ctx, &request, &server_msg_id);
    if queue.send(event).await.is_err() {
        rollback_claim(ctx, &request.client_msg_id).await;
        ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
        return;
    }
    state.metrics.mark_accepted();
    ctx.send(&saved_ack(&request.client_msg_id, &server_msg_id, None))
        .await;
}

fn accepted_event(
    ctx: &Arc<ConnectionContext>,
    request: &SendRequest,
    server_msg_id: &str,
) -> AcceptedEvent {
    AcceptedEvent {
        server_msg_id: server_msg_id.to_string(),
        sender_id: ctx.user_id,
        recipient_id: request.recipient,
        client_msg_id: Some(request.client_msg_id.clone()),
        msg_type: request.msg_type.clone(),
        body: Some(request.body.clone()),
        send_ts: now_millis(),
        producer_instance: ctx.state.config.instance_id.clone(),
    }
}

async fn persist(
    ctx: &Arc<ConnectionContext>,
    request: &SendRequest,
    server_msg_id: &str,
) -> Result<MessageRecord, StorageError> {
    let storage = &ctx.state.storage;
    let conversation = storage
        .ensure_single_conversation(ctx.user_id, request.recipient)
        .await?;
    let msg_seq = storage.next_sequence(conversation.conversation_id).await?;
    let record = MessageRecord {
        server_msg_id: server_msg_id.to_string(),
        conversation_id: conversation.conversation_id,
        sender_id: ctx.user_id,
        recipient_id: Some(request.recipient),
        group_id: None,
        msg_type: request.msg_type.clone(),
        body: Some(request.body.clone()),
        status: MessageStatus::Saved.as_str().to_string(),
        msg_seq,
        client_msg_id: Some(request.client_msg_id.clone()),
        created_at: Utc::now(),
    };
    storage.insert_message(&record).await?;
    ctx.state
        .coalescer
        .record_touch(conversation.conversation_id, record.created_at);
    Ok(record)
}

async fn rollback_claim(ctx: &Arc<ConnectionContext>, client_msg_id: &str) {
    if let Err(error) = ctx
        .state
        .storage
        .forget_msg_id(ctx.user_id, ChatKind::Single.as_str(), client_msg_id)
        .await
    {
        warn!(user_id = ctx.user_id, %error, "claim rollback failed");
    }
}

pub(crate) fn saved_ack(
    client_msg_id: &str,
    server_msg_id: &str,
    msg_seq: Option<i64>,
) -> Envelope {
    let mut ack = Envelope::of(FrameType::Ack);
    ack.ack_type = Some(AckKind::Saved.as_str().to_string());
    ack.client_msg_id = Some(client_msg_id.to_string());
    ack.server_msg_id = Some(server_msg_id.to_string());
    ack.msg_seq = msg_seq;
    ack.ts = Some(now_millis());
    ack
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(client_msg_id: Option<&str>, to: Option<i64>, body: Option<&str>) -> Envelope {
        let mut envelope = Envelope::of(FrameType::SingleChat);
        envelope.client_msg_id = client_msg_id.map(str::to_string);
        envelope.to = to;
        envelope.body = body.map(str::to_string);
        envelope
    }

    #[test]
    fn gate_order_is_stable() {
        assert_eq!(
            validate(1, &frame(None, None, None)).unwrap_err(),
            reason::MISSING_MSG_ID
        );
        assert_eq!(
            validate(1, &frame(Some("c1"), None, None)).unwrap_err(),
            reason::MISSING_TO
        );
        assert_eq!(
            validate(1, &frame(Some("c1"), Some(2), None)).unwrap_err(),
            reason::MISSING_BODY
        );
        assert_eq!(
            validate(1, &frame(Some("c1"), Some(2), Some("  \t"))).unwrap_err(),
            reason::MISSING_BODY
        );
        let long = "x".repeat(MAX_BODY_LEN + 1);
        assert_eq!(
            validate(1, &frame(Some("c1"), Some(2), Some(&long))).unwrap_err(),
            reason::BODY_TOO_LONG
        );
        assert_eq!(
            validate(1, &frame(Some("c1"), Some(1), Some("hi"))).unwrap_err(),
            reason::CANNOT_SEND_TO_SELF
        );
    }

    #[test]
    fn accepts_and_normalizes() {
        let request = validate(1, &frame(Some(" c1 "), Some(2), Some("  hi\u{0007} ")))
            .expect("valid send");
        assert_eq!(request.client_msg_id, "c1");
        assert_eq!(request.recipient, 2);
        assert_eq!(request.body, "hi");
        assert_eq!(request.msg_type, "text");
    }
}
