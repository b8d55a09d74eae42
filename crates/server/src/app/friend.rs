use super::single_chat::saved_ack;
use super::ConnectionContext;
use crate::util::{generate_id, now_millis, sanitize_text};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;
use wiregate_proto::{reason, Envelope, FrameType, MAX_FRIEND_NOTE_LEN};
use wiregate_storage::{ClaimOutcome, FriendRequestRecord};

const INSERT_TIMEOUT: Duration = Duration::from_secs(3);

const CLAIM_TAG: &str = "FRIEND_REQUEST";

/// Stores a friend request and pushes it to the target if they are
/// online. Replays of a claimed `clientMsgId` are acknowledged again
/// with the original request id, without a second row or push.
pub(crate) async fn handle(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    let client_msg_id = match envelope.client_msg_id.as_deref() {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => {
            ctx.send_error(reason::MISSING_MSG_ID, Some(envelope)).await;
            return;
        }
    };
    let target_id = match envelope.to {
        Some(to) if to > 0 => to,
        _ => {
            ctx.send_error(reason::MISSING_TO, Some(envelope)).await;
            return;
        }
    };
    if target_id == ctx.user_id {
        ctx.send_error(reason::CANNOT_SEND_TO_SELF, Some(envelope))
            .await;
        return;
    }
    if let Some(body) = envelope.body.as_deref() {
        if body.chars().count() > MAX_FRIEND_NOTE_LEN {
            ctx.send_error(reason::BODY_TOO_LONG, Some(envelope)).await;
            return;
        }
    }
    let note = envelope
        .body
        .as_deref()
        .map(sanitize_text)
        .filter(|value| !value.is_empty());

    let request_id = generate_id("friend-request");
    match ctx
        .state
        .storage
        .claim_msg_id(
            ctx.user_id,
            CLAIM_TAG,
            &client_msg_id,
            &request_id,
            ctx.state.config.idempotency_ttl_seconds,
        )
        .await
    {
        Ok(ClaimOutcome::New) => {}
        Ok(ClaimOutcome::Existing(existing)) => {
            ctx.send(&saved_ack(&client_msg_id, &existing, None)).await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "friend request claim failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
            return;
        }
    }

    let record = FriendRequestRecord {
        request_id: request_id.clone(),
        sender_id: ctx.user_id,
        target_id,
        note: note.clone(),
        status: "pending".to_string(),
        created_at: Utc::now(),
    };
    let saved = match timeout(INSERT_TIMEOUT, ctx.state.storage.insert_friend_request(&record))
        .await
    {
        Ok(Ok(_)) => true,
        Ok(Err(error)) => {
            warn!(user_id = ctx.user_id, %error, "friend request insert failed");
            false
        }
        Err(_) => {
            warn!(user_id = ctx.user_id, "friend request insert timed out");
            false
        }
    };
    if !saved {
        if let Err(error) = ctx
            .state
            .storage
            .forget_msg_id(ctx.user_id, CLAIM_TAG, &client_msg_id)
            .await
        {
            warn!(user_id = ctx.user_id, %error, "claim rollback failed");
        }
        ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
        return;
    }
    ctx.send(&saved_ack(&client_msg_id, &request_id, None)).await;

    let mut push = Envelope::of(FrameType::FriendRequest);
    push.client_msg_id = Some(client_msg_id);
    push.server_msg_id = Some(request_id);
    push.from = Some(ctx.user_id);
    push.to = Some(target_id);
    push.body = note;
    push.ts = Some(now_millis());
    ctx.state.deliver_to_user(target_id, &push).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_is_sanitized_not_truncated() {
        let long = "n".repeat(MAX_FRIEND_NOTE_LEN + 1);
        assert!(long.chars().count() > MAX_FRIEND_NOTE_LEN);
        assert_eq!(sanitize_text("  \u{0007} "), "");
        assert_eq!(sanitize_text(" hi there "), "hi there");
    }
}
