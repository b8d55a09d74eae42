use super::ConnectionContext;
use crate::util::now_millis;
use std::sync::Arc;
use tracing::warn;
use wiregate_proto::{reason, AckKind, Envelope, FrameType, MessageStatus};
use wiregate_storage::MessageRecord;

/// Processes a delivery or read receipt. Receipts advance the member's
/// cursor; on single chats they also update the row status and bounce
/// back to the original sender.
pub(crate) async fn handle(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    let kind = match envelope.ack_type.as_deref() {
        None | Some("") => {
            ctx.send_error(reason::MISSING_ACK_TYPE, Some(envelope)).await;
            return;
        }
        Some(value) => match AckKind::parse(value) {
            Some(kind) => kind,
            None => {
                ctx.send_error(reason::UNKNOWN_ACK_TYPE, Some(envelope)).await;
                return;
            }
        },
    };
    // `saved` is issued by the server; clients cannot replay it.
    if kind == AckKind::Saved {
        ctx.send_error(reason::ACK_NOT_ALLOWED, Some(envelope)).await;
        return;
    }
    let server_msg_id = match envelope.server_msg_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => {
            ctx.send_error(reason::MISSING_SERVER_MSG_ID, Some(envelope))
                .await;
            return;
        }
    };
    let record = match ctx.state.storage.find_message(server_msg_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            ctx.send_error(reason::MESSAGE_NOT_FOUND, Some(envelope)).await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "receipt lookup failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
            return;
        }
    };
    if !allowed(ctx.user_id, &record, &ctx.state).await {
        ctx.send_error(reason::ACK_NOT_ALLOWED, Some(envelope)).await;
        return;
    }

    if record.group_id.is_none() {
        // Single-chat status is the recipient's; revoked rows stay put.
        let status = match kind {
            AckKind::Read => MessageStatus::Read,
            _ => MessageStatus::Delivered,
        };
        if let Err(error) = ctx
            .state
            .storage
            .mark_message_status(&record.server_msg_id, status.as_str())
            .await
        {
            warn!(user_id = ctx.user_id, %error, "status update failed");
        }
    }
    // Cursor writes are coalesced; the flusher keeps only the highest
    // sequence per (conversation, user, kind).
    ctx.state.coalescer.record_cursor(
        record.conversation_id,
        ctx.user_id,
        kind == AckKind::Read,
        record.msg_seq,
    );

    if record.group_id.is_none() {
        let mut receipt = Envelope::of(FrameType::Ack);
        receipt.ack_type = Some(kind.as_str().to_string());
        receipt.server_msg_id = Some(record.server_msg_id.clone());
        receipt.client_msg_id = record.client_msg_id.clone();
        receipt.from = Some(ctx.user_id);
        receipt.msg_seq = Some(record.msg_seq);
        receipt.ts = Some(now_millis());
        ctx.state.deliver_to_user(record.sender_id, &receipt).await;
    }
}

/// A receipt is valid from the single-chat recipient or from any group
/// member other than the author.
async fn allowed(
    user_id: i64,
    record: &MessageRecord,
    state: &Arc<super::AppState>,
) -> bool {
    match record.group_id {
        None => record.recipient_id == Some(user_id),
        Some(group_id) => {
            if record.sender_id == user_id {
                return false;
            }
            state
                .storage
                .is_group_member(group_id, user_id)
                .await
                .unwrap_or(false)
        }
    }
}
