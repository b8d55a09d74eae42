use super::{message_envelope, ConnectionContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Replays the user's undelivered backlog after a successful bind. A
/// short Redis lock keeps a reconnect storm from replaying twice.
pub(crate) async fn replay_pending(ctx: &Arc<ConnectionContext>) {
    let state = &ctx.state;
    // A connection that is already backed up gets no replay; the client
    // reconnects or acks its way out and replay runs next bind.
    match state.sessions.find(ctx.user_id, &ctx.connection_id).await {
        Some(entry) if !entry.backpressure.is_blocked() => {}
        _ => {
            debug!(user_id = ctx.user_id, "connection not write-ready, skipping replay");
            return;
        }
    }
    if !state
        .storage
        .acquire_resend_lock(ctx.user_id, state.config.resend_lock_seconds)
        .await
    {
        debug!(user_id = ctx.user_id, "backlog replay already in flight");
        return;
    }
    let limit = state.config.resend_limit;
    let mut replayed = 0u64;

    match state.storage.pending_single_messages(ctx.user_id, limit).await {
        Ok(records) => {
            for record in &records {
                ctx.send(&message_envelope(record)).await;
                replayed += 1;
            }
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "single backlog load failed");
        }
    }
    match state.storage.pending_group_messages(ctx.user_id, limit).await {
        Ok(records) => {
            for record in &records {
                ctx.send(&message_envelope(record)).await;
                replayed += 1;
            }
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "group backlog load failed");
        }
    }

    if replayed > 0 {
        state.metrics.mark_resend(replayed);
        info!(user_id = ctx.user_id, replayed, "backlog replayed");
    }
}
