use super::{AppState, ConnectionContext};
use crate::auth::{AuthClaims, AuthError};
use crate::transport::{ChannelReader, Inbound, Outbound};
use crate::util::now_millis;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::debug;
use wiregate_proto::{reason, Envelope, FrameType};
use wiregate_storage::EPOCH_UNKNOWN;

/// Resolves the connection's identity before any other frame is
/// processed. A token in the upgrade URL wins; otherwise the first text
/// frame must be an AUTH and must arrive within the configured window.
pub(crate) async fn authenticate(
    state: &Arc<AppState>,
    reader: &mut ChannelReader,
    out_tx: &mpsc::Sender<Outbound>,
    query_token: Option<String>,
) -> Result<AuthClaims, &'static str> {
    if let Some(token) = query_token {
        return verify_token(state, &token).await;
    }
    let window = Duration::from_secs(state.config.auth_timeout_seconds.max(1));
    match timeout(window, first_token(reader, out_tx)).await {
        Ok(Ok(token)) => verify_token(state, &token).await,
        Ok(Err(code)) => Err(code),
        Err(_) => {
            debug!("authentication window elapsed");
            Err(reason::MISSING_TOKEN)
        }
    }
}

async fn first_token(
    reader: &mut ChannelReader,
    out_tx: &mpsc::Sender<Outbound>,
) -> Result<String, &'static str> {
    loop {
        match reader.next().await {
            Ok(Inbound::Text(payload)) => {
                let envelope = Envelope::decode(&payload).map_err(|_| reason::BAD_JSON)?;
                return match envelope.frame_type() {
                    FrameType::Auth => envelope.token.ok_or(reason::MISSING_TOKEN),
                    _ => Err(reason::UNAUTHORIZED),
                };
            }
            Ok(Inbound::Ping(payload)) => {
                let _ = out_tx.send(Outbound::Pong(payload)).await;
            }
            Ok(Inbound::Pong) => {}
            Ok(Inbound::Closed) | Err(_) => return Err(reason::UNAUTHORIZED),
        }
    }
}

pub(crate) async fn verify_token(
    state: &Arc<AppState>,
    token: &str,
) -> Result<AuthClaims, &'static str> {
    let claims = state
        .verifier
        .verify(token, now_millis())
        .map_err(map_auth_error)?;
    // Epoch lookups fail open; a Redis outage must not lock everyone out.
    let current = state.storage.current_epoch(claims.user_id).await;
    if current != EPOCH_UNKNOWN && claims.session_epoch < current {
        return Err(reason::SESSION_INVALID);
    }
    Ok(claims)
}

fn map_auth_error(error: AuthError) -> &'static str {
    match error {
        AuthError::Expired => reason::TOKEN_EXPIRED,
        AuthError::Malformed | AuthError::BadSignature => reason::INVALID_TOKEN,
    }
}

/// Refreshes an established connection's credentials. The new token
/// must belong to the same user; its epoch replaces the one the
/// connection was admitted under.
pub(crate) async fn handle_reauth(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    let token = match envelope.token.as_deref() {
        Some(token) => token,
        None => {
            ctx.send_error(reason::MISSING_TOKEN, Some(envelope)).await;
            return;
        }
    };
    match verify_token(&ctx.state, token).await {
        Ok(claims) if claims.user_id != ctx.user_id => {
            let mut fail = Envelope::of(FrameType::AuthFail);
            fail.reason = Some(reason::REAUTH_UID_MISMATCH.to_string());
            fail.ts = Some(now_millis());
            ctx.send(&fail).await;
        }
        Ok(claims) => {
            if let Some(entry) = ctx
                .state
                .sessions
                .find(ctx.user_id, &ctx.connection_id)
                .await
            {
                entry.refresh_epoch(claims.session_epoch);
            }
            let mut ok = Envelope::of(FrameType::AuthOk);
            ok.to = Some(ctx.user_id);
            ok.ts = Some(now_millis());
            ctx.send(&ok).await;
        }
        Err(code) => {
            let mut fail = Envelope::of(FrameType::AuthFail);
            fail.reason = Some(code.to_string());
            fail.ts = Some(now_millis());
            ctx.send(&fail).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_wire_reasons() {
        assert_eq!(map_auth_error(AuthError::Expired), reason::TOKEN_EXPIRED);
        assert_eq!(map_auth_error(AuthError::Malformed), reason::INVALID_TOKEN);
        assert_eq!(
            map_auth_error(AuthError::BadSignature),
            reason::INVALID_TOKEN
        );
    }
}
