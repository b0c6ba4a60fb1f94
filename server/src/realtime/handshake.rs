//! Auth/ownership resolver (spec component 4.3): turns the duplex
//! handshake's bearer token, target save id, and device id into a
//! cleared-to-connect `ResolvedSession`, or a `SessionError` carrying the
//! WS close code the caller should use. Runs once per connection, before
//! any frame is sent.

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::db::{self, DbPool};
use crate::error::SessionError;

pub const LEGACY_DEVICE_ID: &str = "legacy";

/// A handshake that has cleared auth, ownership, and device-quota checks.
pub struct ResolvedSession {
    pub user_id: String,
    pub save_id: String,
    pub device_id: String,
}

/// Empty or missing device ids are normalized to the shared `"legacy"`
/// sentinel — every unidentified client for a stream then shares one
/// cursor and can block the others' trim, which is documented-but-
/// surprising rather than a bug.
pub fn normalize_device_id(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => LEGACY_DEVICE_ID.to_string(),
    }
}

/// Runs the full handshake: parse bearer token, verify it, look up and
/// check Save ownership, validate/admit the device. Ensures the device
/// cursor row exists on success so the caller can read `last_acked_seq`
/// unconditionally afterward.
pub async fn resolve(
    pool: &DbPool,
    jwt: &JwtVerifier,
    config: &Config,
    authorization: Option<&str>,
    save_id: &str,
    device_id_raw: Option<&str>,
) -> Result<ResolvedSession, SessionError> {
    if save_id.is_empty() {
        return Err(SessionError::Protocol("save_id must not be empty".to_string()));
    }

    let token = JwtVerifier::parse_bearer(authorization)
        .map_err(|e| SessionError::Auth(e.to_string()))?;
    let user_id = jwt.verify(token).map_err(|e| SessionError::Auth(e.to_string()))?;

    let save = db::get_save(pool, save_id)
        .await?
        .ok_or_else(|| SessionError::Ownership(format!("save {save_id} not found")))?;
    if !save.is_owned_by(&user_id) {
        return Err(SessionError::Ownership(format!(
            "save {save_id} not owned by user"
        )));
    }

    let device_id = normalize_device_id(device_id_raw);
    if device_id.len() > config.ws_max_device_id_length {
        return Err(SessionError::Quota("device_id exceeds max length".to_string()));
    }

    let exists = db::device_cursor_exists(pool, &user_id, save_id, &device_id).await?;
    if !exists {
        let count = db::count_device_cursors(pool, &user_id, save_id).await?;
        if count >= config.ws_max_devices_per_save {
            return Err(SessionError::Quota(format!(
                "device limit ({}) exceeded for save",
                config.ws_max_devices_per_save
            )));
        }
    }
    db::ensure_device_cursor(pool, &user_id, save_id, &device_id).await?;

    Ok(ResolvedSession {
        user_id,
        save_id: save_id.to_string(),
        device_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_missing_and_blank_device_ids() {
        assert_eq!(normalize_device_id(None), LEGACY_DEVICE_ID);
        assert_eq!(normalize_device_id(Some("")), LEGACY_DEVICE_ID);
        assert_eq!(normalize_device_id(Some("   ")), LEGACY_DEVICE_ID);
    }

    #[test]
    fn preserves_real_device_ids() {
        assert_eq!(normalize_device_id(Some(" iphone-1 ")), "iphone-1");
    }
}
