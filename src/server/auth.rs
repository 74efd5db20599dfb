use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::dikto_core::settings::Settings;

type HmacSha256 = Hmac<Sha256>;

const COOKIE_NAME: &str = "dikto_user";

/// Outcome of resolving the session identity for a request.
pub struct SessionIdentity {
    pub user: String,
    /// `Set-Cookie` value to attach when a fresh identity was issued.
    pub set_cookie: Option<String>,
}

fn sign(secret: &str, id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(id.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn verify(secret: &str, value: &str) -> Option<String> {
    let (id, sig) = value.split_once('.')?;
    let decoded = URL_SAFE_NO_PAD.decode(sig).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(id.as_bytes());
    mac.verify_slice(&decoded).ok()?;
    Some(id.to_string())
}

fn cookie_value(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let (name, value) = pair.trim().split_once('=')?;
        if name == COOKIE_NAME {
            return Some(value.to_string());
        }
    }
    None
}

/// Resolve the per-browser identity: the fixed `local` user offline, a
/// signed opaque id online. An invalid or missing cookie online yields a
/// fresh identity to be set on the response.
pub fn resolve_identity(settings: &Settings, headers: &HeaderMap) -> SessionIdentity {
    if !settings.online {
        return SessionIdentity {
            user: "local".to_string(),
            set_cookie: None,
        };
    }

    let secret = settings
        .storage_secret
        .as_deref()
        .expect("validated at startup for online mode");

    if let Some(raw) = cookie_value(headers) {
        if let Some(user) = verify(secret, &raw) {
            return SessionIdentity {
                user,
                set_cookie: None,
            };
        }
    }

    let user = Uuid::new_v4().to_string();
    let cookie = format!(
        "{COOKIE_NAME}={user}.{}; Path=/; HttpOnly; SameSite=Lax; Max-Age=31536000",
        sign(secret, &user)
    );
    SessionIdentity {
        user,
        set_cookie: Some(cookie),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dikto_core::settings::Device;
    use axum::http::header::COOKIE;

    fn online_settings() -> Settings {
        Settings {
            root: std::path::PathBuf::from("/tmp"),
            online: true,
            device: Device::Cpu,
            batch_size: 4,
            storage_secret: Some("unit-test-secret".to_string()),
            ssl_certfile: None,
            ssl_keyfile: None,
            port: 8080,
            stuck_secs: 600,
            asr_command: None,
            hf_auth_token: None,
        }
    }

    #[test]
    fn offline_mode_is_always_local() {
        let mut settings = online_settings();
        settings.online = false;
        let identity = resolve_identity(&settings, &HeaderMap::new());
        assert_eq!(identity.user, "local");
        assert!(identity.set_cookie.is_none());
    }

    #[test]
    fn issued_cookie_round_trips() {
        let settings = online_settings();
        let issued = resolve_identity(&settings, &HeaderMap::new());
        let cookie = issued.set_cookie.expect("fresh cookie");
        let value = cookie
            .strip_prefix("dikto_user=")
            .and_then(|rest| rest.split(';').next())
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, format!("dikto_user={value}").parse().unwrap());
        let resolved = resolve_identity(&settings, &headers);
        assert_eq!(resolved.user, issued.user);
        assert!(resolved.set_cookie.is_none());
    }

    #[test]
    fn tampered_cookie_gets_a_fresh_identity() {
        let settings = online_settings();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "dikto_user=someone-else.AAAA".parse().unwrap());
        let resolved = resolve_identity(&settings, &headers);
        assert_ne!(resolved.user, "someone-else");
        assert!(resolved.set_cookie.is_some());
    }
}
