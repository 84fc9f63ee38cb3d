//! Messages sent to the paired account once pairing completes

use crate::session::SessionId;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sessiongen_core::{CredentialBundle, RetentionPolicy};

const DEFAULT_SERVER: &str = "s.whatsapp.net";

/// Address of the account itself, from phone digits or a device address
///
/// `15551234567:12@s.whatsapp.net` names one linked device; messages go to
/// `15551234567@s.whatsapp.net`.
pub fn account_address(account: &str) -> String {
    let (user, server) = account.split_once('@').unwrap_or((account, DEFAULT_SERVER));
    let user = user.split(':').next().unwrap_or(user);
    format!("{}@{}", user, server)
}

/// Main message: either the session id or, for one-shot retention, the
/// whole bundle, since nothing stays on the server afterwards
pub fn session_ready(
    id: &SessionId,
    account: &str,
    retention: RetentionPolicy,
    bundle: &CredentialBundle,
) -> String {
    let account = account.split('@').next().unwrap_or(account);
    match retention {
        RetentionPolicy::OneShot => format!(
            "*Your session is ready!*\n\n\
             *Session:* `{}`\n\
             *Phone:* {}\n\n\
             Nothing was kept on the server. Save this message, it is the only copy.",
            BASE64.encode(bundle.as_bytes()),
            account
        ),
        RetentionPolicy::UntilFetched => format!(
            "*Your session is ready!*\n\n\
             *Session ID:* `{}`\n\
             *Phone:* {}\n\n\
             Fetch it from /session/{} - it can be downloaded once.",
            id, account, id
        ),
        RetentionPolicy::TimeBoxed { ttl } => format!(
            "*Your session is ready!*\n\n\
             *Session ID:* `{}`\n\
             *Phone:* {}\n\n\
             Fetch it from /session/{} within {}.",
            id,
            account,
            id,
            humanize(ttl.as_secs())
        ),
    }
}

/// Follow-up warning
pub fn security_notice() -> &'static str {
    "*Important Security Notice*\n\n\
     Your session was sent above.\n\
     Never share it with anyone: it grants full access to your account."
}

fn humanize(secs: u64) -> String {
    match secs {
        s if s >= 86_400 && s % 86_400 == 0 => plural(s / 86_400, "day"),
        s if s >= 3_600 && s % 3_600 == 0 => plural(s / 3_600, "hour"),
        s if s >= 60 && s % 60 == 0 => plural(s / 60, "minute"),
        s => plural(s, "second"),
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_account_address() {
        assert_eq!(account_address("15551234567"), "15551234567@s.whatsapp.net");
        assert_eq!(account_address("123@lid"), "123@lid");
        assert_eq!(
            account_address("15551234567:12@s.whatsapp.net"),
            "15551234567@s.whatsapp.net"
        );
        assert_eq!(account_address("15551234567:3"), "15551234567@s.whatsapp.net");
    }

    #[test]
    fn test_one_shot_carries_bundle() {
        let id = SessionId::generate();
        let bundle = CredentialBundle::from_bytes(b"{\"registered\":true}".to_vec());
        let text = session_ready(&id, "15551234567@s.whatsapp.net", RetentionPolicy::OneShot, &bundle);
        assert!(text.contains(&BASE64.encode(bundle.as_bytes())));
        assert!(!text.contains(id.as_str()));
        assert!(text.contains("*Phone:* 15551234567\n"));
    }

    #[test]
    fn test_retained_carries_id() {
        let id = SessionId::generate();
        let bundle = CredentialBundle::from_bytes(b"secret".to_vec());
        let ttl = Duration::from_secs(2 * 86_400);
        let text = session_ready(&id, "447911123456", RetentionPolicy::TimeBoxed { ttl }, &bundle);
        assert!(text.contains(id.as_str()));
        assert!(text.contains("2 days"));
        assert!(!text.contains(&BASE64.encode(b"secret")));
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize(3_600), "1 hour");
        assert_eq!(humanize(90), "90 seconds");
        assert_eq!(humanize(120), "2 minutes");
    }
}
