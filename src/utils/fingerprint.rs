//! Stable per-host fingerprint used in upstream User-Agent strings.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

static FINGERPRINT: LazyLock<String> = LazyLock::new(compute_fingerprint);

fn compute_fingerprint() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Machine fingerprint, 16 hex chars.
pub fn machine_fingerprint() -> &'static str {
    &FINGERPRINT
}

/// `KiroGateway-<fingerprint[:16]>`, attached to refresh and API calls.
pub fn gateway_user_agent() -> String {
    let fp = machine_fingerprint();
    format!("KiroGateway-{}", &fp[..fp.len().min(16)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_hex() {
        let a = machine_fingerprint();
        let b = machine_fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn user_agent_has_gateway_prefix() {
        assert!(gateway_user_agent().starts_with("KiroGateway-"));
    }
}
