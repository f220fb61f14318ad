use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Opaque identifier minted for a manager link the moment it authenticates.
/// Relay links present the session id they were told to expect in
/// `ManagerSessionId`; a mismatch means they're talking about a manager
/// epoch that's already gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// 18 random bytes, URL-safe base64 with no padding — same shape as the
    /// original's `uid_base64` helper.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut bytes);
        SessionId(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for SessionId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_url_safe_and_unpadded() {
        let id = SessionId::generate();
        assert!(!id.as_str().contains('='));
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn two_generated_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
