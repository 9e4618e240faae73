use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use crewdeck_types::AgentId;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Feature flags carried by an embed token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureFlags {
    pub file_upload: bool,
    pub context_usage: bool,
    pub voice_mic: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub agent_id: AgentId,
    pub feature_flags: FeatureFlags,
    pub created_at: DateTime<Utc>,
}

/// Short-lived bearer tokens scoping external callers to one agent.
///
/// No server-side expiry beyond agent lifecycle: a token lives exactly as
/// long as its agent, and generating a replacement revokes the predecessor.
#[derive(Debug, Default)]
pub struct SessionTokenService {
    tokens: Mutex<HashMap<String, TokenInfo>>,
}

impl SessionTokenService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh URL-safe token for the agent, revoking any previous one.
    pub fn generate(&self, agent_id: AgentId, feature_flags: FeatureFlags) -> String {
        let token = mint_token();
        let mut tokens = self.lock();
        tokens.retain(|_, info| info.agent_id != agent_id);
        tokens.insert(
            token.clone(),
            TokenInfo {
                agent_id,
                feature_flags,
                created_at: Utc::now(),
            },
        );
        token
    }

    pub fn validate(&self, token: &str) -> Option<TokenInfo> {
        self.lock().get(token).cloned()
    }

    pub fn validate_for_agent(&self, token: &str, agent_id: AgentId) -> Option<TokenInfo> {
        self.validate(token).filter(|info| info.agent_id == agent_id)
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    /// Cascade during agent shutdown.
    pub fn revoke_for_agent(&self, agent_id: AgentId) -> usize {
        let mut tokens = self.lock();
        let before = tokens.len();
        tokens.retain(|_, info| info.agent_id != agent_id);
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TokenInfo>> {
        self.tokens.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// 32 bytes of entropy rendered URL-safe.
fn mint_token() -> String {
    let mut material = [0u8; 32];
    material[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    material[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    let digest = Sha256::digest(material);
    digest
        .iter()
        .take(32)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> FeatureFlags {
        FeatureFlags {
            file_upload: false,
            context_usage: true,
            voice_mic: false,
        }
    }

    #[test]
    fn generate_validate_revoke() {
        let service = SessionTokenService::new();
        let token = service.generate(7, flags());
        assert_eq!(token.len(), 64);

        let info = service.validate(&token).unwrap();
        assert_eq!(info.agent_id, 7);
        assert!(service.validate_for_agent(&token, 7).is_some());
        assert!(service.validate_for_agent(&token, 8).is_none());

        assert!(service.revoke(&token));
        assert!(service.validate(&token).is_none());
        assert!(!service.revoke(&token));
    }

    #[test]
    fn regeneration_revokes_the_previous_token() {
        let service = SessionTokenService::new();
        let first = service.generate(7, flags());
        let second = service.generate(7, flags());

        assert_ne!(first, second);
        assert!(service.validate(&first).is_none(), "old token must die");
        assert!(service.validate(&second).is_some());
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn revoke_for_agent_cascades() {
        let service = SessionTokenService::new();
        service.generate(1, flags());
        let other = service.generate(2, flags());

        assert_eq!(service.revoke_for_agent(1), 1);
        assert!(service.validate(&other).is_some());
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn tokens_are_unique() {
        let service = SessionTokenService::new();
        let a = service.generate(1, flags());
        let b = service.generate(2, flags());
        assert_ne!(a, b);
    }
}
