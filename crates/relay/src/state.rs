//! Shared relay state

use deskbridge_core::auth::{Hs256Issuer, TokenIssuer};
use deskbridge_core::protocol::PeerRole;
use rand::RngCore;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::registry::Registry;

/// Everything the connection handlers share: the registry, the token issuer,
/// and the validated configuration
pub struct RelayState {
    /// The one owner of Client/Room tables
    pub registry: Registry,

    /// Validated configuration
    pub config: RelayConfig,

    issuer: Hs256Issuer,
    instance_id: String,
}

impl RelayState {
    /// Validate the configuration and build the shared state
    ///
    /// When no token key is configured a random one is generated, which means
    /// issued tokens do not survive a relay restart.
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let key = config.token_key.clone().unwrap_or_else(|| {
            let mut key = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            key
        });
        let issuer = Hs256Issuer::new(key).with_ttl_secs(config.token_ttl_secs);

        Ok(Self {
            registry: Registry::new(),
            config,
            issuer,
            instance_id: Uuid::new_v4().to_string(),
        })
    }

    /// The token issuer
    pub fn issuer(&self) -> &dyn TokenIssuer {
        &self.issuer
    }

    /// Relay instance id that issued claims are bound to
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Issue a claim for a client at its current role
    pub fn issue_token(&self, client_id: &str, role: PeerRole) -> Result<String> {
        Ok(self.issuer.issue(client_id, &self.instance_id, role)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskbridge_core::auth::validate_for_session;

    #[test]
    fn test_issued_tokens_bind_to_instance() {
        let state = RelayState::new(RelayConfig::default()).unwrap();
        let token = state.issue_token("client-1", PeerRole::Host).unwrap();

        let claim = validate_for_session(state.issuer(), &token, state.instance_id()).unwrap();
        assert_eq!(claim.subject, "client-1");

        assert!(validate_for_session(state.issuer(), &token, "other-instance").is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RelayConfig::default().with_bind_addr("nope");
        assert!(RelayState::new(config).is_err());
    }
}
