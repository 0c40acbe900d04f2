use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use zapdesk_core::transport::WhatsAppTransport;

pub fn is_pn_user(jid: &str) -> bool {
    jid.contains("@s.whatsapp.net") && !jid.contains("lid")
}

pub fn is_lid_user(jid: &str) -> bool {
    jid.contains("lid")
}

/// Digits of the user part, ignoring any `:device` suffix.
pub fn jid_digits(jid: &str) -> String {
    let user = jid.split('@').next().unwrap_or_default();
    let user = user.split(':').next().unwrap_or_default();
    user.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn pn_jid(digits: &str) -> String {
    format!("{digits}@s.whatsapp.net")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Form the transport wants for addressing this person.
    pub preferred: String,
    pub lid: Option<String>,
    /// Phone number digits when known.
    pub phone_number: Option<String>,
}

/// Resolves the lid and phone-number views of a jid through the transport's
/// mapping store. Never fails: without a mapping the original jid is used.
#[derive(Default)]
pub struct IdentityResolver {
    cache: Mutex<HashMap<String, ResolvedIdentity>>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, jid: &str) -> Option<ResolvedIdentity> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(jid).cloned()
    }

    fn cache(&self, jid: &str, identity: &ResolvedIdentity) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(jid.to_string(), identity.clone());
    }

    /// Record a mapping announced by the transport.
    pub fn remember(&self, lid: &str, pn: &str) {
        let identity = ResolvedIdentity {
            preferred: lid.to_string(),
            lid: Some(lid.to_string()),
            phone_number: Some(jid_digits(pn)),
        };
        self.cache(lid, &identity);
        self.cache(pn, &identity);
    }

    pub async fn resolve(&self, transport: &dyn WhatsAppTransport, jid: &str) -> ResolvedIdentity {
        if let Some(hit) = self.cached(jid) {
            return hit;
        }

        let fallback = ResolvedIdentity {
            preferred: jid.to_string(),
            lid: is_lid_user(jid).then(|| jid.to_string()),
            phone_number: is_pn_user(jid).then(|| jid_digits(jid)),
        };
        let Some(mapping) = transport.lid_mapping() else {
            return fallback;
        };

        if is_lid_user(jid) {
            match mapping.pn_for_lid(jid).await {
                Ok(Some(pn)) => {
                    let identity = ResolvedIdentity {
                        preferred: jid.to_string(),
                        lid: Some(jid.to_string()),
                        phone_number: Some(jid_digits(&pn)),
                    };
                    self.cache(jid, &identity);
                    identity
                }
                Ok(None) => fallback,
                Err(e) => {
                    warn!(jid = %jid, error = %e, "Lid lookup failed; using original jid");
                    fallback
                }
            }
        } else if is_pn_user(jid) {
            match mapping.lid_for_pn(jid).await {
                Ok(Some(lid)) => {
                    let identity = ResolvedIdentity {
                        preferred: lid.clone(),
                        lid: Some(lid),
                        phone_number: Some(jid_digits(jid)),
                    };
                    self.cache(jid, &identity);
                    identity
                }
                Ok(None) => fallback,
                Err(e) => {
                    warn!(jid = %jid, error = %e, "Pn lookup failed; using original jid");
                    fallback
                }
            }
        } else {
            fallback
        }
    }

    /// Preferred address for a stored number.
    pub async fn preferred_jid(&self, transport: &dyn WhatsAppTransport, number: &str) -> String {
        self.resolve(transport, &pn_jid(number)).await.preferred
    }
}

/// Push a learned mapping back to the transport without waiting on it.
pub fn store_mapping(transport: Arc<dyn WhatsAppTransport>, lid: String, pn: String) {
    tokio::spawn(async move {
        let Some(mapping) = transport.lid_mapping() else {
            return;
        };
        match mapping.store(&lid, &pn).await {
            Ok(()) => debug!(lid = %lid, pn = %pn, "Stored lid mapping"),
            Err(e) => warn!(lid = %lid, error = %e, "Failed to store lid mapping"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    #[test]
    fn test_jid_predicates() {
        assert!(is_pn_user("5511999990000@s.whatsapp.net"));
        assert!(!is_pn_user("123@lid"));
        assert!(is_lid_user("123@lid"));
        assert_eq!(jid_digits("5511999990000:12@s.whatsapp.net"), "5511999990000");
    }

    #[tokio::test]
    async fn test_both_directions_resolve() {
        let transport = MockTransport::new(1);
        transport.map_lid("123@lid", "5511999990000@s.whatsapp.net");
        let resolver = IdentityResolver::new();

        let from_pn = resolver
            .resolve(&transport, "5511999990000@s.whatsapp.net")
            .await;
        assert_eq!(from_pn.preferred, "123@lid");
        assert_eq!(from_pn.phone_number.as_deref(), Some("5511999990000"));

        let from_lid = resolver.resolve(&transport, "123@lid").await;
        assert_eq!(from_lid.lid.as_deref(), Some("123@lid"));
        assert_eq!(from_lid.phone_number.as_deref(), Some("5511999990000"));
    }

    #[tokio::test]
    async fn test_unmapped_jid_degrades_to_itself() {
        let transport = MockTransport::new(1);
        let resolver = IdentityResolver::new();
        let identity = resolver.resolve(&transport, "999@lid").await;
        assert_eq!(identity.preferred, "999@lid");
        assert_eq!(identity.phone_number, None);

        // Misses are not cached, so a later mapping is picked up.
        transport.map_lid("999@lid", "5511888880000@s.whatsapp.net");
        let identity = resolver.resolve(&transport, "999@lid").await;
        assert_eq!(identity.phone_number.as_deref(), Some("5511888880000"));
    }
}
