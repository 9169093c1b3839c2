use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use wayfarer_core::Identity;

/// Resolves a request credential (bearer token or session cookie value) to
/// the signed-in user it was issued to.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, credential: &str) -> Option<Identity>;
}

#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn resolve(&self, credential: &str) -> Option<Identity> {
        self.tokens.get(credential).cloned()
    }
}

/// Per-turn identity gate. Credentials are only looked up the first time a
/// tool actually needs an identity; the answer is reused for the rest of
/// the turn.
pub struct SessionGate {
    provider: Option<Arc<dyn IdentityProvider>>,
    credentials: Vec<String>,
    resolved: OnceCell<Option<Identity>>,
}

impl SessionGate {
    pub fn new(provider: Arc<dyn IdentityProvider>, credentials: Vec<String>) -> Self {
        Self {
            provider: Some(provider),
            credentials: credentials
                .into_iter()
                .map(|credential| credential.trim().to_string())
                .filter(|credential| !credential.is_empty())
                .collect(),
            resolved: OnceCell::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            provider: None,
            credentials: Vec::new(),
            resolved: OnceCell::new(),
        }
    }

    pub fn resolve(&self) -> Option<&Identity> {
        self.resolved
            .get_or_init(|| {
                let provider = self.provider.as_ref()?;
                self.credentials
                    .iter()
                    .find_map(|credential| provider.resolve(credential))
            })
            .as_ref()
    }

    /// The identity if an earlier call already resolved it; never triggers
    /// a lookup.
    pub fn resolved(&self) -> Option<&Identity> {
        self.resolved.get().and_then(Option::as_ref)
    }
}

impl std::fmt::Debug for SessionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGate")
            .field("credentials", &self.credentials.len())
            .field("resolved", &self.resolved.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingProvider {
        inner: StaticIdentityProvider,
        lookups: AtomicUsize,
    }

    impl IdentityProvider for CountingProvider {
        fn resolve(&self, credential: &str) -> Option<Identity> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(credential)
        }
    }

    fn ada() -> Identity {
        Identity {
            user_id: "user-ada".to_string(),
            display_name: Some("Ada".to_string()),
        }
    }

    #[test]
    fn resolves_first_matching_credential_once() {
        let provider = Arc::new(CountingProvider {
            inner: StaticIdentityProvider::new().with_token("tok-ada", ada()),
            lookups: AtomicUsize::new(0),
        });
        let gate = SessionGate::new(provider.clone(), vec!["stale".into(), "tok-ada".into()]);

        assert_eq!(provider.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(gate.resolve().map(|id| id.user_id.as_str()), Some("user-ada"));
        assert_eq!(gate.resolve().map(|id| id.user_id.as_str()), Some("user-ada"));
        assert_eq!(provider.lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn anonymous_gate_never_resolves() {
        assert!(SessionGate::anonymous().resolve().is_none());
    }
}
