//! Session token source consumed by the connectivity layer.
//!
//! Login itself lives elsewhere. The host application stores the bearer token
//! in a [`SessionTokens`] and updates it when the session changes; channels
//! read it on every connect attempt and the coordinator follows changes.

use std::sync::Arc;

use tokio::sync::watch;

/// Supplies the bearer token and notifies about session changes.
pub trait TokenProvider: Send + Sync + 'static {
    /// The current token, `None` when logged out.
    fn token(&self) -> Option<String>;

    /// Receiver that observes every token change.
    fn changes(&self) -> watch::Receiver<Option<String>>;
}

/// Watch-backed token holder.
#[derive(Clone)]
pub struct SessionTokens {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl SessionTokens {
    pub fn new(initial: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Store a new token (login or refresh).
    pub fn set(&self, token: impl Into<String>) {
        self.tx.send_replace(Some(token.into()));
    }

    /// Forget the token (logout).
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for SessionTokens {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token itself
        f.debug_struct("SessionTokens")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl TokenProvider for SessionTokens {
    fn token(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn changes(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn changes_are_observed() {
        let tokens = SessionTokens::default();
        let mut changes = tokens.changes();
        assert_eq!(tokens.token(), None);

        tokens.set("t1");
        changes.changed().await.unwrap();
        assert_eq!(changes.borrow_and_update().as_deref(), Some("t1"));

        tokens.clear();
        changes.changed().await.unwrap();
        assert!(changes.borrow_and_update().is_none());
        assert!(!tokens.is_authenticated());
    }

    #[test]
    fn debug_hides_token() {
        let tokens = SessionTokens::new(Some("secret".into()));
        assert!(!format!("{tokens:?}").contains("secret"));
    }
}
