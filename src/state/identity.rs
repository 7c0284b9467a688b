use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Stable identity of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user id issued by the identity provider.
    pub uid: String,
    /// Display name, when the provider has one.
    pub display_name: Option<String>,
    /// Email address, when the provider has one.
    pub email: Option<String>,
}

impl Identity {
    /// Build an identity from its parts.
    pub fn new(
        uid: impl Into<String>,
        display_name: Option<String>,
        email: Option<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            display_name,
            email,
        }
    }

    /// Human readable label: display name, then email, then uid.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.uid)
    }
}

/// Holder of the current authentication state with change notifications.
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    current: watch::Sender<Option<Identity>>,
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl IdentityProvider {
    /// Create a provider, optionally already signed in.
    pub fn new(initial: Option<Identity>) -> Self {
        let (current, _rx) = watch::channel(initial);
        Self { current }
    }

    /// Identity currently signed in, if any.
    pub fn current(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    /// Uid of the signed-in user, if any.
    pub fn uid(&self) -> Option<String> {
        self.current.borrow().as_ref().map(|identity| identity.uid.clone())
    }

    /// Replace the signed-in identity and notify subscribers.
    pub fn sign_in(&self, identity: Identity) {
        self.current.send_replace(Some(identity));
    }

    /// Clear the signed-in identity and notify subscribers.
    pub fn sign_out(&self) {
        self.current.send_replace(None);
    }

    /// Subscribe to "auth state changed" notifications.
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_falls_back_to_email_then_uid() {
        let full = Identity::new("u1", Some("Ada".into()), Some("ada@example.com".into()));
        let email_only = Identity::new("u2", None, Some("bob@example.com".into()));
        let bare = Identity::new("u3", None, None);

        assert_eq!(full.label(), "Ada");
        assert_eq!(email_only.label(), "bob@example.com");
        assert_eq!(bare.label(), "u3");
    }

    #[tokio::test]
    async fn subscribers_observe_sign_in_and_out() {
        let provider = IdentityProvider::default();
        let mut rx = provider.subscribe();

        provider.sign_in(Identity::new("u1", None, None));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|id| id.uid.as_str()), Some("u1"));

        provider.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
        assert!(provider.uid().is_none());
    }
}
