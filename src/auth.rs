//! User authorization via a static allowlist.

use std::collections::HashSet;

/// Decides whether a Slack user may drive the bridge.
///
/// An empty allowlist denies every identity: the bridge fails closed rather
/// than open when no users were configured.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    allowed: HashSet<String>,
}

impl Allowlist {
    /// Build an allowlist from the configured user IDs.
    #[must_use]
    pub fn new(user_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: user_ids.into_iter().collect(),
        }
    }

    /// Whether the user ID is in the allowlist. Empty allowlist denies all.
    #[must_use]
    pub fn is_allowed(&self, user_id: &str) -> bool {
        !self.allowed.is_empty() && self.allowed.contains(user_id)
    }

    /// Number of configured identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    /// Whether no identities are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Message posted in-thread for unauthorized users, verbatim.
    #[must_use]
    pub fn reject_message(&self) -> &'static str {
        "Sorry, you're not authorized to use this bot. \
         Please contact an administrator if you need access."
    }
}
