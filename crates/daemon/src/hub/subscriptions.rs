//! Per-client tag subscriptions.

use dashmap::DashSet;

/// Tag that matches every broadcast.
pub const WILDCARD: &str = "*";

/// Tags every client is subscribed to on connect.
pub const DEFAULT_SUBSCRIPTIONS: [&str; 2] = ["errors", "broadcast"];

/// The set of tags a client listens for.
///
/// Written by the client's own command handling and read by the hub loop
/// during fan-out, from different tasks, so it is backed by a concurrent set.
#[derive(Debug, Default)]
pub struct Subscriptions {
    tags: DashSet<String>,
}

impl Subscriptions {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default tags plus `extra`.
    pub fn with_defaults<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subs = Self::new();
        subs.subscribe(DEFAULT_SUBSCRIPTIONS);
        subs.subscribe(extra);
        subs
    }

    /// Add tags.
    pub fn subscribe<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.tags.insert(name.into());
        }
    }

    /// Remove tags.
    pub fn unsubscribe<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.tags.remove(name.as_ref());
        }
    }

    /// True if the wildcard is present or any of `names` is.
    pub fn is_subscribed<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.tags.contains(WILDCARD) || names.iter().any(|n| self.tags.contains(n.as_ref()))
    }

    /// Sorted snapshot of the current tags.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.tags.iter().map(|t| t.key().clone()).collect();
        tags.sort();
        tags
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// True if there are no tags.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
