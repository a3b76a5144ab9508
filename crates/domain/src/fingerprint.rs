use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::keys::KeySpace;

/// Query parameters that never change the meaning of a request.
pub const VOLATILE_PARAMS: [&str; 4] = ["staging", "_t", "timestamp", "cache_buster"];

/// The logical identity of an inbound call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user: String,
    pub path: String,
    pub method: String,
    pub params: BTreeMap<String, String>,
}

impl RequestIdentity {
    pub fn new(user: impl Into<String>, path: impl Into<String>, method: impl AsRef<str>) -> Self {
        Self {
            user: user.into(),
            path: path.into(),
            method: method.as_ref().to_ascii_uppercase(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params = params
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    /// Parameters with volatile entries removed, in sorted key order.
    pub fn filtered_params(&self) -> BTreeMap<&str, &str> {
        self.params
            .iter()
            .filter(|(key, _)| !VOLATILE_PARAMS.contains(&key.as_str()))
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect()
    }

    /// Hex digest of `user:path:method:sorted_params`. Collisions only cause
    /// a mistaken deduplication, so the digest is not security sensitive.
    pub fn digest(&self) -> String {
        let params = serde_json::to_string(&self.filtered_params()).unwrap_or_default();
        let signature = format!("{}:{}:{}:{params}", self.user, self.path, self.method);
        hex::encode(Sha256::digest(signature.as_bytes()))
    }

    pub fn request_key(&self, keys: &KeySpace) -> String {
        keys.request_key(&self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_params_do_not_change_fingerprint() {
        let plain = RequestIdentity::new("u@example.com", "/open-book", "get")
            .with_params([("title", "Dune")]);
        let busted = RequestIdentity::new("u@example.com", "/open-book", "GET")
            .with_params([("title", "Dune"), ("_t", "1712"), ("cache_buster", "x")]);
        assert_eq!(plain.digest(), busted.digest());
    }

    #[test]
    fn parameter_order_is_irrelevant() {
        let first = RequestIdentity::new("u", "/navigate", "GET")
            .with_params([("action", "next"), ("count", "2")]);
        let second = RequestIdentity::new("u", "/navigate", "GET")
            .with_params([("count", "2"), ("action", "next")]);
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn distinct_users_and_params_differ() {
        let base = RequestIdentity::new("a", "/open-book", "GET").with_params([("title", "Dune")]);
        let other_user =
            RequestIdentity::new("b", "/open-book", "GET").with_params([("title", "Dune")]);
        let other_title =
            RequestIdentity::new("a", "/open-book", "GET").with_params([("title", "Emma")]);
        assert_ne!(base.digest(), other_user.digest());
        assert_ne!(base.digest(), other_title.digest());
    }

    #[test]
    fn request_key_uses_keyspace_prefix() {
        let identity = RequestIdentity::new("a", "/state", "GET");
        let key = identity.request_key(&KeySpace::new("kindle"));
        assert!(key.starts_with("kindle:request:"));
        assert_eq!(key.len(), "kindle:request:".len() + 64);
    }
}
