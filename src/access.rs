//! Static access policy: email → permitted environment codes.
//!
//! Loaded once at startup from `users.json` and treated as immutable,
//! process-wide read-only state — hot-reload is out of scope.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct UsersFile {
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    email: String,
    environments: Vec<String>,
}

/// Email (case-insensitive) → set of environment codes the user may act
/// against.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    by_email: HashMap<String, Vec<String>>,
}

impl AccessPolicy {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let parsed: UsersFile = serde_json::from_str(raw)?;
        let by_email = parsed
            .users
            .into_iter()
            .map(|u| (u.email.to_lowercase(), u.environments))
            .collect();
        Ok(Self { by_email })
    }

    /// `true` iff `email` is a known user granted `environment`. Email
    /// comparison is case-insensitive; an unknown email is always denied.
    pub fn is_allowed(&self, email: &str, environment: &str) -> bool {
        self.by_email
            .get(&email.to_lowercase())
            .is_some_and(|envs| envs.iter().any(|e| e == environment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: &str = r#"{
        "users": [
            {"email": "qa@x", "environments": ["SIT1", "SIT2"]},
            {"email": "dev@x", "environments": ["SIT1"]}
        ]
    }"#;

    #[test]
    fn known_user_on_granted_environment_is_allowed() {
        let policy = AccessPolicy::from_json(USERS).unwrap();
        assert!(policy.is_allowed("qa@x", "SIT1"));
        assert!(policy.is_allowed("QA@X", "SIT2"));
    }

    #[test]
    fn known_user_on_ungranted_environment_is_denied() {
        let policy = AccessPolicy::from_json(USERS).unwrap();
        assert!(!policy.is_allowed("dev@x", "PROD"));
    }

    #[test]
    fn unknown_user_is_denied() {
        let policy = AccessPolicy::from_json(USERS).unwrap();
        assert!(!policy.is_allowed("ghost@x", "SIT1"));
    }
}
