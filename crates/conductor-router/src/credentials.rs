use std::collections::BTreeSet;

use conductor_core::policy::PolicyConfig;

/// Credentials available to the process, captured once when the router is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    names: BTreeSet<String>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture which of the policy's credentials are set (and non-empty) in the environment.
    pub fn from_env(policy: &PolicyConfig) -> Self {
        let names = policy
            .credential_names()
            .into_iter()
            .filter(|name| {
                std::env::var(name)
                    .map(|v| !v.trim().is_empty())
                    .unwrap_or(false)
            })
            .collect();
        Self { names }
    }

    pub fn with(mut self, name: impl Into<String>) -> Self {
        self.names.insert(name.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_only_keeps_set_variables() {
        std::env::set_var("CONDUCTOR_TEST_CRED_SET", "abc");
        std::env::set_var("CONDUCTOR_TEST_CRED_BLANK", "  ");
        let policy = PolicyConfig::from_toml(
            r#"
[[capabilities.fetch]]
tool = "a"
credential = "CONDUCTOR_TEST_CRED_SET"

[[capabilities.fetch]]
tool = "b"
credential = "CONDUCTOR_TEST_CRED_BLANK"

[[capabilities.fetch]]
tool = "c"
credential = "CONDUCTOR_TEST_CRED_UNSET"
"#,
        )
        .unwrap();

        let creds = CredentialSet::from_env(&policy);
        assert!(creds.contains("CONDUCTOR_TEST_CRED_SET"));
        assert!(!creds.contains("CONDUCTOR_TEST_CRED_BLANK"));
        assert!(!creds.contains("CONDUCTOR_TEST_CRED_UNSET"));
        assert_eq!(creds.len(), 1);

        std::env::remove_var("CONDUCTOR_TEST_CRED_SET");
        std::env::remove_var("CONDUCTOR_TEST_CRED_BLANK");
    }
}
