use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Digest sent in place of a plaintext password.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Accepted usernames and their password digests.
#[derive(Debug, Clone, Default)]
pub struct CredentialTable {
    digests: HashMap<String, String>,
}

impl CredentialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, username: impl Into<String>, password: &str) {
        self.digests
            .insert(username.into(), password_digest(password));
    }

    pub fn with_user(mut self, username: impl Into<String>, password: &str) -> Self {
        self.insert(username, password);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn verify(&self, username: &str, digest: &str) -> bool {
        self.digests
            .get(username)
            .is_some_and(|expected| constant_time_eq(expected.as_bytes(), digest.as_bytes()))
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Parses `name:password` as given on the command line.
pub fn parse_user_spec(spec: &str) -> Result<(String, String), String> {
    match spec.split_once(':') {
        Some((name, password)) if !name.is_empty() => Ok((name.to_string(), password.to_string())),
        _ => Err(format!("expected name:password, got '{spec}'")),
    }
}
