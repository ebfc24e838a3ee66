use sha2::{Digest, Sha256};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Outcome of checking a request's admin credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCheck {
    Granted,
    /// No admin key configured for this process.
    Disabled,
    Missing,
    Rejected,
}

/// Keys are compared as SHA-256 digests with a full-length fold, so every byte is visited.
pub fn check_admin_key(configured: Option<&str>, presented: Option<&str>) -> AdminCheck {
    let Some(expected) = configured else {
        return AdminCheck::Disabled;
    };
    let Some(given) = presented.map(str::trim).filter(|s| !s.is_empty()) else {
        return AdminCheck::Missing;
    };
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(given.as_bytes());
    let diff = a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    if diff == 0 {
        AdminCheck::Granted
    } else {
        AdminCheck::Rejected
    }
}
