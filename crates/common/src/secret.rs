//! Redacting holder for keys

use std::fmt;
use zeroize::Zeroize;

/// Holds the client API key and anything else that must stay out of logs.
///
/// Formats as `[REDACTED]` and wipes its memory on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the raw value.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Compare against an untrusted candidate without short-circuiting on
    /// the first differing byte.
    pub fn eq_constant_time(&self, candidate: &str) -> bool {
        let a = self.0.as_bytes();
        let b = candidate.as_bytes();
        let mut diff = a.len() ^ b.len();
        for (i, byte) in b.iter().enumerate() {
            diff |= usize::from(a.get(i).copied().unwrap_or(0) ^ byte);
        }
        diff == 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}

const REDACTED: &str = "[REDACTED]";

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_never_formats() {
        let token = Secret::from(String::from("eyJhbGciOiJSUzI1NiJ9.payload.sig"));
        let debug = format!("{token:?}");
        let display = format!("{token}");
        assert_eq!(debug, "[REDACTED]");
        assert_eq!(display, "[REDACTED]");
        assert!(!format!("{:?}", Some(&token)).contains("payload"));
    }

    #[test]
    fn test_eq_constant_time() {
        let secret = Secret::new(String::from("sk-proxy"));
        assert!(secret.eq_constant_time("sk-proxy"));
        assert!(!secret.eq_constant_time("sk-proxz"));
        assert!(!secret.eq_constant_time("sk-prox"));
        assert!(!secret.eq_constant_time("sk-proxy-longer"));
        assert!(!secret.eq_constant_time(""));
    }

    #[test]
    fn expose_and_clone_keep_the_value() {
        let key = Secret::new(String::from("refresh-123"));
        let copy = key.clone();
        drop(key);
        assert_eq!(copy.expose(), "refresh-123");
        assert!(!copy.is_empty());
    }
}
