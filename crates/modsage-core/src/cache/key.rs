//! Deterministic cache keys.

use sha2::{Digest, Sha256};

/// Layout version of cached payloads. Bump when the prompt or payload shape changes.
pub const CACHE_SCHEMA_VERSION: &str = "modsage-cache-v1";

/// Computes the cache key for a request.
///
/// Every field is length-prefixed before hashing so no two field lists share a
/// canonical form. The temperature is rendered with three decimals so float
/// noise below that precision does not split entries. Output is lowercase hex.
pub fn generate_key(content: &str, model: &str, temperature: f32, discriminators: &[&str]) -> String {
    let temperature = format!("{temperature:.3}");

    let mut hasher = Sha256::new();
    let fields = [CACHE_SCHEMA_VERSION, content, model, temperature.as_str()];
    for field in fields.iter().chain(discriminators) {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = generate_key("prompt", "llama3", 0.3, &["quick"]);
        let b = generate_key("prompt", "llama3", 0.3, &["quick"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_every_argument_changes_key() {
        let base = generate_key("prompt", "llama3", 0.3, &["quick"]);
        assert_ne!(base, generate_key("prompt!", "llama3", 0.3, &["quick"]));
        assert_ne!(base, generate_key("prompt", "llama3.2", 0.3, &["quick"]));
        assert_ne!(base, generate_key("prompt", "llama3", 0.4, &["quick"]));
        assert_ne!(base, generate_key("prompt", "llama3", 0.3, &["full"]));
        assert_ne!(base, generate_key("prompt", "llama3", 0.3, &[]));
    }

    #[test]
    fn test_field_boundaries_matter() {
        assert_ne!(
            generate_key("ab", "c", 0.0, &[]),
            generate_key("a", "bc", 0.0, &[])
        );
        assert_ne!(
            generate_key("x", "m", 0.0, &["a", "b"]),
            generate_key("x", "m", 0.0, &["ab"])
        );
    }
}
