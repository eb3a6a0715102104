//! Cache key construction.
//!
//! Keys are namespaced strings: `w{id}` for works, `b{id}` for books,
//! `a{id}` for authors, and `ra{id}` for authors with a refresh in flight
//! (the `ra` entry holds the pre-refresh snapshot).

use bytes::Bytes;
use once_cell::sync::Lazy;

/// Sentinel value cached under an ID to record that the upstream returned
/// NotFound. A read that yields exactly this byte means "known absent".
pub static MISSING: Lazy<Bytes> = Lazy::new(|| Bytes::from_static(&[0]));

/// True when the cached value is the known-absent sentinel.
pub fn is_missing(value: &[u8]) -> bool {
    value == MISSING.as_ref()
}

pub fn work_key(work_id: i64) -> String {
    format!("w{work_id}")
}

pub fn book_key(book_id: i64) -> String {
    format!("b{book_id}")
}

pub fn author_key(author_id: i64) -> String {
    format!("a{author_id}")
}

/// Key recording an in-flight author refresh.
pub fn refresh_author_key(author_id: i64) -> String {
    format!("ra{author_id}")
}

/// Prefix enumerated by the persister when resuming refreshes.
pub const REFRESH_AUTHOR_PREFIX: &str = "ra";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(work_key(7), "w7");
        assert_eq!(book_key(7), "b7");
        assert_eq!(author_key(7), "a7");
        assert_eq!(refresh_author_key(7), "ra7");
    }

    #[test]
    fn missing_sentinel_is_one_zero_byte() {
        assert_eq!(MISSING.as_ref(), &[0u8]);
        assert!(is_missing(&[0]));
        assert!(!is_missing(&[]));
        assert!(!is_missing(&[0, 0]));
        assert!(!is_missing(b"{}"));
    }
}
