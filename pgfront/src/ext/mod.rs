use bytes::BufMut;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// Length is `usize` in rust, while postgres want `u32`,
    /// this will saturate instead of wrapping.
    fn to_u32(self) -> u32;
}

/// Nul string operation in [`BufMut`]
pub trait BufMutExt {
    /// Write string and nul termination.
    fn put_nul_string(&mut self, string: &str);

    /// Write string into a fixed width field, truncated to fit and padded with nul.
    ///
    /// Startup packet of the older protocol is a plain C struct, each string field
    /// have fixed width.
    fn put_padded_str(&mut self, string: &str, width: usize);
}

/// Keyword lookup in sql text.
pub trait StrExt {
    /// Case insensitive prefix check.
    fn starts_with_ignore_case(&self, prefix: &str) -> bool;

    /// Whether `token` appears as a whitespace delimited word, ignoring case.
    fn contains_token(&self, token: &str) -> bool;
}

/// Helper trait to [`Display`][std::fmt::Display] bytes.
pub trait FmtExt {
    /// Lossy [`Display`][std::fmt::Display] implementation.
    fn lossy(&self) -> LossyFmt<'_>;
}

/// Lossy [`Display`][std::fmt::Display] implementation for bytes.
pub struct LossyFmt<'a>(pub &'a [u8]);

/// Locking that ignore poisoning, critical sections only assign plain values.
pub trait MutexExt<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T>;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().unwrap_or(u32::MAX)
    }
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }

    fn put_padded_str(&mut self, string: &str, width: usize) {
        let bytes = &string.as_bytes()[..string.len().min(width)];
        self.put(bytes);
        self.put_bytes(b'\0', width - bytes.len());
    }
}

impl StrExt for str {
    fn starts_with_ignore_case(&self, prefix: &str) -> bool {
        self.len() >= prefix.len()
            && self.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    }

    fn contains_token(&self, token: &str) -> bool {
        self.split_ascii_whitespace().any(|word| word.eq_ignore_ascii_case(token))
    }
}

impl FmtExt for [u8] {
    fn lossy(&self) -> LossyFmt<'_> {
        LossyFmt(self)
    }
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Display for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn padded_str() {
        let mut buf = Vec::new();
        buf.put_padded_str("postgres", 4);
        buf.put_padded_str("db", 4);
        assert_eq!(buf, b"postdb\0\0");
    }

    #[test]
    fn token_lookup() {
        assert!("rollback to savepoint a".contains_token("TO"));
        assert!(!"rollback;".contains_token("to"));
        assert!(!"select total from t".contains_token("to"));
        assert!("Commit".starts_with_ignore_case("COMMIT"));
        assert!(!"COM".starts_with_ignore_case("COMMIT"));
    }

    #[test]
    fn lossy_display() {
        assert_eq!(b"ok\x01".lossy().to_string(), "ok\\x01");
    }
}
