//! Code for the quick creation of random identifier strings

/// Lowercase alphanumeric alphabet. Never contains the `,`, `=` or space
/// separators of the line record.
pub(crate) const ALPHANUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Return a `String` of exactly `bytes` characters drawn from [`ALPHANUM`].
pub(crate) fn random_string<R>(rng: &mut R, bytes: usize) -> String
where
    R: rand::Rng + ?Sized,
{
    let cap = ALPHANUM.len();
    (0..bytes)
        .map(|_| char::from(ALPHANUM[rng.random_range(0..cap)]))
        .collect()
}

/// Return `prefix` followed by `bytes` random characters.
pub(crate) fn prefixed<R>(rng: &mut R, prefix: &str, bytes: usize) -> String
where
    R: rand::Rng + ?Sized,
{
    let mut s = String::with_capacity(prefix.len() + bytes);
    s.push_str(prefix);
    s.push_str(&random_string(rng, bytes));
    s
}
