//! Human readable amounts ("512M", "8g", "100")

/// Parse a size or count with an optional binary suffix (K, M, G, T, P)
///
/// Suffixes are case-insensitive and may carry a trailing `B` ("512MB").
pub fn parse_amount(input: &str) -> Option<u64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let s = s
        .strip_suffix(['b', 'B'])
        .filter(|rest| rest.ends_with(|c: char| c.is_ascii_alphabetic()))
        .unwrap_or(s);

    let (digits, shift) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 10),
        'm' | 'M' => (&s[..s.len() - 1], 20),
        'g' | 'G' => (&s[..s.len() - 1], 30),
        't' | 'T' => (&s[..s.len() - 1], 40),
        'p' | 'P' => (&s[..s.len() - 1], 50),
        _ => (s, 0),
    };

    let value: u64 = digits.parse().ok()?;
    value.checked_mul(1u64 << shift)
}
