use rand::Rng;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// Generates a random lowercase hex string of the given length.
///
/// # Examples
/// ```
/// let id = wsnet2_common::id::random_hex(16);
/// assert_eq!(id.len(), 16);
/// ```
pub fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX_CHARS[rng.gen_range(0..16)] as char)
        .collect()
}

/// Picks a room number in `[1, max]`.
pub fn random_number(max: u32) -> u32 {
    rand::thread_rng().gen_range(1..=max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_format() {
        let id = random_hex(16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn random_hex_uniqueness() {
        assert_ne!(random_hex(16), random_hex(16));
    }

    #[test]
    fn random_number_in_range() {
        for _ in 0..100 {
            let n = random_number(9);
            assert!((1..=9).contains(&n));
        }
    }
}
