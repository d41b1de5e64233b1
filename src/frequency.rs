/// Parses a frequency token with an optional engineering suffix
/// (`k`, `M`, `G`, any case). Returns Hz, or `None` on malformed input.
pub fn parse_frequency(token: &str) -> Option<f64> {
    let token = token.trim();
    let (mantissa, scale) = match token.as_bytes().last()? {
        b'k' | b'K' => (&token[..token.len() - 1], 1e3),
        b'm' | b'M' => (&token[..token.len() - 1], 1e6),
        b'g' | b'G' => (&token[..token.len() - 1], 1e9),
        _ => (token, 1.0),
    };
    let value: f64 = mantissa.trim().parse().ok()?;
    value.is_finite().then_some(value * scale)
}

/// Default SSRC for a frequency token: the decimal-digit subsequence of
/// the token folded into a `u32`, wrapping on overflow.
pub fn ssrc_from_token(token: &str) -> u32 {
    token
        .bytes()
        .filter(u8::is_ascii_digit)
        .fold(0u32, |acc, d| {
            acc.wrapping_mul(10).wrapping_add(u32::from(d - b'0'))
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn plain_hertz() {
        assert_eq!(parse_frequency("7200000"), Some(7_200_000.0));
        assert_eq!(parse_frequency(" 0 "), Some(0.0));
    }

    #[test]
    fn engineering_suffixes() {
        assert_eq!(parse_frequency("7.2M"), Some(7_200_000.0));
        assert_eq!(parse_frequency("146.52m"), Some(146_520_000.0));
        assert_eq!(parse_frequency("10k"), Some(10_000.0));
        assert_eq!(parse_frequency("1.296G"), Some(1_296_000_000.0));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_frequency(""), None);
        assert_eq!(parse_frequency("M"), None);
        assert_eq!(parse_frequency("7.2X"), None);
        assert_eq!(parse_frequency("seven"), None);
    }

    #[test]
    fn ssrc_digit_folding() {
        assert_eq!(ssrc_from_token("7200000"), 7_200_000);
        assert_eq!(ssrc_from_token("7.2M"), 72);
        assert_eq!(ssrc_from_token("no digits"), 0);
        // 2^32 + 1 wraps
        assert_eq!(ssrc_from_token("4294967297"), 1);
    }

    #[quickcheck]
    fn ssrc_ignores_non_digits(token: String) -> bool {
        let digits: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
        ssrc_from_token(&token) == ssrc_from_token(&digits)
    }

    #[quickcheck]
    fn ssrc_matches_decimal_mod_2_32(digits: Vec<u8>) -> bool {
        let token: String = digits.iter().map(|d| char::from(b'0' + d % 10)).collect();
        let reference = token
            .bytes()
            .fold(0u64, |acc, d| (acc * 10 + u64::from(d - b'0')) % (1 << 32));
        u64::from(ssrc_from_token(&token)) == reference
    }
}
