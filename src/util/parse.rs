/// Parses the leading decimal integer of a string, ignoring leading whitespace and anything after
///  the digits (`"17abc"` -> 17). An optional sign is accepted. Returns `None` if there are no
///  digits or the number does not fit.
pub fn parse_leading_int(s: &str) -> Option<i32> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let len = digits.bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if len == 0 {
        return None;
    }

    let magnitude: i64 = digits[..len].parse().ok()?;
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::plain("3", Some(3))]
    #[case::trailing("12,1", Some(12))]
    #[case::leading_space("  7", Some(7))]
    #[case::negative("-1", Some(-1))]
    #[case::plus("+5", Some(5))]
    #[case::empty("", None)]
    #[case::no_digits("abc", None)]
    #[case::sign_only("-", None)]
    #[case::overflow("99999999999", None)]
    #[case::very_long("999999999999999999999999", None)]
    fn test_parse_leading_int(#[case] s: &str, #[case] expected: Option<i32>) {
        assert_eq!(parse_leading_int(s), expected);
    }
}
