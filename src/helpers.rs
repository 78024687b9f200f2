/// Render a byte count for humans, with decimal (`kB`) or binary
/// (`KiB`) unit steps.
pub fn human_readable_byte_count(bytes: u64, si: bool) -> String {
    let unit = if si { 1000u64 } else { 1024u64 };
    if bytes < unit {
        return format!("{} B", bytes);
    }
    let exponent = ((bytes as f64).ln() / (unit as f64).ln()) as u32;
    let prefix = ['k', 'M', 'G', 'T', 'P', 'E'][(exponent - 1) as usize];
    let scaled = bytes as f64 / unit.pow(exponent) as f64;
    if si {
        format!("{:.1} {}B", scaled, prefix)
    } else {
        format!("{:.1} {}iB", scaled, prefix.to_ascii_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_counts_stay_plain() {
        assert_eq!(human_readable_byte_count(0, true), "0 B");
        assert_eq!(human_readable_byte_count(999, true), "999 B");
        assert_eq!(human_readable_byte_count(1023, false), "1023 B");
    }

    #[test]
    fn test_decimal_units() {
        assert_eq!(human_readable_byte_count(1000, true), "1.0 kB");
        assert_eq!(human_readable_byte_count(1_500_000, true), "1.5 MB");
        assert_eq!(human_readable_byte_count(5_000_000_000, true), "5.0 GB");
    }

    #[test]
    fn test_binary_units() {
        assert_eq!(human_readable_byte_count(1024, false), "1.0 KiB");
        assert_eq!(human_readable_byte_count(5 * 1024 * 1024, false), "5.0 MiB");
        assert_eq!(
            human_readable_byte_count(3 * 1024 * 1024 * 1024, false),
            "3.0 GiB"
        );
    }
}
