/// Cap a message at `max_bytes`, cutting on a char boundary and noting how much was dropped.
pub fn truncate_message(message: &str, max_bytes: usize) -> String {
    if message.len() <= max_bytes {
        return message.to_string();
    }
    let mut boundary = max_bytes;
    while !message.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!(
        "{}... [truncated {} bytes]",
        &message[..boundary],
        message.len() - boundary
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_untouched() {
        assert_eq!(truncate_message("disk full", 100), "disk full");
    }

    #[test]
    fn exact_limit_untouched() {
        let msg = "a".repeat(100);
        assert_eq!(truncate_message(&msg, 100), msg);
    }

    #[test]
    fn long_message_cut() {
        let msg = "a".repeat(101);
        let out = truncate_message(&msg, 100);
        assert!(out.starts_with(&"a".repeat(100)));
        assert!(out.ends_with("[truncated 1 bytes]"));
    }

    #[test]
    fn respects_char_boundary() {
        // 4-byte chars: a 10-byte cut lands inside the third one.
        let msg = "🦀".repeat(10);
        let out = truncate_message(&msg, 10);
        assert!(out.starts_with("🦀🦀..."));
        assert!(out.ends_with("[truncated 32 bytes]"));
    }

    #[test]
    fn zero_budget() {
        assert_eq!(truncate_message("abc", 0), "... [truncated 3 bytes]");
    }
}
