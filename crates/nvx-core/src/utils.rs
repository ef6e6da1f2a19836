use chrono::{DateTime, SecondsFormat, Utc};

// ============== Timestamp Helpers ==============

/// RFC3339 with millisecond precision, `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `YYYY-MM-DD` prefix used in listings.
pub fn short_date(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

// ============== Secret Display ==============

/// Show only the edges of a secret, e.g. `12345...wxyz`.
///
/// Short values are fully masked so nothing useful leaks.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 12 {
        return "*".repeat(chars.len().max(3));
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
pub(crate) fn tmp_path(prefix: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static SEQ: AtomicUsize = AtomicUsize::new(0);

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    let seq = SEQ.fetch_add(1, Ordering::SeqCst);
    std::path::PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}-{seq}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_secret_keeps_edges_only() {
        let masked = mask_secret("123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw");
        assert_eq!(masked, "12345...Dsaw");
        assert_eq!(mask_secret("short"), "*****");
        assert_eq!(mask_secret(""), "***");
    }

    #[test]
    fn truncate_text_adds_ellipsis() {
        let s = "a".repeat(20);
        let t = truncate_text(&s, 10);
        assert_eq!(t, format!("{}...", "a".repeat(10)));
        assert_eq!(truncate_text("abc", 10), "abc");
    }
}
