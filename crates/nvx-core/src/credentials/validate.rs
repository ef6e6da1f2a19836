use std::sync::OnceLock;

use regex::Regex;

/// Check that a secret looks like a Telegram bot token (`<bot id>:<hash>`).
///
/// This is advisory only. The store accepts any non-empty secret; callers use
/// the reason to warn the operator.
pub fn check_token_format(token: &str) -> Result<(), &'static str> {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

    if token.trim().is_empty() {
        return Err("Token is empty");
    }
    let Some((bot_id, hash)) = token.split_once(':') else {
        return Err("Token should contain exactly one colon (:)");
    };
    if hash.contains(':') {
        return Err("Token should contain exactly one colon (:)");
    }
    if bot_id.is_empty() || !bot_id.chars().all(|c| c.is_ascii_digit()) {
        return Err("Bot ID part (before colon) should contain only digits");
    }
    if hash.len() < 30 {
        return Err("Bot hash part (after colon) seems too short");
    }

    let re = TOKEN_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));
    if !re.is_match(hash) {
        return Err("Bot hash part (after colon) contains unexpected characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_botfather_shaped_tokens() {
        assert!(check_token_format("123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw").is_ok());
    }

    #[test]
    fn rejects_common_mistakes() {
        assert_eq!(check_token_format(""), Err("Token is empty"));
        assert_eq!(
            check_token_format("no-colon-here"),
            Err("Token should contain exactly one colon (:)")
        );
        assert_eq!(
            check_token_format("12a:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw"),
            Err("Bot ID part (before colon) should contain only digits")
        );
        assert_eq!(
            check_token_format("123:short"),
            Err("Bot hash part (after colon) seems too short")
        );
        assert!(check_token_format("123:AAHdqTcvCH1vGWJxfSeofSAs0K5PAL Dsaw").is_err());
    }
}
