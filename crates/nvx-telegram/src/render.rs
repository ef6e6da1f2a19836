//! Reply rendering: typed command results to Telegram HTML.

use nvx_core::{
    commands::{CommandError, Reply, StatusReport},
    credentials::CredentialSummary,
    domain::CredentialId,
    events::{EventType, SecurityEvent},
    utils::{format_timestamp, short_date, truncate_text},
};

pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// What to send back for one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rendered {
    Html(String),
    /// Sent as a file attachment with an HTML caption.
    Document {
        file_name: String,
        bytes: Vec<u8>,
        caption: String,
    },
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Split `/cmd@botname args` into a lowercase verb and the raw argument text.
pub fn parse_command(text: &str) -> (String, String) {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

/// Split on line boundaries so no chunk exceeds `limit` bytes.
///
/// Every rendered line closes its own tags, so line boundaries are safe cut
/// points. A single oversize line loses its markup and is cut to fit on a
/// character boundary, never inside an `&...;` entity.
pub fn split_message(html: &str, limit: usize) -> Vec<String> {
    if html.len() <= limit {
        return vec![html.to_string()];
    }

    let mut out = Vec::new();
    let mut chunk = String::new();
    for line in html.lines() {
        let line = if line.len() > limit {
            clip_line(line, limit)
        } else {
            line.to_string()
        };
        if !chunk.is_empty() && chunk.len() + line.len() + 1 > limit {
            out.push(std::mem::take(&mut chunk));
        }
        if !chunk.is_empty() {
            chunk.push('\n');
        }
        chunk.push_str(&line);
    }
    if !chunk.is_empty() {
        out.push(chunk);
    }
    out
}

fn clip_line(line: &str, limit: usize) -> String {
    const ELLIPSIS: &str = "...";

    let plain = strip_tags(line);
    if plain.len() <= limit {
        return plain;
    }

    let mut cut = limit.saturating_sub(ELLIPSIS.len());
    while !plain.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut head = &plain[..cut];
    if let Some(amp) = head.rfind('&').filter(|&i| !head[i..].contains(';')) {
        head = &head[..amp];
    }
    format!("{head}{ELLIPSIS}")
}

/// Text content only. Literal `<` never reaches here unescaped.
fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

pub fn render_error(err: &CommandError) -> String {
    match err {
        CommandError::Unauthorized { .. } => format!("🚫 {}", escape_html(&err.to_string())),
        CommandError::NotFound(m) => format!("❓ {}", escape_html(m)),
        CommandError::BadRequest(m) => format!("⚠️ {}", escape_html(m)),
        CommandError::RateLimited { .. } => format!("⏳ {}", escape_html(&err.to_string())),
        CommandError::Internal(_) => "❌ Internal error. Check the server logs.".to_string(),
    }
}

pub fn render_reply(reply: &Reply) -> Rendered {
    let html = match reply {
        Reply::Help { role, verbs } => {
            let mut out = format!("🤖 <b>Commands</b> (role: {})\n", role.as_str());
            for v in verbs {
                let usage = if v.usage.is_empty() {
                    String::new()
                } else {
                    format!(" {}", escape_html(v.usage))
                };
                out.push_str(&format!(
                    "\n/{}{usage} - {}",
                    v.verb,
                    escape_html(v.summary)
                ));
            }
            out
        }
        Reply::Identity { user, channel, role } => format!(
            "🆔 User ID: <code>{user}</code>\nChat ID: <code>{}</code>\nRole: {}",
            channel.chat_id.0,
            role.as_str()
        ),
        Reply::Tokens(list) => render_tokens(list),
        Reply::ActiveToken(Some(c)) => format!("🟢 Active credential\n\n{}", token_line(c)),
        Reply::ActiveToken(None) => "⚪ No active credential.".to_string(),
        Reply::Events { events, event_type } => render_events(events, *event_type),
        Reply::Status(s) => render_status(s),
        Reply::TokenAdded {
            id,
            name,
            masked,
            is_active,
            format_warning,
        } => {
            let mut out = format!(
                "✅ Credential added\nID: <code>{id}</code>\nName: {}\nToken: <code>{}</code>",
                escape_html(name),
                escape_html(masked)
            );
            if *is_active {
                out.push_str("\nNow active.");
            }
            push_warning(&mut out, *format_warning);
            out
        }
        Reply::TokenUpdated {
            id,
            rotated,
            format_warning,
        } => {
            let verb = if *rotated { "rotated" } else { "updated" };
            let mut out = format!("🔄 Credential <code>{id}</code> {verb}.");
            push_warning(&mut out, *format_warning);
            out
        }
        Reply::TokenActivated { id } => format!("🟢 Credential <code>{id}</code> is now active."),
        Reply::TokenDeactivated { id, new_active } => format!(
            "⏸️ Credential <code>{id}</code> deactivated.{}",
            pointer_note(new_active.as_ref())
        ),
        Reply::TokenDeleted { id, new_active } => format!(
            "🗑️ Credential <code>{id}</code> deleted.{}",
            pointer_note(new_active.as_ref())
        ),
        Reply::Exported {
            json,
            include_secrets,
        } => {
            let caption = if *include_secrets {
                "📦 Credential export <b>with secrets</b>. Store it somewhere safe and delete this message."
            } else {
                "📦 Credential export (secrets redacted)."
            };
            return Rendered::Document {
                file_name: format!(
                    "tokens-{}.json",
                    chrono::Utc::now().format("%Y%m%d-%H%M%S")
                ),
                bytes: json.as_bytes().to_vec(),
                caption: caption.to_string(),
            };
        }
        Reply::Imported { count, active } => format!(
            "📥 Imported {count} credential(s).{}",
            pointer_note(active.as_ref())
        ),
        Reply::EmergencyReset {
            id,
            masked,
            format_warning,
        } => {
            let mut out = format!(
                "🚨 Emergency reset complete. All previous credentials were removed.\nNew active credential: <code>{id}</code> (<code>{}</code>)",
                escape_html(masked)
            );
            push_warning(&mut out, *format_warning);
            out
        }
    };
    Rendered::Html(html)
}

fn render_tokens(list: &[CredentialSummary]) -> String {
    if list.is_empty() {
        return "📭 No credentials stored.".to_string();
    }
    let mut out = format!("🔑 <b>Credentials</b> ({})\n", list.len());
    for c in list {
        out.push('\n');
        out.push_str(&token_line(c));
    }
    out
}

fn token_line(c: &CredentialSummary) -> String {
    let marker = if c.is_active { "🟢" } else { "⚪" };
    let last_used = c
        .last_used_at
        .as_ref()
        .map_or_else(|| "never".to_string(), short_date);
    format!(
        "{marker} <b>{}</b> <code>{}</code> [{}] created {} last used {last_used}",
        escape_html(&c.name),
        c.id,
        c.lifecycle_state.as_str(),
        short_date(&c.created_at),
    )
}

fn render_events(events: &[SecurityEvent], event_type: Option<EventType>) -> String {
    let filter = event_type.map_or(String::new(), |t| format!(" ({})", t.as_str()));
    if events.is_empty() {
        return format!("📋 No security events{filter}.");
    }
    let mut out = format!("📋 <b>Security events</b>{filter}\n");
    for ev in events {
        let actor = ev
            .actor_identity
            .map_or_else(|| "-".to_string(), |u| u.to_string());
        let details = format_details(&ev.details);
        out.push_str(&format!(
            "\n<code>{}</code> {} by {actor} {}",
            format_timestamp(&ev.timestamp),
            ev.event_type.as_str(),
            escape_html(&truncate_text(&details, 200)),
        ));
    }
    out
}

fn format_details(details: &nvx_core::events::EventDetails) -> String {
    details
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_status(s: &StatusReport) -> String {
    let active = s
        .store
        .active_id
        .as_ref()
        .map_or_else(|| "none".to_string(), |id| format!("<code>{id}</code>"));
    let sealing = if s.store.encrypted {
        "encrypted"
    } else {
        "⚠️ PLAINTEXT (set NOVAXA_MASTER_KEY)"
    };
    format!(
        "📊 <b>Status</b>\n\n\
         Credentials: {} ({} inactive)\n\
         Active: {active}\n\
         At rest: {sealing}\n\
         Security events buffered: {}/{}\n\
         Audit write failures: {}\n\
         Your requests: {}/{} per {}s (role: {})",
        s.store.credentials,
        s.store.inactive,
        s.events_buffered,
        s.event_capacity,
        s.event_write_failures,
        s.rate_limit.count,
        s.rate_limit.max,
        s.rate_limit_interval.as_secs(),
        s.role.as_str(),
    )
}

fn pointer_note(active: Option<&CredentialId>) -> String {
    match active {
        Some(id) => format!("\nActive credential: <code>{id}</code>"),
        None => "\n⚠️ No active credential.".to_string(),
    }
}

fn push_warning(out: &mut String, warning: Option<&'static str>) {
    if let Some(w) = warning {
        out.push_str(&format!("\n\n⚠️ Token format: {}", escape_html(w)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvx_core::{
        commands::VERBS,
        domain::{Channel, UserId},
        security::Role,
    };
    use std::time::Duration;

    #[test]
    fn parse_command_strips_bot_suffix() {
        assert_eq!(
            parse_command("/AddToken@novaxa_bot 123:abc Main Bot"),
            ("addtoken".to_string(), "123:abc Main Bot".to_string())
        );
        assert_eq!(parse_command("/help"), ("help".to_string(), String::new()));
    }

    #[test]
    fn escape_html_covers_telegram_specials() {
        assert_eq!(escape_html("<a & \"b\">"), "&lt;a &amp; &quot;b&quot;&gt;");
    }

    #[test]
    fn split_message_respects_limit_on_line_boundaries() {
        let html = (0..50)
            .map(|i| format!("line {i:02} {}", "x".repeat(20)))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = split_message(&html, 200);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 200));
        assert_eq!(chunks.join("\n"), html);
    }

    #[test]
    fn oversize_multibyte_line_is_cut_to_the_byte_limit() {
        let long = format!("<b>{}</b> &amp; tail", "é".repeat(300));
        let html = format!("header\n{long}\nfooter");
        let chunks = split_message(&html, 101);

        assert!(chunks.iter().all(|c| c.len() <= 101), "{chunks:?}");
        let clipped = chunks.iter().find(|c| c.contains('é')).unwrap();
        assert!(!clipped.contains("<b>"));
        assert!(clipped.ends_with("..."));
        assert!(chunks.first().unwrap().starts_with("header"));
        assert!(chunks.last().unwrap().ends_with("footer"));
    }

    #[test]
    fn clipped_line_never_ends_inside_an_entity() {
        let line = format!("<code>{}</code>", "a&amp;".repeat(40));
        for limit in 20..40 {
            let clipped = clip_line(&line, limit);
            assert!(clipped.len() <= limit);
            let body = clipped.trim_end_matches("...");
            if let Some(amp) = body.rfind('&') {
                assert!(body[amp..].starts_with("&amp;"), "{clipped}");
            }
        }
    }

    #[test]
    fn full_export_is_sent_as_document() {
        let rendered = render_reply(&Reply::Exported {
            json: "{\"tokens\":[]}".into(),
            include_secrets: true,
        });
        let Rendered::Document {
            file_name, caption, ..
        } = rendered
        else {
            panic!("expected document");
        };
        assert!(file_name.ends_with(".json"));
        assert!(caption.contains("with secrets"));
    }

    #[test]
    fn help_and_identity_render() {
        let Rendered::Html(html) = render_reply(&Reply::Help {
            role: Role::Owner,
            verbs: VERBS.iter().collect(),
        }) else {
            panic!("expected html");
        };
        assert!(html.contains("/emergencyreset confirm &lt;TOKEN&gt;"));

        let Rendered::Html(html) = render_reply(&Reply::Identity {
            user: UserId(42),
            channel: Channel::private(42),
            role: Role::User,
        }) else {
            panic!("expected html");
        };
        assert!(html.contains("<code>42</code>"));
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let html = render_error(&CommandError::Internal("/secret/path: EACCES".into()));
        assert!(!html.contains("/secret/path"));
        let html = render_error(&CommandError::RateLimited {
            retry_after: Duration::from_secs(12),
        });
        assert!(html.contains("12s"));
    }
}
