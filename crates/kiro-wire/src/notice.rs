//! Operational-notice injection.
//!
//! The notice text is wrapped in a zero-width character pair and a Markdown
//! blockquote, with the content-derived identity tag embedded, so a later
//! turn can detect a prior injection in the history no matter how the
//! client re-formatted the visible text. At most one notice per
//! conversation; the guarantee needs no server-side state.

use kiro_core::config::NotificationConfig;

use crate::chat::{ChatMessage, Role};

/// ZWSP + WJ + ZWNJ + ZWSP
pub const NOTICE_START: &str = "\u{200B}\u{2060}\u{200C}\u{200B}";
/// ZWSP + ZWNJ + WJ + ZWSP
pub const NOTICE_END: &str = "\u{200B}\u{200C}\u{2060}\u{200B}";

/// Render the notice block emitted into the final text content of a
/// response. The identity tag rides inside the wrapped span.
pub fn render_notice(config: &NotificationConfig) -> String {
    format!(
        "\n\n{NOTICE_START}> {}\n>\n> `{}`{NOTICE_END}",
        config.message.trim(),
        config.identity_tag,
    )
}

/// Whether any message in the history already carries the identity tag.
/// The tag itself is searched (not the zero-width markers) because clients
/// routinely strip invisible characters when re-sending history.
pub fn history_contains_tag(messages: &[ChatMessage], identity_tag: &str) -> bool {
    if identity_tag.is_empty() {
        return false;
    }
    messages.iter().any(|m| m.content.contains(identity_tag))
}

/// Remove previously injected notice spans from assistant history before
/// upstream dispatch, so the model never sees its own operational notices.
/// Falls back to dropping the tag line when the zero-width markers were
/// stripped by the client.
pub fn strip_notice_blocks(messages: &mut [ChatMessage], identity_tag: &str) {
    if identity_tag.is_empty() {
        return;
    }
    for message in messages.iter_mut() {
        if message.role != Role::Assistant || !message.content.contains(identity_tag) {
            continue;
        }
        message.content = strip_from_text(&message.content, identity_tag);
    }
}

fn strip_from_text(text: &str, identity_tag: &str) -> String {
    // preferred: remove the whole marker-delimited span containing the tag
    if let Some(start) = text.find(NOTICE_START) {
        if let Some(end_rel) = text[start..].find(NOTICE_END) {
            let end = start + end_rel + NOTICE_END.len();
            if text[start..end].contains(identity_tag) {
                let mut out = String::with_capacity(text.len());
                out.push_str(text[..start].trim_end());
                out.push_str(&text[end..]);
                return out;
            }
        }
    }

    // markers lost: drop the lines carrying the tag
    text.lines()
        .filter(|line| !line.contains(identity_tag))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;
    use kiro_core::config::NotificationConfig;

    fn config() -> NotificationConfig {
        NotificationConfig::new(true, "Scheduled maintenance at 02:00 UTC.")
    }

    #[test]
    fn rendered_notice_carries_markers_and_tag() {
        let config = config();
        let notice = render_notice(&config);
        assert!(notice.contains(NOTICE_START));
        assert!(notice.contains(NOTICE_END));
        assert!(notice.contains(&config.identity_tag));
        assert!(notice.contains("Scheduled maintenance"));
    }

    #[test]
    fn tag_detection_in_history() {
        let config = config();
        let notice = render_notice(&config);
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant(format!("Sure.{notice}")),
        ];
        assert!(history_contains_tag(&history, &config.identity_tag));
        assert!(!history_contains_tag(
            &[ChatMessage::user("hi")],
            &config.identity_tag
        ));
    }

    #[test]
    fn detection_survives_marker_stripping() {
        let config = config();
        let notice = render_notice(&config);
        // a client that strips zero-width characters still resends the tag
        let visible: String = notice
            .chars()
            .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{2060}'))
            .collect();
        let history = vec![ChatMessage::assistant(visible)];
        assert!(history_contains_tag(&history, &config.identity_tag));
    }

    #[test]
    fn strip_removes_marked_span() {
        let config = config();
        let notice = render_notice(&config);
        let mut history = vec![ChatMessage::assistant(format!("The answer is 42.{notice}"))];
        strip_notice_blocks(&mut history, &config.identity_tag);
        assert_eq!(history[0].content, "The answer is 42.");
    }

    #[test]
    fn strip_falls_back_to_line_removal() {
        let config = config();
        let content = format!("Answer.\n> maintenance `{}`\nMore.", config.identity_tag);
        let mut history = vec![ChatMessage::assistant(content)];
        strip_notice_blocks(&mut history, &config.identity_tag);
        assert_eq!(history[0].content, "Answer.\nMore.");
    }

    #[test]
    fn strip_leaves_user_messages_alone() {
        let config = config();
        let content = format!("quoting `{}` back at you", config.identity_tag);
        let mut history = vec![ChatMessage::user(content.clone())];
        strip_notice_blocks(&mut history, &config.identity_tag);
        assert_eq!(history[0].content, content);
    }

    #[test]
    fn empty_tag_never_matches() {
        let history = vec![ChatMessage::assistant("anything")];
        assert!(!history_contains_tag(&history, ""));
    }
}
