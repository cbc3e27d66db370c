//! Message list bounding.

use termpilot_ai::{Message, Role};

/// Collapse `messages` to the pinned system message plus the last
/// `keep_recent` entries once it grows past `max_messages`.
///
/// Tool results whose requesting assistant message fell out of the window
/// are dropped too; endpoints reject orphaned tool messages.
pub fn trim(messages: &mut Vec<Message>, max_messages: usize, keep_recent: usize) {
    if messages.len() <= max_messages {
        return;
    }

    let pinned = messages
        .first()
        .filter(|m| m.role == Role::System)
        .cloned();
    let body_start = usize::from(pinned.is_some());
    let body = &messages[body_start..];
    let tail_start = body.len().saturating_sub(keep_recent);
    let mut tail: Vec<Message> = body[tail_start..].to_vec();
    drop_orphaned_tool_results(&mut tail);

    let dropped = messages.len() - tail.len() - body_start;
    tracing::debug!(dropped, kept = tail.len(), "trimmed conversation");

    messages.clear();
    messages.extend(pinned);
    messages.extend(tail);
}

/// Keep only the last `max` messages of a long-lived history.
pub fn keep_last(history: &mut Vec<Message>, max: usize) {
    if history.len() > max {
        history.drain(..history.len() - max);
        drop_orphaned_tool_results(history);
    }
}

fn drop_orphaned_tool_results(messages: &mut Vec<Message>) {
    let leading = messages
        .iter()
        .take_while(|m| m.role == Role::Tool)
        .count();
    messages.drain(..leading);
}
