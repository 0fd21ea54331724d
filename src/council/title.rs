//! Conversation titles from the first question.

use std::time::Duration;

use crate::gateway::{Attribution, CallFailure, ChatRequest, ModelGateway};

use super::prompts;

/// Title of a conversation that has not been named yet.
pub const DEFAULT_TITLE: &str = "New Conversation";

pub const TITLE_CALLER: &str = "council::title";

const MAX_TITLE_CHARS: usize = 50;

/// Ask `model` for a short title. A blank answer yields [`DEFAULT_TITLE`].
pub async fn generate_title(
    gateway: &dyn ModelGateway,
    model: &str,
    query: &str,
    timeout: Duration,
) -> Result<String, CallFailure> {
    let req = ChatRequest::new(
        model,
        prompts::title_messages(query),
        timeout,
        Attribution::new(TITLE_CALLER),
    );
    let result = gateway.query(req).await?;
    Ok(clean_title(&result.content))
}

fn clean_title(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line);
    let title = line.trim().trim_matches(|c| matches!(c, '"' | '\'' | '*' | '#')).trim();

    if title.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        let cut: String = title.chars().take(MAX_TITLE_CHARS - 3).collect();
        return format!("{}...", cut.trim_end());
    }
    title.to_string()
}
