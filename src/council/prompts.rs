//! Message builders for the three council stages.

use crate::gateway::{Message, ModelCallResult};

use super::labels::LabelMap;
use super::types::AggregateRanking;

const RANKING_SYSTEM_PROMPT: &str = "You are evaluating anonymous answers to the same question. \
Judge accuracy and insight. Reply with a JSON object of the form \
{\"ranking\":[{\"label\":\"A\",\"rank\":1,\"justification\":\"...\"}]} covering every label \
exactly once, where rank 1 is best.";

const CHAIRMAN_SYSTEM_PROMPT: &str = "You are the chairman of a council of language models. \
Several models answered the user's question and then ranked each other's answers anonymously. \
Write the single best final answer, drawing on the strongest points of the council.";

const TITLE_SYSTEM_PROMPT: &str = "Write a title of at most five words for a conversation \
that starts with the user's question. Reply with the title only, no quotes or punctuation.";

pub fn title_messages(query: &str) -> Vec<Message> {
    vec![Message::system(TITLE_SYSTEM_PROMPT), Message::user(query)]
}

pub fn stage1_messages(query: &str) -> Vec<Message> {
    vec![Message::user(query)]
}

/// Anonymized answers in label order.
pub fn stage2_messages(query: &str, labels: &LabelMap, stage1: &[ModelCallResult]) -> Vec<Message> {
    let mut body = format!("Question:\n{query}\n\n");
    for entry in labels.entries() {
        let content = stage1
            .get(entry.stage1_index)
            .map(|r| r.content.as_str())
            .unwrap_or_default();
        body.push_str(&format!("Response {}:\n{}\n\n", entry.label, content));
    }
    let all: Vec<&str> = labels.labels().collect();
    body.push_str(&format!("Labels to rank: {}", all.join(", ")));

    vec![Message::system(RANKING_SYSTEM_PROMPT), Message::user(body)]
}

pub fn stage3_messages(
    query: &str,
    stage1: &[ModelCallResult],
    aggregate: &AggregateRanking,
) -> Vec<Message> {
    let mut body = format!("Question:\n{query}\n\n");

    if stage1.is_empty() {
        body.push_str(
            "No council answers are available: every council model failed. \
             Answer the question yourself.",
        );
        return vec![Message::system(CHAIRMAN_SYSTEM_PROMPT), Message::user(body)];
    }

    body.push_str("Council answers:\n\n");
    for answer in stage1 {
        body.push_str(&format!("Model {}:\n{}\n\n", answer.model, answer.content));
    }

    body.push_str("Peer ranking (best first):\n");
    for (pos, entry) in aggregate.entries.iter().enumerate() {
        let mean = entry
            .mean_rank
            .map(|m| format!("mean rank {m:.2}"))
            .unwrap_or_else(|| "unranked".to_string());
        body.push_str(&format!("{}. {} ({mean})\n", pos + 1, entry.model));
    }

    vec![Message::system(CHAIRMAN_SYSTEM_PROMPT), Message::user(body)]
}
