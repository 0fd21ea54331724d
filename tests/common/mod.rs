#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use council_harness::council::title::TITLE_CALLER;
use council_harness::council::Stage;
use council_harness::gateway::{
    CallFailure, ChatRequest, CostStatus, ModelCallResult, ModelGateway, TokenUsage,
};
use tokio::sync::Notify;

/// Estimated cost of every scripted call.
pub const CALL_COST: i64 = 1_000;

#[derive(Clone)]
pub enum Reply {
    Content(String),
    Delayed(Duration, String),
    Fail(CallFailure),
    /// Rank every label shown in the prompt as 1.
    TiedRanking,
}

/// In-process gateway with per-stage, per-model scripted replies.
///
/// Unscripted stage 1 calls answer `answer from <model>`, unscripted stage 2
/// calls return a tied ranking, and the chairman answers `final answer`.
/// Generation ids are `<stage>_<model>`. Title calls answer `Council Title`
/// and are not recorded as stage calls.
pub struct ScriptedGateway {
    replies: HashMap<(Stage, String), Reply>,
    chairman: Reply,
    actual: Mutex<HashMap<String, i64>>,
    calls: Mutex<Vec<(Stage, String, String)>>,
    lookups: AtomicUsize,
    stage3_gate: Option<Arc<Notify>>,
    pub stage3_started: Arc<Notify>,
    title: Reply,
    title_prompts: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            chairman: Reply::Content("final answer".into()),
            actual: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            lookups: AtomicUsize::new(0),
            stage3_gate: None,
            stage3_started: Arc::new(Notify::new()),
            title: Reply::Content("Council Title".into()),
            title_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn title(mut self, reply: Reply) -> Self {
        self.title = reply;
        self
    }

    /// Questions sent for conversation titles.
    pub fn title_prompts(&self) -> Vec<String> {
        self.title_prompts.lock().unwrap().clone()
    }

    pub fn reply(mut self, stage: Stage, model: &str, reply: Reply) -> Self {
        self.replies.insert((stage, model.to_string()), reply);
        self
    }

    pub fn answer(self, model: &str, content: &str) -> Self {
        self.reply(Stage::Stage1, model, Reply::Content(content.into()))
    }

    pub fn chairman(mut self, reply: Reply) -> Self {
        self.chairman = reply;
        self
    }

    /// Hold the chairman call until `gate` is notified.
    pub fn hold_stage3(mut self, gate: Arc<Notify>) -> Self {
        self.stage3_gate = Some(gate);
        self
    }

    pub fn set_actual_cost(&self, generation_id: &str, nanos: i64) {
        self.actual
            .lock()
            .unwrap()
            .insert(generation_id.to_string(), nanos);
    }

    /// Models called in `stage`, in call order.
    pub fn calls(&self, stage: Stage) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == stage)
            .map(|(_, m, _)| m.clone())
            .collect()
    }

    /// Last user message sent in `stage`.
    pub fn last_prompt(&self, stage: Stage) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, _, _)| *s == stage)
            .map(|(_, _, p)| p.clone())
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

fn stage_of(req: &ChatRequest) -> Stage {
    match req.attribution.caller {
        "council::stage1" => Stage::Stage1,
        "council::stage2" => Stage::Stage2,
        _ => Stage::Stage3,
    }
}

fn tied_ranking(prompt: &str) -> String {
    let entries: Vec<String> = prompt
        .lines()
        .filter_map(|l| l.strip_prefix("Response "))
        .filter_map(|l| l.strip_suffix(':'))
        .map(|label| format!(r#"{{"label":"{label}","rank":1}}"#))
        .collect();
    format!(r#"{{"ranking":[{}]}}"#, entries.join(","))
}

#[async_trait::async_trait]
impl ModelGateway for ScriptedGateway {
    async fn query(&self, req: ChatRequest) -> Result<ModelCallResult, CallFailure> {
        let prompt = req
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if req.attribution.caller == TITLE_CALLER {
            self.title_prompts.lock().unwrap().push(prompt);
            return match self.title.clone() {
                Reply::Fail(failure) => Err(failure),
                Reply::Content(c) | Reply::Delayed(_, c) => Ok(result(&req.model, c, None)),
                Reply::TiedRanking => Ok(result(&req.model, String::new(), None)),
            };
        }

        let stage = stage_of(&req);
        self.calls
            .lock()
            .unwrap()
            .push((stage, req.model.clone(), prompt.clone()));

        let reply = match stage {
            Stage::Stage3 => {
                self.stage3_started.notify_one();
                if let Some(gate) = &self.stage3_gate {
                    gate.notified().await;
                }
                self.chairman.clone()
            }
            _ => self
                .replies
                .get(&(stage, req.model.clone()))
                .cloned()
                .unwrap_or_else(|| match stage {
                    Stage::Stage1 => Reply::Content(format!("answer from {}", req.model)),
                    _ => Reply::TiedRanking,
                }),
        };

        let content = match reply {
            Reply::Content(c) => c,
            Reply::Delayed(delay, c) => {
                tokio::time::sleep(delay).await;
                c
            }
            Reply::Fail(failure) => return Err(failure),
            Reply::TiedRanking => tied_ranking(&prompt),
        };

        Ok(result(&req.model, content, Some(stage.key(&req.model))))
    }

    async fn fetch_actual_cost(&self, generation_id: &str) -> Option<i64> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.actual.lock().unwrap().get(generation_id).copied()
    }
}

fn result(model: &str, content: String, generation_id: Option<String>) -> ModelCallResult {
    ModelCallResult {
        model: model.to_string(),
        content,
        usage: TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
        cost_nanodollars: CALL_COST,
        cost_status: CostStatus::Estimated,
        generation_id,
        latency_ms: 1,
    }
}

pub fn models(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
