//! Council result types and the per-call cost ledger.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::gateway::{CostStatus, ModelCallResult};

// =============================================================================
// STAGES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Stage1,
    Stage2,
    Stage3,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Stage1, Stage::Stage2, Stage::Stage3];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Stage1 => "stage1",
            Stage::Stage2 => "stage2",
            Stage::Stage3 => "stage3",
        }
    }

    /// Ledger key for one call, e.g. `stage1_openai/gpt-5.1`.
    pub fn key(self, model: &str) -> String {
        format!("{}_{}", self.as_str(), model)
    }

    /// Attribution caller recorded on usage records.
    pub fn caller(self) -> &'static str {
        match self {
            Stage::Stage1 => "council::stage1",
            Stage::Stage2 => "council::stage2",
            Stage::Stage3 => "council::stage3",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// STAGE RESULTS
// =============================================================================

/// One label's position in a single ranker's order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub label: String,
    /// 1 is best. Two labels may share a position.
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// A stage 2 call whose content parsed into a complete ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingResponse {
    #[serde(flatten)]
    pub call: ModelCallResult,
    pub ranking: Vec<RankingEntry>,
}

impl RankingResponse {
    pub fn rank_of(&self, label: &str) -> Option<u32> {
        self.ranking
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.rank)
    }
}

/// Successful stage 1 answers, in configured model order.
pub type Stage1Results = Vec<ModelCallResult>;

/// Successfully parsed rankings, in configured model order.
pub type Stage2Results = Vec<RankingResponse>;

/// The chairman's synthesis.
pub type Stage3Result = ModelCallResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub label: String,
    pub model: String,
    /// Every position this label received, in ranker order.
    pub ranks: Vec<u32>,
    /// `None` when no ranker placed this label.
    pub mean_rank: Option<f64>,
}

/// Labels ordered by ascending mean rank; ties keep stage 1 order and
/// unranked labels come last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRanking {
    pub entries: Vec<AggregateEntry>,
}

impl AggregateRanking {
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// COST LEDGER
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCost {
    pub nanodollars: i64,
    pub status: CostStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCosts {
    pub stage1: StageCost,
    pub stage2: StageCost,
    pub stage3: StageCost,
    pub total: i64,
    /// `actual` once at least one call carries a billed cost.
    pub status: CostStatus,
}

impl StageCosts {
    pub fn get(&self, stage: Stage) -> StageCost {
        match stage {
            Stage::Stage1 => self.stage1,
            Stage::Stage2 => self.stage2,
            Stage::Stage3 => self.stage3,
        }
    }

    fn get_mut(&mut self, stage: Stage) -> &mut StageCost {
        match stage {
            Stage::Stage1 => &mut self.stage1,
            Stage::Stage2 => &mut self.stage2,
            Stage::Stage3 => &mut self.stage3,
        }
    }
}

/// Cost of one billed call, including stage 2 calls whose ranking was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCost {
    pub stage: Stage,
    pub model: String,
    pub cost_nanodollars: i64,
    pub cost_status: CostStatus,
}

/// A model call that produced no usable output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftFailure {
    pub stage: Stage,
    pub model: String,
    /// Short machine-readable code, e.g. `timeout`.
    pub reason: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub stage_costs: StageCosts,
    /// Ledger key to provider generation id.
    pub generation_ids: BTreeMap<String, String>,
    pub call_costs: BTreeMap<String, CallCost>,
    pub label_to_model: BTreeMap<String, String>,
    pub aggregate_ranking: AggregateRanking,
    #[serde(default)]
    pub soft_failures: Vec<SoftFailure>,
}

impl Metadata {
    /// Enter a successful call into the ledger.
    pub fn record_call(&mut self, stage: Stage, call: &ModelCallResult) {
        let key = stage.key(&call.model);
        if let Some(id) = &call.generation_id {
            self.generation_ids.insert(key.clone(), id.clone());
        }
        self.call_costs.insert(
            key,
            CallCost {
                stage,
                model: call.model.clone(),
                cost_nanodollars: call.cost_nanodollars,
                cost_status: call.cost_status,
            },
        );
    }

    /// Rebuild every stage total from the ledger.
    pub fn recompute_costs(&mut self) {
        let mut costs = StageCosts::default();
        let mut any_actual = false;

        for stage in Stage::ALL {
            let calls: Vec<&CallCost> = self
                .call_costs
                .values()
                .filter(|c| c.stage == stage)
                .collect();
            let nanodollars = calls.iter().map(|c| c.cost_nanodollars).sum();
            let all_actual =
                !calls.is_empty() && calls.iter().all(|c| c.cost_status == CostStatus::Actual);
            any_actual |= calls.iter().any(|c| c.cost_status == CostStatus::Actual);

            *costs.get_mut(stage) = StageCost {
                nanodollars,
                status: if all_actual {
                    CostStatus::Actual
                } else {
                    CostStatus::Estimated
                },
            };
        }

        costs.total =
            costs.stage1.nanodollars + costs.stage2.nanodollars + costs.stage3.nanodollars;
        costs.status = if any_actual {
            CostStatus::Actual
        } else {
            CostStatus::Estimated
        };
        self.stage_costs = costs;
    }
}

// =============================================================================
// COUNCIL RESULT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilResult {
    pub stage1: Stage1Results,
    pub stage2: Stage2Results,
    pub stage3: Stage3Result,
    pub metadata: Metadata,
}

impl CouncilResult {
    pub fn total_cost(&self) -> i64 {
        self.metadata.stage_costs.total
    }

    /// Overwrite ledger entries with billed costs keyed by ledger key, then
    /// recompute totals. Returns whether any value changed.
    ///
    /// Applying the same map twice leaves the result unchanged.
    pub fn apply_actual_costs(&mut self, actual: &HashMap<String, i64>) -> bool {
        let mut changed = false;

        for (key, &nanos) in actual {
            let Some(entry) = self.metadata.call_costs.get_mut(key) else {
                continue;
            };
            if entry.cost_nanodollars != nanos || entry.cost_status != CostStatus::Actual {
                changed = true;
            }
            entry.cost_nanodollars = nanos;
            entry.cost_status = CostStatus::Actual;

            let (stage, model) = (entry.stage, entry.model.clone());
            if let Some(call) = self.call_mut(stage, &model) {
                call.cost_nanodollars = nanos;
                call.cost_status = CostStatus::Actual;
            }
        }

        self.metadata.recompute_costs();
        changed
    }

    fn call_mut(&mut self, stage: Stage, model: &str) -> Option<&mut ModelCallResult> {
        match stage {
            Stage::Stage1 => self.stage1.iter_mut().find(|c| c.model == model),
            Stage::Stage2 => self
                .stage2
                .iter_mut()
                .map(|r| &mut r.call)
                .find(|c| c.model == model),
            Stage::Stage3 => Some(&mut self.stage3).filter(|c| c.model == model),
        }
    }
}
