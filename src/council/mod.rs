//! Council consensus: collect, rank anonymously, synthesize.

pub mod labels;
pub mod pipeline;
pub mod prompts;
pub mod ranking;
pub mod title;
pub mod types;

pub use labels::{label_for_index, LabelMap};
pub use pipeline::{PipelineError, StagePipeline};
pub use ranking::{aggregate, parse_ranking, RankingParseError};
pub use title::{generate_title, DEFAULT_TITLE};
pub use types::*;
