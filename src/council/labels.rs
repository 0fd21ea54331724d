//! Anonymized response labels for stage 2.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;

/// Label for a position: A..Z, then AA, AB, ...
pub fn label_for_index(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        n -= 1;
        out.push(b'A' + (n % 26) as u8);
        n /= 26;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub label: String,
    pub model: String,
    /// Position of this answer in the stage 1 results.
    pub stage1_index: usize,
}

/// Bijection between labels and stage 1 answers, in label order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    entries: Vec<LabelEntry>,
}

impl LabelMap {
    /// Assign labels to `models` (stage 1 order) in a shuffled order.
    pub fn assign<R: Rng + ?Sized>(models: &[String], rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..models.len()).collect();
        order.shuffle(rng);
        Self::from_order(models, &order)
    }

    /// Label `A` for the first answer, `B` for the second, and so on.
    pub fn in_order(models: &[String]) -> Self {
        let order: Vec<usize> = (0..models.len()).collect();
        Self::from_order(models, &order)
    }

    fn from_order(models: &[String], order: &[usize]) -> Self {
        let entries = order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| LabelEntry {
                label: label_for_index(pos),
                model: models[idx].clone(),
                stage1_index: idx,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[LabelEntry] {
        &self.entries
    }

    pub fn get(&self, label: &str) -> Option<&LabelEntry> {
        self.entries.iter().find(|e| e.label == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_btree(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.label.clone(), e.model.clone()))
            .collect()
    }
}
