//! New/change/delete partition between the previously harvested guids and the
//! freshly observed ones.

use std::collections::{BTreeMap, HashMap};

use gnh_core::RecordStatus;
use serde::{Deserialize, Serialize};

use crate::error::GatherError;

/// A guid seen upstream in this cycle, with its captured content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedRecord {
    pub guid: String,
    pub content: String,
}

impl ObservedRecord {
    pub fn new(guid: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    New,
    Change,
    Delete,
}

impl IntentAction {
    pub fn status(self) -> RecordStatus {
        match self {
            IntentAction::New => RecordStatus::New,
            IntentAction::Change => RecordStatus::Change,
            IntentAction::Delete => RecordStatus::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIntent {
    pub guid: String,
    pub action: IntentAction,
    pub content: Option<String>,
    pub owner_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCounts {
    pub new: usize,
    pub change: usize,
    pub delete: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub intents: Vec<RecordIntent>,
}

impl ReconciliationPlan {
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordIntent> {
        self.intents.iter()
    }

    pub fn counts(&self) -> PlanCounts {
        let mut counts = PlanCounts::default();
        for intent in &self.intents {
            match intent.action {
                IntentAction::New => counts.new += 1,
                IntentAction::Change => counts.change += 1,
                IntentAction::Delete => counts.delete += 1,
            }
        }
        counts
    }

    pub fn guids(&self, action: IntentAction) -> Vec<&str> {
        self.intents
            .iter()
            .filter(|i| i.action == action)
            .map(|i| i.guid.as_str())
            .collect()
    }
}

/// Deletes come first in guid order, then new and changed guids in the order
/// they were observed. A guid observed twice keeps its first position and its
/// last content.
///
/// Nothing observed and nothing previously known is reported as
/// [`GatherError::NoRecords`] instead of an empty plan.
pub fn reconcile(
    previous: &BTreeMap<String, String>,
    observed: Vec<ObservedRecord>,
) -> Result<ReconciliationPlan, GatherError> {
    let mut order: Vec<ObservedRecord> = Vec::with_capacity(observed.len());
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(observed.len());
    for record in observed {
        match positions.get(&record.guid) {
            Some(&idx) => order[idx].content = record.content,
            None => {
                positions.insert(record.guid.clone(), order.len());
                order.push(record);
            }
        }
    }

    let mut intents = Vec::with_capacity(order.len() + previous.len());
    for (guid, owner_ref) in previous {
        if !positions.contains_key(guid) {
            intents.push(RecordIntent {
                guid: guid.clone(),
                action: IntentAction::Delete,
                content: None,
                owner_ref: Some(owner_ref.clone()),
            });
        }
    }

    for record in order {
        let intent = match previous.get(&record.guid) {
            Some(owner_ref) => RecordIntent {
                guid: record.guid,
                action: IntentAction::Change,
                content: Some(record.content),
                owner_ref: Some(owner_ref.clone()),
            },
            None => RecordIntent {
                guid: record.guid,
                action: IntentAction::New,
                content: Some(record.content),
                owner_ref: None,
            },
        };
        intents.push(intent);
    }

    if intents.is_empty() {
        return Err(GatherError::NoRecords);
    }
    Ok(ReconciliationPlan { intents })
}
