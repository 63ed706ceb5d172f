use serde::{Deserialize, Serialize};

use taxflow_core::{DebtAmount, PersonSnapshot};

/// Kind of change an envelope requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Create,
    Update,
    Delete,
    AddDebt,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "CREATE",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::AddDebt => "ADD_DEBT",
        }
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Amount to add to a person's accumulated debt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtCalculation {
    pub amount: DebtAmount,
}

/// Payload of a person pipeline envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersonPayload {
    /// Entity-change event (create/update/delete).
    Snapshot(PersonSnapshot),
    /// Calculation event.
    Debt(DebtCalculation),
}
