use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    #[error("invalid intent: {reason}")]
    InvalidIntent { reason: &'static str },
    #[error("no queued intent at index {index} (cart holds {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// One requested state-changing call, not yet submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub contract_address: String,
    pub entry_point: String,
    pub calldata: Vec<String>,
}

impl Intent {
    pub fn new(
        contract_address: impl Into<String>,
        entry_point: impl Into<String>,
        calldata: Vec<String>,
    ) -> Self {
        Self {
            contract_address: contract_address.into(),
            entry_point: entry_point.into(),
            calldata,
        }
    }

    pub fn attack(contract_address: impl Into<String>, beast_id: &str) -> Self {
        Self::new(contract_address, "attack", entity_calldata(beast_id))
    }

    pub fn flee(contract_address: impl Into<String>, beast_id: &str) -> Self {
        Self::new(contract_address, "flee", entity_calldata(beast_id))
    }

    pub fn purchase(contract_address: impl Into<String>, item_id: &str) -> Self {
        Self::new(contract_address, "purchase", entity_calldata(item_id))
    }

    pub fn upgrade(contract_address: impl Into<String>, adventurer_id: &str) -> Self {
        Self::new(contract_address, "upgrade_stat", entity_calldata(adventurer_id))
    }

    fn validate(&self) -> Result<(), IntentError> {
        if self.contract_address.trim().is_empty() {
            return Err(IntentError::InvalidIntent {
                reason: "empty contract address",
            });
        }
        if self.entry_point.trim().is_empty() {
            return Err(IntentError::InvalidIntent {
                reason: "empty entry point",
            });
        }
        Ok(())
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.contract_address,
            self.entry_point,
            self.calldata.join(", ")
        )
    }
}

// u256 ids are passed as (low, high) felts.
fn entity_calldata(entity_id: &str) -> Vec<String> {
    vec![entity_id.to_string(), "0".to_string()]
}

/// Ordered contents of the queue at submission time. Never split.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Batch {
    intents: Vec<Intent>,
}

impl Batch {
    pub fn intents(&self) -> &[Intent] {
        &self.intents
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn into_intents(self) -> Vec<Intent> {
        self.intents
    }
}

impl From<Vec<Intent>> for Batch {
    fn from(intents: Vec<Intent>) -> Self {
        Self { intents }
    }
}

#[derive(Debug, Default)]
pub struct IntentQueue {
    intents: Vec<Intent>,
}

impl IntentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, intent: Intent) -> Result<(), IntentError> {
        intent.validate()?;
        self.intents.push(intent);
        Ok(())
    }

    pub fn drain_all(&mut self) -> Batch {
        Batch {
            intents: std::mem::take(&mut self.intents),
        }
    }

    pub fn cancel(&mut self) -> usize {
        let dropped = self.intents.len();
        self.intents.clear();
        dropped
    }

    pub fn remove(&mut self, index: usize) -> Result<Intent, IntentError> {
        if index >= self.intents.len() {
            return Err(IntentError::IndexOutOfRange {
                index,
                len: self.intents.len(),
            });
        }
        Ok(self.intents.remove(index))
    }

    pub fn intents(&self) -> &[Intent] {
        &self.intents
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}
