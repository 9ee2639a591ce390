use std::fmt;
use std::str::FromStr;

use txflow::{
    ActionKind, Expectation, Intent, MergedView, OptimisticSnapshot, QueryKey, QuerySpec, Row,
    SubmitRequest,
};

use super::sim::{
    AdventurerState, BeastState, WorldState, ADVENTURER_QUERY, BATTLES_QUERY, BEAST_QUERY,
};

pub(crate) const ARENA_CONTRACT: &str = "0x0arena";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlayerAction {
    Attack,
    Flee,
}

impl PlayerAction {
    pub(crate) fn kind(self) -> ActionKind {
        match self {
            PlayerAction::Attack => ActionKind::Attack,
            PlayerAction::Flee => ActionKind::Flee,
        }
    }
}

impl fmt::Display for PlayerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerAction::Attack => f.write_str("attack"),
            PlayerAction::Flee => f.write_str("flee"),
        }
    }
}

impl FromStr for PlayerAction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "attack" => Ok(PlayerAction::Attack),
            "flee" => Ok(PlayerAction::Flee),
            other => Err(format!("unknown action `{other}`")),
        }
    }
}

/// One adventurer facing one beast.
#[derive(Debug, Clone)]
pub(crate) struct Encounter {
    pub(crate) adventurer_id: String,
    pub(crate) beast_id: String,
    pub(crate) beast_name: String,
}

impl Encounter {
    pub(crate) fn demo() -> Self {
        Self {
            adventurer_id: "2".to_string(),
            beast_id: "7".to_string(),
            beast_name: "Gnome".to_string(),
        }
    }

    pub(crate) fn genesis(&self, beast_health: u32) -> WorldState {
        WorldState {
            beast: BeastState {
                id: self.beast_id.clone(),
                name: self.beast_name.clone(),
                health: beast_health,
                fled: false,
            },
            adventurer: AdventurerState {
                id: self.adventurer_id.clone(),
                health: 100,
            },
            battles: Vec::new(),
        }
    }

    pub(crate) fn beast_key(&self) -> QueryKey {
        QueryKey::new(BEAST_QUERY).with_var("id", self.beast_id.as_str())
    }

    pub(crate) fn battles_key(&self) -> QueryKey {
        QueryKey::new(BATTLES_QUERY).with_var("beastId", self.beast_id.as_str())
    }

    pub(crate) fn adventurer_key(&self) -> QueryKey {
        QueryKey::new(ADVENTURER_QUERY).with_var("id", self.adventurer_id.as_str())
    }

    pub(crate) fn query_specs(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec::latest(self.adventurer_key()),
            QuerySpec::latest(self.beast_key()),
            QuerySpec::append_only(self.battles_key()),
        ]
    }

    pub(crate) fn intent(&self, action: PlayerAction) -> Intent {
        match action {
            PlayerAction::Attack => Intent::attack(ARENA_CONTRACT, &self.beast_id),
            PlayerAction::Flee => Intent::flee(ARENA_CONTRACT, &self.beast_id),
        }
    }

    /// Builds the submit request from the views rendered right before the
    /// click. A pending battle entry is shown at once. Confirmation is read
    /// from the beast row alone so that a battle log polled at a different
    /// moment cannot confirm the wrong action.
    pub(crate) fn request(
        &self,
        action: PlayerAction,
        battles: &MergedView,
        beast: &MergedView,
    ) -> SubmitRequest {
        let known_battles = battles.len();
        let pending_entry = Row::new(format!("local-{}", known_battles + 1))
            .with_field("action", action.to_string())
            .with_field("pending", "true");
        let snapshot = OptimisticSnapshot::builder()
            .row(self.battles_key(), pending_entry)
            .build();

        let current_health = beast
            .row(&self.beast_id)
            .and_then(|row| row.field_u128("health"));
        let expectation = match (action, current_health) {
            (PlayerAction::Attack, Some(health)) => {
                Expectation::field_decreased(self.beast_key(), &self.beast_id, "health", health)
            }
            // Beast not indexed yet.
            (PlayerAction::Attack, None) => {
                Expectation::row_count_at_least(self.battles_key(), known_battles + 1)
            }
            (PlayerAction::Flee, _) => {
                Expectation::field_equals(self.beast_key(), &self.beast_id, "fled", "true")
            }
        };

        let kind = action.kind();
        let label = format!("{} {}", kind.verb(), self.beast_name);
        SubmitRequest::new(kind)
            .with_label(label)
            .with_snapshot(snapshot)
            .expecting(expectation)
    }
}

/// Parses a comma-separated action script such as `attack,flee,attack`.
pub(crate) fn parse_script(raw: &str) -> Result<Vec<PlayerAction>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(PlayerAction::from_str)
        .collect()
}
