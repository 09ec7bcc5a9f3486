use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// Priority games are mined first, everything else afterwards.
    #[default]
    PriorityFirst,
    /// Only games on the priority list are mined at all.
    PriorityOnly,
}

/// User-supplied game priorities and exclusions. Read-only to the engine;
/// replaced wholesale on reload between scheduling cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    /// Ordered by priority: index 0 is mined first.
    #[serde(default)]
    pub priority_games: Vec<String>,
    #[serde(default)]
    pub excluded_games: HashSet<String>,
    #[serde(default)]
    pub priority_mode: PriorityMode,
}

impl Preferences {
    /// Position of the game on the priority list, if listed.
    pub fn priority_rank(&self, game_name: &str) -> Option<usize> {
        self.priority_games.iter().position(|g| g == game_name)
    }

    pub fn is_excluded(&self, game_name: &str) -> bool {
        self.excluded_games.contains(game_name)
    }

    /// In `PriorityOnly` mode a non-empty priority list shuts out every
    /// unlisted game; an empty list allows everything.
    pub fn allows(&self, game_name: &str) -> bool {
        if self.is_excluded(game_name) {
            return false;
        }
        match self.priority_mode {
            PriorityMode::PriorityFirst => true,
            PriorityMode::PriorityOnly => {
                self.priority_games.is_empty() || self.priority_rank(game_name).is_some()
            }
        }
    }
}
