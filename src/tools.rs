use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::api::Api;
use crate::clock::Clock;
use crate::sync::SharedStateChannel;

/// A named, typed sub-value of the shared room blob. Each feature owns
/// exactly one slot, so independent tools can't collide on keys or see
/// each other's state. Reading an absent or shape-mismatched slot yields
/// the default, never a null/undefined ambiguity.
pub struct ToolSlot<T> {
    key: &'static str,
    default: fn() -> T,
}

impl<T: Serialize + DeserializeOwned> ToolSlot<T> {
    pub const fn new(key: &'static str, default: fn() -> T) -> Self {
        Self { key, default }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn get<A: Api, C: Clock>(&self, channel: &SharedStateChannel<A, C>) -> T {
        match channel.get(self.key) {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|_| (self.default)()),
            None => (self.default)(),
        }
    }

    /// Returns whether the write was applied; false for student channels.
    pub fn set<A: Api, C: Clock>(&self, channel: &mut SharedStateChannel<A, C>, value: T) -> bool {
        match serde_json::to_value(&value) {
            Ok(v) => channel.set_key(self.key, v),
            Err(_) => false,
        }
    }

    /// Reducer-style write: next value computed from the current one.
    pub fn update<A: Api, C: Clock>(
        &self,
        channel: &mut SharedStateChannel<A, C>,
        f: impl FnOnce(T) -> T,
    ) -> bool {
        let next = f(self.get(channel));
        self.set(channel, next)
    }

    pub fn clear<A: Api, C: Clock>(&self, channel: &mut SharedStateChannel<A, C>) -> bool {
        channel.remove_key(self.key)
    }
}

pub const DICE: ToolSlot<DiceState> = ToolSlot::new("dice", DiceState::default);
pub const TIMER: ToolSlot<TimerState> = ToolSlot::new("timer", TimerState::default);
pub const SCOREBOARD: ToolSlot<ScoreboardState> =
    ToolSlot::new("scoreboard", ScoreboardState::default);
pub const GROUPS: ToolSlot<GroupsState> = ToolSlot::new("groups", GroupsState::default);

/// Guards against two features claiming the same blob key. Registration
/// happens once per process with the known slot set; a duplicate is a
/// programming error surfaced immediately rather than a silent overwrite.
#[derive(Debug, Default)]
pub struct SlotRegistry {
    keys: Vec<&'static str>,
}

impl SlotRegistry {
    pub fn with_known_slots() -> Result<Self, SlotCollision> {
        let mut reg = Self::default();
        for key in [
            DICE.key(),
            TIMER.key(),
            SCOREBOARD.key(),
            GROUPS.key(),
            crate::quiz::QUIZ_SESSION_KEY,
        ] {
            reg.register(key)?;
        }
        Ok(reg)
    }

    pub fn register(&mut self, key: &'static str) -> Result<(), SlotCollision> {
        if self.keys.contains(&key) {
            return Err(SlotCollision { key });
        }
        self.keys.push(key);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| *k == key)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SlotCollision {
    pub key: &'static str,
}

impl std::fmt::Display for SlotCollision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot key already registered: {}", self.key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceState {
    pub values: Vec<u8>,
    pub rolled_at: i64,
}

pub fn roll_dice<R: Rng>(rng: &mut R, count: usize, rolled_at: i64) -> DiceState {
    DiceState {
        values: (0..count).map(|_| rng.gen_range(1..=6)).collect(),
        rolled_at,
    }
}

/// Countdown timer represented by an anchor instant, not a ticking
/// counter: remaining time is derived from `started_at` on every read, so
/// a late-joining or refreshed client reconstructs the same value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub duration_secs: i64,
    pub started_at: Option<i64>,
}

impl TimerState {
    pub fn reset(duration_secs: i64) -> Self {
        Self {
            duration_secs,
            started_at: None,
        }
    }

    pub fn running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn remaining_secs(&self, now_ms: i64) -> i64 {
        match self.started_at {
            Some(t0) => (self.duration_secs - (now_ms - t0) / 1000).max(0),
            None => self.duration_secs,
        }
    }

    pub fn start(self, now_ms: i64) -> Self {
        if self.started_at.is_some() {
            return self;
        }
        Self {
            started_at: Some(now_ms),
            ..self
        }
    }

    /// Freezes the remaining time into the duration so a later start
    /// resumes from where it stopped.
    pub fn pause(self, now_ms: i64) -> Self {
        Self {
            duration_secs: self.remaining_secs(now_ms),
            started_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamScore {
    pub name: String,
    pub score: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreboardState {
    pub teams: Vec<TeamScore>,
}

impl ScoreboardState {
    pub fn add_team(mut self, name: &str) -> Self {
        if !self.teams.iter().any(|t| t.name == name) {
            self.teams.push(TeamScore {
                name: name.to_string(),
                score: 0,
            });
        }
        self
    }

    pub fn remove_team(mut self, name: &str) -> Self {
        self.teams.retain(|t| t.name != name);
        self
    }

    pub fn adjust(mut self, name: &str, delta: i64) -> Self {
        if let Some(t) = self.teams.iter_mut().find(|t| t.name == name) {
            t.score += delta;
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupsState {
    pub groups: Vec<Vec<String>>,
    pub shuffled_at: i64,
}

/// Deals the shuffled member list round-robin into `group_count` groups,
/// so sizes differ by at most one.
pub fn randomize_groups<R: Rng>(
    rng: &mut R,
    members: &[String],
    group_count: usize,
    shuffled_at: i64,
) -> GroupsState {
    let group_count = group_count.max(1);
    let mut shuffled: Vec<String> = members.to_vec();
    shuffled.shuffle(rng);
    let mut groups: Vec<Vec<String>> = vec![Vec::new(); group_count];
    for (i, member) in shuffled.into_iter().enumerate() {
        groups[i % group_count].push(member);
    }
    GroupsState {
        groups,
        shuffled_at,
    }
}
