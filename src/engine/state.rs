//! Per-fingerprint alert state machine.
//!
//! ```text
//! Ok ──trigger──▶ Pending ──n consecutive triggers──▶ Alerting
//! Alerting ──no trigger for the recovery window──▶ Recovered ──after cooldown──▶ Ok
//! Pending ──tick without trigger──▶ Ok
//! ```
//!
//! States live in a map keyed by rule id, then fingerprint. Only the task
//! evaluating a rule touches that rule's entry. The map is written to disk
//! on clean shutdown and read back on start.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::datasource::Labels;
use crate::db::{f64_or_nan, AlertRule, EventState};

use super::point::sorted_tags;

/// Bumped whenever [`FingerprintState`] changes shape
pub const SNAPSHOT_VERSION: u32 = 1;

/// Label never part of a default fingerprint
const METRIC_NAME_LABEL: &str = "__name__";

/// Hex SHA-256 over the rule id, the ident and the fingerprint label subset.
///
/// With an empty `subset` every label except `__name__` and `ident_label` counts.
pub fn fingerprint(rule_id: i64, ident: &str, labels: &Labels, subset: &[String], ident_label: &str) -> String {
    let picked: Labels = if subset.is_empty() {
        labels
            .iter()
            .filter(|(k, _)| k.as_str() != METRIC_NAME_LABEL && k.as_str() != ident_label)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        subset
            .iter()
            .filter_map(|k| labels.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    };

    let mut hasher = Sha256::new();
    hasher.update(rule_id.to_string().as_bytes());
    hasher.update(b"/");
    hasher.update(ident.as_bytes());
    hasher.update(b"/");
    hasher.update(sorted_tags(&picked).as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Ok,
    Pending,
    Alerting,
    Recovered,
}

/// Timing parameters taken from the rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatePolicy {
    pub for_count: u32,
    pub recover_window: i64,
    pub cooldown: i64,
    pub repeat_secs: i64,
}

impl StatePolicy {
    pub fn from_rule(rule: &AlertRule) -> Self {
        Self {
            for_count: rule.for_count(),
            recover_window: rule.recover_window(),
            cooldown: rule.cooldown(),
            repeat_secs: rule.config.repeat_secs.max(0),
        }
    }
}

/// One triggering series from an evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub fingerprint: String,
    pub ident: String,
    pub labels: Labels,
    pub value: f64,
}

/// A state change that must become an event
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: EventState,
    pub fingerprint: String,
    pub ident: String,
    pub labels: Labels,
    pub value: f64,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintState {
    pub rule_id: i64,
    pub fingerprint: String,
    pub status: AlertStatus,
    pub consecutive: u32,
    pub ident: String,
    pub labels: Labels,
    #[serde(deserialize_with = "f64_or_nan")]
    pub last_value: f64,
    pub last_trigger: i64,
    pub last_emit: i64,
    pub recovered_at: i64,
}

impl FingerprintState {
    fn new(rule_id: i64, trigger: &Trigger) -> Self {
        Self {
            rule_id,
            fingerprint: trigger.fingerprint.clone(),
            status: AlertStatus::Ok,
            consecutive: 0,
            ident: trigger.ident.clone(),
            labels: trigger.labels.clone(),
            last_value: trigger.value,
            last_trigger: 0,
            last_emit: 0,
            recovered_at: 0,
        }
    }

    fn transition(&mut self, state: EventState, now: i64) -> Transition {
        self.last_emit = now;
        Transition {
            state,
            fingerprint: self.fingerprint.clone(),
            ident: self.ident.clone(),
            labels: self.labels.clone(),
            value: self.last_value,
            at: now,
        }
    }

    /// The series triggered at `now`
    pub fn on_trigger(&mut self, trigger: &Trigger, now: i64, policy: &StatePolicy) -> Option<Transition> {
        if self.status == AlertStatus::Recovered {
            if now - self.recovered_at < policy.cooldown {
                return None;
            }
            self.status = AlertStatus::Ok;
        }

        self.ident = trigger.ident.clone();
        self.labels = trigger.labels.clone();
        self.last_value = trigger.value;
        self.last_trigger = now;

        match self.status {
            AlertStatus::Ok | AlertStatus::Pending => {
                self.consecutive = if self.status == AlertStatus::Ok {
                    1
                } else {
                    self.consecutive.saturating_add(1)
                };
                if self.consecutive >= policy.for_count {
                    self.status = AlertStatus::Alerting;
                    Some(self.transition(EventState::Alerting, now))
                } else {
                    self.status = AlertStatus::Pending;
                    None
                }
            }
            AlertStatus::Alerting => {
                if policy.repeat_secs > 0 && now - self.last_emit >= policy.repeat_secs {
                    Some(self.transition(EventState::Alerting, now))
                } else {
                    None
                }
            }
            AlertStatus::Recovered => None,
        }
    }

    /// The series was absent or did not satisfy the predicate at `now`
    pub fn on_quiet(&mut self, now: i64, policy: &StatePolicy) -> Option<Transition> {
        match self.status {
            AlertStatus::Pending => {
                self.status = AlertStatus::Ok;
                self.consecutive = 0;
                None
            }
            AlertStatus::Alerting if now - self.last_trigger > policy.recover_window => {
                self.status = AlertStatus::Recovered;
                self.consecutive = 0;
                self.recovered_at = now;
                Some(self.transition(EventState::Recovered, now))
            }
            AlertStatus::Recovered if now - self.recovered_at >= policy.cooldown => {
                self.status = AlertStatus::Ok;
                None
            }
            _ => None,
        }
    }
}

/// Which fingerprints of a rule count as quiet in one observation
#[derive(Debug, Clone)]
pub enum Sweep {
    /// Every known fingerprint that did not trigger (pull evaluation)
    Untriggered,
    /// Only these fingerprints (push points)
    Only(Vec<String>),
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: i64,
    states: Vec<FingerprintState>,
}

/// Process-wide state map, partitioned by rule id
#[derive(Debug, Default)]
pub struct AlertStateStore {
    rules: DashMap<i64, HashMap<String, FingerprintState>>,
}

impl AlertStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one evaluation of `rule_id` into the state machine
    pub fn observe(
        &self,
        rule_id: i64,
        policy: &StatePolicy,
        now: i64,
        triggers: Vec<Trigger>,
        sweep: Sweep,
    ) -> Vec<Transition> {
        let mut entry = self.rules.entry(rule_id).or_default();
        let states = entry.value_mut();
        let mut transitions = Vec::new();
        let mut triggered: HashSet<String> = HashSet::with_capacity(triggers.len());

        for trigger in &triggers {
            triggered.insert(trigger.fingerprint.clone());
            let state = states
                .entry(trigger.fingerprint.clone())
                .or_insert_with(|| FingerprintState::new(rule_id, trigger));
            if let Some(t) = state.on_trigger(trigger, now, policy) {
                transitions.push(t);
            }
        }

        let quiet: Vec<String> = match sweep {
            Sweep::Untriggered => states
                .keys()
                .filter(|fp| !triggered.contains(*fp))
                .cloned()
                .collect(),
            Sweep::Only(fps) => fps.into_iter().filter(|fp| !triggered.contains(fp)).collect(),
        };
        for fp in quiet {
            if let Some(state) = states.get_mut(&fp) {
                if let Some(t) = state.on_quiet(now, policy) {
                    transitions.push(t);
                }
            }
        }

        states.retain(|_, s| s.status != AlertStatus::Ok);
        transitions
    }

    pub fn status(&self, rule_id: i64, fingerprint: &str) -> Option<AlertStatus> {
        self.rules
            .get(&rule_id)
            .and_then(|states| states.get(fingerprint).map(|s| s.status))
    }

    /// Drop every state of a rule that is no longer scheduled
    pub fn forget_rule(&self, rule_id: i64) {
        self.rules.remove(&rule_id);
    }

    pub fn len(&self) -> usize {
        self.rules.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the snapshot atomically (temp file, then rename)
    pub fn save(&self, path: &Path, now: i64) -> Result<usize> {
        let states: Vec<FingerprintState> = self
            .rules
            .iter()
            .flat_map(|r| r.value().values().cloned().collect::<Vec<_>>())
            .collect();
        let count = states.len();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            states,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        let body = serde_json::to_vec(&snapshot).context("Failed to encode state snapshot")?;
        std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
        Ok(count)
    }

    /// Read a snapshot. A missing, unreadable or mismatched file starts cold.
    pub fn load(path: &Path) -> Self {
        let store = Self::new();
        let body = match std::fs::read(path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return store,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read state snapshot, starting cold");
                return store;
            }
        };

        let snapshot: Snapshot = match serde_json::from_slice(&body) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt state snapshot");
                return store;
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "Discarding state snapshot with unknown version"
            );
            return store;
        }

        for state in snapshot.states {
            store
                .rules
                .entry(state.rule_id)
                .or_default()
                .insert(state.fingerprint.clone(), state);
        }
        tracing::info!(states = store.len(), "Restored alert state snapshot");
        store
    }
}
