//! Livelock detection: a repeating state cycle of bounded length means an
//! agent is busy without making progress.
//!
//! Agents report `(workflow, task, state)` tuples; each state is reduced to
//! a stable signature. Volatile fields (attempt counters, timestamps) are
//! stripped before hashing -- otherwise every tick looks new and no cycle
//! can ever be seen.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Keys excluded from state signatures because they change monotonically.
pub const VOLATILE_KEYS: &[&str] = &["attempt", "attempts", "timestamp", "updated_at", "ts"];

/// Tuning for the detector window.
#[derive(Debug, Clone)]
pub struct LivelockConfig {
    /// How many recent records per agent to inspect.
    pub window_size: usize,
    /// Longest cycle length considered.
    pub max_cycle_len: usize,
    /// Minimum number of times the cycle must recur.
    pub repeats: usize,
}

impl Default for LivelockConfig {
    fn default() -> Self {
        Self {
            window_size: 12,
            max_cycle_len: 4,
            repeats: 3,
        }
    }
}

/// One reported state.
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub workflow_id: String,
    pub task_id: String,
    pub signature: String,
    pub recorded_at: DateTime<Utc>,
}

/// A detected livelock.
#[derive(Debug, Clone)]
pub struct LivelockDetection {
    pub agent_id: String,
    pub workflow_id: String,
    /// The signatures of one cycle period.
    pub cycle: Vec<String>,
    pub repeats: usize,
}

/// Windowed per-agent livelock detector.
pub struct LivelockDetector {
    config: LivelockConfig,
    history: HashMap<String, VecDeque<StateRecord>>,
}

impl LivelockDetector {
    pub fn new(config: LivelockConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    /// Record a reported state for an agent.
    pub fn record(&mut self, agent_id: &str, workflow_id: &str, task_id: &str, state: &Value) {
        let window = self.history.entry(agent_id.to_owned()).or_default();
        window.push_back(StateRecord {
            workflow_id: workflow_id.to_owned(),
            task_id: task_id.to_owned(),
            signature: state_signature(state),
            recorded_at: Utc::now(),
        });
        while window.len() > self.config.window_size {
            window.pop_front();
        }
    }

    /// Check one agent's window for a repeating cycle.
    pub fn detect(&self, agent_id: &str) -> Option<LivelockDetection> {
        let window = self.history.get(agent_id)?;
        let sigs: Vec<&str> = window.iter().map(|r| r.signature.as_str()).collect();
        let n = sigs.len();

        for cycle_len in 1..=self.config.max_cycle_len {
            let needed = cycle_len * self.config.repeats;
            if n < needed {
                continue;
            }
            let tail = &sigs[n - needed..];
            let periodic = (0..needed - cycle_len).all(|i| tail[i] == tail[i + cycle_len]);
            if periodic {
                let workflow_id = window
                    .back()
                    .map(|r| r.workflow_id.clone())
                    .unwrap_or_default();
                return Some(LivelockDetection {
                    agent_id: agent_id.to_owned(),
                    workflow_id,
                    cycle: tail[..cycle_len].iter().map(|s| (*s).to_owned()).collect(),
                    repeats: self.config.repeats,
                });
            }
        }

        None
    }

    /// Check every tracked agent, lowest agent id first.
    pub fn detect_any(&self) -> Option<LivelockDetection> {
        let mut agents: Vec<&String> = self.history.keys().collect();
        agents.sort();
        agents.into_iter().find_map(|agent| self.detect(agent))
    }

    /// Forget an agent's history (REPLAN mitigation).
    pub fn clear(&mut self, agent_id: &str) {
        self.history.remove(agent_id);
    }
}

/// Stable hash of a reported state with volatile fields stripped.
pub fn state_signature(state: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(state, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical rendering: object keys sorted, volatile keys dropped.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !VOLATILE_KEYS.contains(&k.as_str()))
                .collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&format!("{key:?}:"));
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_excludes_volatile_fields() {
        let a = json!({"phase": "negotiating", "attempt": 1, "timestamp": "t1"});
        let b = json!({"phase": "negotiating", "attempt": 7, "timestamp": "t9"});
        assert_eq!(state_signature(&a), state_signature(&b));
    }

    #[test]
    fn signature_distinguishes_real_changes() {
        let a = json!({"phase": "negotiating"});
        let b = json!({"phase": "committing"});
        assert_ne!(state_signature(&a), state_signature(&b));
    }

    #[test]
    fn signature_is_key_order_independent() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(state_signature(&a), state_signature(&b));
    }

    #[test]
    fn alternating_pair_flags_livelock() {
        let mut detector = LivelockDetector::new(LivelockConfig {
            window_size: 10,
            max_cycle_len: 3,
            repeats: 3,
        });
        // A,B,A,B,A,B -> cycle of 2 repeated 3 times.
        for i in 0..6 {
            let state = if i % 2 == 0 {
                json!({"phase": "claim"})
            } else {
                json!({"phase": "yield"})
            };
            detector.record("agent-1", "wf-1", "t1", &state);
        }
        let detection = detector.detect("agent-1").expect("livelock expected");
        assert_eq!(detection.cycle.len(), 2);
        assert_eq!(detection.agent_id, "agent-1");
    }

    #[test]
    fn progress_is_not_livelock() {
        let mut detector = LivelockDetector::new(LivelockConfig::default());
        for i in 0..10 {
            detector.record("agent-1", "wf-1", "t1", &json!({"step": i}));
        }
        assert!(detector.detect("agent-1").is_none());
    }

    #[test]
    fn attempt_churn_alone_is_a_cycle_of_one() {
        let mut detector = LivelockDetector::new(LivelockConfig {
            window_size: 6,
            max_cycle_len: 2,
            repeats: 3,
        });
        // Only the attempt counter changes; the signature stays constant.
        for attempt in 1..=3 {
            detector.record("agent-1", "wf-1", "t1", &json!({"phase": "stuck", "attempt": attempt}));
        }
        let detection = detector.detect("agent-1").expect("livelock expected");
        assert_eq!(detection.cycle.len(), 1);
    }

    #[test]
    fn too_few_records_is_silent() {
        let mut detector = LivelockDetector::new(LivelockConfig::default());
        detector.record("agent-1", "wf-1", "t1", &json!({"phase": "a"}));
        detector.record("agent-1", "wf-1", "t1", &json!({"phase": "b"}));
        assert!(detector.detect("agent-1").is_none());
    }

    #[test]
    fn clear_forgets_history() {
        let mut detector = LivelockDetector::new(LivelockConfig {
            window_size: 6,
            max_cycle_len: 1,
            repeats: 3,
        });
        for _ in 0..3 {
            detector.record("agent-1", "wf-1", "t1", &json!({"phase": "stuck"}));
        }
        assert!(detector.detect("agent-1").is_some());
        detector.clear("agent-1");
        assert!(detector.detect("agent-1").is_none());
    }
}
