//! Heuristic anomaly detection.
//!
//! Three heuristics run on every admitted request:
//!
//! - **burst**: request volume for the same action and target inside the
//!   burst window exceeds the threshold
//! - **unusual-target**: first time an action is aimed at a domain, once the
//!   action already has an established set of targets
//! - **payload-shape**: a top-level key set never seen before for the action,
//!   once enough history exists
//!
//! Only `burst` blocks. The others are attached to the audit record.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use semblance_types::ActionType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Distinct payload shapes remembered per action.
const MAX_SHAPES_PER_ACTION: usize = 64;

/// Distinct targets remembered per action.
const MAX_TARGETS_PER_ACTION: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    Burst,
    UnusualTarget,
    PayloadShape,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Burst => "burst",
            AnomalyKind::UnusualTarget => "unusual-target",
            AnomalyKind::PayloadShape => "payload-shape",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFinding {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub message: String,
    pub severity: AnomalySeverity,
}

impl AnomalyFinding {
    /// Burst findings always block; everything else is advisory.
    pub fn is_blocking(&self) -> bool {
        self.kind == AnomalyKind::Burst
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub flagged: bool,
    pub anomalies: Vec<AnomalyFinding>,
}

impl AnomalyReport {
    pub fn blocking(&self) -> Option<&AnomalyFinding> {
        self.anomalies.iter().find(|f| f.is_blocking())
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking().is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Requests allowed per action/target inside the burst window.
    pub burst_threshold: u32,
    pub burst_window_ms: u64,
    /// Observations of an action before new payload shapes are flagged.
    pub shape_min_history: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            burst_threshold: 10,
            burst_window_ms: 60_000,
            shape_min_history: 5,
        }
    }
}

/// What the detector needs to know about one request.
#[derive(Clone, Copy, Debug)]
pub struct AnomalyInput<'a> {
    pub action: ActionType,
    pub payload: &'a Value,
    /// `None` for local-only actions.
    pub target_domain: Option<&'a str>,
}

#[derive(Default)]
struct ShapeHistory {
    observations: u64,
    shapes: HashSet<Vec<String>>,
}

#[derive(Default)]
struct DetectorState {
    volume: HashMap<(ActionType, Option<String>), VecDeque<DateTime<Utc>>>,
    targets: HashMap<ActionType, BTreeSet<String>>,
    shapes: HashMap<ActionType, ShapeHistory>,
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    state: Mutex<DetectorState>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState::default()),
        }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Score a request and fold it into the history.
    ///
    /// The observation is recorded even when the request is later blocked, so
    /// a sustained flood keeps tripping the burst heuristic.
    pub fn check(&self, input: AnomalyInput<'_>, now: DateTime<Utc>) -> AnomalyReport {
        let mut anomalies = Vec::new();
        let mut state = self.state.lock();

        // burst
        let window = Duration::milliseconds(self.config.burst_window_ms as i64);
        let key = (input.action, input.target_domain.map(str::to_ascii_lowercase));
        let volume = state.volume.entry(key).or_default();
        while volume.front().is_some_and(|t| *t <= now - window) {
            volume.pop_front();
        }
        volume.push_back(now);
        let count = volume.len();
        // Keep only what can still matter for the threshold.
        while volume.len() > self.config.burst_threshold as usize + 1 {
            volume.pop_front();
        }
        if count > self.config.burst_threshold as usize {
            anomalies.push(AnomalyFinding {
                kind: AnomalyKind::Burst,
                message: format!(
                    "{} requests for {} to {} within {}ms (threshold {})",
                    count,
                    input.action,
                    input.target_domain.unwrap_or("local"),
                    self.config.burst_window_ms,
                    self.config.burst_threshold
                ),
                severity: AnomalySeverity::High,
            });
        }

        // unusual-target
        if let Some(domain) = input.target_domain {
            let domain = domain.to_ascii_lowercase();
            let known = state.targets.entry(input.action).or_default();
            if !known.is_empty() && !known.contains(&domain) {
                anomalies.push(AnomalyFinding {
                    kind: AnomalyKind::UnusualTarget,
                    message: format!("first {} request to {}", input.action, domain),
                    severity: AnomalySeverity::Medium,
                });
            }
            if known.len() < MAX_TARGETS_PER_ACTION {
                known.insert(domain);
            }
        }

        // payload-shape
        let shape = payload_shape(input.payload);
        let history = state.shapes.entry(input.action).or_default();
        if history.observations >= u64::from(self.config.shape_min_history)
            && !history.shapes.contains(&shape)
        {
            anomalies.push(AnomalyFinding {
                kind: AnomalyKind::PayloadShape,
                message: format!(
                    "unfamiliar payload fields for {}: [{}]",
                    input.action,
                    shape.join(", ")
                ),
                severity: AnomalySeverity::Low,
            });
        }
        history.observations += 1;
        if history.shapes.len() < MAX_SHAPES_PER_ACTION {
            history.shapes.insert(shape);
        }

        AnomalyReport {
            flagged: !anomalies.is_empty(),
            anomalies,
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(AnomalyConfig::default())
    }
}

/// Sorted top-level field names.
fn payload_shape(payload: &Value) -> Vec<String> {
    match payload {
        Value::Object(map) => {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            keys
        }
        _ => Vec::new(),
    }
}
