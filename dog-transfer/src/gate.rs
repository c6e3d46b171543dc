//! Network policy gate: decides whether a direction may transfer under the
//! current connectivity.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Direction;

/// Kind of network the device is currently on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityClass {
    /// Wi-Fi, ethernet
    Unmetered,

    /// Cellular and other billed links
    Metered,

    Offline,
}

impl fmt::Display for ConnectivityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unmetered => "unmetered",
            Self::Metered => "metered",
            Self::Offline => "offline",
        })
    }
}

/// Connectivity classes a direction is allowed to transfer over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub transfer_over: Vec<ConnectivityClass>,

    /// Resume policy-paused transfers when the direction is allowed again.
    /// When off they become user-paused and wait for an explicit `resume`.
    #[serde(default = "default_auto_resume")]
    pub auto_resume: bool,
}

fn default_auto_resume() -> bool {
    true
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self::new(vec![ConnectivityClass::Unmetered, ConnectivityClass::Metered])
    }
}

impl NetworkPolicy {
    pub fn new(transfer_over: Vec<ConnectivityClass>) -> Self {
        Self {
            transfer_over,
            auto_resume: default_auto_resume(),
        }
    }

    pub fn with_auto_resume(mut self, auto_resume: bool) -> Self {
        self.auto_resume = auto_resume;
        self
    }

    /// Wi-Fi only
    pub fn unmetered_only() -> Self {
        Self::new(vec![ConnectivityClass::Unmetered])
    }

    pub fn allows(&self, class: ConnectivityClass) -> bool {
        class != ConnectivityClass::Offline && self.transfer_over.contains(&class)
    }
}

/// Per-direction allow/deny change caused by a connectivity update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateChange {
    pub direction: Direction,
    pub allowed: bool,
}

/// Current connectivity plus the per-direction policies
#[derive(Debug)]
pub struct NetworkGate {
    current: RwLock<ConnectivityClass>,
    upload: NetworkPolicy,
    download: NetworkPolicy,
}

impl NetworkGate {
    pub fn new(initial: ConnectivityClass, upload: NetworkPolicy, download: NetworkPolicy) -> Self {
        Self {
            current: RwLock::new(initial),
            upload,
            download,
        }
    }

    pub fn connectivity(&self) -> ConnectivityClass {
        *self.current.read()
    }

    pub fn policy(&self, direction: Direction) -> &NetworkPolicy {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    /// Whether the gate lifts its own pauses in `direction`
    pub fn auto_resumes(&self, direction: Direction) -> bool {
        self.policy(direction).auto_resume
    }

    /// Whether `direction` may transfer right now
    pub fn allows(&self, direction: Direction) -> bool {
        self.policy(direction).allows(self.connectivity())
    }

    /// Record new connectivity and report which directions flipped
    pub fn set_connectivity(&self, class: ConnectivityClass) -> Vec<GateChange> {
        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, class)
        };

        [Direction::Upload, Direction::Download]
            .into_iter()
            .filter_map(|direction| {
                let policy = self.policy(direction);
                let before = policy.allows(previous);
                let after = policy.allows(class);
                (before != after).then_some(GateChange {
                    direction,
                    allowed: after,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_denies_offline_only() {
        let policy = NetworkPolicy::default();
        assert!(policy.allows(ConnectivityClass::Unmetered));
        assert!(policy.allows(ConnectivityClass::Metered));
        assert!(!policy.allows(ConnectivityClass::Offline));
    }

    #[test]
    fn test_set_connectivity_reports_flips() {
        let gate = NetworkGate::new(
            ConnectivityClass::Unmetered,
            NetworkPolicy::unmetered_only(),
            NetworkPolicy::default(),
        );

        let changes = gate.set_connectivity(ConnectivityClass::Metered);
        assert_eq!(
            changes,
            vec![GateChange {
                direction: Direction::Upload,
                allowed: false
            }]
        );
        assert!(!gate.allows(Direction::Upload));
        assert!(gate.allows(Direction::Download));

        let changes = gate.set_connectivity(ConnectivityClass::Offline);
        assert_eq!(
            changes,
            vec![GateChange {
                direction: Direction::Download,
                allowed: false
            }]
        );

        let changes = gate.set_connectivity(ConnectivityClass::Unmetered);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|change| change.allowed));
    }

    #[test]
    fn test_auto_resume_defaults_on() {
        let gate = NetworkGate::new(
            ConnectivityClass::Unmetered,
            NetworkPolicy::default().with_auto_resume(false),
            NetworkPolicy::default(),
        );
        assert!(!gate.auto_resumes(Direction::Upload));
        assert!(gate.auto_resumes(Direction::Download));

        let policy: NetworkPolicy = serde_json::from_str(r#"{"transfer_over":["Metered"]}"#).unwrap();
        assert!(policy.auto_resume);
    }
}
