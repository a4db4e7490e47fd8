use std::fmt;

/// Multi-granularity lock modes, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Intention to take shared locks on finer targets
    IntentionShared,
    /// Intention to take exclusive locks on finer targets
    IntentionExclusive,
    Shared,
    /// Shared on the whole target plus intention exclusive on its children
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    pub const ALL: [LockMode; 5] = [
        LockMode::IntentionShared,
        LockMode::IntentionExclusive,
        LockMode::Shared,
        LockMode::SharedIntentionExclusive,
        LockMode::Exclusive,
    ];

    /// Returns true if holding `self` already grants everything `other`
    /// would.
    pub fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            SharedIntentionExclusive => other != Exclusive,
            Shared => matches!(other, Shared | IntentionShared),
            IntentionExclusive => matches!(other, IntentionExclusive | IntentionShared),
            IntentionShared => other == IntentionShared,
        }
    }

    /// Modes dropped by a shared-only release at a statement boundary.
    pub fn is_shared(self) -> bool {
        matches!(self, LockMode::IntentionShared | LockMode::Shared)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::IntentionShared => "IS",
            LockMode::IntentionExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::SharedIntentionExclusive => "SIX",
            LockMode::Exclusive => "X",
        };
        f.write_str(name)
    }
}
