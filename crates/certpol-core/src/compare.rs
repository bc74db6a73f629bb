//! Extension set comparison.

use serde::{Deserialize, Serialize};

use crate::types::{ExtensionKind, ExtensionSet};

/// Names added, changed and removed between two extension sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDiff {
    /// In desired, not in existing
    pub added: Vec<ExtensionKind>,
    /// In both, with a different critical flag or value
    pub changed: Vec<ExtensionKind>,
    /// In existing, not in desired
    pub removed: Vec<ExtensionKind>,
}

impl ExtensionDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Compare the extensions of an existing artifact with the desired ones.
pub fn compare(existing: &ExtensionSet, desired: &ExtensionSet) -> ExtensionDiff {
    let mut diff = ExtensionDiff::default();
    for (kind, want) in desired.iter() {
        match existing.get(kind) {
            None => diff.added.push(kind),
            Some(have) if have != want => diff.changed.push(kind),
            Some(_) => {}
        }
    }
    diff.removed = existing.kinds().filter(|k| !desired.contains(*k)).collect();
    diff
}
