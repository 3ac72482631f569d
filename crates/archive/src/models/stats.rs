//! Aggregate mailbox statistics

use serde::{Deserialize, Serialize};

/// Number of threads carrying a label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: String,
    pub threads: usize,
}

/// Aggregate counts derived from one owner's archived threads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStats {
    pub total_threads: usize,
    pub total_messages: usize,
    /// Label inventory with per-label thread counts, lexicographic by label
    pub labels: Vec<LabelCount>,
}
