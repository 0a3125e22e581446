use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Task priority as understood by the substrate.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn value(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Urgent => 10,
        }
    }
}

/// Named work queues.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueueName {
    Download,
    Processing,
    Merge,
    Notifications,
    Default,
}

impl QueueName {
    /// Relative share of workers the queue should get.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Download => 1.0,
            Self::Processing => 2.0,
            Self::Merge => 1.5,
            Self::Notifications => 0.5,
            Self::Default => 1.0,
        }
    }

    /// Highest priority the queue honors, `None` when it has no priority support.
    pub fn max_priority(&self) -> Option<u8> {
        match self {
            Self::Download | Self::Processing | Self::Merge => Some(10),
            Self::Notifications | Self::Default => None,
        }
    }

    /// Priority value to hand the substrate for this queue.
    pub fn effective_priority(&self, priority: Priority) -> Option<u8> {
        self.max_priority().map(|max| priority.value().min(max))
    }
}

/// Substrate-level retry, independent of in-process fetch retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRetryPolicy {
    pub max_retries: u32,
    pub interval_start_secs: u64,
    pub interval_step_secs: u64,
    pub interval_max_secs: u64,
}

impl Default for TaskRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval_start_secs: 60,
            interval_step_secs: 60,
            interval_max_secs: 300,
        }
    }
}

impl TaskRetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            interval_start_secs: 0,
            interval_step_secs: 0,
            interval_max_secs: 0,
        }
    }

    /// Wait before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let secs = self
            .interval_start_secs
            .saturating_add(self.interval_step_secs.saturating_mul(retry as u64))
            .min(self.interval_max_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    #[rstest]
    #[case(Priority::Low, 1)]
    #[case(Priority::Normal, 5)]
    #[case(Priority::High, 8)]
    #[case(Priority::Urgent, 10)]
    fn test_priority_values(#[case] priority: Priority, #[case] value: u8) {
        assert_eq!(priority.value(), value);
    }

    #[test]
    fn test_queue_table() {
        let weights: Vec<(QueueName, f64)> = QueueName::iter().map(|q| (q, q.weight())).collect();
        assert_eq!(weights[0], (QueueName::Download, 1.0));
        assert_eq!(weights[1], (QueueName::Processing, 2.0));
        assert_eq!(weights[2], (QueueName::Merge, 1.5));
        assert_eq!(weights[3], (QueueName::Notifications, 0.5));
        assert_eq!(QueueName::Merge.max_priority(), Some(10));
        assert_eq!(QueueName::Notifications.effective_priority(Priority::Urgent), None);
        assert_eq!("processing".parse::<QueueName>().unwrap(), QueueName::Processing);
    }

    #[test]
    fn test_retry_intervals() {
        let policy = TaskRetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
        assert_eq!(TaskRetryPolicy::none().delay_for(3), Duration::ZERO);
    }
}
