use serde::{Deserialize, Serialize};

/// Lifecycle of a pipeline run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Initializing,
    Downloading,
    Processing,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Position on the main path, `None` for failure states.
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Initializing => Some(1),
            Self::Downloading => Some(2),
            Self::Processing => Some(3),
            Self::Merging => Some(4),
            Self::Completed => Some(5),
            Self::Failed | Self::Cancelled => None,
        }
    }

    /// Whether `next` is a legal successor.
    ///
    /// The main path only moves forward and may skip stages the run does
    /// not plan. `Failed` and `Cancelled` are reachable from any non-terminal
    /// state. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from && (next != Self::Completed || from >= 1),
            (None, Some(_)) => false,
        }
    }
}

/// A unit of pipeline work.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Download,
    Process,
    Merge,
}

impl Stage {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Download => RunStatus::Downloading,
            Self::Process => RunStatus::Processing,
            Self::Merge => RunStatus::Merging,
        }
    }
}

/// What a run does with its inputs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingMode {
    DownloadOnly,
    ProcessOnly,
    CompressOnly,
    #[default]
    FullPipeline,
    MergeEpisodes,
}

impl ProcessingMode {
    /// Planned stages, always a subsequence of download, process, merge.
    pub fn stages(&self, has_urls: bool, merge_episodes: bool) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(3);
        match self {
            Self::DownloadOnly => stages.push(Stage::Download),
            Self::ProcessOnly | Self::CompressOnly => stages.push(Stage::Process),
            Self::FullPipeline => {
                if has_urls {
                    stages.push(Stage::Download);
                }
                stages.push(Stage::Process);
                if merge_episodes {
                    stages.push(Stage::Merge);
                }
            }
            Self::MergeEpisodes => {
                if has_urls {
                    stages.push(Stage::Download);
                }
                stages.push(Stage::Merge);
            }
        }
        stages
    }

    pub fn processes(&self) -> bool {
        matches!(
            self,
            Self::ProcessOnly | Self::CompressOnly | Self::FullPipeline
        )
    }
}
