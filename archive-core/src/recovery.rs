//! The recovery arbiter: a small set of named decision points, each
//! returning one action from a closed set. Every default is `Backup`
//! (never destroy data the user hasn't explicitly told us to discard),
//! except reusing a compatible archive, which defaults to `Reuse`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    SkipDownload,
    Delete,
    Backup,
    /// Only legal at the "data file missized" and "archive reuse" decision
    /// points; truncating a mis-sized data file, or continuing to append to
    /// a compatible one.
    Reuse,
}

/// Per-channel overrides for the two decision points whose policy actually
/// varies by configuration (what to do with an existing compatible vs.
/// incompatible archive). All other decision points use the fixed default
/// policy; they aren't exposed as configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub on_existing_compatible_archive: RecoveryAction,
    pub on_existing_incompatible_archive: RecoveryAction,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy {
            on_existing_compatible_archive: RecoveryAction::Reuse,
            on_existing_incompatible_archive: RecoveryAction::Backup,
        }
    }
}

pub trait RecoveryArbiter {
    /// Header file exists but failed to parse or validate.
    fn on_unloadable_header(&self, data_file_exists: bool) -> RecoveryAction;

    /// The data file's size disagrees with what the header recorded.
    /// `actual` is `None` if the data file doesn't exist at all.
    fn on_missized_data_file(&self, expected: u64, actual: Option<u64>) -> RecoveryAction;

    /// The planner has produced a decision for an existing archive;
    /// `compatible` says whether it was "append" (true) or "from scratch"
    /// (false, e.g. direction change or disjoint request).
    ///
    /// Per the decision table an incompatible archive may only be
    /// Backed up, Deleted, or have its download Skipped — never Reused.
    fn on_archive_reuse(&self, compatible: bool) -> RecoveryAction;

    /// An error was raised partway through writing posts.
    fn on_post_loading_failure(&self) -> RecoveryAction;

    /// The backup slot (`<stem>--backup.*`) this channel would write to is
    /// already occupied by a previous backup.
    fn on_existing_channel_backup(&self) -> RecoveryAction;
}

pub struct DefaultRecoveryArbiter {
    pub policy: RecoveryPolicy,
}

impl DefaultRecoveryArbiter {
    pub fn new(policy: RecoveryPolicy) -> Self {
        DefaultRecoveryArbiter { policy }
    }
}

impl Default for DefaultRecoveryArbiter {
    fn default() -> Self {
        DefaultRecoveryArbiter::new(RecoveryPolicy::default())
    }
}

impl RecoveryArbiter for DefaultRecoveryArbiter {
    fn on_unloadable_header(&self, data_file_exists: bool) -> RecoveryAction {
        if data_file_exists {
            log::info!("channel header could not be loaded; data file is present and will be backed up alongside it");
        }
        RecoveryAction::Backup
    }

    fn on_missized_data_file(&self, expected: u64, actual: Option<u64>) -> RecoveryAction {
        match actual {
            None => {
                log::warn!("archive data file is missing; it will be redownloaded");
                RecoveryAction::Backup
            }
            Some(actual) if actual < expected => {
                log::warn!("archive data file ({actual} bytes) is smaller than the header records ({expected} bytes)");
                RecoveryAction::Backup
            }
            Some(actual) => {
                log::warn!(
                    "archive data file ({actual} bytes) is larger than the header records ({expected} bytes); truncating to the recorded size"
                );
                RecoveryAction::Reuse
            }
        }
    }

    fn on_archive_reuse(&self, compatible: bool) -> RecoveryAction {
        if compatible {
            self.policy.on_existing_compatible_archive
        } else {
            match self.policy.on_existing_incompatible_archive {
                RecoveryAction::Reuse => RecoveryAction::Backup,
                other => other,
            }
        }
    }

    fn on_post_loading_failure(&self) -> RecoveryAction {
        log::warn!("post download failed partway through; partially downloaded content is left for inspection");
        RecoveryAction::Backup
    }

    fn on_existing_channel_backup(&self) -> RecoveryAction {
        log::warn!("previous backup will be renamed to an alternate slot");
        RecoveryAction::Backup
    }
}
