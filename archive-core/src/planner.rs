//! Decides, for one channel, whether anything needs to be fetched at all,
//! and if so whether the existing archive can be extended in place or must
//! be rebuilt from scratch.
//!
//! This is a pure function: the same `(request, archive, lastChannelMessageTime)`
//! always yields the same `Plan`. Resolving an id-only boundary
//! (`posts_after_id`/`posts_before_id`) to an actual time when it doesn't
//! match one of the archive's own known boundary ids requires a server
//! round trip (`GET /posts/{id}`); that resolution happens in the caller
//! (the orchestrator) *before* invoking the planner, via
//! [`PlanRequest::effective_start_time`]/[`effective_end_time`] — the
//! planner itself never talks to the network.

use crate::ids::{Id, Time};
use crate::options::{ChannelOptions, OrderDirection};
use crate::store::{PostOrdering, PostStorage};

/// The subset of an existing channel's [`PostStorage`] the planner needs,
/// named to match the decision algorithm rather than the storage's own
/// bookkeeping-oriented field names.
#[derive(Debug, Clone)]
pub struct ArchiveInterval {
    pub organization: PostOrdering,
    pub count: u64,
    pub begin_time: Time,
    pub end_time: Time,
    pub post_id_before_first: Option<Id>,
    pub first_post_id: Id,
    pub last_post_id: Id,
    pub post_id_after_last: Option<Id>,
}

impl From<&PostStorage> for ArchiveInterval {
    fn from(storage: &PostStorage) -> Self {
        ArchiveInterval {
            organization: storage.organization,
            count: storage.count,
            begin_time: storage.begin_time,
            end_time: storage.end_time,
            post_id_before_first: storage.post_id_before_first.clone(),
            first_post_id: storage.first_post_id.clone(),
            last_post_id: storage.last_post_id.clone(),
            post_id_after_last: storage.post_id_after_last.clone(),
        }
    }
}

/// The request, with any id-only boundary already resolved to a time where
/// that was necessary (see module docs).
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub options: ChannelOptions,
    pub effective_start_id: Option<Id>,
    pub effective_start_time: Option<Time>,
    pub effective_end_id: Option<Id>,
    pub effective_end_time: Option<Time>,
}

impl PlanRequest {
    /// Builds a request whose effective bounds are taken directly from the
    /// options' own id/time fields, for the common case where no id needs
    /// resolving against the server (it already matches — or there simply
    /// is no id boundary in play).
    pub fn from_options(options: ChannelOptions) -> PlanRequest {
        let (start_id, start_time) = match options.download_time_direction {
            OrderDirection::Asc => (options.posts_after_id.clone(), options.posts_after_time),
            OrderDirection::Desc => (options.posts_before_id.clone(), options.posts_before_time),
        };
        let (end_id, end_time) = match options.download_time_direction {
            OrderDirection::Asc => (options.posts_before_id.clone(), options.posts_before_time),
            OrderDirection::Desc => (options.posts_after_id.clone(), options.posts_after_time),
        };
        PlanRequest {
            options,
            effective_start_id: start_id,
            effective_start_time: start_time,
            effective_end_id: end_id,
            effective_end_time: end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    NothingToDo,
    FromScratch(ChannelOptions),
    Append(ChannelOptions),
}

fn requested_ordering(direction: OrderDirection) -> PostOrdering {
    match direction {
        OrderDirection::Asc => PostOrdering::AscendingContinuous,
        OrderDirection::Desc => PostOrdering::DescendingContinuous,
    }
}

fn reduce_limit(limit: i64, already_fetched: u64) -> i64 {
    if limit < 0 {
        -1
    } else {
        (limit - already_fetched as i64).max(0)
    }
}

fn append_from(options: &ChannelOptions, archive: &ArchiveInterval) -> ChannelOptions {
    let mut appended = options.clone();
    appended.post_limit = reduce_limit(options.post_limit, archive.count);
    match options.download_time_direction {
        OrderDirection::Asc => {
            appended.posts_after_id = Some(archive.last_post_id.clone());
            appended.posts_after_time = Some(archive.end_time);
        }
        OrderDirection::Desc => {
            appended.posts_before_id = Some(archive.first_post_id.clone());
            appended.posts_before_time = Some(archive.begin_time);
        }
    }
    appended
}

pub fn plan(request: &PlanRequest, archive: Option<&ArchiveInterval>, last_channel_message_time: Option<Time>) -> Plan {
    let options = &request.options;

    if options.post_limit == 0 || options.post_session_limit == 0 {
        return Plan::NothingToDo;
    }

    let Some(archive) = archive else {
        return Plan::FromScratch(options.clone());
    };

    if archive.count == 0 {
        return Plan::FromScratch(options.clone());
    }

    // Rule 3: direction/ordering changed underneath us.
    if archive.organization != requested_ordering(options.download_time_direction) {
        return Plan::FromScratch(options.clone());
    }

    // Rule 1: request starts strictly before the archive, and the archive
    // doesn't already reach the channel's true origin.
    if let Some(start_time) = request.effective_start_time {
        if start_time < archive.begin_time && archive.post_id_before_first.is_some() {
            return Plan::FromScratch(options.clone());
        }
    }

    // Rule 2: request's whole window ends before the archive even starts.
    if let Some(end_time) = request.effective_end_time {
        if end_time < archive.begin_time {
            return Plan::FromScratch(options.clone());
        }
    }

    // Rule 4: the archive is a prefix of what's being requested.
    let starts_at_known_boundary = request
        .effective_start_id
        .as_ref()
        .is_some_and(|id| {
            Some(id) == archive.post_id_before_first.as_ref()
                || *id == archive.first_post_id
                || *id == archive.last_post_id
        });
    let starts_within_interval = request
        .effective_start_time
        .is_some_and(|t| t >= archive.begin_time && t <= archive.end_time);
    let both_start_at_channel_origin = request.effective_start_id.is_none()
        && request.effective_start_time.is_none()
        && archive.post_id_before_first.is_none();

    if starts_at_known_boundary || starts_within_interval || both_start_at_channel_origin {
        let has_end_bound = request.effective_end_time.is_some() || request.effective_end_id.is_some();
        if has_end_bound {
            let ends_within_archive = request
                .effective_end_time
                .is_some_and(|t| t <= archive.end_time)
                || request
                    .effective_end_id
                    .as_ref()
                    .is_some_and(|id| *id == archive.last_post_id || Some(id) == archive.post_id_after_last.as_ref());

            return if ends_within_archive {
                Plan::NothingToDo
            } else {
                Plan::Append(append_from(options, archive))
            };
        }
        // No end bound at all: an unbounded request starting within the
        // archive just wants "everything new since here", which Rule 6
        // below is the one place that knows whether the channel has moved.
    }

    // Rule 5: already have at least as many posts as the lifetime limit asks for.
    if options.post_limit > 0 && archive.count >= options.post_limit as u64 {
        return Plan::NothingToDo;
    }

    // Rule 6: ascending archive already reaches the channel's current end.
    if archive.organization == PostOrdering::AscendingContinuous && archive.post_id_after_last.is_none() {
        if let Some(last_time) = last_channel_message_time {
            if last_time <= archive.end_time {
                return Plan::NothingToDo;
            }
            return Plan::Append(append_from(options, archive));
        }
    }

    // Disjoint from, or unresolvable against, the existing archive: safest
    // correct action is a full redownload.
    Plan::FromScratch(options.clone())
}

/// `maxCount = min(postLimit - alreadyFetched, postSessionLimit)`, with
/// `-1` meaning "no limit" on either side.
pub fn effective_max_count(options: &ChannelOptions) -> Option<u64> {
    let lifetime = if options.post_limit < 0 {
        None
    } else {
        Some(options.post_limit as u64)
    };
    let session = if options.post_session_limit < 0 {
        None
    } else {
        Some(options.post_session_limit as u64)
    };
    match (lifetime, session) {
        (None, None) => None,
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (Some(a), Some(b)) => Some(a.min(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(count: u64, begin: i64, end: i64, before_first: Option<&str>, after_last: Option<&str>) -> ArchiveInterval {
        ArchiveInterval {
            organization: PostOrdering::AscendingContinuous,
            count,
            begin_time: Time(begin),
            end_time: Time(end),
            post_id_before_first: before_first.map(|s| Id(s.to_string())),
            first_post_id: Id("p1".to_string()),
            last_post_id: Id("p3".to_string()),
            post_id_after_last: after_last.map(|s| Id(s.to_string())),
        }
    }

    #[test]
    fn no_archive_means_from_scratch() {
        let req = PlanRequest::from_options(ChannelOptions::default());
        assert_eq!(plan(&req, None, None), Plan::FromScratch(ChannelOptions::default()));
    }

    #[test]
    fn unchanged_channel_is_nothing_to_do() {
        let archive = archive(3, 100, 300, None, None);
        let req = PlanRequest::from_options(ChannelOptions::default());
        assert_eq!(plan(&req, Some(&archive), Some(Time(300))), Plan::NothingToDo);
    }

    #[test]
    fn new_posts_trigger_append() {
        let archive = archive(3, 100, 300, None, None);
        let req = PlanRequest::from_options(ChannelOptions::default());
        let result = plan(&req, Some(&archive), Some(Time(500)));
        match result {
            Plan::Append(opts) => {
                assert_eq!(opts.posts_after_id, Some(Id("p3".to_string())));
                assert_eq!(opts.posts_after_time, Some(Time(300)));
            }
            other => panic!("expected Append, got {other:?}"),
        }
    }

    #[test]
    fn direction_change_forces_from_scratch() {
        let mut storage_archive = archive(3, 100, 300, None, None);
        storage_archive.organization = PostOrdering::DescendingContinuous;
        let mut options = ChannelOptions::default();
        options.download_time_direction = OrderDirection::Asc;
        let req = PlanRequest::from_options(options.clone());
        assert_eq!(plan(&req, Some(&storage_archive), None), Plan::FromScratch(options));
    }

    #[test]
    fn zero_post_limit_is_always_nothing_to_do() {
        let mut options = ChannelOptions::default();
        options.post_limit = 0;
        let req = PlanRequest::from_options(options);
        assert_eq!(plan(&req, None, None), Plan::NothingToDo);
    }

    #[test]
    fn effective_max_count_takes_the_tighter_bound() {
        let mut options = ChannelOptions::default();
        options.post_limit = 100;
        options.post_session_limit = 20;
        assert_eq!(effective_max_count(&options), Some(20));

        options.post_session_limit = -1;
        assert_eq!(effective_max_count(&options), Some(100));

        options.post_limit = -1;
        assert_eq!(effective_max_count(&options), None);
    }
}
