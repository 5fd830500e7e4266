//! The post fetcher: walks a channel's post history page by page in either
//! direction, stopping at whichever of several conditions (an id boundary,
//! a time boundary, a count cap, or simply running out of posts) is hit
//! first. Exactly one page request is ever in flight at a time — there is
//! no read-ahead.

use std::collections::HashMap;

use crate::entities::Post;
use crate::ids::{Id, Time};
use crate::options::OrderDirection;
use crate::store::PostHints;

/// One page of posts as the server returns them: `order` lists ids
/// newest-first within the page regardless of overall fetch direction,
/// `posts` holds the bodies, and `next_post_id`/`prev_post_id` are cursors
/// to the adjacent (older/newer) page — empty string means there is none.
#[derive(Debug, Clone)]
pub struct PostsPage {
    pub order: Vec<Id>,
    pub posts: HashMap<Id, Post>,
    pub next_post_id: Option<Id>,
    pub prev_post_id: Option<Id>,
}

#[derive(Debug, Clone, Default)]
pub struct PostsPageRequest {
    pub per_page: usize,
    pub page: Option<usize>,
    pub after: Option<Id>,
    pub before: Option<Id>,
}

/// Adapter the fetcher drives to retrieve pages. `archive-client` implements
/// this against the real server; tests implement it against a canned fixture.
pub trait PostPageSource {
    type Error;

    async fn fetch_posts_page(
        &mut self,
        channel_id: &Id,
        request: &PostsPageRequest,
    ) -> Result<PostsPage, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The request's own bounds were contradictory (`afterTime` not before
    /// `beforeTime`); no request was even issued.
    NothingRequested,
    /// The server ran out of posts before any stopping condition was hit.
    NoMorePosts,
    /// `max_count` posts were processed.
    MaxCountReached,
    /// An id or time boundary condition was reached.
    ConditionReached,
    /// Cancellation was observed between suspension points; everything
    /// processed so far was handed to `processor`, but the channel's
    /// window has not been fully walked.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct PostFetchRequest {
    pub direction: OrderDirection,
    pub after_post: Option<Id>,
    pub before_post: Option<Id>,
    pub after_time: Option<Time>,
    pub before_time: Option<Time>,
    /// `None` means unlimited.
    pub max_count: Option<u64>,
    /// Posts to skip from the fetch's natural starting point before the
    /// first one is handed to the processor. Only meaningful when
    /// `after_post`/`before_post` is unset (an ascending fetch with neither
    /// an id nor a time anchor starts at the channel's beginning and this
    /// is how the planner asks to start further in).
    pub offset: u64,
    pub buffer_size: usize,
}

/// Walks a channel's posts per `request`, calling `processor` for each post
/// that falls within the requested window (in the requested direction) and
/// `on_skipped_post` for ones fetched but outside the window (useful for
/// progress reporting without double counting).
///
/// `cancelled` is polled at every suspension point (right before each page
/// is requested); once it reports `true` the walk stops and returns
/// [`FetchOutcome::Interrupted`] without issuing the next request. A page
/// already in flight is always allowed to finish and its posts are handed
/// to `processor` before the check runs again.
pub async fn fetch_posts<S: PostPageSource>(
    source: &mut S,
    channel_id: &Id,
    channel_message_count: u64,
    request: &PostFetchRequest,
    cancelled: &(dyn Fn() -> bool),
    mut processor: impl FnMut(Post, PostHints) -> Result<(), S::Error>,
    mut on_skipped_post: impl FnMut(&Post),
) -> Result<FetchOutcome, S::Error> {
    if let (Some(after), Some(before)) = (request.after_time, request.before_time) {
        if after >= before {
            return Ok(FetchOutcome::NothingRequested);
        }
    }

    let buffer_size = request.buffer_size.max(1);
    let mut processed_count: u64 = 0;

    let mut after_cursor = request.after_post.clone();
    let mut before_cursor = request.before_post.clone();

    let (mut page, mut page_offset) = match resolve_start(
        source,
        channel_id,
        channel_message_count,
        request,
        buffer_size,
        cancelled,
    )
    .await?
    {
        StartResolution::Found(page, offset) => (page, offset),
        StartResolution::NoMorePosts => return Ok(FetchOutcome::NoMorePosts),
        StartResolution::Cancelled => return Ok(FetchOutcome::Interrupted),
    };

    loop {
        if cancelled() {
            return Ok(FetchOutcome::Interrupted);
        }

        let page_request = PostsPageRequest {
            per_page: buffer_size,
            page: if page == 0 { None } else { Some(page) },
            after: after_cursor.clone(),
            before: before_cursor.clone(),
        };

        let window = source.fetch_posts_page(channel_id, &page_request).await?;

        if window.order.is_empty() {
            let is_unanchored_ascending =
                matches!(request.direction, OrderDirection::Asc) && request.after_post.is_none();
            if is_unanchored_ascending && page != 0 {
                page -= 1;
                continue;
            }
            return Ok(FetchOutcome::NoMorePosts);
        }

        // `order` is always newest-first; ascending fetches walk it back to
        // front, descending fetches walk it as returned.
        let indices: Vec<usize> = match request.direction {
            OrderDirection::Asc => (0..window.order.len()).rev().collect(),
            OrderDirection::Desc => (0..window.order.len()).collect(),
        };

        let mut stop = None;

        for (i, idx) in indices.iter().enumerate() {
            if i < page_offset {
                continue;
            }

            let post_id = &window.order[*idx];
            let post = window
                .posts
                .get(post_id)
                .expect("post id present in order must have a body")
                .clone();

            let hints = neighbor_hints(&window, &indices, i);

            if matches_id_boundary(request, &post.id) {
                stop = Some(FetchOutcome::ConditionReached);
                break;
            }
            if matches_time_boundary(request, post.create_time) {
                stop = Some(FetchOutcome::ConditionReached);
                break;
            }
            if Some(processed_count) == request.max_count {
                stop = Some(FetchOutcome::MaxCountReached);
                break;
            }
            if is_before_requested_range(request, post.create_time) {
                on_skipped_post(&post);
                continue;
            }

            processor(post, hints)?;
            processed_count += 1;
        }

        page_offset = 0;

        if let Some(outcome) = stop {
            return Ok(outcome);
        }
        if Some(processed_count) == request.max_count {
            return Ok(FetchOutcome::MaxCountReached);
        }

        match request.direction {
            OrderDirection::Desc => match &window.prev_post_id {
                None => return Ok(FetchOutcome::NoMorePosts),
                Some(id) if id.as_str().is_empty() => return Ok(FetchOutcome::NoMorePosts),
                Some(id) => {
                    before_cursor = Some(id.clone());
                    after_cursor = None;
                    page = 0;
                }
            },
            OrderDirection::Asc => match &window.next_post_id {
                None => return Ok(FetchOutcome::NoMorePosts),
                Some(id) if id.as_str().is_empty() => return Ok(FetchOutcome::NoMorePosts),
                Some(id) => {
                    after_cursor = Some(id.clone());
                    before_cursor = None;
                    page = 0;
                }
            },
        }
    }
}

enum StartResolution {
    Found(usize, usize),
    NoMorePosts,
    Cancelled,
}

/// Resolves the starting `(page, page_offset)` pair. For descending
/// fetches, and for ascending fetches anchored on a post id, this is a
/// direct division of `offset` by the page size. An ascending fetch with no
/// anchor has to locate the channel's true last page first, since the
/// server's own `messageCount` is an approximation, then back off `offset`
/// posts from the oldest post found there — possibly into an earlier,
/// full page if `offset` reaches past the trailing one.
async fn resolve_start<S: PostPageSource>(
    source: &mut S,
    channel_id: &Id,
    channel_message_count: u64,
    request: &PostFetchRequest,
    buffer_size: usize,
    cancelled: &(dyn Fn() -> bool),
) -> Result<StartResolution, S::Error> {
    let anchored_ascending = matches!(request.direction, OrderDirection::Asc) && request.after_post.is_some();
    if matches!(request.direction, OrderDirection::Desc) || anchored_ascending {
        let offset = request.offset as usize;
        return Ok(StartResolution::Found(offset / buffer_size, offset % buffer_size));
    }

    // Unanchored ascending: estimate the last page from messageCount, then
    // walk forward until the server confirms there is nothing older.
    let mut page = (channel_message_count as usize / buffer_size)
        .saturating_sub(if channel_message_count as usize % buffer_size == 0 { 1 } else { 0 });

    let mut last_window_len;
    loop {
        if cancelled() {
            return Ok(StartResolution::Cancelled);
        }

        let page_request = PostsPageRequest {
            per_page: buffer_size,
            page: if page == 0 { None } else { Some(page) },
            after: None,
            before: None,
        };
        let window = source.fetch_posts_page(channel_id, &page_request).await?;
        last_window_len = window.order.len();
        let has_earlier = window
            .prev_post_id
            .as_ref()
            .is_some_and(|id| !id.as_str().is_empty());
        if !has_earlier {
            let total_messages = page * buffer_size + last_window_len;
            // `offset` requested more posts back than the channel actually
            // has (the server's own messageCount is only an upper bound, so
            // this can only be confirmed once the true last page is found).
            let offset = request.offset as usize;
            if offset >= total_messages {
                return Ok(StartResolution::NoMorePosts);
            }
            // `page_offset` counts how many of this page's oldest posts to
            // skip, in the ascending walk's own order (the main loop enumerates
            // the reversed `order`, oldest first). If `offset` reaches past
            // this trailing page it also consumes whole, full earlier pages.
            if offset < last_window_len {
                return Ok(StartResolution::Found(page, offset));
            }
            let remaining = offset - last_window_len;
            let pages_back = 1 + remaining / buffer_size;
            return Ok(StartResolution::Found(page.saturating_sub(pages_back), remaining % buffer_size));
        }
        page += 1;
    }
}

fn neighbor_hints(window: &PostsPage, indices: &[usize], i: usize) -> PostHints {
    let older_id = |idx: usize| window.order.get(idx).cloned();
    let non_empty = |id: &Option<Id>| id.clone().filter(|v| !v.as_str().is_empty());

    // Each arm falls back to the page's own `prev`/`next` cursor once there
    // is no other post in this same page to supply the neighbor — which, on
    // a single-post page, applies to both `before` and `after` at once.
    let post_id_before = if i == 0 {
        non_empty(&window.prev_post_id)
    } else {
        indices.get(i - 1).and_then(|&idx| older_id(idx))
    };
    let post_id_after = if i + 1 == indices.len() {
        non_empty(&window.next_post_id)
    } else {
        indices.get(i + 1).and_then(|&idx| older_id(idx))
    };

    PostHints { post_id_before, post_id_after }
}

fn matches_id_boundary(request: &PostFetchRequest, post_id: &Id) -> bool {
    match request.direction {
        OrderDirection::Asc => request.before_post.as_ref() == Some(post_id),
        OrderDirection::Desc => request.after_post.as_ref() == Some(post_id),
    }
}

fn matches_time_boundary(request: &PostFetchRequest, create_time: Time) -> bool {
    match request.direction {
        OrderDirection::Asc => request.before_time.is_some_and(|bound| create_time >= bound),
        OrderDirection::Desc => request.after_time.is_some_and(|bound| create_time <= bound),
    }
}

fn is_before_requested_range(request: &PostFetchRequest, create_time: Time) -> bool {
    match request.direction {
        OrderDirection::Asc => request.after_time.is_some_and(|bound| create_time < bound),
        OrderDirection::Desc => request.before_time.is_some_and(|bound| create_time > bound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Post;

    fn post(id: &str, t: i64) -> Post {
        Post {
            id: Id(id.to_string()),
            user_id: Id("u1".to_string()),
            create_time: Time(t),
            message: "hi".to_string(),
            is_pinned: None,
            update_time: None,
            public_update_time: None,
            delete_time: None,
            parent_post_id: None,
            root_post_id: None,
            special_msg_type: None,
            emojis: Default::default(),
            attachments: Vec::new(),
            reactions: Vec::new(),
            user_name: None,
            misc: Default::default(),
        }
    }

    /// A channel's full history, newest-first, split into fixed-size pages
    /// the way the real server's `order` field always is — a test double
    /// for [`PostPageSource`] that never talks to a network.
    struct FixtureChannel {
        /// newest-first
        posts: Vec<Post>,
    }

    impl FixtureChannel {
        fn new(posts_oldest_first: Vec<Post>) -> FixtureChannel {
            let mut posts = posts_oldest_first;
            posts.reverse();
            FixtureChannel { posts }
        }
    }

    impl PostPageSource for FixtureChannel {
        type Error = std::convert::Infallible;

        async fn fetch_posts_page(
            &mut self,
            _channel_id: &Id,
            request: &PostsPageRequest,
        ) -> Result<PostsPage, Self::Error> {
            // `self.posts` is newest-first throughout. `before=X`/`after=X`
            // are inclusive of X (mirroring `next_post_id`/`prev_post_id`
            // being the literal id to resume from, gapless and
            // duplicate-free); `before` continues toward older history
            // (larger index), `after` toward newer history (smaller index);
            // with neither, `page` indexes fixed windows from the newest post.
            let (start, end) = if let Some(before) = &request.before {
                let idx = self.posts.iter().position(|p| &p.id == before).unwrap_or(self.posts.len());
                (idx, (idx + request.per_page).min(self.posts.len()))
            } else if let Some(after) = &request.after {
                let idx = self.posts.iter().position(|p| &p.id == after).unwrap_or(0);
                let end = idx + 1;
                (end.saturating_sub(request.per_page), end)
            } else {
                let start = request.page.unwrap_or(0) * request.per_page;
                (start, (start + request.per_page).min(self.posts.len()))
            };

            let slice = if start < end { &self.posts[start..end] } else { &[] };

            let order: Vec<Id> = slice.iter().map(|p| p.id.clone()).collect();
            let posts: HashMap<Id, Post> = slice.iter().map(|p| (p.id.clone(), p.clone())).collect();

            let prev_post_id = self.posts.get(end).map(|p| p.id.clone()).unwrap_or(Id(String::new()));
            let next_post_id = if start > 0 { self.posts[start - 1].id.clone() } else { Id(String::new()) };

            Ok(PostsPage { order, posts, next_post_id: Some(next_post_id), prev_post_id: Some(prev_post_id) })
        }
    }

    #[tokio::test]
    async fn single_page_ascending_emits_in_creation_order() {
        let mut channel = FixtureChannel::new(vec![post("p1", 100), post("p2", 200), post("p3", 300)]);
        let request = PostFetchRequest {
            direction: OrderDirection::Asc,
            after_post: None,
            before_post: None,
            after_time: None,
            before_time: None,
            max_count: None,
            offset: 0,
            buffer_size: 60,
        };

        let mut seen = Vec::new();
        let outcome = fetch_posts(
            &mut channel,
            &Id("c1".into()),
            3,
            &request,
            &never_cancelled,
            |p, _hints| {
                seen.push(p.id.0.clone());
                Ok(())
            },
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome, FetchOutcome::NoMorePosts);
        assert_eq!(seen, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn before_time_not_earlier_than_after_time_is_nothing_requested() {
        let mut channel = FixtureChannel::new(vec![post("p1", 100)]);
        let request = PostFetchRequest {
            direction: OrderDirection::Asc,
            after_post: None,
            before_post: None,
            after_time: Some(Time(500)),
            before_time: Some(Time(100)),
            max_count: None,
            offset: 0,
            buffer_size: 60,
        };

        let outcome = fetch_posts(
            &mut channel,
            &Id("c1".into()),
            1,
            &request,
            &never_cancelled,
            |_, _| Ok(()),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(outcome, FetchOutcome::NothingRequested);
    }

    #[tokio::test]
    async fn max_count_stops_the_walk_early() {
        let mut channel = FixtureChannel::new(vec![post("p1", 100), post("p2", 200), post("p3", 300)]);
        let request = PostFetchRequest {
            direction: OrderDirection::Asc,
            after_post: None,
            before_post: None,
            after_time: None,
            before_time: None,
            max_count: Some(2),
            offset: 0,
            buffer_size: 60,
        };

        let mut seen = Vec::new();
        let outcome = fetch_posts(
            &mut channel,
            &Id("c1".into()),
            3,
            &request,
            &never_cancelled,
            |p, _hints| {
                seen.push(p.id.0.clone());
                Ok(())
            },
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome, FetchOutcome::MaxCountReached);
        assert_eq!(seen, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn ascending_tolerates_stale_high_message_count() {
        // Server reports 10 messages but only 3 actually exist (deletions);
        // the unanchored-ascending offset resolution must back off through
        // the empty trailing pages rather than skip real history.
        let mut channel = FixtureChannel::new(vec![post("p1", 100), post("p2", 200), post("p3", 300)]);
        let request = PostFetchRequest {
            direction: OrderDirection::Asc,
            after_post: None,
            before_post: None,
            after_time: None,
            before_time: None,
            max_count: None,
            offset: 0,
            buffer_size: 2,
        };

        let mut seen = Vec::new();
        let outcome = fetch_posts(
            &mut channel,
            &Id("c1".into()),
            10,
            &request,
            &never_cancelled,
            |p, _hints| {
                seen.push(p.id.0.clone());
                Ok(())
            },
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome, FetchOutcome::NoMorePosts);
        assert_eq!(seen, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn offset_greater_than_message_count_yields_no_more_posts() {
        let mut channel = FixtureChannel::new(vec![post("p1", 100)]);
        let request = PostFetchRequest {
            direction: OrderDirection::Asc,
            after_post: None,
            before_post: None,
            after_time: None,
            before_time: None,
            max_count: None,
            offset: 50,
            buffer_size: 10,
        };

        let mut seen = Vec::new();
        let outcome = fetch_posts(&mut channel, &Id("c1".into()), 1, &request, &never_cancelled, |p, _| {
            seen.push(p.id.0.clone());
            Ok(())
        }, |_| {})
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::NoMorePosts);
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn descending_walks_newest_first() {
        let mut channel = FixtureChannel::new(vec![post("p1", 100), post("p2", 200), post("p3", 300)]);
        let request = PostFetchRequest {
            direction: OrderDirection::Desc,
            after_post: None,
            before_post: None,
            after_time: None,
            before_time: None,
            max_count: None,
            offset: 0,
            buffer_size: 60,
        };

        let mut seen = Vec::new();
        let outcome = fetch_posts(&mut channel, &Id("c1".into()), 3, &request, &never_cancelled, |p, _| {
            seen.push(p.id.0.clone());
            Ok(())
        }, |_| {})
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::NoMorePosts);
        assert_eq!(seen, vec!["p3", "p2", "p1"]);
    }

    #[tokio::test]
    async fn cancellation_before_the_first_page_yields_interrupted() {
        let mut channel = FixtureChannel::new(vec![post("p1", 100), post("p2", 200), post("p3", 300)]);
        let request = PostFetchRequest {
            direction: OrderDirection::Asc,
            after_post: None,
            before_post: None,
            after_time: None,
            before_time: None,
            max_count: None,
            offset: 0,
            buffer_size: 60,
        };

        let mut seen = Vec::new();
        let outcome = fetch_posts(&mut channel, &Id("c1".into()), 3, &request, &|| true, |p, _| {
            seen.push(p.id.0.clone());
            Ok(())
        }, |_| {})
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Interrupted);
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn cancellation_between_pages_stops_after_the_in_flight_page() {
        let mut channel = FixtureChannel::new(vec![post("p1", 100), post("p2", 200), post("p3", 300)]);
        let request = PostFetchRequest {
            direction: OrderDirection::Asc,
            after_post: None,
            before_post: None,
            after_time: None,
            before_time: None,
            max_count: None,
            offset: 0,
            buffer_size: 2,
        };

        // False on the first poll (so the in-flight first page is always
        // fetched), true from the second poll onward.
        let polls = std::cell::Cell::new(0u32);
        let cancelled = || {
            polls.set(polls.get() + 1);
            polls.get() > 1
        };

        let mut seen = Vec::new();
        let outcome = fetch_posts(&mut channel, &Id("c1".into()), 3, &request, &cancelled, |p, _| {
            seen.push(p.id.0.clone());
            Ok(())
        }, |_| {})
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Interrupted);
        assert_eq!(seen, vec!["p1", "p2"]);
    }

    fn never_cancelled() -> bool {
        false
    }
}
