//! Drives one full archival run: selecting the wanted channels, and for
//! each, running the load-previous/recovery/plan/fetch/finalize state
//! machine.

use std::collections::HashMap;
use std::path::Path;

use archive_client::ServerClient;
use archive_core::entities::{Channel, ChannelType, Emoji, Team, User};
use archive_core::fetcher::{fetch_posts, FetchOutcome, PostFetchRequest};
use archive_core::options::{ChannelOptions, OrderDirection};
use archive_core::planner::{self, ArchiveInterval, Plan, PlanRequest};
use archive_core::recovery::{DefaultRecoveryArbiter, RecoveryAction, RecoveryArbiter};
use archive_core::store::{archive_filenames, ChannelFileInfo, ChannelHeader, PostStorage};
use archive_core::{EntityLocator, Id};
use itertools::Itertools;

use crate::config::{ChannelSpec, Config, GroupLocator};
use crate::error::AppError;
use crate::{files, stems};

/// One channel the orchestrator has decided to archive, with the options
/// that apply to it already resolved (explicit locator override, or the
/// relevant per-kind default).
struct ChannelRequest {
    channel: Channel,
    options: ChannelOptions,
}

async fn resolve_locator(client: &mut ServerClient, locator: &EntityLocator) -> Result<User, AppError> {
    let user = match locator {
        EntityLocator::Id(id) => client.get_user_by_id(id).await?,
        EntityLocator::Name(name) | EntityLocator::InternalName(name) => client.get_user_by_name(name).await?,
    };
    Ok(user.clone())
}

/// A configured group locator matches a channel only if the channel's full
/// member set (the local user included) equals exactly the locators'
/// resolved user set — a subset is not a match.
async fn matches_group_channel(
    client: &mut ServerClient,
    team_id: &Id,
    channel: &mut Channel,
    local_user_id: &Id,
    members: &[EntityLocator],
) -> Result<bool, AppError> {
    if channel.members.is_empty() {
        client.load_channel_members(team_id, &channel.id).await?;
        if let Some(team) = client.get_team_by_id(team_id) {
            if let Some(reloaded) = team.channels.get(&channel.id) {
                channel.members = reloaded.members.clone();
            }
        }
    }

    let mut wanted: Vec<Id> = Vec::with_capacity(members.len() + 1);
    for locator in members {
        wanted.push(resolve_locator(client, locator).await?.id);
    }
    wanted.push(local_user_id.clone());
    let wanted: Vec<Id> = wanted.into_iter().unique().sorted().collect();

    let actual: Vec<Id> = channel.members.iter().map(|u| u.id.clone()).unique().sorted().collect();

    Ok(wanted == actual)
}

struct SelectedChannels {
    direct: Vec<(User, ChannelRequest)>,
    group: Vec<ChannelRequest>,
    per_team: Vec<(Team, Vec<ChannelRequest>)>,
}

async fn select_channels(client: &mut ServerClient, config: &Config, local_user: &User) -> Result<SelectedChannels, AppError> {
    let mut explicit_direct: HashMap<String, (User, ChannelOptions)> = HashMap::new();
    for spec in &config.users {
        let user = resolve_locator(client, &spec.locator).await?;
        let internal_name = Channel::direct_channel_internal_name(&local_user.id, &user.id);
        let options = spec.options.apply(&config.direct_channel_options.apply(&config.default_channel_options.apply(&ChannelOptions::default())));
        explicit_direct.insert(internal_name, (user, options));
    }

    let team_ids: Vec<Id> = client.teams().map(|t| t.id.clone()).collect();

    let mut direct: Vec<(User, ChannelRequest)> = Vec::new();
    let mut seen_direct_channel_ids: Vec<Id> = Vec::new();
    let mut group: Vec<ChannelRequest> = Vec::new();
    let mut matched_group_specs: Vec<usize> = Vec::new();

    for team_id in &team_ids {
        let channels: Vec<Channel> = client
            .get_team_by_id(team_id)
            .map(|t| t.channels.values().cloned().collect())
            .unwrap_or_default();

        for mut channel in channels {
            match channel.kind {
                ChannelType::Direct => {
                    if seen_direct_channel_ids.contains(&channel.id) {
                        continue;
                    }
                    if let Some((user, options)) = explicit_direct.remove(&channel.internal_name) {
                        seen_direct_channel_ids.push(channel.id.clone());
                        direct.push((user, ChannelRequest { channel, options }));
                    } else if config.misc_direct_channels {
                        let other_id = other_direct_participant(&channel.internal_name, &local_user.id);
                        let other_user = client.get_user_by_id(&other_id).await?.clone();
                        seen_direct_channel_ids.push(channel.id.clone());
                        let options = config.direct_channel_options.apply(&config.default_channel_options.apply(&ChannelOptions::default()));
                        direct.push((other_user, ChannelRequest { channel, options }));
                    }
                }
                ChannelType::Group => {
                    let mut matched = false;
                    for (idx, spec) in config.groups.iter().enumerate() {
                        let is_match = match &spec.group {
                            GroupLocator::ChannelId(id) => &channel.id == id,
                            GroupLocator::Members(members) => {
                                matches_group_channel(client, team_id, &mut channel, &local_user.id, members).await?
                            }
                        };
                        if is_match {
                            let options = spec.options.apply(&config.group_channel_options.apply(&config.default_channel_options.apply(&ChannelOptions::default())));
                            group.push(ChannelRequest { channel: channel.clone(), options });
                            matched_group_specs.push(idx);
                            matched = true;
                            break;
                        }
                    }
                    if !matched && config.misc_group_channels {
                        let options = config.group_channel_options.apply(&config.default_channel_options.apply(&ChannelOptions::default()));
                        group.push(ChannelRequest { channel, options });
                    }
                }
                _ => {}
            }
        }
    }

    for (internal_name, (user, _)) in &explicit_direct {
        log::warn!("found no direct channel with {} ({internal_name})", user.name);
    }
    for (idx, spec) in config.groups.iter().enumerate() {
        if !matched_group_specs.contains(&idx) {
            log::warn!("found no group channel matching configured locator {:?}", spec.group);
        }
    }

    let per_team = select_per_team_channels(client, config, &team_ids)?;

    Ok(SelectedChannels { direct, group, per_team })
}

fn other_direct_participant(internal_name: &str, local_user_id: &Id) -> Id {
    let (a, b) = internal_name.split_once("__").unwrap_or((internal_name, ""));
    if a == local_user_id.as_str() {
        Id(b.to_string())
    } else {
        Id(a.to_string())
    }
}

fn select_per_team_channels(client: &ServerClient, config: &Config, team_ids: &[Id]) -> Result<Vec<(Team, Vec<ChannelRequest>)>, AppError> {
    if !config.misc_teams && config.teams.is_empty() {
        return Ok(Vec::new());
    }

    let mut explicit_team_locators: Vec<&EntityLocator> = config.teams.iter().map(|t| &t.locator).collect();
    let mut result = Vec::new();

    for team_id in team_ids {
        let Some(team) = client.get_team_by_id(team_id) else { continue };

        let matching_spec = config.teams.iter().find(|spec| team.matches(&spec.locator));
        if let Some(spec) = matching_spec {
            explicit_team_locators.retain(|l| *l != &spec.locator);
            let channels = channels_for_team_with_spec(team, spec, config);
            result.push((team.clone(), channels));
        } else if config.misc_teams {
            let channels = channels_for_team_misc(team, config);
            result.push((team.clone(), channels));
        }
    }

    for locator in explicit_team_locators {
        log::error!("team requested via {locator:?} was not found");
    }

    Ok(result)
}

fn channels_for_team_with_spec(team: &Team, spec: &crate::config::TeamSpec, config: &Config) -> Vec<ChannelRequest> {
    let mut requests = Vec::new();
    let mut explicit_public: Vec<&ChannelSpec> = spec.explicit_public_channels.iter().collect();
    let mut explicit_private: Vec<&ChannelSpec> = spec.explicit_private_channels.iter().collect();

    let public_base = spec.public_channel_defaults.apply(&spec.default_channel_options.apply(&config.public_channel_options.apply(&config.default_channel_options.apply(&ChannelOptions::default()))));
    let private_base = spec.private_channel_defaults.apply(&spec.default_channel_options.apply(&config.private_channel_options.apply(&config.default_channel_options.apply(&ChannelOptions::default()))));

    for channel in team.channels.values() {
        match channel.kind {
            ChannelType::Open => {
                if let Some(pos) = explicit_public.iter().position(|s| channel.matches(&s.locator)) {
                    let found = explicit_public.remove(pos);
                    requests.push(ChannelRequest { channel: channel.clone(), options: found.options.apply(&public_base) });
                } else if spec.misc_public_channels {
                    requests.push(ChannelRequest { channel: channel.clone(), options: public_base.clone() });
                }
            }
            ChannelType::Private => {
                if let Some(pos) = explicit_private.iter().position(|s| channel.matches(&s.locator)) {
                    let found = explicit_private.remove(pos);
                    requests.push(ChannelRequest { channel: channel.clone(), options: found.options.apply(&private_base) });
                } else if spec.misc_private_channels {
                    requests.push(ChannelRequest { channel: channel.clone(), options: private_base.clone() });
                }
            }
            _ => {}
        }
    }

    for s in explicit_public {
        log::warn!("found no requested public channel on team {} via locator {:?}", team.internal_name, s.locator);
    }
    for s in explicit_private {
        log::warn!("found no requested private channel on team {} via locator {:?}", team.internal_name, s.locator);
    }

    requests
}

fn channels_for_team_misc(team: &Team, config: &Config) -> Vec<ChannelRequest> {
    let public_base = config.public_channel_options.apply(&config.default_channel_options.apply(&ChannelOptions::default()));
    let private_base = config.private_channel_options.apply(&config.default_channel_options.apply(&ChannelOptions::default()));

    team.channels
        .values()
        .filter_map(|channel| match channel.kind {
            ChannelType::Open => Some(ChannelRequest { channel: channel.clone(), options: public_base.clone() }),
            ChannelType::Private => Some(ChannelRequest { channel: channel.clone(), options: private_base.clone() }),
            _ => None,
        })
        .collect()
}

fn enrich_post(post: &mut archive_core::entities::Post, user: &User, verbose: bool) {
    if verbose {
        post.user_name = Some(user.name.clone());
    }
}

fn enrich_reaction(reaction: &mut archive_core::entities::PostReaction, user: &User, verbose: bool) {
    if verbose {
        reaction.user_name = Some(user.name.clone());
    }
}

/// Resolves an id-only start/end boundary to a time, when the id doesn't
/// already match one of the archive's own known boundary ids — a server
/// round trip the planner itself never performs (see `planner.rs` module
/// docs).
async fn resolve_boundary_times(
    client: &mut ServerClient,
    options: &mut ChannelOptions,
    archive: Option<&ArchiveInterval>,
) -> Result<(), AppError> {
    let known_ids = |archive: &ArchiveInterval| -> Vec<&Id> {
        [
            archive.post_id_before_first.as_ref(),
            Some(&archive.first_post_id),
            Some(&archive.last_post_id),
            archive.post_id_after_last.as_ref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    };

    if let Some(id) = options.posts_after_id.clone() {
        let already_known = archive.is_some_and(|a| known_ids(a).contains(&&id));
        if !already_known && options.posts_after_time.is_none() {
            let post = client.get_post_by_id(&id).await?;
            options.posts_after_time = Some(post.create_time);
        }
    }
    if let Some(id) = options.posts_before_id.clone() {
        let already_known = archive.is_some_and(|a| known_ids(a).contains(&&id));
        if !already_known && options.posts_before_time.is_none() {
            let post = client.get_post_by_id(&id).await?;
            options.posts_before_time = Some(post.create_time);
        }
    }
    Ok(())
}

fn backup_alternatives(stem: &str) -> impl Iterator<Item = String> + '_ {
    stems::alternate_backup_stems(stem)
}

fn unused_backup_stem(directory: &Path, stem: &str) -> String {
    let primary = stems::primary_backup_stem(stem);
    let (h, d) = archive_filenames(directory, &primary);
    if !h.is_file() && !d.is_file() {
        return primary;
    }
    for candidate in backup_alternatives(stem) {
        let (h, d) = archive_filenames(directory, &candidate);
        if !h.is_file() && !d.is_file() {
            return candidate;
        }
    }
    unreachable!("backup alternatives is an infinite sequence")
}

/// Backs up an existing archive pair by renaming it. `header_only` backs up
/// just the header (used for the append-mode rollback path, where the data
/// file is recovered by truncation instead). Returns `true` if a pre-existing
/// backup slot forced skipping this channel's download entirely.
fn backup_archive(directory: &Path, stem: &str, header_only: bool, arbiter: &DefaultRecoveryArbiter) -> Result<bool, AppError> {
    let (header_path, data_path) = archive_filenames(directory, stem);
    let header_exists = header_path.is_file();
    let data_exists = data_path.is_file();

    if !header_exists && (header_only || !data_exists) {
        return Ok(false);
    }

    let backup_stem = stems::primary_backup_stem(stem);
    let (backup_header, backup_data) = archive_filenames(directory, &backup_stem);

    if backup_header.is_file() || backup_data.is_file() {
        match arbiter.on_existing_channel_backup() {
            RecoveryAction::SkipDownload => return Ok(true),
            RecoveryAction::Delete => {
                remove_if_exists(&backup_header)?;
                remove_if_exists(&backup_data)?;
            }
            _ => {
                let alt_stem = unused_backup_stem(directory, stem);
                let (alt_header, alt_data) = archive_filenames(directory, &alt_stem);
                if backup_header.is_file() {
                    std::fs::rename(&backup_header, &alt_header).map_err(|source| AppError::Io { path: backup_header.clone(), source })?;
                }
                if backup_data.is_file() {
                    std::fs::rename(&backup_data, &alt_data).map_err(|source| AppError::Io { path: backup_data.clone(), source })?;
                }
            }
        }
    }

    if header_exists {
        std::fs::rename(&header_path, &backup_header).map_err(|source| AppError::Io { path: header_path.clone(), source })?;
    }
    if !header_only && data_exists {
        std::fs::rename(&data_path, &backup_data).map_err(|source| AppError::Io { path: data_path.clone(), source })?;
    }

    Ok(false)
}

/// Undoes [`backup_archive`]: a from-scratch rollback renames the full pair
/// back; an append-mode rollback truncates the data file to its pre-append
/// size and renames only the header back.
fn restore_backup(directory: &Path, stem: &str, old_data_size: Option<u64>) -> Result<(), AppError> {
    let (header_path, data_path) = archive_filenames(directory, stem);
    let backup_stem = stems::primary_backup_stem(stem);
    let (backup_header, backup_data) = archive_filenames(directory, &backup_stem);

    if backup_data.is_file() {
        std::fs::rename(&backup_data, &data_path).map_err(|source| AppError::Io { path: backup_data.clone(), source })?;
        std::fs::rename(&backup_header, &header_path).map_err(|source| AppError::Io { path: backup_header.clone(), source })?;
    } else if let Some(size) = old_data_size {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&data_path)
            .map_err(|source| AppError::Io { path: data_path.clone(), source })?;
        file.set_len(size).map_err(|source| AppError::Io { path: data_path.clone(), source })?;
        std::fs::rename(&backup_header, &header_path).map_err(|source| AppError::Io { path: backup_header.clone(), source })?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), AppError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(AppError::Io { path: path.to_path_buf(), source }),
    }
}

async fn process_channel(
    client: &mut ServerClient,
    config: &Config,
    arbiter: &DefaultRecoveryArbiter,
    stem: &str,
    mut header: ChannelHeader,
    request: ChannelRequest,
    cancelled: &(dyn Fn() -> bool),
) -> Result<(), AppError> {
    let ChannelRequest { channel, mut options } = request;

    if options.post_limit == 0 || options.post_session_limit == 0 {
        return Ok(());
    }

    let directory = &config.output_directory;
    let (header_path, data_path) = archive_filenames(directory, stem);

    let loaded = match ChannelFileInfo::load(&channel.id, &header_path, &data_path) {
        Ok(info) => info,
        Err(archive_core::CoreError::DataFileSizeMismatch { expected, actual, .. }) => {
            match arbiter.on_missized_data_file(expected, Some(actual)) {
                RecoveryAction::Delete => {
                    remove_if_exists(&header_path)?;
                    remove_if_exists(&data_path)?;
                    None
                }
                RecoveryAction::SkipDownload => return Ok(()),
                RecoveryAction::Reuse if actual > expected => {
                    let file = std::fs::OpenOptions::new().write(true).open(&data_path).map_err(|source| AppError::Io { path: data_path.clone(), source })?;
                    file.set_len(expected).map_err(|source| AppError::Io { path: data_path.clone(), source })?;
                    ChannelFileInfo::load(&channel.id, &header_path, &data_path)?
                }
                _ => {
                    backup_archive(directory, stem, false, arbiter)?;
                    None
                }
            }
        }
        Err(_unloadable) => match arbiter.on_unloadable_header(data_path.is_file()) {
            RecoveryAction::Delete => {
                remove_if_exists(&header_path)?;
                remove_if_exists(&data_path)?;
                None
            }
            RecoveryAction::SkipDownload => return Ok(()),
            _ => {
                if backup_archive(directory, stem, false, arbiter)? {
                    return Ok(());
                }
                None
            }
        },
    };

    let archive_interval = loaded.as_ref().and_then(|info| info.header.storage.as_ref().map(ArchiveInterval::from));

    resolve_boundary_times(client, &mut options, archive_interval.as_ref()).await?;

    header.storage = Some(PostStorage::from_options(&options));

    let plan_request = PlanRequest::from_options(options.clone());
    let plan = planner::plan(&plan_request, archive_interval.as_ref(), channel.last_message_time);

    let (from_scratch, mut fetch_options) = match plan {
        Plan::NothingToDo => return Ok(()),
        Plan::FromScratch(opts) => (true, opts),
        Plan::Append(opts) => (false, opts),
    };

    let old_data_size = loaded.as_ref().and_then(|info| info.data_file_size);
    let mut archive_header = loaded.map(|info| info.header);

    if archive_header.is_some() {
        let reusable = !from_scratch;
        match arbiter.on_archive_reuse(reusable) {
            RecoveryAction::SkipDownload => return Ok(()),
            RecoveryAction::Delete => {
                remove_if_exists(&header_path)?;
                remove_if_exists(&data_path)?;
                archive_header = None;
            }
            RecoveryAction::Backup => {
                if backup_archive(directory, stem, false, arbiter)? {
                    return Ok(());
                }
                archive_header = None;
            }
            RecoveryAction::Reuse => {
                if backup_archive(directory, stem, !from_scratch, arbiter)? {
                    return Ok(());
                }
            }
        }
    }

    let reused = archive_header.is_some();

    let max_count = planner::effective_max_count(&fetch_options);
    let direction = fetch_options.download_time_direction;
    let fetch_request = PostFetchRequest {
        direction,
        after_post: fetch_options.posts_after_id.clone(),
        before_post: fetch_options.posts_before_id.clone(),
        after_time: fetch_options.posts_after_time,
        before_time: fetch_options.posts_before_time,
        max_count,
        offset: 0,
        buffer_size: 60,
    };

    let run_result: Result<(), AppError> = async {
        use std::io::Write as _;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(from_scratch)
            .append(!from_scratch)
            .open(&data_path)
            .map_err(|source| AppError::Io { path: data_path.clone(), source })?;

        let mut attachments = Vec::new();
        let take_emojis = options.emoji_metadata || options.download_emoji;
        let verbose = config.verbose_human_friendly_posts;
        let mut author_ids: std::collections::HashSet<Id> = std::collections::HashSet::new();

        let outcome = fetch_posts(
            client,
            &channel.id,
            channel.message_count,
            &fetch_request,
            cancelled,
            |mut post, hints| {
                let storage = header.storage.as_mut().expect("storage seeded before fetch");

                author_ids.insert(post.user_id.clone());
                for reaction in &post.reactions {
                    author_ids.insert(reaction.user_id.clone());
                }
                if options.download_attachments {
                    attachments.extend(post.attachments.iter().cloned());
                }

                let full_emojis = match std::mem::take(&mut post.emojis) {
                    archive_core::entities::PostEmojis::Full(v) => v,
                    archive_core::entities::PostEmojis::Ids(_) => Vec::new(),
                };
                if take_emojis {
                    for emoji in &full_emojis {
                        if !header.used_emojis.iter().any(|e| e.id == emoji.id) {
                            header.used_emojis.push(emoji.clone());
                        }
                    }
                    post.emojis = archive_core::entities::PostEmojis::Ids(full_emojis.iter().map(|e| e.id.clone()).collect());
                } else {
                    post.emojis = archive_core::entities::PostEmojis::Ids(Vec::new());
                }

                let line = serde_json::to_string(&post).expect("post always serializes");
                writeln!(file, "{line}").map_err(|source| {
                    archive_client::ClientError::Entity(archive_core::CoreError::Io(source))
                })?;

                storage.add_sorted_post(&post, &hints, direction);
                Ok(())
            },
            |_skipped| {},
        )
        .await?;
        file.flush().map_err(|source| AppError::Io { path: data_path.clone(), source })?;
        let size = file.metadata().map_err(|source| AppError::Io { path: data_path.clone(), source })?.len();
        header.storage.as_mut().expect("storage seeded before fetch").byte_size = size;
        log_outcome(stem, outcome, size);

        if outcome == FetchOutcome::Interrupted {
            // Whatever was written so far stays in `file`, but the header
            // is never finalized for this channel: falling into the error
            // arm below makes this look exactly like any other mid-fetch
            // failure, so the existing backup/restore logic rolls it back.
            return Err(AppError::Interrupted);
        }

        for user_id in author_ids {
            if header.used_users.iter().any(|u| u.id == user_id) {
                continue;
            }
            let user = client.get_user_by_id(&user_id).await?.clone();
            header.used_users.push(user);
        }

        for emoji in &mut header.used_emojis {
            if options.emoji_metadata {
                let creator = client.get_user_by_id(&emoji.creator_id).await?.clone();
                enrich_emoji(emoji, &creator, verbose);
            }
        }

        if verbose {
            enrich_post_file(&data_path, &header.used_users)?;
        }

        process_channel_auxiliaries(client, config, stem, &mut header, &options, &attachments, cancelled).await?;

        if let Some(mut existing) = archive_header.filter(|_| !from_scratch) {
            existing.merge(header.clone())?;
            header = existing;
        }

        std::fs::write(&header_path, header.to_json()).map_err(|source| AppError::Io { path: header_path.clone(), source })?;

        Ok(())
    }
    .await;

    match run_result {
        Ok(()) => {
            if reused {
                let backup_stem = stems::primary_backup_stem(stem);
                let (bh, bd) = archive_filenames(directory, &backup_stem);
                remove_if_exists(&bh)?;
                remove_if_exists(&bd)?;
            }
            Ok(())
        }
        Err(err) => {
            if reused && !from_scratch {
                restore_backup(directory, stem, old_data_size)?;
            } else {
                match arbiter.on_post_loading_failure() {
                    RecoveryAction::Delete => {
                        remove_if_exists(&header_path)?;
                        remove_if_exists(&data_path)?;
                        if reused {
                            restore_backup(directory, stem, None)?;
                        }
                    }
                    _ => {}
                }
            }
            Err(err)
        }
    }
}

fn log_outcome(stem: &str, outcome: FetchOutcome, data_file_size: u64) {
    let reason = match outcome {
        FetchOutcome::NothingRequested => "nothing to download",
        FetchOutcome::NoMorePosts => "processed all posts",
        FetchOutcome::MaxCountReached => "processed posts up to the configured count",
        FetchOutcome::ConditionReached => "processed up to the requested boundary",
        FetchOutcome::Interrupted => "interrupted",
    };
    log::info!("{stem}: {reason}, data file is now {}", humansize::format_size(data_file_size, humansize::DECIMAL));
}

fn enrich_emoji(emoji: &mut Emoji, creator: &User, verbose: bool) {
    if verbose {
        emoji.creator_name = Some(creator.name.clone());
    }
}

/// Sets `userName` on every post and reaction in the data file from the
/// now-fully-resolved user set. Posts are written during the fetch loop
/// before their authors are all known, so this runs as a whole-file
/// rewrite afterward rather than enriching inline.
fn enrich_post_file(data_path: &Path, used_users: &[User]) -> Result<(), AppError> {
    let contents = std::fs::read_to_string(data_path).map_err(|source| AppError::Io { path: data_path.to_path_buf(), source })?;

    let mut rewritten = String::with_capacity(contents.len());
    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        let mut post: archive_core::entities::Post = serde_json::from_str(line).map_err(|source| AppError::Io {
            path: data_path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
        })?;

        if let Some(author) = used_users.iter().find(|u| u.id == post.user_id) {
            enrich_post(&mut post, author, true);
        }
        for reaction in &mut post.reactions {
            if let Some(author) = used_users.iter().find(|u| u.id == reaction.user_id) {
                enrich_reaction(reaction, author, true);
            }
        }

        rewritten.push_str(&serde_json::to_string(&post).expect("post always serializes"));
        rewritten.push('\n');
    }

    std::fs::write(data_path, rewritten).map_err(|source| AppError::Io { path: data_path.to_path_buf(), source })
}

async fn process_channel_auxiliaries(
    client: &mut ServerClient,
    config: &Config,
    stem: &str,
    header: &mut ChannelHeader,
    options: &ChannelOptions,
    attachments: &[archive_core::entities::FileAttachment],
    cancelled: &(dyn Fn() -> bool),
) -> Result<(), AppError> {
    let directory = &config.output_directory;

    if options.download_emoji && !config.download_all_emojis {
        let emoji_dir = directory.join("emojis");
        files::ensure_directory(&emoji_dir).await?;
        for emoji in &mut header.used_emojis {
            if cancelled() {
                return Err(AppError::Interrupted);
            }
            let url = client.emoji_image_url(&emoji.id);
            let filename = files::store_file(client, &url, &emoji.name, &emoji_dir, None, options.redownload).await?;
            emoji.image_file_name = Some(filename);
        }
    }

    if options.download_attachments && !attachments.is_empty() {
        let files_dir = directory.join(stems::files_dir_name(stem));
        files::ensure_directory(&files_dir).await?;
        for attachment in attachments {
            if cancelled() {
                return Err(AppError::Interrupted);
            }
            let within_size = options.download_attachment_size_limit == 0 || attachment.byte_size <= options.download_attachment_size_limit;
            let allowed_type = options.download_attachment_types.is_empty()
                || attachment.mime_type.as_deref().is_some_and(|t| options.download_attachment_types.iter().any(|a| a == t));
            if !within_size || !allowed_type {
                continue;
            }
            let suffix = Path::new(&attachment.name).extension().map(|e| format!(".{}", e.to_string_lossy()));
            let url = client.file_url(&attachment.id, false);
            files::store_file(client, &url, attachment.id.as_str(), &files_dir, suffix, options.redownload).await?;
        }
    }

    if options.download_avatars {
        let avatar_dir = directory.join("avatars");
        files::ensure_directory(&avatar_dir).await?;
        for user in &mut header.used_users {
            if cancelled() {
                return Err(AppError::Interrupted);
            }
            let url = client.avatar_url(&user.id);
            let filename = files::store_file(client, &url, &user.name, &avatar_dir, None, options.redownload).await?;
            user.avatar_file_name = Some(filename);
        }
    }

    Ok(())
}

/// Runs a full archival pass. `cancelled` is polled at every suspension
/// point (server requests, inter-page sleeps, file writes); once it reports
/// `true` the channel currently in flight finishes its rollback path (same
/// as any other failed channel) and no further channels are started.
pub async fn run(client: &mut ServerClient, config: &Config, cancelled: &(dyn Fn() -> bool)) -> Result<(), AppError> {
    macro_rules! process_or_stop {
        ($fut:expr) => {
            match $fut.await {
                Ok(()) => {}
                Err(AppError::Interrupted) => {
                    log::warn!("interrupted: finished the in-progress channel's rollback, stopping before any further channels");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        };
    }

    files::ensure_directory(&config.output_directory).await?;
    let arbiter = DefaultRecoveryArbiter::new(config.recovery_policy());

    let team_count = client.get_teams().await?;
    if team_count == 0 {
        return Err(AppError::NoTeams);
    }

    let team_ids: Vec<Id> = client.teams().map(|t| t.id.clone()).collect();
    for team_id in &team_ids {
        client.load_channels(team_id).await?;
    }

    if config.download_all_emojis {
        log::info!("downloading emoji database");
        client.load_all_emojis().await?;
    }

    let local_user_id = client.local_user_id().cloned().expect("local user resolved before run");
    let local_user = client.get_user_by_id(&local_user_id).await?.clone();

    log::info!("selecting channels to download");
    let selected = select_channels(client, config, &local_user).await?;

    log::info!("processing channels");
    for (other_user, request) in selected.direct {
        if cancelled() {
            log::warn!("interrupted before starting the next channel, stopping");
            return Ok(());
        }
        log::info!("processing conversation with {}", other_user.name);
        let stem = stems::direct_channel_stem(&local_user.name, &other_user.name);
        let mut header = ChannelHeader::new(request.channel.clone(), None);
        header.used_users = vec![local_user.clone(), other_user];
        process_or_stop!(process_channel(client, config, &arbiter, &stem, header, request, cancelled));
    }

    for request in selected.group {
        if cancelled() {
            log::warn!("interrupted before starting the next channel, stopping");
            return Ok(());
        }
        let member_names: Vec<String> = {
            let mut names: Vec<String> = request.channel.members.iter().map(|u| u.name.clone()).collect();
            names.sort();
            names
        };
        let stem = if member_names.is_empty() {
            format!("g.{}", request.channel.id)
        } else {
            stems::group_channel_stem(&member_names)
        };
        log::info!("processing group chat {stem}");
        let header = ChannelHeader::new(request.channel.clone(), None);
        process_or_stop!(process_channel(client, config, &arbiter, &stem, header, request, cancelled));
    }

    for (team, channels) in selected.per_team {
        for request in channels {
            if cancelled() {
                log::warn!("interrupted before starting the next channel, stopping");
                return Ok(());
            }
            let private = request.channel.kind == ChannelType::Private;
            log::info!(
                "processing {} channel {}/{}",
                if private { "private" } else { "public" },
                team.internal_name,
                request.channel.internal_name
            );
            let stem = if private {
                stems::private_channel_stem(&team.internal_name, &request.channel.internal_name)
            } else {
                stems::public_channel_stem(&team.internal_name, &request.channel.internal_name)
            };
            let header = ChannelHeader::new(request.channel.clone(), Some(team.clone()));
            process_or_stop!(process_channel(client, config, &arbiter, &stem, header, request, cancelled));
        }
    }

    log::info!("download process completed successfully");
    Ok(())
}

/// Orchestrator-level tests drive `run` against a `wiremock` server standing
/// in for the chat server, exercising the same load/plan/fetch/finalize path
/// `main` does but with a bearer token set directly instead of a real login.
/// Each step below stands up its own server (rather than one stateful server
/// reprogrammed between steps), since a single run only ever issues one
/// shape of query against any given endpoint.
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHANNEL_ID: &str = "c1";
    const TEAM_ID: &str = "t1";
    const LOCAL_USER_ID: &str = "u1";
    const LOCAL_USER_NAME: &str = "alice";

    async fn mount_identity_and_team(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/v4/users/username/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": LOCAL_USER_ID,
                "username": LOCAL_USER_NAME,
                "create_at": 1,
            })))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("/api/v4/users/{LOCAL_USER_ID}/teams")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": TEAM_ID,
                "name": "town",
                "display_name": "Town",
                "type": "O",
                "create_at": 1,
            }])))
            .mount(server)
            .await;
    }

    async fn mount_channel(server: &MockServer, message_count: u64, last_post_at: i64) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v4/users/{LOCAL_USER_ID}/teams/{TEAM_ID}/channels")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": CHANNEL_ID,
                "name": "general",
                "display_name": "General",
                "type": "O",
                "create_at": 1,
                "total_msg_count": message_count,
                "last_post_at": last_post_at,
            }])))
            .mount(server)
            .await;
    }

    fn post_json(id: &str, create_at: i64) -> serde_json::Value {
        json!({ "id": id, "user_id": LOCAL_USER_ID, "create_at": create_at, "message": "hi" })
    }

    /// Mounts one `channels/{id}/posts` response, matched on `per_page` plus
    /// whichever of `after`/`before` the caller supplies; any other
    /// unmounted query shape falls through to wiremock's 404 default, which
    /// a test can rely on to prove a fetch it didn't expect never happened.
    async fn mount_posts_page(
        server: &MockServer,
        extra_query: &[(&str, &str)],
        order: &[&str],
        bodies: &[(&str, i64)],
        next_post_id: &str,
        prev_post_id: &str,
    ) {
        let mut posts_map = serde_json::Map::new();
        for (id, t) in bodies {
            posts_map.insert((*id).to_string(), post_json(id, *t));
        }

        let mut mock = Mock::given(method("GET"))
            .and(path(format!("/api/v4/channels/{CHANNEL_ID}/posts")))
            .and(query_param("per_page", "60"));
        for (key, value) in extra_query {
            mock = mock.and(query_param(*key, *value));
        }

        mock.respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "order": order,
            "posts": posts_map,
            "next_post_id": next_post_id,
            "prev_post_id": prev_post_id,
        })))
        .mount(server)
        .await;
    }

    async fn test_client(server: &MockServer) -> ServerClient {
        let http = reqwest::Client::new();
        let mut client = ServerClient::new(format!("{}/api/v4", server.uri()), http, Duration::ZERO);
        client.set_token("test-token".to_string());
        client.load_local_user(LOCAL_USER_NAME).await.expect("identity mock must be mounted");
        client
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            output_directory: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn never_cancelled() -> bool {
        false
    }

    fn data_file_ids(data_path: &Path) -> Vec<String> {
        std::fs::read_to_string(data_path)
            .unwrap()
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn fresh_download_then_idempotent_rerun_then_append_then_corruption_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stem = stems::public_channel_stem("town", "general");
        let (header_path, data_path) = archive_filenames(dir.path(), &stem);

        // Step 1: nothing archived yet, the whole channel is fetched in one page.
        {
            let server = MockServer::start().await;
            mount_identity_and_team(&server).await;
            mount_channel(&server, 3, 300).await;
            mount_posts_page(&server, &[], &["p3", "p2", "p1"], &[("p1", 100), ("p2", 200), ("p3", 300)], "", "").await;

            let mut client = test_client(&server).await;
            run(&mut client, &config, &never_cancelled).await.unwrap();
        }

        assert_eq!(data_file_ids(&data_path), vec!["p1", "p2", "p3"]);
        let header = ChannelHeader::from_json(&Id(CHANNEL_ID.into()), &std::fs::read_to_string(&header_path).unwrap()).unwrap();
        assert_eq!(header.storage.as_ref().unwrap().count, 3);

        // Step 2: the channel hasn't moved; the planner must decide
        // NothingToDo without ever touching the posts endpoint. No posts
        // mock is registered here on purpose: if the planner mistakenly
        // appends, the unmatched request turns into a hard failure below.
        {
            let server = MockServer::start().await;
            mount_identity_and_team(&server).await;
            mount_channel(&server, 3, 300).await;

            let mut client = test_client(&server).await;
            run(&mut client, &config, &never_cancelled).await.unwrap();
        }
        assert_eq!(data_file_ids(&data_path), vec!["p1", "p2", "p3"]);

        // Step 3: one new post landed in the channel; the archive must be
        // appended to in place, anchored on the previous last post.
        {
            let server = MockServer::start().await;
            mount_identity_and_team(&server).await;
            mount_channel(&server, 4, 500).await;
            mount_posts_page(&server, &[("after", "p3")], &["p4"], &[("p4", 500)], "", "p3").await;

            let mut client = test_client(&server).await;
            run(&mut client, &config, &never_cancelled).await.unwrap();
        }
        assert_eq!(data_file_ids(&data_path), vec!["p1", "p2", "p3", "p4"]);
        let header = ChannelHeader::from_json(&Id(CHANNEL_ID.into()), &std::fs::read_to_string(&header_path).unwrap()).unwrap();
        let storage = header.storage.as_ref().unwrap();
        assert_eq!(storage.count, 4);
        let data_len = std::fs::metadata(&data_path).unwrap().len();
        assert_eq!(storage.byte_size, data_len);

        // Step 4: someone appended garbage to the data file behind the
        // archiver's back. The recovery arbiter truncates it back to the
        // header's recorded size and the (already up to date) archive is
        // otherwise left untouched.
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&data_path).unwrap();
            use std::io::Write as _;
            file.write_all(b"garbage-not-json\n").unwrap();
        }

        {
            let server = MockServer::start().await;
            mount_identity_and_team(&server).await;
            mount_channel(&server, 4, 500).await;

            let mut client = test_client(&server).await;
            run(&mut client, &config, &never_cancelled).await.unwrap();
        }
        assert_eq!(data_file_ids(&data_path), vec!["p1", "p2", "p3", "p4"]);
        assert_eq!(std::fs::metadata(&data_path).unwrap().len(), data_len);
    }

    #[tokio::test]
    async fn direction_change_rebuilds_from_scratch_and_keeps_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let stem = stems::public_channel_stem("town", "general");
        let (header_path, data_path) = archive_filenames(dir.path(), &stem);
        let (backup_header, backup_data) = archive_filenames(dir.path(), &stems::primary_backup_stem(&stem));

        // Step 1: an ordinary ascending archive.
        {
            let server = MockServer::start().await;
            mount_identity_and_team(&server).await;
            mount_channel(&server, 3, 300).await;
            mount_posts_page(&server, &[], &["p3", "p2", "p1"], &[("p1", 100), ("p2", 200), ("p3", 300)], "", "").await;

            let mut client = test_client(&server).await;
            run(&mut client, &test_config(dir.path()), &never_cancelled).await.unwrap();
        }
        assert_eq!(data_file_ids(&data_path), vec!["p1", "p2", "p3"]);

        // Step 2: the user flips to newest-first. The existing ascending
        // archive is incompatible, so it gets backed up wholesale and the
        // channel is redownloaded from scratch in the new order.
        let mut config = test_config(dir.path());
        config.default_channel_options.download_from_oldest = Some(false);
        {
            let server = MockServer::start().await;
            mount_identity_and_team(&server).await;
            mount_channel(&server, 3, 300).await;
            mount_posts_page(&server, &[], &["p3", "p2", "p1"], &[("p1", 100), ("p2", 200), ("p3", 300)], "", "").await;

            let mut client = test_client(&server).await;
            run(&mut client, &config, &never_cancelled).await.unwrap();
        }

        assert_eq!(data_file_ids(&data_path), vec!["p3", "p2", "p1"]);
        let header = ChannelHeader::from_json(&Id(CHANNEL_ID.into()), &std::fs::read_to_string(&header_path).unwrap()).unwrap();
        assert_eq!(header.storage.as_ref().unwrap().organization, archive_core::store::PostOrdering::DescendingContinuous);

        assert!(backup_header.is_file(), "the original ascending header must survive as a backup");
        assert!(backup_data.is_file(), "the original ascending data file must survive as a backup");
        assert_eq!(data_file_ids(&backup_data), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn interrupted_append_rolls_back_to_the_pre_attempt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let stem = stems::public_channel_stem("town", "general");
        let (header_path, data_path) = archive_filenames(dir.path(), &stem);

        {
            let server = MockServer::start().await;
            mount_identity_and_team(&server).await;
            mount_channel(&server, 3, 300).await;
            mount_posts_page(&server, &[], &["p3", "p2", "p1"], &[("p1", 100), ("p2", 200), ("p3", 300)], "", "").await;

            let mut client = test_client(&server).await;
            run(&mut client, &config, &never_cancelled).await.unwrap();
        }

        let header_before = std::fs::read_to_string(&header_path).unwrap();
        let data_before = std::fs::read_to_string(&data_path).unwrap();

        // The channel has new posts, but cancellation is observed right
        // before the fetcher would issue its one page request — so no
        // posts mock is registered at all; an unexpected call here would
        // fail loudly instead of silently succeeding.
        {
            let server = MockServer::start().await;
            mount_identity_and_team(&server).await;
            mount_channel(&server, 4, 500).await;

            let mut client = test_client(&server).await;
            let polls = std::cell::Cell::new(0u32);
            let cancelled = || {
                polls.set(polls.get() + 1);
                polls.get() >= 2
            };
            run(&mut client, &config, &cancelled).await.unwrap();
        }

        assert_eq!(std::fs::read_to_string(&header_path).unwrap(), header_before);
        assert_eq!(std::fs::read_to_string(&data_path).unwrap(), data_before);
        assert!(!archive_filenames(dir.path(), &stems::primary_backup_stem(&stem)).0.is_file());
    }
}
