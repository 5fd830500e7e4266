//! Filename stems for per-channel archive pairs, per the channel-kind
//! prefix convention (`d.`/`g.`/`o.`/`p.`) and the backup-slot naming
//! scheme (`--backup`, `--backup~N`).

/// `d.<localUser>--<otherUser>`
pub fn direct_channel_stem(local_user_name: &str, other_user_name: &str) -> String {
    format!("d.{local_user_name}--{other_user_name}")
}

/// `g.<member1>-<member2>-...`, members already sorted by username.
pub fn group_channel_stem(member_names: &[String]) -> String {
    format!("g.{}", member_names.join("-"))
}

/// `o.<teamInternal>--<channelInternal>`
pub fn public_channel_stem(team_internal_name: &str, channel_internal_name: &str) -> String {
    format!("o.{team_internal_name}--{channel_internal_name}")
}

/// `p.<teamInternal>--<channelInternal>`
pub fn private_channel_stem(team_internal_name: &str, channel_internal_name: &str) -> String {
    format!("p.{team_internal_name}--{channel_internal_name}")
}

pub fn primary_backup_stem(channel_stem: &str) -> String {
    format!("{channel_stem}--backup")
}

/// Infinite sequence of alternate backup stems (`--backup~1`, `--backup~2`, ...),
/// used when the primary backup slot is already occupied.
pub fn alternate_backup_stems(channel_stem: &str) -> impl Iterator<Item = String> + '_ {
    (1..).map(move |n| format!("{channel_stem}--backup~{n}"))
}

/// Directory name for a channel's attachment files.
pub fn files_dir_name(channel_stem: &str) -> String {
    format!("{channel_stem}--files")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_follow_the_channel_kind_prefix_convention() {
        assert_eq!(direct_channel_stem("alice", "bob"), "d.alice--bob");
        assert_eq!(group_channel_stem(&["alice".into(), "bob".into(), "carl".into()]), "g.alice-bob-carl");
        assert_eq!(public_channel_stem("town", "general"), "o.town--general");
        assert_eq!(private_channel_stem("town", "secret"), "p.town--secret");
        assert_eq!(primary_backup_stem("o.town--general"), "o.town--general--backup");
    }

    #[test]
    fn alternate_backup_stems_increment() {
        let mut iter = alternate_backup_stems("o.town--general");
        assert_eq!(iter.next().unwrap(), "o.town--general--backup~1");
        assert_eq!(iter.next().unwrap(), "o.town--general--backup~2");
    }
}
