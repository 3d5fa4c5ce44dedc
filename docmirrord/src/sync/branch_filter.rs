//! Subtree pruning on the remote rollup timestamp. A folder's rollup is the newest modification
//! anywhere beneath it, so a rollup at or before the last sync proves the whole subtree is
//! unchanged. Nothing here talks to the network.

use docmirror_core::RemoteFolder;
use time::OffsetDateTime;

use super::timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchDecision {
    /// Unchanged subtree; `calls_saved` estimates the listing and version calls avoided.
    Skip { calls_saved: u64 },
    /// Rollup missing or unreadable, so the folder is expanded conservatively.
    NeedsCheck,
    Expand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectCheck {
    /// Every root rollup is at or before the last sync.
    Unchanged { newest_rollup: OffsetDateTime },
    Changed,
    /// No baseline, or some root carries no usable rollup.
    Unknown,
}

#[derive(Debug, Default)]
pub struct FilterResult {
    /// Folders to expand, in the order they were given.
    pub candidates: Vec<RemoteFolder>,
    pub skipped: Vec<String>,
    pub needs_check: usize,
    pub calls_saved: u64,
}

impl FilterResult {
    pub fn examined(&self) -> usize {
        self.candidates.len() + self.skipped.len()
    }
}

pub fn decide(
    rollup: Option<OffsetDateTime>,
    object_count: Option<u64>,
    last_sync: Option<OffsetDateTime>,
) -> BranchDecision {
    let Some(last_sync) = last_sync else {
        return BranchDecision::Expand;
    };
    match rollup {
        None => BranchDecision::NeedsCheck,
        Some(rollup) if rollup <= last_sync => BranchDecision::Skip {
            calls_saved: object_count.unwrap_or(0).saturating_mul(2).max(1),
        },
        Some(_) => BranchDecision::Expand,
    }
}

pub fn decide_folder(folder: &RemoteFolder, last_sync: Option<OffsetDateTime>) -> BranchDecision {
    decide(
        rollup_of(folder),
        folder.attributes.object_count,
        last_sync,
    )
}

pub fn project_level_check(
    roots: &[RemoteFolder],
    last_sync: Option<OffsetDateTime>,
) -> ProjectCheck {
    let Some(last_sync) = last_sync else {
        return ProjectCheck::Unknown;
    };
    let mut newest: Option<OffsetDateTime> = None;
    for root in roots {
        let Some(rollup) = rollup_of(root) else {
            return ProjectCheck::Unknown;
        };
        newest = Some(newest.map_or(rollup, |current| current.max(rollup)));
    }
    match newest {
        Some(newest) if newest <= last_sync => ProjectCheck::Unchanged {
            newest_rollup: newest,
        },
        Some(_) => ProjectCheck::Changed,
        None => ProjectCheck::Unknown,
    }
}

/// Applies [`decide`] to the project's top-level folders. Deeper levels are pruned by the
/// fetcher as it descends.
pub fn filter_roots(roots: Vec<RemoteFolder>, last_sync: Option<OffsetDateTime>) -> FilterResult {
    let mut result = FilterResult::default();
    for folder in roots {
        match decide_folder(&folder, last_sync) {
            BranchDecision::Skip { calls_saved } => {
                result.calls_saved += calls_saved;
                result.skipped.push(folder.id);
            }
            BranchDecision::NeedsCheck => {
                result.needs_check += 1;
                result.candidates.push(folder);
            }
            BranchDecision::Expand => result.candidates.push(folder),
        }
    }
    result
}

fn rollup_of(folder: &RemoteFolder) -> Option<OffsetDateTime> {
    timestamp::parse_opt(folder.attributes.last_modified_time_rollup.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmirror_core::{FolderAttributes, Relationships};
    use time::macros::datetime;

    fn root(id: &str, rollup: Option<&str>, objects: u64) -> RemoteFolder {
        RemoteFolder {
            id: id.to_string(),
            attributes: FolderAttributes {
                name: Some(id.to_string()),
                last_modified_time_rollup: rollup.map(str::to_string),
                object_count: Some(objects),
                ..FolderAttributes::default()
            },
            relationships: Relationships::default(),
        }
    }

    const LAST_SYNC: OffsetDateTime = datetime!(2024-01-05 00:00 UTC);

    #[test]
    fn equal_rollup_is_skipped() {
        assert_eq!(
            decide(Some(LAST_SYNC), Some(4), Some(LAST_SYNC)),
            BranchDecision::Skip { calls_saved: 8 }
        );
    }

    #[test]
    fn newer_rollup_expands_and_missing_needs_check() {
        assert_eq!(
            decide(Some(datetime!(2024-01-10 00:00 UTC)), None, Some(LAST_SYNC)),
            BranchDecision::Expand
        );
        assert_eq!(decide(None, Some(3), Some(LAST_SYNC)), BranchDecision::NeedsCheck);
        assert_eq!(decide(None, None, None), BranchDecision::Expand);
    }

    #[test]
    fn offsets_are_compared_in_utc() {
        // 2024-01-05T01:00+02:00 is 2024-01-04T23:00Z, before the last sync.
        let folder = root("a", Some("2024-01-05T01:00:00+02:00"), 1);
        assert!(matches!(
            decide_folder(&folder, Some(LAST_SYNC)),
            BranchDecision::Skip { .. }
        ));
    }

    #[test]
    fn project_unchanged_only_when_every_root_is_old() {
        let old = vec![
            root("a", Some("2024-01-01T00:00:00Z"), 1),
            root("b", Some("2024-01-04T00:00:00.0000000Z"), 1),
        ];
        assert_eq!(
            project_level_check(&old, Some(LAST_SYNC)),
            ProjectCheck::Unchanged {
                newest_rollup: datetime!(2024-01-04 00:00 UTC)
            }
        );

        let mut changed = old.clone();
        changed.push(root("c", Some("2024-01-10T00:00:00Z"), 1));
        assert_eq!(
            project_level_check(&changed, Some(LAST_SYNC)),
            ProjectCheck::Changed
        );

        let mut unknown = old;
        unknown.push(root("d", None, 1));
        assert_eq!(
            project_level_check(&unknown, Some(LAST_SYNC)),
            ProjectCheck::Unknown
        );
        assert_eq!(project_level_check(&[], None), ProjectCheck::Unknown);
    }

    #[test]
    fn filter_keeps_order_and_counts_savings() {
        let roots = vec![
            root("drawings", Some("2024-01-10T00:00:00Z"), 3),
            root("archive", Some("2023-12-01T00:00:00Z"), 10),
            root("garbled", Some("last tuesday"), 2),
        ];

        let result = filter_roots(roots, Some(LAST_SYNC));

        let ids: Vec<_> = result.candidates.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["drawings", "garbled"]);
        assert_eq!(result.skipped, vec!["archive".to_string()]);
        assert_eq!(result.needs_check, 1);
        assert_eq!(result.calls_saved, 20);
        assert_eq!(result.examined(), 3);
    }
}
