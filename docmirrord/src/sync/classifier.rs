use std::collections::BTreeMap;

use serde::Serialize;
use time::OffsetDateTime;

use super::metrics;
use super::model::FileRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    New,
    Modified,
    NoTimestamp,
    ParseFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFile {
    pub file: FileRecord,
    pub reason: ChangeReason,
}

#[derive(Debug, Default)]
pub struct Classification {
    pub needs_update: Vec<ClassifiedFile>,
    pub skipped: Vec<FileRecord>,
}

impl Classification {
    pub fn total(&self) -> usize {
        self.needs_update.len() + self.skipped.len()
    }

    pub fn skip_efficiency(&self) -> f64 {
        metrics::efficiency(self.skipped.len() as u64, self.total() as u64)
    }

    pub fn reason_counts(&self) -> BTreeMap<ChangeReason, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.needs_update {
            *counts.entry(entry.reason).or_insert(0) += 1;
        }
        counts
    }
}

/// Decides per file whether it changed after `last_sync`. A missing or malformed modification
/// time always counts as changed.
pub fn classify(files: Vec<FileRecord>, last_sync: OffsetDateTime) -> Classification {
    let mut classification = Classification::default();
    for file in files {
        match reason_for(&file, last_sync) {
            Some(reason) => classification
                .needs_update
                .push(ClassifiedFile { file, reason }),
            None => classification.skipped.push(file),
        }
    }
    classification
}

fn reason_for(file: &FileRecord, last_sync: OffsetDateTime) -> Option<ChangeReason> {
    let modified = match (&file.last_modified_raw, file.last_modified_time) {
        (_, Some(modified)) => modified,
        (None, None) => return Some(ChangeReason::NoTimestamp),
        (Some(_), None) => return Some(ChangeReason::ParseFailed),
    };
    if file.create_time.is_some_and(|created| created > last_sync) {
        return Some(ChangeReason::New);
    }
    (modified > last_sync).then_some(ChangeReason::Modified)
}
