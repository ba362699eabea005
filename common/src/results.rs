//! Persist survey submissions to a CSV file.
//!
//! Two layouts are supported. [`ResultsLayout::Raw`] appends every posted
//! form field as its own row. [`ResultsLayout::Merged`] keeps one row per
//! image and a `rank_<voter>`/`score_<voter>` column pair per voter, so a
//! voter who submits again overwrites their earlier cells.
//!
//! All access goes through one lock, so concurrent requests in the same
//! process cannot interleave a read-modify-write.

use crate::submission::{EMAIL_FIELD, FormFields, RANK_PREFIX, SCORE_PREFIX, Submission};
use crate::{ResultsLayout, Vote};
use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const IMAGE_COLUMN: &str = "image_id";
const RANK_COLUMN_PREFIX: &str = "rank_";
const SCORE_COLUMN_PREFIX: &str = "score_";
const ANONYMOUS_PREFIX: &str = "anon-";

/// What happened to a submission handed to [`ResultsStore::record`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Written as a new response.
    Recorded,
    /// Replaced an earlier response from the same voter.
    Updated,
    /// Rejected because the email already submitted. Nothing was written.
    Duplicate,
}

/// One recorded judgement read back from the results file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub image: String,
    /// The voter's email, or an `anon-<n>` key numbered in recording order.
    pub voter: String,
    pub vote: Vote,
}

pub struct ResultsStore {
    path: PathBuf,
    layout: ResultsLayout,
    dedup_by_email: bool,
    lock: Mutex<()>,
}

impl ResultsStore {
    /// Prepare a store writing to `path`, creating its parent directory.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created.
    pub fn open(
        path: impl Into<PathBuf>,
        layout: ResultsLayout,
        dedup_by_email: bool,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating results directory {}", parent.display()))?;
        }
        Ok(Self {
            path,
            layout,
            dedup_by_email,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> ResultsLayout {
        self.layout
    }

    pub fn dedup_by_email(&self) -> bool {
        self.dedup_by_email
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("results lock poisoned by an earlier panic"))
    }

    /// Write a validated submission. `fields` is the raw form it came from.
    ///
    /// # Errors
    /// Returns an error if the results file cannot be read or written.
    pub fn record(&self, submission: &Submission, fields: &FormFields) -> Result<RecordOutcome> {
        let _guard = self.guard()?;
        match self.layout {
            ResultsLayout::Raw => self.record_raw(submission, fields),
            ResultsLayout::Merged => self.record_merged(submission),
        }
    }

    fn record_raw(&self, submission: &Submission, fields: &FormFields) -> Result<RecordOutcome> {
        if self.dedup_by_email
            && let Some(email) = &submission.email
            && raw_has_email(&self.path, email)?
        {
            log::info!("Rejected duplicate submission from {email}");
            return Ok(RecordOutcome::Duplicate);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_writer(file);
        for (key, values) in fields.iter() {
            writer.write_record(std::iter::once(key).chain(values.iter().map(String::as_str)))?;
        }
        sync_writer(writer)?;

        log::info!(
            "Appended {} votes to {}",
            submission.votes.len(),
            self.path.display()
        );
        Ok(RecordOutcome::Recorded)
    }

    fn record_merged(&self, submission: &Submission) -> Result<RecordOutcome> {
        let mut table = MergedTable::load(&self.path)?;

        let voter = match &submission.email {
            Some(email) => email.clone(),
            None => table.next_anonymous_voter(),
        };
        let existing = table.has_voter(&voter);
        if existing && self.dedup_by_email && submission.email.is_some() {
            log::info!("Rejected duplicate submission from {voter}");
            return Ok(RecordOutcome::Duplicate);
        }

        let (rank_col, score_col) = table.voter_columns(&voter);
        for (image, vote) in &submission.votes {
            let row = table.row_for(image);
            row[rank_col] = vote.rank.map(|r| r.to_string()).unwrap_or_default();
            row[score_col] = vote.score.map(|s| s.to_string()).unwrap_or_default();
        }
        table.save(&self.path)?;

        log::info!(
            "Merged {} votes from {voter} into {}",
            submission.votes.len(),
            self.path.display()
        );
        Ok(if existing {
            RecordOutcome::Updated
        } else {
            RecordOutcome::Recorded
        })
    }

    /// Read every recorded judgement back. A missing file has none.
    ///
    /// # Errors
    /// Returns an error if the results file exists but cannot be parsed.
    pub fn observations(&self) -> Result<Vec<Observation>> {
        let _guard = self.guard()?;
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        match self.layout {
            ResultsLayout::Raw => raw_observations(&self.path),
            ResultsLayout::Merged => Ok(MergedTable::load(&self.path)?.observations()),
        }
    }

    /// The whole results file as written so far, or `None` if nothing has been recorded.
    ///
    /// # Errors
    /// Returns an error if the results file exists but cannot be read.
    pub fn contents(&self) -> Result<Option<Vec<u8>>> {
        let _guard = self.guard()?;
        if !self.path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read(&self.path).with_context(|| format!("reading {}", self.path.display()))?;
        Ok(Some(contents))
    }
}

/// Flush the csv writer and push the file to disk.
fn sync_writer(writer: csv::Writer<File>) -> Result<()> {
    let file = writer
        .into_inner()
        .map_err(|err| anyhow!("flushing results: {}", err.error()))?;
    file.sync_all().context("syncing results file")?;
    Ok(())
}

fn raw_reader(path: &Path) -> Result<Option<csv::Reader<File>>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    Ok(Some(reader))
}

fn raw_has_email(path: &Path, email: &str) -> Result<bool> {
    let Some(mut reader) = raw_reader(path)? else {
        return Ok(false);
    };
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", path.display()))?;
        if record.get(0) == Some(EMAIL_FIELD)
            && record
                .iter()
                .skip(1)
                .any(|value| value.trim().to_lowercase() == email)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_cell<T: std::str::FromStr>(cell: &str, image: &str) -> Option<T> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    let parsed = cell.parse().ok();
    if parsed.is_none() {
        log::warn!("Ignoring unreadable value '{cell}' for {image}");
    }
    parsed
}

/// Rows of one raw-layout response while it is being regrouped.
#[derive(Default)]
struct RawResponse {
    voter: Option<String>,
    votes: Vec<(String, Vote)>,
}

impl RawResponse {
    fn vote_mut(&mut self, image: &str) -> &mut Vote {
        let index = match self.votes.iter().position(|(i, _)| i == image) {
            Some(index) => index,
            None => {
                self.votes.push((image.to_string(), Vote::default()));
                self.votes.len() - 1
            }
        };
        &mut self.votes[index].1
    }

    fn has_field(&self, image: &str, is_rank: bool) -> bool {
        self.votes.iter().any(|(i, vote)| {
            i == image
                && if is_rank {
                    vote.rank.is_some()
                } else {
                    vote.score.is_some()
                }
        })
    }

    fn flush_into(&mut self, observations: &mut Vec<Observation>, anonymous: &mut usize) {
        let voter = self.voter.take();
        if self.votes.iter().all(|(_, vote)| vote.is_empty()) {
            self.votes.clear();
            return;
        }
        let voter = voter.unwrap_or_else(|| {
            *anonymous += 1;
            format!("{ANONYMOUS_PREFIX}{anonymous}")
        });
        for (image, vote) in self.votes.drain(..) {
            if !vote.is_empty() {
                observations.push(Observation {
                    image,
                    voter: voter.clone(),
                    vote,
                });
            }
        }
    }
}

/// Read the raw layout back as one observation per image per response.
/// A response ends at the next `email` row, or when a rank or score repeats
/// for an image already seen in the current response.
fn raw_observations(path: &Path) -> Result<Vec<Observation>> {
    let Some(mut reader) = raw_reader(path)? else {
        return Ok(Vec::new());
    };
    let mut observations = Vec::new();
    let mut response = RawResponse::default();
    let mut anonymous = 0;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", path.display()))?;
        let Some(key) = record.get(0) else {
            continue;
        };
        let value = record.iter().skip(1).map(str::trim).find(|v| !v.is_empty());

        if key == EMAIL_FIELD {
            response.flush_into(&mut observations, &mut anonymous);
            response.voter = value.map(str::to_lowercase);
            continue;
        }
        let (image, is_rank) = if let Some(image) = key.strip_prefix(RANK_PREFIX) {
            (image, true)
        } else if let Some(image) = key.strip_prefix(SCORE_PREFIX) {
            (image, false)
        } else {
            continue;
        };
        let Some(value) = value else {
            continue;
        };

        if response.has_field(image, is_rank) {
            response.flush_into(&mut observations, &mut anonymous);
        }
        if is_rank {
            let rank = parse_cell(value, image);
            response.vote_mut(image).rank = rank;
        } else {
            let score = parse_cell(value, image);
            response.vote_mut(image).score = score;
        }
    }
    response.flush_into(&mut observations, &mut anonymous);
    Ok(observations)
}

/// The merged layout held in memory: a header and equally wide rows.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MergedTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Default for MergedTable {
    fn default() -> Self {
        Self {
            header: vec![IMAGE_COLUMN.to_string()],
            rows: Vec::new(),
        }
    }
}

impl MergedTable {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let header: Vec<String> = reader
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();
        if header.is_empty() {
            return Ok(Self::default());
        }
        if header.first().map(String::as_str) != Some(IMAGE_COLUMN) {
            return Err(anyhow!(
                "{} is not a merged results file (first column is not {IMAGE_COLUMN})",
                path.display()
            ));
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("reading {}", path.display()))?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            if row.len() > header.len() {
                log::warn!(
                    "Dropping {} cells past the header in row for {} of {}",
                    row.len() - header.len(),
                    row.first().map_or("", String::as_str),
                    path.display()
                );
            }
            row.resize(header.len(), String::new());
            rows.push(row);
        }
        Ok(Self { header, rows })
    }

    fn save(&self, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("results path {} has no file name", path.display()))?;
        let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

        let file = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        let mut writer = csv::WriterBuilder::new().from_writer(file);
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        sync_writer(writer)?;

        fs::rename(&tmp_path, path)
            .with_context(|| format!("replacing {} with {}", path.display(), tmp_path.display()))?;
        Ok(())
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    fn voters(&self) -> impl Iterator<Item = &str> {
        self.header
            .iter()
            .filter_map(|h| h.strip_prefix(RANK_COLUMN_PREFIX))
    }

    fn has_voter(&self, voter: &str) -> bool {
        self.voters().any(|v| v == voter)
    }

    fn next_anonymous_voter(&self) -> String {
        let count = self
            .voters()
            .filter(|v| v.starts_with(ANONYMOUS_PREFIX))
            .count();
        format!("{ANONYMOUS_PREFIX}{}", count + 1)
    }

    /// Column indices for a voter, adding the pair if it is new.
    fn voter_columns(&mut self, voter: &str) -> (usize, usize) {
        let rank_name = format!("{RANK_COLUMN_PREFIX}{voter}");
        let score_name = format!("{SCORE_COLUMN_PREFIX}{voter}");
        let rank_col = self.column(&rank_name).unwrap_or_else(|| self.add_column(rank_name));
        let score_col = self
            .column(&score_name)
            .unwrap_or_else(|| self.add_column(score_name));
        (rank_col, score_col)
    }

    fn add_column(&mut self, name: String) -> usize {
        self.header.push(name);
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.header.len() - 1
    }

    /// Row for an image, appended if it is new.
    fn row_for(&mut self, image: &str) -> &mut Vec<String> {
        let index = match self.rows.iter().position(|row| row[0] == image) {
            Some(index) => index,
            None => {
                let mut row = vec![String::new(); self.header.len()];
                row[0] = image.to_string();
                self.rows.push(row);
                self.rows.len() - 1
            }
        };
        &mut self.rows[index]
    }

    fn observations(&self) -> Vec<Observation> {
        let voter_columns: Vec<(&str, usize, Option<usize>)> = self
            .header
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                let voter = h.strip_prefix(RANK_COLUMN_PREFIX)?;
                Some((voter, i, self.column(&format!("{SCORE_COLUMN_PREFIX}{voter}"))))
            })
            .collect();

        let mut observations = Vec::new();
        for row in &self.rows {
            let image = row[0].as_str();
            for &(voter, rank_col, score_col) in &voter_columns {
                let vote = Vote {
                    rank: parse_cell(&row[rank_col], image),
                    score: score_col.and_then(|col| parse_cell(&row[col], image)),
                };
                if !vote.is_empty() {
                    observations.push(Observation {
                        image: image.to_string(),
                        voter: voter.to_string(),
                        vote,
                    });
                }
            }
        }
        observations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::summarize;
    use std::collections::BTreeMap;

    fn create_test_submission(email: Option<&str>, votes: &[(&str, u32, u8)]) -> Submission {
        Submission {
            email: email.map(str::to_string),
            votes: votes
                .iter()
                .map(|&(image, rank, score)| {
                    (
                        image.to_string(),
                        Vote {
                            rank: Some(rank),
                            score: Some(score),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn create_test_fields(email: Option<&str>, votes: &[(&str, u32, u8)]) -> FormFields {
        let mut fields = FormFields::default();
        if let Some(email) = email {
            fields.push(EMAIL_FIELD.to_string(), email.to_string());
        }
        for (image, rank, score) in votes {
            fields.push(format!("{RANK_PREFIX}{image}"), rank.to_string());
            fields.push(format!("{SCORE_PREFIX}{image}"), score.to_string());
        }
        fields
    }

    fn record(
        store: &ResultsStore,
        email: Option<&str>,
        votes: &[(&str, u32, u8)],
    ) -> RecordOutcome {
        store
            .record(
                &create_test_submission(email, votes),
                &create_test_fields(email, votes),
            )
            .unwrap()
    }

    #[test_log::test]
    fn test_raw_layout_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultsStore::open(&path, ResultsLayout::Raw, false).unwrap();

        let votes = [("mnist/fgsm/0.png", 1, 5), ("mnist/pgd/0.png", 2, 3)];
        assert_eq!(record(&store, Some("a@b.org"), &votes), RecordOutcome::Recorded);
        assert_eq!(record(&store, Some("a@b.org"), &votes), RecordOutcome::Recorded);

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 10);
        assert_eq!(contents.lines().next(), Some("email,a@b.org"));
        assert_eq!(contents.lines().nth(1), Some("rank:mnist/fgsm/0.png,1"));

        let observations = store.observations().unwrap();
        assert_eq!(observations.len(), 4);
        assert_eq!(
            observations[0],
            Observation {
                image: "mnist/fgsm/0.png".to_string(),
                voter: "a@b.org".to_string(),
                vote: Vote {
                    rank: Some(1),
                    score: Some(5)
                },
            }
        );
    }

    #[test_log::test]
    fn test_raw_anonymous_responses_split_on_repeated_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultsStore::open(&path, ResultsLayout::Raw, false).unwrap();

        let votes = [("mnist/fgsm/0.png", 1, 5)];
        record(&store, None, &votes);
        record(&store, None, &[("mnist/fgsm/0.png", 2, 1)]);

        let votes: Vec<(String, Vote)> = store
            .observations()
            .unwrap()
            .into_iter()
            .map(|o| (o.voter, o.vote))
            .collect();
        assert_eq!(
            votes,
            vec![
                (
                    "anon-1".to_string(),
                    Vote {
                        rank: Some(1),
                        score: Some(5)
                    }
                ),
                (
                    "anon-2".to_string(),
                    Vote {
                        rank: Some(2),
                        score: Some(1)
                    }
                ),
            ]
        );
    }

    #[test_log::test]
    fn test_layouts_count_the_same_votes() {
        let dir = tempfile::tempdir().unwrap();
        let raw = ResultsStore::open(dir.path().join("raw.csv"), ResultsLayout::Raw, false).unwrap();
        let merged =
            ResultsStore::open(dir.path().join("merged.csv"), ResultsLayout::Merged, false)
                .unwrap();

        let first = [("mnist/fgsm/0.png", 1, 5), ("mnist/pgd/0.png", 2, 3)];
        let second = [("mnist/fgsm/0.png", 2, 2), ("cifar/cw/cat.png", 1, 4)];
        for store in [&raw, &merged] {
            record(store, Some("a@b.org"), &first);
            record(store, Some("c@d.org"), &second);
            record(store, None, &first);
        }

        let raw_summary = summarize(&raw.observations().unwrap());
        let merged_summary = summarize(&merged.observations().unwrap());
        assert_eq!(raw_summary.voters, merged_summary.voters);
        assert_eq!(raw_summary.methods, merged_summary.methods);
        assert_eq!(raw_summary.voters, 3);
        assert_eq!(raw_summary.methods[0].method, "fgsm");
        assert_eq!(raw_summary.methods[0].votes, 3);
    }

    #[test_log::test]
    fn test_raw_dedup_lowercases_non_ascii_emails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultsStore::open(&path, ResultsLayout::Raw, true).unwrap();

        let votes = [("mnist/fgsm/0.png", 1, 5)];
        let submission = create_test_submission(Some("émile@x.org"), &votes);
        let fields = create_test_fields(Some("Émile@X.org"), &votes);
        assert_eq!(
            store.record(&submission, &fields).unwrap(),
            RecordOutcome::Recorded
        );
        assert_eq!(
            store.record(&submission, &fields).unwrap(),
            RecordOutcome::Duplicate
        );
    }

    #[test_log::test]
    fn test_contents_reads_what_was_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultsStore::open(&path, ResultsLayout::Raw, false).unwrap();
        assert_eq!(store.contents().unwrap(), None);

        record(&store, Some("a@b.org"), &[("mnist/fgsm/0.png", 1, 5)]);
        assert_eq!(
            store.contents().unwrap(),
            Some(fs::read(&path).unwrap())
        );
    }

    #[test_log::test]
    fn test_raw_layout_rejects_repeat_email() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.csv");
        let store = ResultsStore::open(&path, ResultsLayout::Raw, true).unwrap();

        let votes = [("cifar/cw/cat.png", 1, 2)];
        assert_eq!(record(&store, Some("a@b.org"), &votes), RecordOutcome::Recorded);
        let before = fs::read_to_string(&path).unwrap();
        assert_eq!(record(&store, Some("a@b.org"), &votes), RecordOutcome::Duplicate);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(record(&store, Some("c@d.org"), &votes), RecordOutcome::Recorded);
    }

    #[test_log::test]
    fn test_merged_layout_tracks_voter_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultsStore::open(&path, ResultsLayout::Merged, false).unwrap();

        let first = [("mnist/fgsm/0.png", 1, 5), ("mnist/pgd/0.png", 2, 3)];
        record(&store, Some("a@b.org"), &first);
        record(&store, Some("c@d.org"), &[("mnist/pgd/0.png", 1, 4)]);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "image_id,rank_a@b.org,score_a@b.org,rank_c@d.org,score_c@d.org",
                "mnist/fgsm/0.png,1,5,,",
                "mnist/pgd/0.png,2,3,1,4",
            ]
        );
    }

    #[test_log::test]
    fn test_merged_layout_repeat_voter_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultsStore::open(&path, ResultsLayout::Merged, false).unwrap();

        let first = [("mnist/fgsm/0.png", 1, 5), ("mnist/pgd/0.png", 2, 3)];
        let second = [("mnist/pgd/0.png", 1, 1), ("cifar/cw/cat.png", 1, 2)];
        record(&store, Some("a@b.org"), &first);
        let outcome = record(&store, Some("a@b.org"), &second);
        assert_eq!(outcome, RecordOutcome::Updated);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "image_id,rank_a@b.org,score_a@b.org",
                "mnist/fgsm/0.png,1,5",
                "mnist/pgd/0.png,1,1",
                "cifar/cw/cat.png,1,2",
            ]
        );
        assert!(!dir.path().join(".results.csv.tmp").exists());
    }

    #[test_log::test]
    fn test_merged_layout_dedup_and_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultsStore::open(&path, ResultsLayout::Merged, true).unwrap();

        let votes = [("mnist/fgsm/0.png", 1, 5)];
        assert_eq!(record(&store, Some("a@b.org"), &votes), RecordOutcome::Recorded);
        assert_eq!(record(&store, Some("a@b.org"), &votes), RecordOutcome::Duplicate);
        assert_eq!(record(&store, None, &votes), RecordOutcome::Recorded);
        assert_eq!(record(&store, None, &votes), RecordOutcome::Recorded);

        let voters: Vec<String> = store
            .observations()
            .unwrap()
            .into_iter()
            .map(|o| o.voter)
            .collect();
        assert_eq!(
            voters,
            vec![
                "a@b.org".to_string(),
                "anon-1".to_string(),
                "anon-2".to_string(),
            ]
        );
    }

    #[test_log::test]
    fn test_merged_layout_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(&path, "email,a@b.org\n").unwrap();
        let store = ResultsStore::open(&path, ResultsLayout::Merged, false).unwrap();
        assert!(store.observations().is_err());
    }

    #[test_log::test]
    fn test_merged_layout_starts_over_on_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(&path, "").unwrap();
        let store = ResultsStore::open(&path, ResultsLayout::Merged, false).unwrap();

        assert!(store.observations().unwrap().is_empty());
        assert_eq!(
            record(&store, Some("a@b.org"), &[("mnist/fgsm/0.png", 1, 5)]),
            RecordOutcome::Recorded
        );
        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec!["image_id,rank_a@b.org,score_a@b.org", "mnist/fgsm/0.png,1,5"]
        );
    }

    #[test_log::test]
    fn test_merged_layout_drops_cells_past_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(
            &path,
            "image_id,rank_a@b.org,score_a@b.org\nmnist/fgsm/0.png,1,5,stray\n",
        )
        .unwrap();
        let store = ResultsStore::open(&path, ResultsLayout::Merged, false).unwrap();

        assert_eq!(
            store.observations().unwrap(),
            vec![Observation {
                image: "mnist/fgsm/0.png".to_string(),
                voter: "a@b.org".to_string(),
                vote: Vote {
                    rank: Some(1),
                    score: Some(5)
                },
            }]
        );
        record(&store, Some("c@d.org"), &[("mnist/fgsm/0.png", 2, 2)]);
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents.lines().nth(1),
            Some("mnist/fgsm/0.png,1,5,2,2")
        );
    }

    #[test_log::test]
    fn test_observations_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let store = ResultsStore::open(path, ResultsLayout::Merged, false).unwrap();
        assert!(store.observations().unwrap().is_empty());
    }

    #[test_log::test]
    fn test_concurrent_merged_writes_keep_every_voter() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            ResultsStore::open(dir.path().join("results.csv"), ResultsLayout::Merged, false)
                .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let email = format!("voter{i}@example.org");
                    record(&store, Some(email.as_str()), &[("mnist/fgsm/0.png", 1, 3)]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.observations().unwrap().len(), 8);
    }
}
