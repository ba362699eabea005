//! Scan the image directories into an in-memory catalog.
//!
//! The expected layout under the image root is
//! `<dataset>/original/<label>` for the unperturbed images and
//! `<dataset>/<method>/<label>` for each adversarial method. Every file in
//! `original` is a label; every other directory is a method.

use crate::{Dataset, ImageGroup, ImageRef, MIN_GROUPS, ORIGINAL_DIR};
use anyhow::{Context, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// All image groups shown by the survey, built once at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    pub mnist: Vec<ImageGroup>,
    pub cifar: Vec<ImageGroup>,
    /// Ids of every image a voter may rank.
    #[serde(skip)]
    votable: HashSet<String>,
}

impl Catalog {
    /// Scan both datasets under `root`.
    ///
    /// # Errors
    /// Returns an error if either dataset directory (or its `original`
    /// directory) cannot be read.
    pub fn load<R: Rng + ?Sized>(root: &Path, rng: &mut R) -> Result<Self> {
        let mnist = load_dataset(root, Dataset::Mnist, rng)?;
        let cifar = load_dataset(root, Dataset::Cifar, rng)?;
        Ok(Self::from_groups(mnist, cifar))
    }

    pub fn from_groups(mnist: Vec<ImageGroup>, cifar: Vec<ImageGroup>) -> Self {
        let votable = mnist
            .iter()
            .chain(cifar.iter())
            .flat_map(|group| group.adversarial.iter().map(ImageRef::id))
            .collect();
        Self {
            mnist,
            cifar,
            votable,
        }
    }

    pub fn groups(&self, dataset: Dataset) -> &[ImageGroup] {
        match dataset {
            Dataset::Mnist => &self.mnist,
            Dataset::Cifar => &self.cifar,
        }
    }

    /// Whether `id` names an adversarial image that can be voted on.
    pub fn contains(&self, id: &str) -> bool {
        self.votable.contains(id)
    }

    pub fn votable_count(&self) -> usize {
        self.votable.len()
    }
}

struct Entry {
    name: String,
    is_dir: bool,
}

/// List a directory, skipping hidden entries and names that are not UTF-8.
fn read_entries(dir: &Path) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
        let Ok(name) = entry.file_name().into_string() else {
            log::warn!("Skipping non UTF-8 entry in {}", dir.display());
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry
            .file_type()
            .with_context(|| format!("reading type of {name}"))?
            .is_dir();
        entries.push(Entry { name, is_dir });
    }
    Ok(entries)
}

/// Build the image groups for one dataset, padded to [`MIN_GROUPS`].
///
/// Labels come out sorted. The adversarial images inside each group are
/// shuffled with `rng` so the page does not give away which method produced
/// which image.
///
/// # Errors
/// Returns an error if the dataset directory or its `original` directory
/// cannot be read.
pub fn load_dataset<R: Rng + ?Sized>(
    root: &Path,
    dataset: Dataset,
    rng: &mut R,
) -> Result<Vec<ImageGroup>> {
    let dataset_dir = root.join(dataset.dir_name());

    let mut labels: Vec<String> = read_entries(&dataset_dir.join(ORIGINAL_DIR))?
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| e.name)
        .collect();
    labels.sort();

    // sorted first so a seeded rng gives the same page every time
    let mut methods: Vec<String> = read_entries(&dataset_dir)?
        .into_iter()
        .filter(|e| e.is_dir && e.name != ORIGINAL_DIR)
        .map(|e| e.name)
        .collect();
    methods.sort();

    let mut groups = Vec::with_capacity(labels.len().max(MIN_GROUPS));
    for label in labels {
        let mut adversarial: Vec<ImageRef> = methods
            .iter()
            .filter(|method| dataset_dir.join(method).join(&label).is_file())
            .map(|method| ImageRef::new(dataset, method.as_str(), label.as_str()))
            .collect();
        adversarial.shuffle(rng);

        groups.push(ImageGroup {
            original: Some(ImageRef::new(dataset, ORIGINAL_DIR, label.as_str())),
            label: Some(label),
            adversarial,
        });
    }

    log::info!(
        "Loaded {} groups across {} methods for {dataset}",
        groups.len(),
        methods.len()
    );
    pad_groups(&mut groups);
    Ok(groups)
}

/// Append empty groups until there are at least [`MIN_GROUPS`].
fn pad_groups(groups: &mut Vec<ImageGroup>) {
    if groups.len() < MIN_GROUPS {
        groups.resize_with(MIN_GROUPS, ImageGroup::default);
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.contains(['/', '\\', '\0'])
}

/// Map a requested image to a path under `root`.
/// Returns `None` for unknown datasets or any segment that could escape the root.
pub fn resolve_image(root: &Path, dataset: &str, method: &str, file: &str) -> Option<PathBuf> {
    let dataset = Dataset::from_dir_name(dataset)?;
    if !is_safe_segment(method) || !is_safe_segment(file) {
        return None;
    }
    Some(root.join(dataset.dir_name()).join(method).join(file))
}
