//! A library with common utilities for the adversarial image survey.

pub mod catalog;
pub mod results;
pub mod submission;
pub mod summary;

pub use anyhow::{Error, Result};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Each dataset is padded with empty groups up to this many.
pub const MIN_GROUPS: usize = 20;
/// Highest score a voter can give a single image.
pub const MAX_SCORE: u8 = 5;
/// Name of the directory holding the unperturbed images.
pub const ORIGINAL_DIR: &str = "original";
/// Route prefix that image URLs are served under.
pub const IMAGE_URL_PREFIX: &str = "/vc";

/// Each image dataset the survey knows about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Mnist,
    Cifar,
}

impl Dataset {
    pub const ALL: [Dataset; 2] = [Dataset::Mnist, Dataset::Cifar];

    /// Directory name under the image root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Dataset::Mnist => "mnist",
            Dataset::Cifar => "cifar",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.dir_name() == name)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// How results are laid out in the CSV file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResultsLayout {
    /// One row per form field: the key followed by every submitted value.
    Raw,
    /// One row per image, with a rank and score column per voter.
    Merged,
}

/// A single image on disk, relative to the image root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ImageRef {
    pub dataset: Dataset,
    pub method: String,
    pub file: String,
}

impl ImageRef {
    pub fn new(dataset: Dataset, method: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            dataset,
            method: method.into(),
            file: file.into(),
        }
    }

    /// Stable identifier used in form field names and CSV rows.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.dataset, self.method, self.file)
    }

    pub fn url(&self) -> String {
        format!("{IMAGE_URL_PREFIX}/{}", self.id())
    }

    /// Parse an id of the form `dataset/method/file`.
    pub fn parse_id(id: &str) -> Option<Self> {
        let mut parts = id.splitn(3, '/');
        let dataset = Dataset::from_dir_name(parts.next()?)?;
        let method = parts.next().filter(|s| !s.is_empty())?;
        let file = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
        Some(Self::new(dataset, method, file))
    }
}

/// One original image and its adversarial counterparts.
/// Padding groups have no label and no images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageGroup {
    pub label: Option<String>,
    pub original: Option<ImageRef>,
    pub adversarial: Vec<ImageRef>,
}

impl ImageGroup {
    pub fn is_padding(&self) -> bool {
        self.original.is_none()
    }
}

/// A voter's judgement of one adversarial image.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Vote {
    pub rank: Option<u32>,
    pub score: Option<u8>,
}

impl Vote {
    pub fn is_empty(&self) -> bool {
        self.rank.is_none() && self.score.is_none()
    }
}
