//! Parse a posted survey form into a voter's submission.

use crate::catalog::Catalog;
use crate::{MAX_SCORE, Vote};
use std::collections::BTreeMap;
use thiserror::Error;

pub const EMAIL_FIELD: &str = "email";
pub const RANK_PREFIX: &str = "rank:";
pub const SCORE_PREFIX: &str = "score:";

/// Every field of a url-encoded form, keeping all values for repeated keys.
/// Keys stay in the order they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormFields {
    entries: Vec<(String, Vec<String>)>,
}

impl FormFields {
    /// Decode an `application/x-www-form-urlencoded` body.
    pub fn parse(body: &str) -> Self {
        let mut fields = Self::default();
        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            fields.push(key.into_owned(), value.into_owned());
        }
        fields
    }

    pub fn push(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// First non-blank value for `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, values)| values.iter().map(|v| v.trim()).find(|v| !v.is_empty()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a posted form could not be turned into a submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("An email address is required.")]
    MissingEmail,

    #[error("'{0}' is not a valid email address.")]
    InvalidEmail(String),

    #[error("Field '{field}' expects a number, got '{value}'.")]
    InvalidNumber { field: String, value: String },

    #[error("Score {score} for {image} is outside 1 to {max}.", max = MAX_SCORE)]
    ScoreOutOfRange { image: String, score: u32 },

    #[error("Rank for {image} must start at 1.")]
    ZeroRank { image: String },

    #[error("Unknown image {0}.")]
    UnknownImage(String),

    #[error("Nothing to record, please rank some images.")]
    Empty,
}

/// A validated submission from one voter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    /// Trimmed, lowercased email if one was given.
    pub email: Option<String>,
    /// Votes keyed by image id.
    pub votes: BTreeMap<String, Vote>,
}

fn parse_number(field: &str, value: &str) -> Result<u32, SubmissionError> {
    value
        .parse::<u32>()
        .map_err(|_| SubmissionError::InvalidNumber {
            field: field.to_string(),
            value: value.to_string(),
        })
}

fn normalize_email(raw: &str) -> Result<String, SubmissionError> {
    let email = raw.trim().to_lowercase();
    let valid = email
        .split_once('@')
        .is_some_and(|(user, domain)| !user.is_empty() && domain.contains('.'))
        && !email.contains(char::is_whitespace)
        && !email.contains(',');
    if valid {
        Ok(email)
    } else {
        Err(SubmissionError::InvalidEmail(raw.trim().to_string()))
    }
}

impl Submission {
    /// Validate the posted fields against the catalog.
    ///
    /// # Errors
    /// Returns a [`SubmissionError`] describing the first problem found.
    pub fn from_fields(
        fields: &FormFields,
        catalog: &Catalog,
        require_email: bool,
    ) -> Result<Self, SubmissionError> {
        let email = fields.first(EMAIL_FIELD).map(normalize_email).transpose()?;
        if require_email && email.is_none() {
            return Err(SubmissionError::MissingEmail);
        }

        let mut votes: BTreeMap<String, Vote> = BTreeMap::new();
        for (key, _) in fields.iter() {
            let (image, is_rank) = if let Some(image) = key.strip_prefix(RANK_PREFIX) {
                (image, true)
            } else if let Some(image) = key.strip_prefix(SCORE_PREFIX) {
                (image, false)
            } else {
                continue;
            };
            let Some(value) = fields.first(key) else {
                continue;
            };
            if !catalog.contains(image) {
                return Err(SubmissionError::UnknownImage(image.to_string()));
            }

            let number = parse_number(key, value)?;
            let vote = votes.entry(image.to_string()).or_default();
            if is_rank {
                if number == 0 {
                    return Err(SubmissionError::ZeroRank {
                        image: image.to_string(),
                    });
                }
                vote.rank = Some(number);
            } else {
                match u8::try_from(number) {
                    Ok(score) if (1..=MAX_SCORE).contains(&score) => vote.score = Some(score),
                    _ => {
                        return Err(SubmissionError::ScoreOutOfRange {
                            image: image.to_string(),
                            score: number,
                        });
                    }
                }
            }
        }

        if votes.is_empty() {
            return Err(SubmissionError::Empty);
        }
        Ok(Self { email, votes })
    }
}
