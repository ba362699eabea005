//! Template contexts for the survey page.

use rocket::request::FlashMessage;
use rocket::serde::Serialize;
use survey_common::catalog::Catalog;
use survey_common::submission::{EMAIL_FIELD, RANK_PREFIX, SCORE_PREFIX};
use survey_common::{Dataset, ImageGroup, ImageRef, MAX_SCORE};

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ImageContext {
    url: String,
    rank_field: String,
    score_field: String,
}

impl From<&ImageRef> for ImageContext {
    fn from(image: &ImageRef) -> Self {
        let id = image.id();
        Self {
            url: image.url(),
            rank_field: format!("{RANK_PREFIX}{id}"),
            score_field: format!("{SCORE_PREFIX}{id}"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct GroupContext {
    number: usize,
    label: Option<String>,
    original_url: Option<String>,
    adversarial: Vec<ImageContext>,
    /// Ranks a voter can pick from, one per adversarial image.
    ranks: Vec<usize>,
}

impl GroupContext {
    fn new(number: usize, group: &ImageGroup) -> Self {
        Self {
            number,
            label: group.label.clone(),
            original_url: group.original.as_ref().map(ImageRef::url),
            adversarial: group.adversarial.iter().map(ImageContext::from).collect(),
            ranks: (1..=group.adversarial.len()).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct DatasetContext {
    name: String,
    groups: Vec<GroupContext>,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct FlashContext {
    kind: String,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(crate = "rocket::serde")]
pub struct IndexContext {
    datasets: Vec<DatasetContext>,
    scores: Vec<u8>,
    email_field: &'static str,
    require_email: bool,
    flash: Option<FlashContext>,
}

impl IndexContext {
    pub fn new(catalog: &Catalog, require_email: bool, flash: Option<FlashMessage<'_>>) -> Self {
        let datasets = Dataset::ALL
            .into_iter()
            .map(|dataset| DatasetContext {
                name: dataset.to_string(),
                groups: catalog
                    .groups(dataset)
                    .iter()
                    .enumerate()
                    .map(|(i, group)| GroupContext::new(i + 1, group))
                    .collect(),
            })
            .collect();

        Self {
            datasets,
            scores: (1..=MAX_SCORE).collect(),
            email_field: EMAIL_FIELD,
            require_email,
            flash: flash.map(|f| FlashContext {
                kind: f.kind().to_string(),
                message: f.message().to_string(),
            }),
        }
    }
}
