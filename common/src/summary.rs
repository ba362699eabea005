//! Aggregate recorded votes per dataset and adversarial method.

use crate::results::Observation;
use crate::{Dataset, ImageRef};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodSummary {
    pub dataset: Dataset,
    pub method: String,
    pub votes: usize,
    pub mean_rank: Option<f64>,
    pub mean_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub generated_at: DateTime<Utc>,
    /// Distinct voters, anonymous responses included.
    pub voters: usize,
    pub methods: Vec<MethodSummary>,
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Group observations by `(dataset, method)` and average their ranks and scores.
/// Observations whose image id cannot be parsed are ignored.
pub fn summarize(observations: &[Observation]) -> Summary {
    let voters = observations
        .iter()
        .map(|o| o.voter.as_str())
        .unique()
        .count();

    let methods = observations
        .iter()
        .filter_map(|o| {
            let image = ImageRef::parse_id(&o.image);
            if image.is_none() {
                log::warn!("Skipping observation for unparseable image id {}", o.image);
            }
            image.map(|image| ((image.dataset, image.method), o))
        })
        .into_group_map()
        .into_iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .map(|((dataset, method), group)| MethodSummary {
            dataset,
            method,
            votes: group.len(),
            mean_rank: mean(group.iter().filter_map(|o| o.vote.rank).map(f64::from)),
            mean_score: mean(group.iter().filter_map(|o| o.vote.score).map(f64::from)),
        })
        .collect();

    Summary {
        generated_at: Utc::now(),
        voters,
        methods,
    }
}
