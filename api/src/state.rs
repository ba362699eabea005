//! Shared state handed to every request.

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::sync::Arc;
use survey_common::ResultsLayout;
use survey_common::catalog::Catalog;
use survey_common::results::ResultsStore;

pub struct SurveyState {
    pub catalog: Catalog,
    pub store: Arc<ResultsStore>,
    pub image_root: PathBuf,
}

impl SurveyState {
    /// Scan the images and prepare the results file.
    /// With no seed the image order differs on every start.
    ///
    /// # Errors
    /// Returns an error if the image directories cannot be read or the
    /// results directory cannot be created.
    pub fn load(
        image_root: PathBuf,
        results_file: PathBuf,
        layout: ResultsLayout,
        dedup_by_email: bool,
        seed: Option<u64>,
    ) -> survey_common::Result<Self> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let catalog = Catalog::load(&image_root, &mut rng)?;
        let store = ResultsStore::open(results_file, layout, dedup_by_email)?;

        tracing::info!(
            image_root = %image_root.display(),
            results_file = %store.path().display(),
            layout = ?layout,
            dedup_by_email,
            votable_images = catalog.votable_count(),
            "Survey state loaded"
        );

        Ok(Self {
            catalog,
            store: Arc::new(store),
            image_root,
        })
    }
}
