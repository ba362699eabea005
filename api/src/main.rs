//! A web survey for ranking adversarially-perturbed images against their originals.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::needless_pass_by_value)]

#[macro_use]
extern crate rocket;

mod helpers;
mod pages;
mod state;

use clap::Parser;
use helpers::{
    ApiError, ApiResult, CsvAttachment, RESULTS_DOWNLOAD_NAME, RequestTimingFairing,
    bad_request_error, internal_error, not_found_error, payload_too_large_error,
    unsupported_media_type_error,
};
use pages::IndexContext;
use rocket::data::{Data, Limits, ToByteUnit};
use rocket::figment::Figment;
use rocket::fs::NamedFile;
use rocket::http::ContentType;
use rocket::request::FlashMessage;
use rocket::response::{Flash, Redirect};
use rocket::serde::json::{Json, Value, json};
use rocket::tokio::task::spawn_blocking;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::Template;
use state::SurveyState;
use std::path::PathBuf;
use survey_common::ResultsLayout;
use survey_common::catalog::resolve_image;
use survey_common::results::RecordOutcome;
use survey_common::submission::{FormFields, Submission};
use survey_common::summary::{Summary, summarize};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory holding the `mnist` and `cifar` image folders
    #[arg(long, default_value = "vc", env = "SURVEY_IMAGE_ROOT")]
    image_root: PathBuf,

    /// CSV file that responses are written to
    #[arg(long, default_value = "results.csv", env = "SURVEY_RESULTS_FILE")]
    results_file: PathBuf,

    /// How responses are laid out in the CSV file
    #[arg(long, value_enum, default_value = "raw", env = "SURVEY_LAYOUT")]
    layout: ResultsLayout,

    /// Require an email and accept only one response per email
    #[arg(long, env = "SURVEY_DEDUP_EMAIL")]
    dedup_email: bool,

    /// Seed for the image shuffle, for a stable page between restarts
    #[arg(long, env = "SURVEY_SEED")]
    seed: Option<u64>,
}

const DEFAULT_FORM_LIMIT_KIB: u64 = 64;
const DUPLICATE_MESSAGE: &str = "This email has already submitted a response.";

#[get("/")]
fn index(state: &State<SurveyState>, flash: Option<FlashMessage<'_>>) -> Template {
    let context = IndexContext::new(&state.catalog, state.store.dedup_by_email(), flash);
    Template::render("index", context)
}

/// Takes the body as a whole form so repeated keys survive. Anything other
/// than a url-encoded form is answered with 415.
#[post("/", data = "<data>")]
async fn submit(
    state: &State<SurveyState>,
    content_type: Option<&ContentType>,
    limits: &Limits,
    data: Data<'_>,
) -> Result<Flash<Redirect>, ApiError> {
    if !content_type.is_some_and(|ct| ct.is_form()) {
        return Err(unsupported_media_type_error(
            "Responses must be posted as application/x-www-form-urlencoded.",
        ));
    }
    let limit = limits
        .get("form")
        .unwrap_or_else(|| DEFAULT_FORM_LIMIT_KIB.kibibytes());
    let body = data
        .open(limit)
        .into_string()
        .await
        .map_err(|e| bad_request_error(format!("Could not read form: {e}")))?;
    if !body.is_complete() {
        return Err(payload_too_large_error(format!(
            "Form is larger than the {limit} limit."
        )));
    }

    let fields = FormFields::parse(&body);
    tracing::debug!(fields = ?fields, "Received submission");

    let submission =
        match Submission::from_fields(&fields, &state.catalog, state.store.dedup_by_email()) {
            Ok(submission) => submission,
            Err(e) => {
                tracing::info!(error = %e, "Rejected invalid submission");
                return Ok(Flash::error(Redirect::to(uri!(index)), e.to_string()));
            }
        };

    let store = state.store.clone();
    let outcome = spawn_blocking(move || store.record(&submission, &fields))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Results writer task failed");
            internal_error("Could not save your response.")
        })?
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to write results");
            internal_error("Could not save your response.")
        })?;

    tracing::info!(outcome = ?outcome, "Submission handled");
    Ok(match outcome {
        RecordOutcome::Recorded => {
            Flash::success(Redirect::to(uri!(index)), "Thank you, your response was saved.")
        }
        RecordOutcome::Updated => {
            Flash::success(Redirect::to(uri!(index)), "Your earlier response was updated.")
        }
        RecordOutcome::Duplicate => Flash::error(Redirect::to(uri!(index)), DUPLICATE_MESSAGE),
    })
}

#[get("/vc/<dataset>/<method>/<file>")]
async fn image(
    state: &State<SurveyState>,
    dataset: &str,
    method: &str,
    file: &str,
) -> Result<NamedFile, ApiError> {
    let path = resolve_image(&state.image_root, dataset, method, file)
        .ok_or_else(|| not_found_error("Image not found."))?;
    NamedFile::open(&path)
        .await
        .map_err(|_| not_found_error("Image not found."))
}

#[get("/download")]
async fn download(state: &State<SurveyState>) -> Result<CsvAttachment, ApiError> {
    let store = state.store.clone();
    let contents = spawn_blocking(move || store.contents())
        .await
        .map_err(|e| internal_error(format!("Download task failed: {e}")))?
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to read results");
            internal_error("Could not read results.")
        })?
        .ok_or_else(|| not_found_error("Results file not found."))?;
    Ok(CsvAttachment::new(contents, RESULTS_DOWNLOAD_NAME))
}

#[get("/summary")]
async fn summary(state: &State<SurveyState>) -> ApiResult<Summary> {
    let store = state.store.clone();
    let observations = spawn_blocking(move || store.observations())
        .await
        .map_err(|e| internal_error(format!("Summary task failed: {e}")))?
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to read results");
            internal_error("Could not read results.")
        })?;
    Ok(Json(summarize(&observations)))
}

#[get("/health")]
fn health() -> Value {
    json!({ "status": "ok" })
}

#[catch(404)]
fn not_found() -> ApiError {
    not_found_error("The requested resource could not be found.")
}

/// Assemble the server from a Rocket config source and loaded state.
fn build_rocket(figment: Figment, state: SurveyState) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .attach(Template::fairing())
        .attach(RequestTimingFairing)
        .mount(
            "/",
            routes![index, submit, image, download, summary, health],
        )
        .register("/", catchers![not_found])
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let state = SurveyState::load(
        cli.image_root,
        cli.results_file,
        cli.layout,
        cli.dedup_email,
        cli.seed,
    )?;

    let _rocket = build_rocket(rocket::Config::figment(), state)
        .launch()
        .await?;
    Ok(())
}
