//! Per-subject image acquisition loop.
//!
//! Each subject walks its candidate titles in order: locate an image URL,
//! download it, normalize it to JPEG and, on the first success, point the
//! fact row at the saved file. Every subject yields exactly one ledger entry.

use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::FetchConfig;
use crate::db_manager::FactStore;
use crate::image_pipeline::{ImageNormalizer, NormalizeOutcome};
use crate::protocol::{AcquisitionResult, AcquisitionStatus, Subject};
use crate::title_candidates::{candidate_titles, TitleOverrides};
use crate::wikipedia_client::{ImageDownloader, ImageLocator};

enum CandidateOutcome {
    Saved {
        image_url: String,
        content_type: Option<String>,
        outcome: NormalizeOutcome,
    },
    NoImage,
    Failed {
        image_url: Option<String>,
        reason: String,
    },
}

/// Drives locator, downloader, normalizer and fact store for a batch of
/// subjects, strictly one at a time.
pub struct ImageAcquisitionManager {
    overrides: TitleOverrides,
    locator: Box<dyn ImageLocator>,
    downloader: Box<dyn ImageDownloader>,
    normalizer: ImageNormalizer,
    fact_store: Box<dyn FactStore>,
    public_prefix: String,
    candidate_pause: Duration,
    subject_pause: Duration,
}

impl ImageAcquisitionManager {
    pub fn new(
        config: &FetchConfig,
        locator: Box<dyn ImageLocator>,
        downloader: Box<dyn ImageDownloader>,
        normalizer: ImageNormalizer,
        fact_store: Box<dyn FactStore>,
    ) -> Self {
        Self {
            overrides: config.title_overrides(),
            locator,
            downloader,
            normalizer,
            fact_store,
            public_prefix: config.public_prefix.clone(),
            candidate_pause: config.candidate_pause(),
            subject_pause: config.subject_pause(),
        }
    }

    #[cfg(test)]
    pub fn with_title_overrides(mut self, overrides: TitleOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Processes every subject and returns the ledger in input order.
    pub fn run(&self, subjects: &[Subject]) -> Vec<AcquisitionResult> {
        let total = subjects.len();
        let mut ledger = Vec::with_capacity(total);
        for (index, subject) in subjects.iter().enumerate() {
            let result = self.acquire_subject(subject);
            if result.status.is_ok() {
                info!(
                    "[{}/{}] {} / {}: {}",
                    index + 1,
                    total,
                    subject.country_name,
                    subject.fruit_name,
                    result.status
                );
            } else {
                warn!(
                    "[{}/{}] {} / {}: {}",
                    index + 1,
                    total,
                    subject.country_name,
                    subject.fruit_name,
                    result.status
                );
            }
            ledger.push(result);
            pause(self.subject_pause);
        }
        ledger
    }

    pub fn acquire_subject(&self, subject: &Subject) -> AcquisitionResult {
        let stem = subject.file_stem();
        debug!(
            "Acquiring image for fact {} (country {}) as {stem}",
            subject.fact_id, subject.country_id
        );
        let mut tried_titles = Vec::new();
        let mut last_failure: Option<String> = None;
        let mut last_image_url = String::new();

        for title in candidate_titles(&self.overrides, &subject.fruit_name) {
            tried_titles.push(title.clone());
            let outcome = self.try_candidate(&title, &stem);
            pause(self.candidate_pause);

            match outcome {
                CandidateOutcome::Saved {
                    image_url,
                    content_type,
                    outcome,
                } => {
                    return self.record_saved(subject, image_url, content_type, outcome, tried_titles);
                }
                CandidateOutcome::NoImage => {
                    debug!("No image for title '{title}'");
                }
                CandidateOutcome::Failed { image_url, reason } => {
                    debug!("Candidate '{title}' failed: {reason}");
                    if let Some(image_url) = image_url {
                        last_image_url = image_url;
                    }
                    last_failure = Some(reason);
                }
            }
        }

        let status = match last_failure {
            Some(reason) => AcquisitionStatus::Failed(reason),
            None => AcquisitionStatus::NotFound,
        };
        AcquisitionResult {
            subject: subject.clone(),
            image_url: last_image_url,
            status,
            detail: String::new(),
            tried_titles,
            saved_as: String::new(),
        }
    }

    fn try_candidate(&self, title: &str, stem: &str) -> CandidateOutcome {
        let image_url = match self.locator.locate(title) {
            Ok(Some(image_url)) => image_url,
            Ok(None) => return CandidateOutcome::NoImage,
            Err(error) => {
                warn!("Lookup failed for '{title}': {error}");
                return CandidateOutcome::Failed {
                    image_url: None,
                    reason: error.to_string(),
                };
            }
        };

        let downloaded = match self.downloader.download(&image_url) {
            Ok(downloaded) => downloaded,
            Err(error) => {
                warn!("Download failed for {image_url}: {error}");
                return CandidateOutcome::Failed {
                    image_url: Some(image_url),
                    reason: error.to_string(),
                };
            }
        };

        match self.normalizer.normalize(
            &downloaded.bytes,
            downloaded.content_type.as_deref(),
            &image_url,
            stem,
        ) {
            Ok(outcome) => CandidateOutcome::Saved {
                image_url,
                content_type: downloaded.content_type,
                outcome,
            },
            Err(error) => {
                warn!("Rejected image {image_url}: {error}");
                CandidateOutcome::Failed {
                    image_url: Some(image_url),
                    reason: error.to_string(),
                }
            }
        }
    }

    fn relative_path_for(&self, saved_path: &Path) -> String {
        let file_name = saved_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.public_prefix.is_empty() {
            return file_name;
        }
        format!("{}/{}", self.public_prefix, file_name)
    }

    fn record_saved(
        &self,
        subject: &Subject,
        image_url: String,
        content_type: Option<String>,
        outcome: NormalizeOutcome,
        tried_titles: Vec<String>,
    ) -> AcquisitionResult {
        let saved_as = self.relative_path_for(outcome.path());
        let detail = outcome
            .degraded_tag()
            .unwrap_or_else(|| content_type.unwrap_or_default());
        if let Some(degraded) = outcome.degraded_tag() {
            warn!(
                "Saved {} without normalization ({degraded})",
                outcome.path().display()
            );
        }

        // The file stays on disk even when the row update fails.
        let status = match self.fact_store.set_fruit_image(subject.fact_id, &saved_as) {
            Ok(()) => AcquisitionStatus::Ok,
            Err(error) => {
                warn!(
                    "Saved {} but could not update fact {}: {error}",
                    saved_as, subject.fact_id
                );
                AcquisitionStatus::Failed(format!("db_update_error:{}", error.kind()))
            }
        };

        AcquisitionResult {
            subject: subject.clone(),
            image_url,
            status,
            detail,
            tried_titles,
            saved_as,
        }
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
