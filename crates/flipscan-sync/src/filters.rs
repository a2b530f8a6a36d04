//! Per-candidate accept/reject stages: words, contact, picture.

use std::sync::Arc;

use chrono::Utc;
use flipscan_adapters::{
    contact_token, email_from_contact_page, first_picture_url, picture_extension,
    reveal_contact_url, visible_text, VisionClassifier, VisionLabel,
};
use flipscan_core::{CandidateListing, ListingMetadata, RejectReason, SearchTask, StageOutcome};
use flipscan_storage::{PageSource, PictureArchive};
use tracing::{debug, info, warn};

/// Decision for one candidate plus whatever metadata the stages collected.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterVerdict {
    pub matches: bool,
    /// Outcome of the last stage that ran.
    pub outcome: StageOutcome,
    pub metadata: ListingMetadata,
}

impl FilterVerdict {
    fn finish(outcome: StageOutcome, metadata: ListingMetadata) -> Self {
        Self {
            matches: outcome.is_accepted(),
            outcome,
            metadata,
        }
    }
}

/// Case-insensitive phrase test over visible page text.
pub fn word_filter(task: &SearchTask, text: &str) -> StageOutcome {
    let haystack = text.to_lowercase();
    let phrases = |list: &[String]| -> Vec<(String, String)> {
        list.iter()
            .map(|p| (p.clone(), p.trim().to_lowercase()))
            .filter(|(_, needle)| !needle.is_empty())
            .collect()
    };

    // Blank phrases carry no constraint.
    let required = phrases(task.must_contain.as_slice());
    if !required.is_empty() && !required.iter().any(|(_, n)| haystack.contains(n.as_str())) {
        return StageOutcome::Rejected(RejectReason::MissingRequiredPhrase);
    }
    if let Some((phrase, _)) = phrases(task.must_not_contain.as_slice())
        .into_iter()
        .find(|(_, n)| haystack.contains(n.as_str()))
    {
        return StageOutcome::Rejected(RejectReason::ForbiddenPhrase(phrase));
    }
    StageOutcome::Accepted
}

/// Detail page fetched at most once per candidate.
struct DetailPage<'a> {
    url: &'a str,
    html: Option<Option<String>>,
}

impl<'a> DetailPage<'a> {
    fn new(url: &'a str) -> Self {
        Self { url, html: None }
    }

    async fn html(&mut self, pages: &dyn PageSource) -> Option<&str> {
        if self.html.is_none() {
            let fetched = match pages.get_text(self.url).await {
                Ok(html) => Some(html),
                Err(err) => {
                    warn!(url = self.url, error = %err, "detail page unavailable");
                    None
                }
            };
            self.html = Some(fetched);
        }
        self.html.as_ref().and_then(|h| h.as_deref())
    }
}

pub struct FilterPipeline {
    pages: Arc<dyn PageSource>,
    vision: Option<Arc<dyn VisionClassifier>>,
    archive: Option<PictureArchive>,
    contact_service_id: String,
}

impl FilterPipeline {
    pub fn new(
        pages: Arc<dyn PageSource>,
        vision: Option<Arc<dyn VisionClassifier>>,
        contact_service_id: impl Into<String>,
    ) -> Self {
        Self {
            pages,
            vision,
            archive: None,
            contact_service_id: contact_service_id.into(),
        }
    }

    pub fn with_archive(mut self, archive: PictureArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Runs word, contact and picture stages in order, stopping at the first rejection.
    pub async fn evaluate(&self, task: &SearchTask, listing: &CandidateListing) -> FilterVerdict {
        let mut metadata = ListingMetadata::default();
        let mut detail = DetailPage::new(&listing.url);

        if task.has_word_filters() {
            let outcome = match detail.html(self.pages.as_ref()).await {
                Some(html) => word_filter(task, &visible_text(html)),
                None => StageOutcome::Failed("detail page unavailable".into()),
            };
            if !outcome.is_accepted() {
                info!(external_id = %listing.external_id, ?outcome, "word filter did not pass");
                return FilterVerdict::finish(outcome, metadata);
            }
        }

        metadata.email = self.extract_contact(listing, &mut detail).await;

        let outcome = self.picture_stage(task, listing, &mut detail, &mut metadata).await;
        if !outcome.is_accepted() {
            info!(external_id = %listing.external_id, ?outcome, "picture filter did not pass");
        }
        FilterVerdict::finish(outcome, metadata)
    }

    async fn extract_contact(
        &self,
        listing: &CandidateListing,
        detail: &mut DetailPage<'_>,
    ) -> Option<String> {
        let token = contact_token(detail.html(self.pages.as_ref()).await?)?;
        let url = reveal_contact_url(&listing.url, &token, &self.contact_service_id)?;
        match self.pages.get_text(&url).await {
            Ok(body) => {
                let email = email_from_contact_page(&body);
                debug!(external_id = %listing.external_id, found = email.is_some(), "contact lookup");
                email
            }
            Err(err) => {
                debug!(external_id = %listing.external_id, error = %err, "contact reveal failed");
                None
            }
        }
    }

    async fn picture_stage(
        &self,
        task: &SearchTask,
        listing: &CandidateListing,
        detail: &mut DetailPage<'_>,
        metadata: &mut ListingMetadata,
    ) -> StageOutcome {
        let requirements = &task.picture;
        let picture_url = match detail.html(self.pages.as_ref()).await {
            Some(html) => first_picture_url(html, &listing.url),
            None => None,
        };
        metadata.picture_url = picture_url.clone();

        let Some(picture_url) = picture_url else {
            return if requirements.required {
                StageOutcome::Rejected(RejectReason::NoPicture)
            } else {
                StageOutcome::Accepted
            };
        };
        if requirements.target_labels.is_empty() {
            return StageOutcome::Accepted;
        }

        let Some(vision) = &self.vision else {
            return StageOutcome::Failed("no image classifier configured".into());
        };
        let bytes = match self.pages.get_bytes(&picture_url).await {
            Ok(bytes) => bytes,
            Err(err) => return StageOutcome::Failed(format!("picture download failed: {err}")),
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store_picture(
                    Utc::now(),
                    &listing.site,
                    &listing.external_id,
                    picture_extension(&picture_url),
                    &bytes,
                )
                .await
            {
                warn!(error = %err, "could not archive picture");
            }
        }

        let labels = match vision.classify(&bytes).await {
            Ok(labels) => labels,
            Err(err) => return StageOutcome::Failed(format!("classification failed: {err}")),
        };
        metadata.labels = labels.iter().map(|l| l.label.clone()).collect();

        match best_target_match(&labels, &requirements.target_labels, requirements.min_confidence) {
            Some(hit) => {
                metadata.confidence = Some(hit.confidence);
                info!(label = %hit.label, confidence = hit.confidence, "picture matched");
                StageOutcome::Accepted
            }
            None => {
                metadata.confidence = labels.iter().map(|l| l.confidence).reduce(f64::max);
                info!(labels = ?metadata.labels, "picture labels did not match targets");
                StageOutcome::Rejected(RejectReason::LabelMismatch {
                    labels: metadata.labels.clone(),
                })
            }
        }
    }
}

fn best_target_match<'a>(
    labels: &'a [VisionLabel],
    targets: &[String],
    min_confidence: f64,
) -> Option<&'a VisionLabel> {
    labels
        .iter()
        .filter(|l| l.confidence >= min_confidence)
        .filter(|l| {
            let label = l.label.trim().to_lowercase();
            targets.iter().any(|t| t.trim().to_lowercase() == label)
        })
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}
