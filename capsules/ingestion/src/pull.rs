//! Image availability: decide whether to pull before creating the container.

use crate::engine::{ContainerEngine, ImageSummary};
use crate::error::{IngestionError, LifecycleStage};
use config_loader::PullPolicy;
use tracing::{debug, info, instrument};

/// What [`ensure_image`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    Pulled,
    /// Found locally under its first tag; no pull.
    Present,
    /// Policy `NEVER`; nothing checked.
    Skipped,
}

/// Make sure `image` is available locally according to `policy`.
#[instrument(skip(engine))]
pub async fn ensure_image(
    engine: &dyn ContainerEngine,
    image: &str,
    policy: PullPolicy,
) -> Result<PullDecision, IngestionError> {
    match policy {
        PullPolicy::Always => {
            pull(engine, image).await?;
            Ok(PullDecision::Pulled)
        }
        PullPolicy::IfNotPresent => {
            let images = engine
                .list_images()
                .await
                .map_err(|e| IngestionError::lifecycle(LifecycleStage::ListImages, e))?;

            if is_present(&images, image) {
                debug!("image already present locally");
                Ok(PullDecision::Present)
            } else {
                pull(engine, image).await?;
                Ok(PullDecision::Pulled)
            }
        }
        PullPolicy::Never => Ok(PullDecision::Skipped),
    }
}

/// Only the first tag of each local image is compared, so an image known
/// locally under a secondary tag counts as absent and is pulled again.
pub fn is_present(images: &[ImageSummary], image: &str) -> bool {
    images.iter().any(|local| local.first_tag() == Some(image))
}

async fn pull(engine: &dyn ContainerEngine, image: &str) -> Result<(), IngestionError> {
    info!("Pulling docker image");
    engine
        .pull_image(image)
        .await
        .map_err(|source| IngestionError::ImagePullFailed {
            image: image.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(tags: &[&str]) -> ImageSummary {
        ImageSummary {
            id: format!("sha256:{}", tags.len()),
            repo_tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn present_when_first_tag_matches() {
        let images = vec![
            image(&["alpine:3.20"]),
            image(&["acryldata/datahub-ingestion:head", "datahub:latest"]),
        ];
        assert!(is_present(&images, "acryldata/datahub-ingestion:head"));
    }

    #[test]
    fn secondary_tag_does_not_count_as_present() {
        let images = vec![image(&["datahub:latest", "acryldata/datahub-ingestion:head"])];
        assert!(!is_present(&images, "acryldata/datahub-ingestion:head"));
    }

    #[test]
    fn untagged_images_are_ignored() {
        let images = vec![image(&[])];
        assert!(!is_present(&images, "acryldata/datahub-ingestion:head"));
    }
}
