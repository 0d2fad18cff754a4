use crate::core::LocalImage;
use crate::error::ScanError;
use crate::runtime::{ContainerRuntime, InspectedImage};

const UNTAGGED: &str = "<none>";
const SHORT_ID_LEN: usize = 12;

/// Lists locally cached images, one record per tag.
///
/// Never fails: an unreachable runtime is logged and yields an empty list.
pub fn list_local_images(runtime: &ContainerRuntime) -> Vec<LocalImage> {
    match try_list_local_images(runtime) {
        Ok(images) => images,
        Err(err) => {
            log::error!("Failed to list images: {err}");
            Vec::new()
        }
    }
}

pub fn try_list_local_images(runtime: &ContainerRuntime) -> Result<Vec<LocalImage>, ScanError> {
    let ids = runtime.list_image_ids()?;
    let inspected = inspect_present(runtime, &ids)?;
    Ok(inspected.iter().flat_map(records_for).collect())
}

/// Inspects all ids at once. If that fails because an image vanished after
/// listing, falls back to one call per id and skips the missing ones.
fn inspect_present(
    runtime: &ContainerRuntime,
    ids: &[String],
) -> Result<Vec<InspectedImage>, ScanError> {
    match runtime.inspect_images(ids) {
        Err(ScanError::NonZeroExit { stderr, .. }) if ids.len() > 1 => {
            log::debug!("batched inspect failed, retrying per image: {stderr}");
        }
        res => return res,
    }

    let mut out = Vec::new();
    for id in ids {
        match runtime.inspect_images(std::slice::from_ref(id)) {
            Ok(images) => out.extend(images),
            Err(ScanError::NonZeroExit { stderr, .. }) => {
                log::warn!("Skipping image {}: {stderr}", short_id(id));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}

fn records_for(image: &InspectedImage) -> Vec<LocalImage> {
    let id = short_id(&image.id);
    let tags: Vec<&str> = match &image.repo_tags {
        Some(tags) if !tags.is_empty() => tags.iter().map(String::as_str).collect(),
        _ => vec![UNTAGGED],
    };
    tags.into_iter()
        .map(|tag| LocalImage {
            id: id.clone(),
            tag: tag.to_string(),
            size: image.size,
            created: image.created.clone(),
        })
        .collect()
}

pub fn short_id(id: &str) -> String {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.chars().take(SHORT_ID_LEN).collect()
}
