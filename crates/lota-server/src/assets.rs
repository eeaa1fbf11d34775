//! Dashboard files baked into the binary.

use rust_embed::RustEmbed;

use lota_core::{content_type_for, Resource, ResourceStore};

#[derive(RustEmbed)]
#[folder = "../../static/"]
struct DashboardFiles;

/// Resource store backed by the embedded `static/` directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedResources;

impl ResourceStore for EmbeddedResources {
    fn get(&self, name: &str) -> Option<Resource> {
        DashboardFiles::get(name).map(|file| Resource {
            content_type: content_type_for(name),
            body: file.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lota_core::Asset;

    #[test]
    fn test_every_asset_is_embedded() {
        let store = EmbeddedResources;
        for asset in Asset::ROUTABLE.into_iter().chain([Asset::ErrorPage]) {
            let resource = store.asset(asset).unwrap_or_else(|| panic!("{:?} missing", asset));
            assert_eq!(resource.content_type, asset.content_type());
            assert!(!resource.is_empty());
        }
    }

    #[test]
    fn test_unknown_file() {
        assert!(EmbeddedResources.get("secret.txt").is_none());
    }
}
