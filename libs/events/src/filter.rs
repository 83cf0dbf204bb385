//! Which containers take part in network attachment.

use crate::ContainerRef;

const CONTENT_HASH_PREFIX: &str = "sha256:";
const CONTENT_HASH_LEN: usize = 64;

/// Why a container event is not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyId,
    ContentAddressedImage,
    Excluded,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::EmptyId => "empty container id",
            SkipReason::ContentAddressedImage => "content-addressed image",
            SkipReason::Excluded => "excluded by name",
        };
        f.write_str(s)
    }
}

/// Container filtering policy.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    exclude_name_prefixes: Vec<String>,
    exclude_names: Vec<String>,
}

impl EventFilter {
    pub fn new(exclude_name_prefixes: Vec<String>, exclude_names: Vec<String>) -> Self {
        Self {
            exclude_name_prefixes,
            exclude_names,
        }
    }

    /// `None` when the container should be handled.
    pub fn skip_reason(&self, container: &ContainerRef) -> Option<SkipReason> {
        if container.id.is_empty() {
            return Some(SkipReason::EmptyId);
        }
        if is_content_addressed(&container.image) {
            return Some(SkipReason::ContentAddressedImage);
        }
        if self.is_excluded(&container.name) {
            return Some(SkipReason::Excluded);
        }
        None
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude_names.iter().any(|n| n == name)
            || self
                .exclude_name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

/// Whether an image reference is a bare content hash rather than a name.
pub fn is_content_addressed(image: &str) -> bool {
    let digest = image.strip_prefix(CONTENT_HASH_PREFIX).unwrap_or(image);
    digest.len() == CONTENT_HASH_LEN && digest.bytes().all(|b| b.is_ascii_hexdigit())
}
