#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1id::IdentityResolution;
use presence_storage::ph1f::PresenceStore;

/// PH1.ID lookup seam. Implementations must not block on presence locks: the toggle
/// controller calls this before it takes any partition lock.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, tag_or_id: &str) -> IdentityResolution;
}

impl IdentityResolver for PresenceStore {
    fn resolve(&self, tag_or_id: &str) -> IdentityResolution {
        self.resolve_identifier(tag_or_id)
    }
}
