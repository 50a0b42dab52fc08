pub mod pending;
pub mod registry;

use crate::error::PvaError;

/// Capability every entry of a [registry::RequestRegistry] has: it can be told that it will
///  not receive (further) responses.
pub trait RequestHandle: Send + Sync + 'static {
    /// Called at most once per registration, after the handle was removed from the registry
    fn cancel(&self, reason: &PvaError);
}
