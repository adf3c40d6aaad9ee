use super::ConsistentSampler;
use crate::trace_state::MIN_THRESHOLD;
use std::borrow::Cow;

/// A consistent sampler that samples every span.
///
/// Returns [`MIN_THRESHOLD`] regardless of the parent, which satisfies the
/// sampling comparison for every randomness value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConsistentAlwaysOnSampler;

impl ConsistentAlwaysOnSampler {
    /// Description reported by [`ConsistentSampler::description`].
    pub const DESCRIPTION: &'static str = "ConsistentAlwaysOnSampler";
}

impl ConsistentSampler for ConsistentAlwaysOnSampler {
    fn compute_threshold(&self, _parent_threshold: Option<u8>, _is_root: bool) -> u8 {
        MIN_THRESHOLD
    }

    fn description(&self) -> Cow<'static, str> {
        Cow::Borrowed(Self::DESCRIPTION)
    }
}
