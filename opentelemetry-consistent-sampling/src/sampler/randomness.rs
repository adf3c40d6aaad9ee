use crate::trace_state::MAX_RANDOMNESS;
use opentelemetry::otel_warn;
use opentelemetry::trace::TraceId;
use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::env;

/// Environment variable selecting the [`RandomnessSource`] used when a trace
/// arrives without a valid `r` value.
///
/// Accepted values are `trace_id` (the default) and `random`.
pub const OTEL_CONSISTENT_SAMPLING_RANDOMNESS: &str = "OTEL_CONSISTENT_SAMPLING_RANDOMNESS";

/// Where a root span draws its randomness value from.
///
/// Both sources yield `r` with `P(r >= k) = 2^-k`, capped at
/// [`MAX_RANDOMNESS`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RandomnessSource {
    /// Derive `r` from the low 62 bits of the trace id. Every service that
    /// sees the same trace id computes the same value.
    #[default]
    TraceId,
    /// Draw `r` from a thread-local random number generator.
    Random,
}

impl RandomnessSource {
    /// Reads the source from [`OTEL_CONSISTENT_SAMPLING_RANDOMNESS`], falling
    /// back to the default if it is unset or unrecognized.
    pub fn from_env() -> Self {
        match env::var(OTEL_CONSISTENT_SAMPLING_RANDOMNESS) {
            Ok(value) => match value.as_str() {
                "trace_id" => RandomnessSource::TraceId,
                "random" => RandomnessSource::Random,
                other => {
                    otel_warn!(
                        name: "ConsistentSampling.Config.InvalidRandomnessSource",
                        message = format!(
                            "Unrecognized randomness source '{}' in OTEL_CONSISTENT_SAMPLING_RANDOMNESS environment variable. Valid values are: trace_id, random. Using fallback: trace_id",
                            other
                        ),
                    );
                    RandomnessSource::default()
                }
            },
            Err(_) => RandomnessSource::default(),
        }
    }

    /// Produces a randomness value for a trace.
    pub fn generate(&self, trace_id: TraceId) -> u8 {
        match self {
            RandomnessSource::TraceId => {
                let bytes = trace_id.to_bytes();
                let mut low = [0u8; 8];
                low.copy_from_slice(&bytes[8..]);
                randomness_from_bits(u64::from_be_bytes(low) << 2)
            }
            RandomnessSource::Random => {
                CURRENT_RNG.with(|rng| randomness_from_bits(rng.borrow_mut().random::<u64>()))
            }
        }
    }
}

thread_local! {
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_os_rng());
}

/// Leading zeros of the top 62 bits of `bits`, so an all-zero draw maps to
/// [`MAX_RANDOMNESS`].
fn randomness_from_bits(bits: u64) -> u8 {
    let zeros = (bits >> 2).leading_zeros() - 2;
    zeros.min(u32::from(MAX_RANDOMNESS)) as u8
}
