//! Consistent probability sampling for [OpenTelemetry].
//!
//! Services taking part in a distributed trace decide independently whether to
//! keep it. With consistent probability sampling every service reaches the
//! same decision for the same trace, and the rate of the original traffic can
//! be reconstructed from the kept spans. Two values travel with each trace in
//! the `ot` entry of the W3C `tracestate` header:
//!
//! - the randomness value `r` in `[0, 62]`, drawn once per trace;
//! - the sampling threshold `p` in `[0, 63]`, the threshold the trace was
//!   kept with so far. A span is kept if `p <= r`, so it is kept with
//!   probability `2^-p`.
//!
//! ## What does this crate contain?
//!
//! - [`OtelTraceState`]: parses and serializes the `ot` entry. Parsing is
//!   total, malformed input yields an empty state instead of an error, since
//!   the header comes from untrusted upstream services.
//! - [`ConsistentSampler`]: the interface samplers implement to compute a
//!   span's threshold from its parent's. Implementations may only keep or
//!   lower the parent threshold.
//! - [`ConsistentAlwaysOnSampler`]: samples everything.
//! - [`ConsistentSampling`]: adapts any [`ConsistentSampler`] to the SDK
//!   [`ShouldSample`] interface so it can be installed in a tracer provider.
//!
//! # Getting Started
//!
//! ```
//! use opentelemetry::trace::{Span, Tracer, TracerProvider};
//! use opentelemetry_consistent_sampling::{
//!     ConsistentAlwaysOnSampler, ConsistentSampling, OtelTraceState, RandomnessSource,
//! };
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! let sampler = ConsistentSampling::builder(ConsistentAlwaysOnSampler)
//!     .with_randomness_source(RandomnessSource::TraceId)
//!     .build();
//! let provider = SdkTracerProvider::builder().with_sampler(sampler).build();
//!
//! let span = provider.tracer("example").start("root");
//! let state = OtelTraceState::from_trace_state(span.span_context().trace_state());
//! assert_eq!(state.threshold(), Some(0));
//! assert!(state.has_valid_randomness());
//! ```
//!
//! # Configuration
//!
//! The randomness source used for traces that arrive without an `r` value is
//! read from the `OTEL_CONSISTENT_SAMPLING_RANDOMNESS` environment variable
//! (`trace_id` or `random`) unless set with
//! [`ConsistentSamplingBuilder::with_randomness_source`].
//!
//! # Crate Feature Flags
//!
//! * `internal-logs`: emits internal diagnostics (rejected trace state
//!   entries, inconsistent parent thresholds) through `tracing`. Enabled by
//!   default.
//! * `testing`: exposes [`testing::assert_consistent`] for checking custom
//!   [`ConsistentSampler`] implementations.
//!
//! [OpenTelemetry]: https://opentelemetry.io/docs/specs/otel/trace/tracestate-probability-sampling/
//! [`ShouldSample`]: opentelemetry_sdk::trace::ShouldSample
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod error;
mod sampler;
pub mod trace_state;

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

pub use error::{ConsistentSamplingError, ConsistentSamplingResult, ParseError};
pub use sampler::{
    is_sampled, sampling_probability, ConsistentAlwaysOnSampler, ConsistentSampler,
    ConsistentSampling, ConsistentSamplingBuilder, RandomnessSource,
    OTEL_CONSISTENT_SAMPLING_RANDOMNESS,
};
pub use trace_state::{
    is_valid_randomness, is_valid_threshold, OtelTraceState, INVALID_RANDOMNESS,
    INVALID_THRESHOLD, MAX_RANDOMNESS, MAX_THRESHOLD, MIN_RANDOMNESS, MIN_THRESHOLD,
    TRACE_STATE_KEY, TRACE_STATE_SIZE_LIMIT,
};
