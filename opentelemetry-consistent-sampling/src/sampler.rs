use crate::trace_state::{OtelTraceState, MAX_THRESHOLD};
use opentelemetry::{
    otel_debug, otel_warn,
    trace::{
        Link, SamplingDecision, SamplingResult, SpanContext, SpanKind, TraceContextExt, TraceId,
    },
    Context, KeyValue,
};
use opentelemetry_sdk::trace::ShouldSample;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

mod always_on;
mod randomness;

pub use always_on::ConsistentAlwaysOnSampler;
pub use randomness::{RandomnessSource, OTEL_CONSISTENT_SAMPLING_RANDOMNESS};

/// The [`ConsistentSampler`] interface computes the sampling threshold of a
/// span from the threshold its parent was sampled with.
///
/// # Consistency
///
/// Every service that participates in a trace decides on its own whether to
/// keep a span, by comparing the trace's randomness value `r` with the
/// threshold returned here (see [`is_sampled`]). Lower thresholds sample more.
/// For the trace as a whole to stay complete and for its original rate to be
/// reconstructible, a child may never be *less* likely to be sampled than an
/// ancestor:
///
/// * when `is_root` is `false` and `parent_threshold` is `Some(t)`, the result
///   MUST be `<= t`;
/// * when `is_root` is `true`, the result MUST NOT depend on
///   `parent_threshold`;
/// * the result is always in `[MIN_THRESHOLD, MAX_THRESHOLD]`.
///
/// Breaking these rules is a bug in the sampler. They are not checked at
/// runtime; use `testing::assert_consistent` (behind the `testing` feature)
/// in the sampler's tests.
///
/// Implementations are shared between threads and must not hold mutable
/// state.
///
/// [`MIN_THRESHOLD`]: crate::MIN_THRESHOLD
/// [`MAX_THRESHOLD`]: crate::MAX_THRESHOLD
pub trait ConsistentSampler: Send + Sync + fmt::Debug {
    /// Returns the threshold for a span to be created.
    ///
    /// `parent_threshold` is `None` for root spans and for children whose
    /// parent carried no valid (or no consistent) threshold.
    fn compute_threshold(&self, parent_threshold: Option<u8>, is_root: bool) -> u8;

    /// A human readable description, for diagnostics only.
    fn description(&self) -> Cow<'static, str>;
}

impl<T: ConsistentSampler + ?Sized> ConsistentSampler for Arc<T> {
    fn compute_threshold(&self, parent_threshold: Option<u8>, is_root: bool) -> u8 {
        (**self).compute_threshold(parent_threshold, is_root)
    }

    fn description(&self) -> Cow<'static, str> {
        (**self).description()
    }
}

/// Returns `true` if a trace with the given randomness value is kept at the
/// given threshold.
///
/// The comparison is monotonic: lowering the threshold never drops a trace
/// that was kept. [`MAX_THRESHOLD`] keeps nothing since randomness values
/// never exceed [`MAX_RANDOMNESS`].
///
/// [`MAX_RANDOMNESS`]: crate::MAX_RANDOMNESS
pub fn is_sampled(threshold: u8, randomness: u8) -> bool {
    threshold <= randomness
}

/// The fraction of traces kept at `threshold`, `2^-threshold`.
///
/// Adjusted counts for rate reconstruction are the reciprocal. Returns `0.0`
/// for [`MAX_THRESHOLD`] and for out-of-range thresholds.
pub fn sampling_probability(threshold: u8) -> f64 {
    if threshold >= MAX_THRESHOLD {
        0.0
    } else {
        1.0 / (1u64 << threshold) as f64
    }
}

/// Adapts a [`ConsistentSampler`] to the SDK [`ShouldSample`] interface.
///
/// For each span the parent's `ot` trace state entry is decoded, a randomness
/// value is generated if the trace has none yet, the wrapped sampler computes
/// the threshold, and the updated entry is written into the returned
/// [`SamplingResult::trace_state`]. Entries of other vendors, and foreign
/// `ot` sub-entries, are carried over unchanged.
///
/// # Examples
///
/// ```
/// use opentelemetry_consistent_sampling::{ConsistentAlwaysOnSampler, ConsistentSampling};
/// use opentelemetry_sdk::trace::SdkTracerProvider;
///
/// let provider = SdkTracerProvider::builder()
///     .with_sampler(ConsistentSampling::new(ConsistentAlwaysOnSampler))
///     .build();
/// # drop(provider);
/// ```
#[derive(Clone, Debug)]
pub struct ConsistentSampling<S> {
    sampler: S,
    randomness_source: RandomnessSource,
}

impl<S: ConsistentSampler> ConsistentSampling<S> {
    /// Wraps `sampler`, reading the randomness source from the environment.
    pub fn new(sampler: S) -> Self {
        Self::builder(sampler).build()
    }

    /// Starts building a [`ConsistentSampling`] around `sampler`.
    pub fn builder(sampler: S) -> ConsistentSamplingBuilder<S> {
        ConsistentSamplingBuilder {
            sampler,
            randomness_source: None,
        }
    }

    /// The wrapped sampler.
    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    /// Where root spans draw their randomness value from.
    pub fn randomness_source(&self) -> RandomnessSource {
        self.randomness_source
    }

    /// The wrapped sampler's description.
    pub fn description(&self) -> Cow<'static, str> {
        self.sampler.description()
    }
}

/// Builder for [`ConsistentSampling`].
#[derive(Debug)]
pub struct ConsistentSamplingBuilder<S> {
    sampler: S,
    randomness_source: Option<RandomnessSource>,
}

impl<S: ConsistentSampler> ConsistentSamplingBuilder<S> {
    /// Sets where root spans draw their randomness value from.
    ///
    /// Overrides [`OTEL_CONSISTENT_SAMPLING_RANDOMNESS`].
    pub fn with_randomness_source(mut self, randomness_source: RandomnessSource) -> Self {
        self.randomness_source = Some(randomness_source);
        self
    }

    /// Builds the sampler, reading [`OTEL_CONSISTENT_SAMPLING_RANDOMNESS`]
    /// if no randomness source was set.
    pub fn build(self) -> ConsistentSampling<S> {
        ConsistentSampling {
            sampler: self.sampler,
            randomness_source: self
                .randomness_source
                .unwrap_or_else(RandomnessSource::from_env),
        }
    }
}

impl<S> ShouldSample for ConsistentSampling<S>
where
    S: ConsistentSampler + Clone + 'static,
{
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        _name: &str,
        _span_kind: &SpanKind,
        _attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let parent_span_context = parent_context
            .filter(|cx| cx.has_active_span())
            .map(|cx| cx.span().span_context().clone())
            .filter(SpanContext::is_valid);
        let is_root = parent_span_context.is_none();
        let parent_trace_state = parent_span_context
            .as_ref()
            .map(|span_context| span_context.trace_state().clone())
            .unwrap_or_default();

        let mut otel_trace_state = OtelTraceState::from_trace_state(&parent_trace_state);

        let randomness = match otel_trace_state.randomness() {
            Some(r) => r,
            None => {
                let r = self.randomness_source.generate(trace_id);
                otel_trace_state.set_randomness(r.into());
                r
            }
        };

        let mut parent_threshold = if is_root {
            None
        } else {
            otel_trace_state.threshold()
        };
        if let (Some(p), Some(parent)) = (parent_threshold, parent_span_context.as_ref()) {
            // the threshold must agree with the sampled flag it travelled with
            if is_sampled(p, randomness) != parent.is_sampled() {
                otel_debug!(
                    name: "ConsistentSampling.InconsistentParentThreshold",
                    threshold = p,
                    randomness = randomness,
                    parent_sampled = parent.is_sampled()
                );
                parent_threshold = None;
            }
        }

        let threshold = self.sampler.compute_threshold(parent_threshold, is_root);
        let decision = if is_sampled(threshold, randomness) {
            otel_trace_state.set_threshold(threshold.into());
            SamplingDecision::RecordAndSample
        } else {
            otel_trace_state.invalidate_threshold();
            SamplingDecision::Drop
        };

        let trace_state = match otel_trace_state.store_in(&parent_trace_state) {
            Ok(trace_state) => trace_state,
            Err(err) => {
                otel_warn!(
                    name: "ConsistentSampling.TraceStateUpdateFailed",
                    error = format!("{}", err)
                );
                parent_trace_state
            }
        };

        SamplingResult {
            decision,
            attributes: Vec::new(),
            trace_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::assert_consistent;
    use crate::trace_state::{MAX_RANDOMNESS, MIN_THRESHOLD};
    use opentelemetry::trace::{SpanId, TraceFlags, TraceState};
    use rstest::rstest;

    const TRACE_ID: u128 = 0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736;

    /// Keeps the parent threshold, or uses a fixed one for roots and
    /// children without a usable parent threshold.
    #[derive(Clone, Debug)]
    struct KeepParentThreshold(u8);

    impl ConsistentSampler for KeepParentThreshold {
        fn compute_threshold(&self, parent_threshold: Option<u8>, is_root: bool) -> u8 {
            match (parent_threshold, is_root) {
                (Some(p), false) => p,
                _ => self.0,
            }
        }

        fn description(&self) -> Cow<'static, str> {
            Cow::Owned(format!("KeepParentThreshold{{{}}}", self.0))
        }
    }

    fn parent_context(ot: &str, sampled: bool) -> Context {
        let trace_flags = if sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        let trace_state =
            TraceState::from_key_value(vec![("ot", ot), ("vendor", "abc")]).unwrap();
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from(TRACE_ID),
            SpanId::from(1u64),
            trace_flags,
            true,
            trace_state,
        ))
    }

    fn sample<S: ConsistentSampler + Clone + 'static>(
        sampler: S,
        parent_context: Option<&Context>,
    ) -> SamplingResult {
        ConsistentSampling::builder(sampler)
            .with_randomness_source(RandomnessSource::TraceId)
            .build()
            .should_sample(
                parent_context,
                TraceId::from(TRACE_ID),
                "span",
                &SpanKind::Internal,
                &[],
                &[],
            )
    }

    fn expected_root_randomness() -> u8 {
        RandomnessSource::TraceId.generate(TraceId::from(TRACE_ID))
    }

    #[test]
    fn root_span_with_always_on() {
        let result = sample(ConsistentAlwaysOnSampler, None);
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert!(result.attributes.is_empty());

        let state = OtelTraceState::from_trace_state(&result.trace_state);
        assert_eq!(state.threshold(), Some(MIN_THRESHOLD));
        assert_eq!(state.randomness(), Some(expected_root_randomness()));
        assert_eq!(
            result.trace_state.get("ot"),
            Some(format!("p:0;r:{}", expected_root_randomness()).as_str())
        );
    }

    #[test]
    fn context_without_span_is_root() {
        let cx = Context::new();
        let result = sample(KeepParentThreshold(MAX_THRESHOLD), Some(&cx));
        assert_eq!(result.decision, SamplingDecision::Drop);
        assert_eq!(
            result.trace_state.header(),
            format!("ot=r:{}", expected_root_randomness())
        );
    }

    #[test]
    fn invalid_parent_span_context_is_root() {
        let cx = Context::new().with_remote_span_context(SpanContext::new(
            TraceId::INVALID,
            SpanId::INVALID,
            TraceFlags::SAMPLED,
            true,
            TraceState::from_key_value(vec![("ot", "p:3;r:10")]).unwrap(),
        ));
        let result = sample(KeepParentThreshold(MIN_THRESHOLD), Some(&cx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(
            result.trace_state.header(),
            format!("ot=p:0;r:{}", expected_root_randomness())
        );
    }

    #[test]
    fn child_keeps_parent_randomness_and_foreign_entries() {
        let cx = parent_context("p:3;r:10;xx:foo", true);
        let result = sample(ConsistentAlwaysOnSampler, Some(&cx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.header(), "ot=p:0;r:10;xx:foo,vendor=abc");
    }

    #[rustfmt::skip]
    #[rstest]
    // name, parent ot entry, parent sampled, expected decision, expected ot entry
    #[case("consistent sampled parent", "p:3;r:10", true, SamplingDecision::RecordAndSample, Some("p:3;r:10"))]
    #[case("threshold above randomness", "p:12;r:10", true, SamplingDecision::Drop, Some("r:10"))]
    #[case("unsampled parent with low threshold", "p:3;r:10", false, SamplingDecision::Drop, Some("r:10"))]
    #[case("unsampled parent", "p:12;r:10", false, SamplingDecision::Drop, Some("r:10"))]
    #[case("parent at randomness", "p:10;r:10", true, SamplingDecision::RecordAndSample, Some("p:10;r:10"))]
    #[case("parent without threshold", "r:10", true, SamplingDecision::Drop, Some("r:10"))]
    fn parent_threshold_consistency(
        #[case] name: &str,
        #[case] ot: &str,
        #[case] parent_sampled: bool,
        #[case] expected_decision: SamplingDecision,
        #[case] expected_ot: Option<&str>,
    ) {
        let cx = parent_context(ot, parent_sampled);
        let result = sample(KeepParentThreshold(MAX_THRESHOLD), Some(&cx));
        assert_eq!(result.decision, expected_decision, "{}", name);
        assert_eq!(result.trace_state.get("ot"), expected_ot, "{}", name);
        assert_eq!(result.trace_state.get("vendor"), Some("abc"), "{}", name);
    }

    #[test]
    fn malformed_parent_entry_gets_fresh_randomness() {
        let cx = parent_context("p:3;r:10;", true);
        let result = sample(ConsistentAlwaysOnSampler, Some(&cx));
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(
            result.trace_state.get("ot"),
            Some(format!("p:0;r:{}", expected_root_randomness()).as_str())
        );
    }

    #[test]
    fn random_source_produces_valid_randomness() {
        let sampler = ConsistentSampling::builder(ConsistentAlwaysOnSampler)
            .with_randomness_source(RandomnessSource::Random)
            .build();
        assert_eq!(sampler.randomness_source(), RandomnessSource::Random);
        for _ in 0..100 {
            let result = sampler.should_sample(
                None,
                TraceId::from(TRACE_ID),
                "span",
                &SpanKind::Internal,
                &[],
                &[],
            );
            let state = OtelTraceState::from_trace_state(&result.trace_state);
            assert!(state.randomness().is_some());
            assert_eq!(state.threshold(), Some(MIN_THRESHOLD));
        }
    }

    #[test]
    fn shared_dyn_sampler() {
        let shared: Arc<dyn ConsistentSampler> = Arc::new(ConsistentAlwaysOnSampler);
        assert_eq!(shared.description(), ConsistentAlwaysOnSampler::DESCRIPTION);
        let result = sample(shared, None);
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
    }

    #[test]
    fn clone_a_boxed_consistent_sampler() {
        let sampler: Box<dyn ShouldSample> =
            Box::new(ConsistentSampling::new(KeepParentThreshold(5)));
        #[allow(clippy::redundant_clone)]
        let cloned = sampler.clone();
        let cx = parent_context("p:3;r:10", true);

        let result = sampler.should_sample(
            Some(&cx),
            TraceId::from(TRACE_ID),
            "should sample",
            &SpanKind::Internal,
            &[],
            &[],
        );
        let cloned_result = cloned.should_sample(
            Some(&cx),
            TraceId::from(TRACE_ID),
            "should sample",
            &SpanKind::Internal,
            &[],
            &[],
        );
        assert_eq!(result, cloned_result);
    }

    #[test]
    fn builder_falls_back_to_env_randomness_source() {
        temp_env::with_var(OTEL_CONSISTENT_SAMPLING_RANDOMNESS, Some("random"), || {
            let sampler = ConsistentSampling::new(ConsistentAlwaysOnSampler);
            assert_eq!(sampler.randomness_source(), RandomnessSource::Random);

            let sampler = ConsistentSampling::builder(ConsistentAlwaysOnSampler)
                .with_randomness_source(RandomnessSource::TraceId)
                .build();
            assert_eq!(sampler.randomness_source(), RandomnessSource::TraceId);
        });
    }

    #[test]
    fn description_delegates_to_sampler() {
        let sampler = ConsistentSampling::new(KeepParentThreshold(5));
        assert_eq!(sampler.description(), "KeepParentThreshold{5}");
        assert_eq!(sampler.sampler().0, 5);
        assert_consistent(sampler.sampler());
    }

    #[test]
    fn decision_rule_is_monotonic() {
        for r in 0..=MAX_RANDOMNESS {
            for t in 1..=MAX_THRESHOLD {
                if is_sampled(t, r) {
                    assert!(is_sampled(t - 1, r), "t={} r={}", t, r);
                }
            }
            assert!(is_sampled(MIN_THRESHOLD, r));
            assert!(!is_sampled(MAX_THRESHOLD, r));
        }
    }

    #[test]
    fn probabilities() {
        assert_eq!(sampling_probability(0), 1.0);
        assert_eq!(sampling_probability(1), 0.5);
        assert_eq!(sampling_probability(10), 1.0 / 1024.0);
        assert_eq!(sampling_probability(MAX_THRESHOLD), 0.0);
        assert_eq!(sampling_probability(200), 0.0);
        assert!(sampling_probability(62) > 0.0);
    }
}
