//! The `ot` entry of the W3C trace state.
//!
//! Consistent probability sampling propagates two small integers next to every
//! trace: the randomness value `r` drawn once per trace, and the sampling
//! threshold `p` under which the trace has been kept so far. Both live in the
//! `ot` list member of the [W3C `tracestate`] header, encoded as
//! `;`-separated `key:value` entries:
//!
//! ```text
//! tracestate: ot=p:2;r:10;xx:foo,vendor=bar
//! ```
//!
//! Entries owned by other OpenTelemetry components are kept verbatim and in
//! order so the payload survives a round trip through this crate.
//!
//! [W3C `tracestate`]: https://www.w3.org/TR/trace-context/#tracestate-header
use crate::error::{ConsistentSamplingResult, ParseError};
use opentelemetry::otel_debug;
use opentelemetry::trace::TraceState;
use opentelemetry_sdk::trace::TraceError;
use std::fmt;
use std::str::FromStr;

/// The key of the OpenTelemetry list member in the W3C trace state.
pub const TRACE_STATE_KEY: &str = "ot";

/// Maximum length of the `ot` payload, on input and on output.
pub const TRACE_STATE_SIZE_LIMIT: usize = 256;

/// Smallest valid threshold. Spans with this threshold are always sampled.
pub const MIN_THRESHOLD: u8 = 0;
/// Largest valid threshold. Spans with this threshold are never sampled.
pub const MAX_THRESHOLD: u8 = 63;
/// Integer sentinel for an invalid threshold, outside `[MIN_THRESHOLD, MAX_THRESHOLD]`.
pub const INVALID_THRESHOLD: i32 = -1;

/// Smallest valid randomness value.
pub const MIN_RANDOMNESS: u8 = 0;
/// Largest valid randomness value.
pub const MAX_RANDOMNESS: u8 = 62;
/// Integer sentinel for an invalid randomness value, outside `[MIN_RANDOMNESS, MAX_RANDOMNESS]`.
pub const INVALID_RANDOMNESS: i32 = -1;

const THRESHOLD_SUBKEY: &str = "p";
const RANDOMNESS_SUBKEY: &str = "r";

/// Returns `true` if `value` is a threshold that can be stored.
pub fn is_valid_threshold(value: i32) -> bool {
    checked_field(value, MAX_THRESHOLD).is_some()
}

/// Returns `true` if `value` is a randomness value that can be stored.
pub fn is_valid_randomness(value: i32) -> bool {
    checked_field(value, MAX_RANDOMNESS).is_some()
}

fn checked_field(value: i32, max: u8) -> Option<u8> {
    u8::try_from(value).ok().filter(|v| *v <= max)
}

/// Parsed representation of the `ot` trace state entry.
///
/// A missing or invalid threshold or randomness value is `None`; values out of
/// range are never clamped. The default value is the empty state: both fields
/// invalid and no foreign entries.
///
/// # Examples
///
/// ```
/// use opentelemetry_consistent_sampling::OtelTraceState;
///
/// let mut state = OtelTraceState::parse("p:2;r:10;xx:foo");
/// assert_eq!(state.threshold(), Some(2));
/// assert_eq!(state.randomness(), Some(10));
///
/// state.set_threshold(64);
/// assert!(!state.has_valid_threshold());
/// assert_eq!(state.serialize(), "r:10;xx:foo");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct OtelTraceState {
    randomness: Option<u8>,
    threshold: Option<u8>,
    foreign_pairs: Vec<String>,
}

impl OtelTraceState {
    /// Parses an `ot` payload.
    ///
    /// Never fails: a structurally invalid payload yields the empty state, and
    /// an out-of-range or malformed `p` or `r` value only invalidates that
    /// field. Use [`OtelTraceState::try_parse`] to learn why a payload was
    /// rejected.
    pub fn parse(ts: &str) -> Self {
        Self::try_parse(ts).unwrap_or_else(|err| {
            otel_debug!(
                name: "ConsistentSampling.TraceState.ParseFailed",
                reason = format!("{}", err)
            );
            Self::default()
        })
    }

    /// Parses an `ot` payload, returning the structural error if any.
    ///
    /// Field-level problems (for example `p:64` or `r:abc`) are not errors,
    /// the field is simply invalid in the returned state.
    pub fn try_parse(ts: &str) -> Result<Self, ParseError> {
        if ts.is_empty() {
            return Err(ParseError::Empty);
        }
        if ts.len() > TRACE_STATE_SIZE_LIMIT {
            return Err(ParseError::TooLong { len: ts.len() });
        }

        let bytes = ts.as_bytes();
        let len = bytes.len();
        let mut state = OtelTraceState::default();
        let mut start = 0;

        loop {
            if bytes[start] == b';' {
                return Err(ParseError::EmptyEntry { offset: start });
            }

            let key_end = start
                + bytes[start..]
                    .iter()
                    .enumerate()
                    .take_while(|&(i, &b)| b.is_ascii_lowercase() || (i > 0 && b.is_ascii_digit()))
                    .count();
            match bytes.get(key_end) {
                _ if key_end == start => return Err(ParseError::InvalidKey { offset: start }),
                Some(b':') => {}
                None | Some(b';') => {
                    return Err(ParseError::MissingKeyValueSeparator { offset: key_end })
                }
                Some(_) => return Err(ParseError::InvalidKey { offset: key_end }),
            }

            let value_start = key_end + 1;
            let value_end = value_start
                + bytes[value_start..]
                    .iter()
                    .take_while(|&&b| is_value_byte(b))
                    .count();

            let value = &ts[value_start..value_end];
            match &ts[start..key_end] {
                THRESHOLD_SUBKEY => state.threshold = parse_field(value, MAX_THRESHOLD),
                RANDOMNESS_SUBKEY => state.randomness = parse_field(value, MAX_RANDOMNESS),
                _ => state.foreign_pairs.push(ts[start..value_end].to_owned()),
            }

            if value_end == len {
                break;
            }
            if bytes[value_end] != b';' {
                return Err(ParseError::InvalidValue { offset: value_end });
            }

            start = value_end + 1;
            if start == len {
                return Err(ParseError::TrailingSeparator);
            }
        }

        Ok(state)
    }

    /// Reads the `ot` entry of a W3C trace state.
    ///
    /// Returns the empty state if the entry is absent or invalid.
    pub fn from_trace_state(trace_state: &TraceState) -> Self {
        trace_state
            .get(TRACE_STATE_KEY)
            .map(Self::parse)
            .unwrap_or_default()
    }

    /// Reads the `ot` entry of a W3C trace state, failing on a structurally
    /// invalid entry.
    ///
    /// An absent entry is not an error and yields the empty state.
    pub fn try_from_trace_state(trace_state: &TraceState) -> ConsistentSamplingResult<Self> {
        match trace_state.get(TRACE_STATE_KEY) {
            Some(ts) => Ok(Self::try_parse(ts)?),
            None => Ok(Self::default()),
        }
    }

    /// Returns a copy of `trace_state` whose `ot` entry holds this state.
    ///
    /// The entry moves to the front of the list as W3C mutation rules
    /// require. If this state serializes to an empty string the `ot` entry is
    /// removed instead.
    pub fn store_in(&self, trace_state: &TraceState) -> ConsistentSamplingResult<TraceState> {
        let serialized = self.serialize();
        let updated = if serialized.is_empty() {
            trace_state.delete(TRACE_STATE_KEY)
        } else {
            trace_state.insert(TRACE_STATE_KEY, serialized)
        };
        Ok(updated.map_err(|err| TraceError::Other(Box::new(err)))?)
    }

    /// Encodes this state as an `ot` payload.
    ///
    /// `p` and `r` come first. Foreign entries follow in their original order
    /// until the next one would push the output past
    /// [`TRACE_STATE_SIZE_LIMIT`]; the rest are dropped.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(TRACE_STATE_SIZE_LIMIT);
        if let Some(p) = self.threshold {
            out.push_str("p:");
            out.push_str(&p.to_string());
        }
        if let Some(r) = self.randomness {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str("r:");
            out.push_str(&r.to_string());
        }
        for pair in &self.foreign_pairs {
            let separator = usize::from(!out.is_empty());
            if out.len() + separator + pair.len() > TRACE_STATE_SIZE_LIMIT {
                break;
            }
            if separator == 1 {
                out.push(';');
            }
            out.push_str(pair);
        }
        out
    }

    /// The sampling threshold, if valid.
    pub fn threshold(&self) -> Option<u8> {
        self.threshold
    }

    /// The randomness value, if valid.
    pub fn randomness(&self) -> Option<u8> {
        self.randomness
    }

    /// Entries not owned by this crate, as `key:value` strings in input order.
    pub fn foreign_pairs(&self) -> &[String] {
        &self.foreign_pairs
    }

    /// Returns `true` if the threshold is within `[0, 63]`.
    pub fn has_valid_threshold(&self) -> bool {
        self.threshold.is_some()
    }

    /// Returns `true` if the randomness value is within `[0, 62]`.
    pub fn has_valid_randomness(&self) -> bool {
        self.randomness.is_some()
    }

    /// Returns `true` if nothing would be serialized.
    pub fn is_empty(&self) -> bool {
        self.threshold.is_none() && self.randomness.is_none() && self.foreign_pairs.is_empty()
    }

    /// Sets the threshold, or invalidates it if `value` is out of range.
    pub fn set_threshold(&mut self, value: i32) {
        self.threshold = checked_field(value, MAX_THRESHOLD);
    }

    /// Sets the randomness value, or invalidates it if `value` is out of range.
    pub fn set_randomness(&mut self, value: i32) {
        self.randomness = checked_field(value, MAX_RANDOMNESS);
    }

    /// Clears the threshold so it is left out of the serialized entry.
    pub fn invalidate_threshold(&mut self) {
        self.threshold = None;
    }

    /// Clears the randomness value so it is left out of the serialized entry.
    pub fn invalidate_randomness(&mut self) {
        self.randomness = None;
    }

    /// Returns this state with the threshold replaced, see [`set_threshold`].
    ///
    /// [`set_threshold`]: OtelTraceState::set_threshold
    pub fn with_threshold(mut self, value: i32) -> Self {
        self.set_threshold(value);
        self
    }

    /// Returns this state with the randomness value replaced, see [`set_randomness`].
    ///
    /// [`set_randomness`]: OtelTraceState::set_randomness
    pub fn with_randomness(mut self, value: i32) -> Self {
        self.set_randomness(value);
        self
    }
}

impl FromStr for OtelTraceState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_parse(s)
    }
}

impl fmt::Display for OtelTraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

fn is_value_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-'
}

/// One or two decimal digits; two-digit values above `max` are rejected.
fn parse_field(value: &str, max: u8) -> Option<u8> {
    match *value.as_bytes() {
        [d] if d.is_ascii_digit() => Some(d - b'0'),
        [d1, d2] if d1.is_ascii_digit() && d2.is_ascii_digit() => {
            let v = (d1 - b'0') * 10 + (d2 - b'0');
            if v > max {
                otel_debug!(
                    name: "ConsistentSampling.TraceState.ValueOutOfRange",
                    value = value,
                    max = max
                );
                return None;
            }
            Some(v)
        }
        _ => None,
    }
}
