//! Structured reporting of protocol violations.
//!
//! Anything a peer sends that the protocol cannot accept, and any lockstep
//! fault the session detects, is turned into a [`ProtocolViolation`] and handed
//! to a [`ViolationObserver`]. Sessions log through [`TracingObserver`] unless
//! one is configured with [`SessionBuilder::with_violation_observer`].
//!
//! ```
//! use lockstep_netplay::telemetry::{CollectingObserver, ViolationKind, ViolationObserver};
//! use lockstep_netplay::report_violation_to;
//! use lockstep_netplay::telemetry::ViolationSeverity;
//! use std::sync::Arc;
//!
//! let collector = Arc::new(CollectingObserver::new());
//! let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
//!
//! report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::Replication,
//!     "chunk at offset {} overruns the blob", 90);
//! assert!(collector.has_violation(ViolationKind::Replication));
//! ```
//!
//! [`SessionBuilder::with_violation_observer`]: crate::SessionBuilder::with_violation_observer

use crate::{Frame, PlayerId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

mod frame_serializer {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            Some(f) if f.is_valid() => serializer.serialize_i32(f.as_i32()),
            _ => serializer.serialize_none(),
        }
    }
}

/// How bad a violation is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Dropped or corrected; nothing else affected.
    ///
    /// Example: a blob chunk that overruns its transfer.
    Warning,
    /// An attempt or a peer was abandoned.
    ///
    /// Example: a peer registered under a slot it was not assigned.
    Error,
    /// The session cannot advance correctly.
    ///
    /// Example: an input queue ran dry.
    Critical,
}

impl ViolationSeverity {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem a violation was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Join handshake: bad magic, version, length or sequencing.
    Handshake,
    /// Roster messages or slot bookkeeping.
    Roster,
    /// Game start and instance assignment.
    GameStart,
    /// Lockstep input queues: starvation, dropped frames, bad input packets.
    InputQueue,
    /// Blob replication frames and the sync barrier.
    Replication,
    /// Undecodable payloads or transport-level anomalies.
    Transport,
    /// Invalid configuration values.
    Configuration,
}

impl ViolationKind {
    /// snake_case label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Roster => "roster",
            Self::GameStart => "game_start",
            Self::InputQueue => "input_queue",
            Self::Replication => "replication",
            Self::Transport => "transport",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded violation.
///
/// ```
/// use lockstep_netplay::telemetry::{ProtocolViolation, ViolationKind, ViolationSeverity};
/// use lockstep_netplay::{Frame, PlayerId};
///
/// let violation = ProtocolViolation::new(
///     ViolationSeverity::Critical,
///     ViolationKind::InputQueue,
///     "input queue empty",
///     "netplay_session.rs:1",
/// )
/// .with_frame(Frame::new(120))
/// .with_player(PlayerId::new(2));
///
/// assert_eq!(violation.context.get("player").map(String::as_str), Some("2"));
/// assert!(violation.to_string().contains("frame=120"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// Severity level.
    pub severity: ViolationSeverity,
    /// Subsystem.
    pub kind: ViolationKind,
    /// What went wrong.
    pub message: String,
    /// `file:line` where it was detected.
    pub location: &'static str,
    /// Simulation frame, when one applies. Serialized as `null` otherwise.
    #[serde(serialize_with = "frame_serializer::serialize")]
    pub frame: Option<Frame>,
    /// Extra key/value diagnostics.
    pub context: BTreeMap<String, String>,
}

impl ProtocolViolation {
    /// Creates a violation with no frame and no context.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the frame the violation occurred on.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Records the player involved under the `player` key.
    #[must_use]
    pub fn with_player(self, player: PlayerId) -> Self {
        self.with_context("player", player.to_string())
    }

    /// Adds a context key/value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes the violation to a JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Serializes the violation to indented JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives violations as they are detected.
///
/// Called from the network-processing path, so implementations should return quickly.
pub trait ViolationObserver: Send + Sync {
    /// Called once per violation.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Logs violations through `tracing`.
///
/// `Warning` maps to `warn!`, `Error` and `Critical` map to `error!`. Severity,
/// kind, location, frame and context are emitted as structured fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_frame(frame: Option<Frame>) -> String {
        match frame {
            Some(f) if f.is_valid() => f.as_i32().to_string(),
            _ => "null".to_string(),
        }
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame_str = Self::format_frame(violation.frame);
        let context_str = if violation.context.is_empty() {
            "{}".to_string()
        } else {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Stores every violation it sees. Meant for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    /// Number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns `true` if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Returns `true` if a violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Returns `true` if a violation of exactly `severity` was collected.
    #[must_use]
    pub fn has_severity(&self, severity: ViolationSeverity) -> bool {
        self.violations
            .lock()
            .iter()
            .any(|v| v.severity == severity)
    }

    /// Violations of one kind.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Forgets everything collected so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Forwards every violation to several observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ViolationObserver>>,
}

impl CompositeObserver {
    /// Creates a composite with no children.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child observer.
    pub fn add(&mut self, observer: Arc<dyn ViolationObserver>) {
        self.observers.push(observer);
    }
}

impl ViolationObserver for CompositeObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        for observer in &self.observers {
            observer.on_violation(violation);
        }
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("num_observers", &self.observers.len())
            .finish()
    }
}

/// Reports a violation straight to [`TracingObserver`], tagged with the call site.
///
/// ```
/// use lockstep_netplay::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::Roster,
///     "player list count {} exceeds capacity", 17);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Asserts that a [`CollectingObserver`] saw nothing.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a [`CollectingObserver`] saw a violation of the given kind.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

/// Sends `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Like [`report_violation!`], routed through an `Option<Arc<dyn ViolationObserver>>`.
///
/// Use [`report_to_observer`] directly when the violation needs a frame or context.
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn violation(kind: ViolationKind, severity: ViolationSeverity) -> ProtocolViolation {
        ProtocolViolation::new(severity, kind, "test", "test.rs:1")
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn kind_labels_are_snake_case() {
        assert_eq!(ViolationKind::GameStart.as_str(), "game_start");
        assert_eq!(ViolationKind::InputQueue.as_str(), "input_queue");
        assert_eq!(ViolationKind::Replication.to_string(), "replication");
    }

    #[test]
    fn display_includes_frame_and_context() {
        let v = violation(ViolationKind::InputQueue, ViolationSeverity::Critical)
            .with_frame(Frame::new(12))
            .with_context("queue_len", "0");
        let text = v.to_string();
        assert!(text.starts_with("[critical/input_queue] test"));
        assert!(text.contains("frame=12"));
        assert!(text.contains("queue_len"));
    }

    #[test]
    fn collecting_observer_filters_by_kind() {
        let observer = CollectingObserver::new();
        observer.on_violation(&violation(
            ViolationKind::Roster,
            ViolationSeverity::Warning,
        ));
        observer.on_violation(&violation(
            ViolationKind::Replication,
            ViolationSeverity::Error,
        ));

        assert_eq!(observer.len(), 2);
        assert_eq!(observer.violations_of_kind(ViolationKind::Roster).len(), 1);
        assert!(observer.has_severity(ViolationSeverity::Error));
        assert!(!observer.has_severity(ViolationSeverity::Critical));

        observer.clear();
        assert_no_violations!(observer);
    }

    #[test]
    fn composite_fans_out() {
        let a = Arc::new(CollectingObserver::new());
        let b = Arc::new(CollectingObserver::new());
        let mut composite = CompositeObserver::new();
        composite.add(a.clone());
        composite.add(b.clone());

        composite.on_violation(&violation(
            ViolationKind::Handshake,
            ViolationSeverity::Error,
        ));

        assert_violation!(a, ViolationKind::Handshake);
        assert_violation!(b, ViolationKind::Handshake);
    }

    #[test]
    fn report_to_observer_falls_back_to_tracing() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::Transport,
            "undecodable payload of {} bytes",
            3
        );
    }

    #[test]
    fn report_violation_to_records_location() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::Replication,
            "dropped"
        );

        let violations = collector.violations();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].location.contains("telemetry.rs"));
    }

    #[test]
    fn collecting_observer_accepts_concurrent_writes() {
        let observer = Arc::new(CollectingObserver::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let observer = Arc::clone(&observer);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        observer.on_violation(&violation(
                            ViolationKind::InputQueue,
                            ViolationSeverity::Warning,
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(observer.len(), 100);
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_uses_null_for_missing_frame() {
        let json = violation(ViolationKind::Roster, ViolationSeverity::Warning)
            .to_json()
            .unwrap();
        assert!(json.contains(r#""frame":null"#));
        assert!(json.contains(r#""kind":"roster""#));
    }

    #[cfg(feature = "json")]
    #[test]
    fn pretty_json_carries_the_same_document() {
        let v = violation(ViolationKind::Configuration, ViolationSeverity::Error)
            .with_context("field", "lag_depth");
        let pretty = v.to_json_pretty().unwrap();
        assert!(pretty.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&pretty).unwrap();
        let compact: serde_json::Value = serde_json::from_str(&v.to_json().unwrap()).unwrap();
        assert_eq!(parsed, compact);
        assert_eq!(parsed["kind"], "configuration");
    }
}
