use std::sync::Arc;

use crate::network::transport::TransportFactory;
use crate::report_violation_to;
use crate::sessions::config::SessionConfig;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{NetplayError, NetplaySession};

/// The [`SessionBuilder`] builds [`NetplaySession`]s.
///
/// A transport factory is required; everything else has defaults.
///
/// ```
/// use lockstep_netplay::{MemoryNetwork, SessionBuilder, SessionConfig};
/// use lockstep_netplay::telemetry::CollectingObserver;
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::sync::Arc;
///
/// let network = MemoryNetwork::new();
/// let observer = Arc::new(CollectingObserver::new());
/// let session = SessionBuilder::new()
///     .with_session_config(SessionConfig::lan())
///     .with_violation_observer(observer.clone())
///     .with_transport_factory(network.factory(IpAddr::V4(Ipv4Addr::LOCALHOST)))
///     .build()
///     .unwrap();
/// assert_eq!(session.config().lag_depth, 2);
/// ```
#[must_use = "SessionBuilder must be consumed by calling build()"]
pub struct SessionBuilder {
    session_config: SessionConfig,
    /// Optional observer for protocol violations.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    transport_factory: Option<Box<dyn TransportFactory>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            session_config,
            violation_observer,
            transport_factory,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("session_config", session_config)
            .field("has_violation_observer", &violation_observer.is_some())
            .field("has_transport_factory", &transport_factory.is_some())
            .finish()
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Construct a new builder with all values set to their defaults.
    pub fn new() -> Self {
        Self {
            session_config: SessionConfig::default(),
            violation_observer: None,
            transport_factory: None,
        }
    }

    /// Replaces the lobby and lockstep settings.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Routes protocol violations to `observer` instead of the default tracing output.
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Sets how transport endpoints are created.
    pub fn with_transport_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.transport_factory = Some(Box::new(factory));
        self
    }

    /// Consumes the builder to construct an idle [`NetplaySession`].
    ///
    /// # Errors
    /// - Returns [`NetplayError::InvalidConfig`] if the session config does not validate
    ///   or no transport factory was set. A config that does not validate is also
    ///   reported to the violation observer.
    pub fn build(self) -> Result<NetplaySession, NetplayError> {
        if let Err(err) = self.session_config.validate() {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "session config rejected: {}",
                err
            );
            return Err(err);
        }
        let Some(factory) = self.transport_factory else {
            return Err(NetplayError::InvalidConfig {
                info: "a transport factory is required".to_owned(),
            });
        };
        Ok(NetplaySession::new(
            self.session_config,
            factory,
            self.violation_observer,
        ))
    }
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
    use crate::telemetry::CollectingObserver;
    use crate::MemoryNetwork;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn build_requires_a_transport_factory() {
        let err = SessionBuilder::new().build().unwrap_err();
        assert!(matches!(err, NetplayError::InvalidConfig { ref info } if info.contains("transport")));
    }

    #[test]
    fn build_validates_the_session_config() {
        let network = MemoryNetwork::new();
        let result = SessionBuilder::new()
            .with_session_config(SessionConfig {
                lag_depth: 0,
                ..SessionConfig::default()
            })
            .with_transport_factory(network.factory(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .build();
        assert!(matches!(result, Err(NetplayError::InvalidConfig { .. })));
    }

    #[test]
    fn rejected_config_is_reported_to_the_observer() {
        let network = MemoryNetwork::new();
        let observer = Arc::new(CollectingObserver::new());
        let result = SessionBuilder::new()
            .with_session_config(SessionConfig {
                max_players: 17,
                ..SessionConfig::default()
            })
            .with_violation_observer(observer.clone())
            .with_transport_factory(network.factory(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .build();
        assert!(result.is_err());
        assert!(observer.has_violation(ViolationKind::Configuration));
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn built_session_is_idle() {
        let network = MemoryNetwork::new();
        let session = SessionBuilder::default()
            .with_transport_factory(network.factory(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .build()
            .unwrap();
        assert!(!session.state().active);
        assert!(session.health().is_healthy());
        assert!(session.violation_observer().is_none());
        assert_eq!(network.endpoint_count(), 0);
    }

    #[test]
    fn debug_reports_what_is_configured() {
        let network = MemoryNetwork::new();
        let builder = SessionBuilder::new()
            .with_transport_factory(network.factory(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let rendered = format!("{builder:?}");
        assert!(rendered.contains("has_transport_factory: true"));
        assert!(rendered.contains("has_violation_observer: false"));
    }
}
