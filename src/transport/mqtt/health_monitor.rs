//! Pure link health logic for the MQTT event loop driver
//!
//! The broker link is never re-established: every decision here either keeps
//! the session or ends it for good.

use super::connection::LinkState;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Tracks the oldest PINGREQ still waiting for a PINGRESP
#[derive(Debug, Clone)]
pub struct PingWatchdog {
    timeout: Duration,
    outstanding_since: Option<Instant>,
}

impl PingWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            outstanding_since: None,
        }
    }

    /// Record an outgoing PINGREQ; an older outstanding ping keeps its deadline
    pub fn on_ping_sent(&mut self, now: Instant) {
        if self.outstanding_since.is_none() {
            self.outstanding_since = Some(now);
        }
    }

    pub fn on_ping_response(&mut self) {
        self.outstanding_since = None;
    }

    /// Instant at which the outstanding ping expires, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding_since.map(|sent| sent + self.timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Events observed by the event loop driver
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    ConnAckReceived,
    DisconnectSent,
    DisconnectedByBroker,
    PingTimedOut(Duration),
    Failed(LinkState),
}

/// Pure link state transitions
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine the next state after a link event (pure function)
    pub fn determine_next_state(client_id: &str, event: LinkEvent) -> LinkState {
        match event {
            LinkEvent::ConnAckReceived => {
                info!(client_id = %client_id, "MQTT session acknowledged");
                LinkState::Connected
            }
            LinkEvent::DisconnectSent => {
                info!(client_id = %client_id, "MQTT session closed");
                LinkState::Closed
            }
            LinkEvent::DisconnectedByBroker => {
                warn!(client_id = %client_id, "MQTT broker closed the session");
                LinkState::Lost("broker closed the session".to_string())
            }
            LinkEvent::PingTimedOut(timeout) => {
                error!(
                    client_id = %client_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "No PINGRESP from broker, declaring link lost"
                );
                LinkState::Lost(format!("no PINGRESP within {timeout:?}"))
            }
            LinkEvent::Failed(state) => {
                match &state {
                    LinkState::Rejected(reason) => {
                        error!(
                            client_id = %client_id,
                            reason = %reason,
                            "MQTT broker rejected credentials"
                        );
                    }
                    LinkState::Lost(reason) => {
                        error!(client_id = %client_id, reason = %reason, "MQTT link lost");
                    }
                    _ => {}
                }
                state
            }
        }
    }

    /// Check if the link state allows publishing (pure function)
    pub fn can_publish(state: &LinkState) -> bool {
        state.is_up()
    }

    /// True once the driver must stop polling
    pub fn is_terminal(state: &LinkState) -> bool {
        matches!(
            state,
            LinkState::Rejected(_) | LinkState::Lost(_) | LinkState::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_idle_has_no_deadline() {
        let watchdog = PingWatchdog::new(Duration::from_secs(10));
        assert_eq!(watchdog.deadline(), None);
    }

    #[test]
    fn test_watchdog_deadline_after_ping() {
        let mut watchdog = PingWatchdog::new(Duration::from_secs(10));
        let sent = Instant::now();
        watchdog.on_ping_sent(sent);

        assert_eq!(watchdog.deadline(), Some(sent + Duration::from_secs(10)));
    }

    #[test]
    fn test_watchdog_keeps_oldest_ping() {
        let mut watchdog = PingWatchdog::new(Duration::from_secs(10));
        let first = Instant::now();
        watchdog.on_ping_sent(first);
        watchdog.on_ping_sent(first + Duration::from_secs(5));

        assert_eq!(watchdog.deadline(), Some(first + Duration::from_secs(10)));
    }

    #[test]
    fn test_watchdog_response_clears_deadline() {
        let mut watchdog = PingWatchdog::new(Duration::from_secs(10));
        let sent = Instant::now();
        watchdog.on_ping_sent(sent);
        watchdog.on_ping_response();

        assert_eq!(watchdog.deadline(), None);
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state("host1", LinkEvent::ConnAckReceived),
            LinkState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state("host1", LinkEvent::DisconnectSent),
            LinkState::Closed
        );
        assert!(matches!(
            HealthMonitor::determine_next_state(
                "host1",
                LinkEvent::PingTimedOut(Duration::from_secs(10))
            ),
            LinkState::Lost(_)
        ));
        assert_eq!(
            HealthMonitor::determine_next_state(
                "host1",
                LinkEvent::Failed(LinkState::Rejected("NotAuthorized".to_string()))
            ),
            LinkState::Rejected("NotAuthorized".to_string())
        );
    }

    #[test]
    fn test_can_publish_only_when_connected() {
        assert!(HealthMonitor::can_publish(&LinkState::Connected));
        assert!(!HealthMonitor::can_publish(&LinkState::Connecting));
        assert!(!HealthMonitor::can_publish(&LinkState::Closed));
        assert!(!HealthMonitor::can_publish(&LinkState::Lost("x".to_string())));
    }

    #[test]
    fn test_every_event_but_connack_ends_the_driver() {
        let ending = [
            LinkEvent::DisconnectSent,
            LinkEvent::DisconnectedByBroker,
            LinkEvent::PingTimedOut(Duration::from_secs(10)),
            LinkEvent::Failed(LinkState::Lost("connection reset".to_string())),
            LinkEvent::Failed(LinkState::Rejected("BadUserNamePassword".to_string())),
        ];
        for event in ending {
            let state = HealthMonitor::determine_next_state("host1", event.clone());
            assert!(HealthMonitor::is_terminal(&state), "{event:?} kept the driver alive");
            assert!(!HealthMonitor::can_publish(&state));
        }

        let state = HealthMonitor::determine_next_state("host1", LinkEvent::ConnAckReceived);
        assert!(!HealthMonitor::is_terminal(&state));
        assert!(HealthMonitor::can_publish(&state));
    }

    #[test]
    fn test_is_terminal() {
        assert!(!HealthMonitor::is_terminal(&LinkState::Connecting));
        assert!(!HealthMonitor::is_terminal(&LinkState::Connected));
        assert!(HealthMonitor::is_terminal(&LinkState::Closed));
        assert!(HealthMonitor::is_terminal(&LinkState::Rejected("x".to_string())));
    }
}
