//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc client, drives its event loop on a background
//! task and reports link state through a watch channel.

use super::connection::{
    classify_connection_error, classify_refusal, configure_mqtt_options, LinkState,
    REQUEST_CAPACITY,
};
use super::health_monitor::{HealthMonitor, LinkEvent, PingWatchdog};
use super::message_handler::{EventRoute, MessageHandler};
use crate::mqtt_span;
use crate::transport::{BrokerError, SessionOptions, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

struct ActiveSession {
    client_id: String,
    client: AsyncClient,
    driver: JoinHandle<()>,
}

/// Publish-only MQTT 3.1.1 transport backed by rumqttc
pub struct MqttTransport {
    session: Mutex<Option<ActiveSession>>,
    // Read synchronously by `send`
    client: RwLock<Option<AsyncClient>>,
    link_up: Arc<AtomicBool>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            client: RwLock::new(None),
            link_up: Arc::new(AtomicBool::new(false)),
        }
    }

    fn current_client(&self) -> Option<AsyncClient> {
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_client(&self, client: Option<AsyncClient>) {
        match self.client.write() {
            Ok(mut guard) => *guard = client,
            Err(poisoned) => *poisoned.into_inner() = client,
        }
    }

    /// Wait until the driver reports CONNACK or a terminal state
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    LinkState::Connected => return Ok(()),
                    LinkState::Connecting => {}
                    terminal => {
                        return Err(terminal.into_connect_error().unwrap_or_else(|| {
                            BrokerError::Unreachable("unexpected link state".to_string())
                        }));
                    }
                }
                if state_rx.changed().await.is_err() {
                    return Err(BrokerError::Unreachable(
                        "event loop stopped before CONNACK".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Unreachable(format!(
                "no CONNACK within {timeout:?}"
            ))),
        }
    }

    /// Poll the event loop until the session ends
    async fn drive_event_loop(
        client_id: String,
        mut event_loop: EventLoop,
        state_tx: watch::Sender<LinkState>,
        link_up: Arc<AtomicBool>,
        ping_timeout: Duration,
    ) {
        let mut watchdog = PingWatchdog::new(ping_timeout);

        loop {
            let deadline = watchdog.deadline();
            let link_event = tokio::select! {
                polled = event_loop.poll() => match polled {
                    Err(e) => LinkEvent::Failed(classify_connection_error(&e)),
                    Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                        EventRoute::ConnectionAcknowledged => LinkEvent::ConnAckReceived,
                        EventRoute::ConnectionRefused(code) => {
                            LinkEvent::Failed(classify_refusal(code))
                        }
                        EventRoute::DisconnectSent => LinkEvent::DisconnectSent,
                        EventRoute::DisconnectedByBroker => LinkEvent::DisconnectedByBroker,
                        EventRoute::PingSent => {
                            watchdog.on_ping_sent(Instant::now());
                            continue;
                        }
                        EventRoute::PingResponse => {
                            watchdog.on_ping_response();
                            continue;
                        }
                        EventRoute::InfrastructureEvent => {
                            debug!(client_id = %client_id, event = ?event, "MQTT event");
                            continue;
                        }
                    },
                },
                _ = Self::ping_deadline(deadline) => LinkEvent::PingTimedOut(watchdog.timeout()),
            };

            let state = HealthMonitor::determine_next_state(&client_id, link_event);
            link_up.store(HealthMonitor::can_publish(&state), Ordering::SeqCst);
            let terminal = HealthMonitor::is_terminal(&state);
            let _ = state_tx.send(state);
            if terminal {
                break;
            }
        }
    }

    async fn ping_deadline(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn open(&self, session: &SessionOptions) -> Result<(), BrokerError> {
        let mut active = self.session.lock().await;
        if active.is_some() && self.is_link_up() {
            return Err(BrokerError::InvalidSession(
                "a session is already open".to_string(),
            ));
        }
        if let Some(stale) = active.take() {
            debug!(client_id = %stale.client_id, "Discarding session with lost link");
            stale.driver.abort();
            self.set_client(None);
        }

        let mqtt_options = configure_mqtt_options(session)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        info!(
            client_id = %session.client_id,
            server = %session.server(),
            "Opening MQTT session"
        );

        let span = mqtt_span!(client_id = %session.client_id, server = %session.server());
        let driver = tokio::spawn(
            Self::drive_event_loop(
                session.client_id.clone(),
                event_loop,
                state_tx,
                self.link_up.clone(),
                session.ping_timeout,
            )
            .instrument(span),
        );

        if let Err(e) =
            Self::wait_for_connection_confirmation(state_rx, session.connect_timeout).await
        {
            driver.abort();
            self.link_up.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.set_client(Some(client.clone()));
        *active = Some(ActiveSession {
            client_id: session.client_id.clone(),
            client,
            driver,
        });
        Ok(())
    }

    async fn probe(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        let client = self.current_client().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))
    }

    fn send(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        if !self.is_link_up() {
            return Err(BrokerError::NotConnected);
        }
        let client = self.current_client().ok_or(BrokerError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))
    }

    async fn close(&self, linger: Duration) -> Result<(), BrokerError> {
        let Some(ActiveSession {
            client_id,
            client,
            mut driver,
        }) = self.session.lock().await.take()
        else {
            return Ok(());
        };
        self.set_client(None);

        let mut result = Ok(());
        if self.link_up.load(Ordering::SeqCst) {
            match tokio::time::timeout(linger, client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(client_id = %client_id, error = %e, "Event loop already gone");
                }
                Err(_) => {
                    result = Err(BrokerError::Unreachable(format!(
                        "DISCONNECT not queued within {linger:?}"
                    )));
                }
            }
        }

        match tokio::time::timeout(linger, &mut driver).await {
            Ok(Ok(())) => debug!(client_id = %client_id, "Event loop stopped"),
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(client_id = %client_id, error = %e, "Event loop task ended with error");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(client_id = %client_id, "Event loop did not stop within linger, aborting");
                driver.abort();
            }
        }

        self.link_up.store(false, Ordering::SeqCst);
        result
    }

    fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.driver.abort();
        }
    }
}
