//! MQTT subscription adapter built on `rumqttc`.
//!
//! The `rumqttc` event loop reconnects on its own whenever it is polled after a
//! transport error. This adapter paces those polls with the configured
//! reconnect delay and re-issues the subscription on every `CONNACK`.

use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, SubscribeReasonCode,
};
use sensor_ingest_config::{BrokerConfig, ConfigLimits};
use sensor_ingest_ports::{
    BoxFuture, InboundMessage, SessionEvent, SubscriptionPort, SupervisorBusPort,
    SupervisorEvent, TopicFilter,
};
use sensor_ingest_shared::{ErrorClass, ErrorCode, ErrorEnvelope, RequestContext, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Client id used when none is configured: `sensor-ingest-{database}-{uuid}`.
#[must_use]
pub fn generated_client_id(database: &str) -> String {
    format!("sensor-ingest-{database}-{}", Uuid::new_v4())
}

/// Map the configured QoS level (already validated to 0 or 1).
#[must_use]
pub const fn qos_from_config(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Build `rumqttc` options from the `broker` section.
///
/// The packet size limit applies to both directions; an incoming publish over
/// it fails the connection rather than being truncated.
#[must_use]
pub fn mqtt_options(broker: &BrokerConfig, limits: &ConfigLimits, database: &str) -> MqttOptions {
    let client_id = broker
        .client_id
        .as_deref()
        .map_or_else(|| generated_client_id(database), str::to_owned);
    let max_packet = usize::try_from(limits.broker_max_packet_bytes.get()).unwrap_or(usize::MAX);
    let mut options = MqttOptions::new(client_id, &*broker.host, broker.port);
    options
        .set_keep_alive(Duration::from_secs(limits.broker_keep_alive_secs.get()))
        .set_clean_session(broker.clean_session)
        .set_max_packet_size(max_packet, max_packet);
    if let Some(username) = broker.username.as_deref() {
        options.set_credentials(username, broker.password.as_deref().unwrap_or_default());
    }
    options
}

/// Broker session subscribed to one topic filter.
pub struct MqttSubscription {
    client: AsyncClient,
    event_loop: EventLoop,
    client_id: Box<str>,
    topic: TopicFilter,
    qos: QoS,
    reconnect_delay: Duration,
    bus: Option<Arc<dyn SupervisorBusPort>>,
    failed_attempts: u32,
    pending_delay: Option<Duration>,
    closed: Option<Box<str>>,
}

impl MqttSubscription {
    /// Create the session. Nothing is dialed until the first `next_event`.
    #[must_use]
    pub fn new(broker: &BrokerConfig, limits: &ConfigLimits, database: &str) -> Self {
        let options = mqtt_options(broker, limits, database);
        let client_id = options.client_id().into_boxed_str();
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        Self {
            client,
            event_loop,
            client_id,
            topic: broker.topic.clone(),
            qos: qos_from_config(broker.qos),
            reconnect_delay: Duration::from_millis(limits.broker_reconnect_delay_ms.get()),
            bus: None,
            failed_attempts: 0,
            pending_delay: None,
            closed: None,
        }
    }

    /// Publish reconnect and close events to `bus`.
    #[must_use]
    pub fn with_supervisor_bus(mut self, bus: Arc<dyn SupervisorBusPort>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Client id presented to the broker.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn publish(&self, event: SupervisorEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    fn on_connected(&mut self, session_present: bool) -> Result<SessionEvent> {
        self.failed_attempts = 0;
        self.client
            .try_subscribe(self.topic.as_str(), self.qos)
            .map_err(|error| subscribe_error(&self.topic, &error))?;
        Ok(SessionEvent::Connected { session_present })
    }

    fn on_transport_error(&mut self, error: &ConnectionError) -> SessionEvent {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        let reason: Box<str> = error.to_string().into();
        self.pending_delay = Some(self.reconnect_delay);
        self.publish(SupervisorEvent::ReconnectAttempt {
            attempt: self.failed_attempts,
            reason: reason.clone(),
        });
        SessionEvent::Reconnecting {
            attempt: self.failed_attempts,
            reason,
            delay_ms: u64::try_from(self.reconnect_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn close(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.into());
            self.publish(SupervisorEvent::Closed {
                reason: reason.into(),
            });
        }
    }
}

impl SubscriptionPort for MqttSubscription {
    fn next_event<'a>(&'a mut self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<SessionEvent>> {
        Box::pin(async move {
            loop {
                if let Some(reason) = &self.closed {
                    return Ok(SessionEvent::Closed {
                        reason: reason.clone(),
                    });
                }
                ctx.ensure_not_cancelled("broker.poll")?;

                if let Some(delay) = self.pending_delay.take() {
                    tokio::select! {
                        () = ctx.cancelled() => return Err(poll_cancelled()),
                        () = tokio::time::sleep(delay) => {},
                    }
                }

                let polled = tokio::select! {
                    () = ctx.cancelled() => return Err(poll_cancelled()),
                    polled = self.event_loop.poll() => polled,
                };

                match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return self.on_connected(ack.session_present);
                    },
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        return Ok(SessionEvent::Message(InboundMessage {
                            topic: publish.topic.into(),
                            payload: publish.payload.to_vec(),
                        }));
                    },
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        if ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure))
                        {
                            return Err(ErrorEnvelope::unexpected(
                                ErrorCode::new("broker", "subscribe_failed"),
                                "broker rejected the subscription",
                                ErrorClass::NonRetriable,
                            )
                            .with_metadata("topic", self.topic.as_str()));
                        }
                        tracing::debug!(topic = self.topic.as_str(), "subscription acknowledged");
                    },
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::debug!("broker sent disconnect");
                    },
                    Ok(other) => {
                        tracing::trace!(event = ?other, "mqtt event ignored");
                    },
                    Err(error) => return Ok(self.on_transport_error(&error)),
                }
            }
        })
    }

    fn disconnect<'a>(&'a mut self, _ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.closed.is_some() {
                return Ok(());
            }
            if let Err(error) = self.client.try_disconnect() {
                tracing::debug!(%error, "disconnect request not queued");
            } else {
                // Drive the loop until the DISCONNECT packet is flushed.
                let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
                    loop {
                        match self.event_loop.poll().await {
                            Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                            Ok(_) => {},
                        }
                    }
                })
                .await;
                if flushed.is_err() {
                    tracing::debug!("disconnect flush timed out");
                }
            }
            self.close("client disconnected");
            Ok(())
        })
    }
}

fn poll_cancelled() -> ErrorEnvelope {
    ErrorEnvelope::cancelled("subscription cancelled").with_metadata("operation", "broker.poll")
}

fn subscribe_error(topic: &TopicFilter, error: &ClientError) -> ErrorEnvelope {
    ErrorEnvelope::unexpected(
        ErrorCode::new("broker", "subscribe_failed"),
        error.to_string(),
        ErrorClass::Retriable,
    )
    .with_metadata("topic", topic.as_str())
}
