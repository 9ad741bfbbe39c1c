//! MQTT transport: inbound message dispatch and outbound device commands.
//!
//! The event loop owns reconnection; subscriptions are (re)issued on every
//! `ConnAck` so a broker restart does not silently drop the topic filters.
//! Each publish is handed to a spawned task so slow pipelines for one device
//! do not stall the others; a semaphore bounds the fan-out.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::MqttConfig;
use crate::ingest::PhotoIngestor;

/// Outbound command seam used by the HTTP device-control endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceCommander: Send + Sync {
    /// Publish a mode-change command to a device's setup topic.
    async fn send_mode(&self, device_id: &str, mode: &str) -> Result<()>;
}

/// Payload for a mode command: `set <mode>`.
fn setup_payload(mode: &str) -> String {
    format!("set {}", mode)
}

/// MQTT-backed device commander publishing to `<setup_prefix>/<device_id>`.
pub struct MqttDeviceCommander {
    client: AsyncClient,
    setup_prefix: String,
}

#[async_trait]
impl DeviceCommander for MqttDeviceCommander {
    async fn send_mode(&self, device_id: &str, mode: &str) -> Result<()> {
        let topic = format!("{}/{}", self.setup_prefix, device_id);

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, setup_payload(mode))
            .await
            .context("Failed to publish device command")?;

        info!(topic = %topic, mode = %mode, "Device mode command published");

        Ok(())
    }
}

/// MQTT consumer driving the ingestion pipeline.
pub struct MqttIngestService {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
    ingestor: Arc<PhotoIngestor>,
    dispatch_semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl MqttIngestService {
    pub fn new(
        config: MqttConfig,
        ingestor: Arc<PhotoIngestor>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut mqtt_options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        mqtt_options.set_keep_alive(config.keep_alive());

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let dispatch_semaphore = Arc::new(Semaphore::new(config.handler_concurrency));

        Self {
            client,
            eventloop,
            config,
            ingestor,
            dispatch_semaphore,
            shutdown,
        }
    }

    /// Commander sharing this consumer's client, for the HTTP layer.
    pub fn commander(&self) -> MqttDeviceCommander {
        MqttDeviceCommander {
            client: self.client.clone(),
            setup_prefix: self.config.setup_topic_prefix.clone(),
        }
    }

    fn topic_filters(&self) -> [String; 3] {
        [
            format!("{}/+", self.config.photo_topic_prefix),
            format!("{}/+", self.config.register_topic_prefix),
            format!("{}/+", self.config.disconnect_topic_prefix),
        ]
    }

    async fn subscribe_all(client: &AsyncClient, filters: [String; 3]) -> Result<()> {
        for filter in filters {
            client
                .subscribe(&filter, QoS::AtLeastOnce)
                .await
                .with_context(|| format!("Failed to subscribe to {}", filter))?;
            info!(filter = %filter, "Subscribed to MQTT topic filter");
        }
        Ok(())
    }

    /// Run until the shutdown token fires. Connection errors back off and
    /// retry; the event loop reconnects on the next poll.
    #[instrument(skip(self), fields(broker = %self.config.broker_host, port = self.config.broker_port))]
    pub async fn run(mut self) -> Result<()> {
        info!("Starting MQTT ingest loop");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, disconnecting from broker");
                    let _ = self.client.disconnect().await;
                    break;
                }
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            Self::subscribe_all(&self.client, self.topic_filters()).await?;
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            Self::dispatch(
                                self.ingestor.clone(),
                                self.dispatch_semaphore.clone(),
                                publish,
                            )
                            .await;
                        }
                        Ok(Event::Incoming(Packet::SubAck(_))) => {
                            debug!("Subscription acknowledged");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "MQTT connection error");
                            metrics::counter!("photosink.mqtt.errors").increment(1);
                            tokio::select! {
                                _ = self.shutdown.cancelled() => break,
                                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                            }
                        }
                    }
                }
            }
        }

        info!("MQTT ingest loop stopped");

        Ok(())
    }

    /// Hand one publish to the pipeline on its own task. Handlers run
    /// concurrently across messages; the semaphore bounds them.
    async fn dispatch(
        ingestor: Arc<PhotoIngestor>,
        dispatch_semaphore: Arc<Semaphore>,
        publish: Publish,
    ) {
        let permit = match dispatch_semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed, shutting down
        };

        tokio::spawn(async move {
            let _permit = permit;
            let topic = publish.topic.as_str();

            match ingestor.handle_message(topic, &publish.payload).await {
                Ok(()) => {
                    metrics::counter!("photosink.messages.processed").increment(1);
                }
                Err(e) if e.is_sender_fault() => {
                    warn!(topic = %topic, error = %e, "Dropping message from sender");
                    metrics::counter!("photosink.messages.rejected").increment(1);
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "Failed to process message");
                    metrics::counter!("photosink.messages.failed").increment(1);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_payload_format() {
        assert_eq!(setup_payload("live"), "set live");
        assert_eq!(setup_payload("normal"), "set normal");
    }
}
