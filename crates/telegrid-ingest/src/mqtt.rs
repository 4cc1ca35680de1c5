use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::debug;
use uuid::Uuid;

use telegrid_core::DistributionError;

use crate::transport::{MessageStream, PubSubTransport, TransportMessage};

/// Broker connection parameters for the ingestion side.
#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    pub client_id_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keepalive: Duration::from_secs(60),
            client_id_prefix: "telegrid".to_string(),
        }
    }
}

/// MQTT-backed transport. Each `connect` builds a fresh client and event
/// loop and queues the topic subscriptions; telemetry uses QoS 0, matching
/// the at-most-once delivery contract.
pub struct MqttTransport {
    config: MqttConfig,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PubSubTransport for MqttTransport {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn connect(&self, topics: &[String]) -> Result<MessageStream, DistributionError> {
        // A fresh client id per attempt avoids broker-side session takeover
        // fights between a half-dead predecessor and its replacement.
        let client_id = format!("{}-{}", self.config.client_id_prefix, Uuid::now_v7());
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keepalive);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        for topic in topics {
            client
                .subscribe(topic.as_str(), QoS::AtMostOnce)
                .await
                .map_err(|e| DistributionError::TransportDisconnected(e.to_string()))?;
            debug!(topic = %topic, "queued subscription");
        }

        // The client half must stay alive with the event loop or the
        // request channel closes under it.
        let stream = stream::unfold((client, eventloop), |(client, mut eventloop)| async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = TransportMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.clone(),
                        };
                        return Some((Ok(message), (client, eventloop)));
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("broker acknowledged connection");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Some((
                            Err(DistributionError::TransportDisconnected(e.to_string())),
                            (client, eventloop),
                        ));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
