use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use proximity_rs::{Notification, Reason};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::{config, messages::ControlMessage};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct PresenceMqttMessage<'a> {
    presence: bool,
    reason: &'static str,
    device: Option<&'a str>,
    #[serde(rename = "id")]
    mac_address: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SignalMqttMessage<'a> {
    name: &'a str,
    #[serde(rename = "id")]
    mac_address: &'a str,
    rssi: Option<i32>,
    active: bool,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"proximity-rs".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or("proximity".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(
                    format!("{}/set/passive_mode", self.topic_path),
                    QoS::AtMostOnce,
                ),
                SubscribeFilter::new(format!("{}/set/suspended", self.topic_path), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<ControlMessage>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(message) = ControlMessage::parse(&p.topic, &p.payload) else {
                            warn!("Ignoring unrecognised MQTT message on {}", p.topic);
                            continue;
                        };

                        if let Err(err) = tx.send(message) {
                            error!("Error forwarding control message: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Publishes engine notifications until the sender side closes.
    /// `names` maps device addresses to configured names.
    pub async fn announce_loop(
        &self,
        mut rx: broadcast::Receiver<Notification<String>>,
        names: HashMap<String, String>,
    ) {
        loop {
            let notification = match rx.recv().await {
                Ok(notification) => notification,
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Notification channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("MQTT announcer skipped {skipped} notifications");
                    continue;
                }
            };
            let result = match &notification {
                Notification::PresenceChanged {
                    presence,
                    reason,
                    device,
                } => {
                    let address = device.as_deref();
                    let name = address.map(|a| names.get(a).map(String::as_str).unwrap_or(a));
                    self.announce_presence(*presence, *reason, name, address)
                        .await
                }
                Notification::SignalUpdated {
                    device,
                    estimate,
                    active,
                } => {
                    let name = names.get(device).map(String::as_str).unwrap_or(device);
                    self.announce_signal(name, device, *estimate, *active).await
                }
                _ => Ok(()),
            };
            if let Err(err) = result {
                error!("Error publishing to MQTT: {:?}", err);
            }
        }
    }

    pub async fn announce_presence(
        &self,
        presence: bool,
        reason: Reason,
        name: Option<&str>,
        mac_address: Option<&str>,
    ) -> anyhow::Result<()> {
        info!("Announcing presence {presence} ({reason}) on MQTT");
        let message = PresenceMqttMessage {
            presence,
            reason: reason.as_str(),
            device: name,
            mac_address,
        };
        self.client
            .publish(
                format!("{}/{}/presence", self.topic_path, self.publisher_id),
                QoS::AtLeastOnce,
                true,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn announce_signal(
        &self,
        name: &str,
        mac_address: &str,
        rssi: Option<i32>,
        active: bool,
    ) -> anyhow::Result<()> {
        debug!("Announcing device {} (rssi: {:?}) on MQTT", name, rssi);
        let message = SignalMqttMessage {
            name,
            mac_address,
            rssi,
            active,
            retained: false,
        };
        let channel_name = sanitize_name(name);
        self.client
            .publish(
                format!("{}/{}/{}", self.topic_path, self.publisher_id, channel_name),
                QoS::AtMostOnce,
                false,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Device 123";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "test_s_device_123");
    }

    #[test]
    fn test_presence_payload() {
        let message = PresenceMqttMessage {
            presence: false,
            reason: Reason::Away.as_str(),
            device: Some("Phone"),
            mac_address: Some("AA:BB:CC:DD:EE:FF"),
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"presence":false,"reason":"away","device":"Phone","id":"AA:BB:CC:DD:EE:FF"}"#
        );
    }
}
