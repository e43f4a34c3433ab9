use crate::config::MqttConfig;
use crate::error::AppError;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type V5Publish = mqtt5::mqttbytes::v5::Publish;
pub type QoS = mqtt5::mqttbytes::QoS;

pub fn build_options(cfg: &MqttConfig) -> Result<MqttOptions, AppError> {
    if cfg.host.is_empty() {
        return Err(AppError::Mqtt("broker host is empty".into()));
    }
    let client_id = cfg
        .client_id
        .clone()
        .unwrap_or_else(|| format!("export-limiter-{}", Uuid::new_v4()));
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts.set_clean_start(true);
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    Ok(opts)
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    mqtt5::AsyncClient::new(options, 50)
}

/// What the service cares about from the event loop.
pub enum Inbound {
    /// (Re)connected; subscriptions must be renewed since sessions start clean.
    Connected,
    Publish(V5Publish),
}

pub async fn next_inbound(eventloop: &mut EventLoop) -> Result<Inbound, AppError> {
    loop {
        match eventloop.poll().await {
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p))) => return Ok(Inbound::Publish(p)),
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::ConnAck(_))) => return Ok(Inbound::Connected),
            Ok(_) => continue,
            Err(e) => return Err(AppError::Mqtt(e.to_string())),
        }
    }
}

pub async fn subscribe(client: &AsyncClient, filter: &str) -> Result<(), AppError> {
    client
        .subscribe(filter.to_string(), QoS::AtLeastOnce)
        .await
        .map_err(|e| AppError::Mqtt(format!("subscribe {filter}: {e}")))
}

pub async fn subscribe_all(client: AsyncClient, filters: Vec<String>) {
    for filter in &filters {
        if let Err(e) = subscribe(&client, filter).await {
            warn!(error = %e, "subscription failed");
        }
    }
    info!("subscribed to {} topic(s)", filters.len());
}

pub async fn publish(
    client: &AsyncClient,
    topic: &str,
    payload: Vec<u8>,
    retain: bool,
) -> Result<(), AppError> {
    client
        .publish(topic.to_string(), QoS::AtLeastOnce, retain, payload)
        .await
        .map_err(|e| AppError::Mqtt(format!("publish {topic}: {e}")))
}

/// MQTT filter match with `+` (one level) and `#` (rest) wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let fseg: Vec<&str> = filter.split('/').collect();
    let tseg: Vec<&str> = topic.split('/').collect();
    for (i, f) in fseg.iter().enumerate() {
        match *f {
            "#" => return true,
            "+" => {
                if i >= tseg.len() {
                    return false;
                }
            }
            _ => {
                if i >= tseg.len() || *f != tseg[i] {
                    return false;
                }
            }
        }
    }
    fseg.len() == tseg.len()
}
