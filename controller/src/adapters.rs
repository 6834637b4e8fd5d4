//! Host implementations of the appliance ports.

use std::{io::ErrorKind, path::PathBuf};

use anyhow::Context;
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use appliance_common::{
    power_command_topic, press_command_topic, ActuatorError, MemoryStore, Notifier, PriceFeed,
    PriceFeedError, PricePoint, StateStore, StoreError, SwitchActuator, TOPIC_NOTIFY,
};

/// Appliance state kept in memory and written to one JSON file after changes.
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    dirty: bool,
}

impl FileStore {
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let inner = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<MemoryStore>(&raw)
                .with_context(|| format!("corrupt state file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => MemoryStore::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            inner,
            dirty: false,
        })
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(&self.inner)?;
        tokio::fs::write(&self.path, payload)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: Value, committed: bool) -> Result<(), StoreError> {
        self.inner.set(key, value, committed)?;
        self.dirty = true;
        Ok(())
    }
}

/// Drives smart plugs through their MQTT command topics.
pub struct MqttSwitch {
    mqtt: AsyncClient,
}

impl MqttSwitch {
    pub fn new(mqtt: AsyncClient) -> Self {
        Self { mqtt }
    }

    fn send(&self, device: &str, topic: String, payload: &'static str) -> Result<(), ActuatorError> {
        self.mqtt
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| ActuatorError::CommandFailed {
                device: device.to_string(),
                reason: err.to_string(),
            })
    }
}

impl SwitchActuator for MqttSwitch {
    fn set_switch(&mut self, device: &str, on: bool) -> Result<(), ActuatorError> {
        info!("{device}: switching {}", if on { "on" } else { "off" });
        self.send(device, power_command_topic(device), if on { "ON" } else { "OFF" })
    }

    fn press(&mut self, device: &str) -> Result<(), ActuatorError> {
        info!("{device}: pressing start");
        self.send(device, press_command_topic(device), "PRESS")
    }
}

pub struct MqttNotifier {
    mqtt: AsyncClient,
}

impl MqttNotifier {
    pub fn new(mqtt: AsyncClient) -> Self {
        Self { mqtt }
    }
}

impl Notifier for MqttNotifier {
    fn notify(&mut self, text: &str) {
        info!("notify: {text}");
        if let Err(err) = self
            .mqtt
            .try_publish(TOPIC_NOTIFY, QoS::AtLeastOnce, false, text.as_bytes().to_vec())
        {
            warn!("notification dropped: {err}");
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriceDocument {
    Points(Vec<PricePoint>),
    Wrapped { prices: Vec<PricePoint> },
}

/// The latest price document seen on the retained price topic.
#[derive(Default)]
pub struct RetainedPrices {
    latest: Option<Result<Vec<PricePoint>, PriceFeedError>>,
}

impl RetainedPrices {
    pub fn update(&mut self, raw: &str) {
        let parsed = parse_price_document(raw);
        match &parsed {
            Ok(points) => debug!("price curve updated with {} points", points.len()),
            Err(err) => warn!("ignoring price document: {err}"),
        }
        self.latest = Some(parsed);
    }

    pub fn points(&self) -> Option<&[PricePoint]> {
        match &self.latest {
            Some(Ok(points)) => Some(points),
            _ => None,
        }
    }
}

impl PriceFeed for RetainedPrices {
    fn fetch_prices(&self) -> Result<Vec<PricePoint>, PriceFeedError> {
        match &self.latest {
            None => Err(PriceFeedError::NotConfigured),
            Some(Ok(points)) if points.is_empty() => Err(PriceFeedError::Empty),
            Some(Ok(points)) => Ok(points.clone()),
            Some(Err(err)) => Err(err.clone()),
        }
    }
}

/// Accepts a bare array of price points or `{"prices": [...]}`.
pub fn parse_price_document(raw: &str) -> Result<Vec<PricePoint>, PriceFeedError> {
    let document = serde_json::from_str::<PriceDocument>(raw)
        .map_err(|err| PriceFeedError::Unavailable(err.to_string()))?;
    let mut points = match document {
        PriceDocument::Points(points) | PriceDocument::Wrapped { prices: points } => points,
    };
    points.retain(|point| point.unit_price.is_finite());
    points.sort_by_key(|point| point.starts_at);
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_both_price_document_shapes() {
        let bare = r#"[{"startsAt":"2026-03-02T11:00:00Z","unitPrice":0.2},
                       {"startsAt":"2026-03-02T10:00:00Z","unitPrice":0.3}]"#;
        let wrapped = r#"{"prices":[{"startsAt":"2026-03-02T10:00:00Z","unitPrice":0.3}]}"#;

        let points = parse_price_document(bare).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(
            points[0].starts_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
        );
        assert_eq!(parse_price_document(wrapped).unwrap().len(), 1);
        assert!(matches!(
            parse_price_document("not json"),
            Err(PriceFeedError::Unavailable(_))
        ));
    }

    #[test]
    fn feed_reports_missing_and_empty_documents() {
        let mut feed = RetainedPrices::default();
        assert_eq!(feed.fetch_prices(), Err(PriceFeedError::NotConfigured));

        feed.update("[]");
        assert_eq!(feed.fetch_prices(), Err(PriceFeedError::Empty));

        feed.update("{");
        assert!(matches!(
            feed.fetch_prices(),
            Err(PriceFeedError::Unavailable(_))
        ));
        assert!(feed.points().is_none());
    }

    #[tokio::test]
    async fn file_store_survives_a_reload() {
        let dir = std::env::temp_dir().join(format!("appliance-store-{}", std::process::id()));
        let path = dir.join("state.json");

        let mut store = FileStore::load(path.clone()).await.unwrap();
        store
            .set("washer.scheduled", Value::Bool(true), true)
            .unwrap();
        store.flush().await.unwrap();

        let reloaded = FileStore::load(path).await.unwrap();
        assert_eq!(
            reloaded.get("washer.scheduled").unwrap(),
            Some(Value::Bool(true))
        );

        let _ = std::fs::remove_dir_all(dir);
    }
}
