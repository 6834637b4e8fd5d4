use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info, warn};

use appliance_common::{
    build_controllers, find_cheapest_window, instant::parse_instant, parse_device_topic,
    state_topic, store, ControllerEvent, DeviceController, DeviceStatus, DeviceTopic, Plan, PlanError,
    Ports, PricePoint, PriceWindow, RuntimeConfig, StateChange, StateField, StateStore, SUB_PLAN,
    SUB_POWER, SUB_SET, TOPIC_PRICES,
};

use crate::adapters::{FileStore, MqttNotifier, MqttSwitch, RetainedPrices};

const MAX_MQTT_PAYLOAD_BYTES: usize = 8 * 1024;

#[derive(Clone)]
struct AppState {
    hub: Arc<Mutex<Hub>>,
    mqtt: AsyncClient,
    timezone: Tz,
}

/// Every controller plus the ports they share, behind one lock.
struct Hub {
    controllers: Vec<DeviceController>,
    store: FileStore,
    prices: RetainedPrices,
    switch: MqttSwitch,
    notifier: MqttNotifier,
}

#[derive(Clone)]
struct ConfigStore {
    runtime_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct PricesView {
    prices: Vec<PricePoint>,
    #[serde(rename = "cheapestHour", skip_serializing_if = "Option::is_none")]
    cheapest_hour: Option<PriceWindow>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("APPLIANCE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.appliances"));

    let config_store = ConfigStore::new(&data_dir);
    let mut runtime = config_store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let timezone = runtime.timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!("unknown timezone {:?}, using UTC", runtime.timezone);
        Tz::UTC
    });

    let mqtt_host = env_or("MQTT_HOST", &runtime.network.mqtt_host);
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("appliance-controller", mqtt_host, mqtt_port);
    let mqtt_user = env_or("MQTT_USER", &runtime.network.mqtt_user);
    let mqtt_pass = env_or("MQTT_PASS", &runtime.network.mqtt_pass);
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let store = FileStore::load(data_dir.join("state.json"))
        .await
        .context("failed to load appliance state")?;

    let mut hub = Hub {
        controllers: build_controllers(&runtime),
        store,
        prices: RetainedPrices::default(),
        switch: MqttSwitch::new(mqtt.clone()),
        notifier: MqttNotifier::new(mqtt.clone()),
    };
    hub.restore_all(Utc::now());
    hub.flush().await;
    info!("managing {} appliances", hub.controllers.len());

    let app_state = AppState {
        hub: Arc::new(Mutex::new(hub)),
        mqtt,
        timezone,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/devices", get(handle_list_devices))
        .route("/api/devices/{id}", get(handle_get_device))
        .route("/api/devices/{id}/schedule", post(handle_schedule))
        .route("/api/devices/{id}/cancel", post(handle_cancel))
        .route("/api/devices/{id}/plan", post(handle_plan))
        .route("/api/prices", get(handle_get_prices))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

impl Hub {
    /// Runs `f` against one controller with the shared ports.
    fn with_device<R>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut DeviceController, &mut Ports<'_>) -> R,
    ) -> Option<R> {
        let Hub {
            controllers,
            store,
            prices,
            switch,
            notifier,
        } = self;
        let controller = controllers.iter_mut().find(|controller| controller.id() == id)?;
        let mut ports = Ports {
            store,
            switch,
            notifier,
            prices: &*prices,
        };
        Some(f(controller, &mut ports))
    }

    fn ids(&self) -> Vec<String> {
        self.controllers
            .iter()
            .map(|controller| controller.id().to_string())
            .collect()
    }

    fn restore_all(&mut self, now: DateTime<Utc>) {
        for id in self.ids() {
            let events = self
                .with_device(&id, |controller, ports| controller.restore(now, ports))
                .unwrap_or_default();
            self.handle_events(&id, events, now);
        }
    }

    fn tick_all(&mut self, now: DateTime<Utc>) {
        for id in self.ids() {
            let events = self
                .with_device(&id, |controller, ports| controller.tick(now, ports))
                .unwrap_or_default();
            self.handle_events(&id, events, now);
        }
    }

    fn handle_events(&mut self, id: &str, events: Vec<ControllerEvent>, now: DateTime<Utc>) {
        for event in events {
            match event {
                ControllerEvent::Planned(plan) => self.route_linked(&plan, now),
                other => debug!("{id}: {other:?}"),
            }
        }
    }

    /// Schedules the second half of a chained plan on its own appliance.
    fn route_linked(&mut self, plan: &Plan, now: DateTime<Utc>) {
        let Some(linked) = &plan.linked else {
            return;
        };
        let outcome = self.with_device(&linked.device, |controller, ports| {
            controller.schedule_at(linked.window.start, now, ports)
        });
        match outcome {
            Some(outcome) => info!("{}: linked start {outcome:?}", linked.device),
            None => warn!("{}: linked appliance is not configured", linked.device),
        }
    }

    fn plan(
        &mut self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Option<Result<Plan, PlanError>> {
        let result = self.with_device(id, |controller, ports| controller.plan(now, ports))?;
        if let Ok(plan) = &result {
            self.route_linked(plan, now);
        }
        Some(result)
    }

    fn statuses(&mut self, now: DateTime<Utc>) -> Vec<DeviceStatus> {
        self.ids()
            .iter()
            .filter_map(|id| self.with_device(id, |controller, ports| controller.status(now, ports)))
            .collect()
    }

    /// Writes an operator edit into the store and lets the appliance react.
    fn apply_edit(&mut self, id: &str, field: StateField, raw: &str, now: DateTime<Utc>) {
        if field == StateField::Running {
            warn!("{id}: running is detection-owned, edit ignored");
            return;
        }

        let value = edit_value(field, raw);
        if let Err(err) = self.store.set(&store::key(id, field), value.clone(), false) {
            warn!("{id}: failed to record edit of {}: {err}", field.as_str());
            return;
        }

        let change = StateChange::operator(id, field, value);
        let outcome = self.with_device(id, |controller, ports| {
            controller.on_state_change(&change, now, ports)
        });
        match outcome {
            Some(outcome) => info!("{id}: edit of {} -> {outcome:?}", field.as_str()),
            None => warn!("edit for unknown appliance {id}"),
        }
    }

    async fn flush(&mut self) {
        if let Err(err) = self.store.flush().await {
            warn!("failed to persist appliance state: {err:#}");
        }
    }
}

/// Flags arrive as text; anything unrecognised is passed through as a string
/// so the schedule manager can reject it.
fn edit_value(field: StateField, raw: &str) -> Value {
    let raw = raw.trim();
    match field {
        StateField::StartTime => Value::String(raw.to_string()),
        StateField::Scheduled | StateField::Running => match raw.to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => Value::Bool(true),
            "false" | "off" | "0" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [SUB_POWER, SUB_SET, SUB_PLAN, TOPIC_PRICES];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;
            let mut hub = app_state.hub.lock().await;
            hub.tick_all(Utc::now());
            hub.flush().await;
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            let statuses = {
                let mut hub = app_state.hub.lock().await;
                hub.statuses(Utc::now())
            };

            for status in statuses {
                match serde_json::to_vec(&status) {
                    Ok(body) => {
                        if let Err(err) = app_state
                            .mqtt
                            .publish(state_topic(&status.id), QoS::AtLeastOnce, true, body)
                            .await
                        {
                            warn!("{}: state publish failed: {err}", status.id);
                        }
                    }
                    Err(err) => warn!("{}: state serialization failed: {err}", status.id),
                }
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let now = Utc::now();
    let mut hub = app_state.hub.lock().await;

    if topic == TOPIC_PRICES {
        hub.prices.update(&message);
        return Ok(());
    }

    match parse_device_topic(&topic) {
        Some(DeviceTopic::Power(id)) => {
            let Some(watts) = parse_watts(&message) else {
                warn!("{id}: unreadable power sample {message:?}");
                return Ok(());
            };
            let events = hub
                .with_device(id, |controller, ports| {
                    controller.on_power(Some(watts), now, ports)
                })
                .unwrap_or_default();
            hub.handle_events(id, events, now);
        }
        Some(DeviceTopic::Set(id, field)) => hub.apply_edit(id, field, &message, now),
        Some(DeviceTopic::Plan(id)) => {
            if hub.plan(id, now).is_none() {
                warn!("plan requested for unknown appliance {id}");
            }
        }
        Some(DeviceTopic::PowerCommand(_) | DeviceTopic::PressCommand(_)) | None => {}
    }

    hub.flush().await;
    Ok(())
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

/// Plain watt readings, or Tasmota-style `{"power": 12.5}` documents.
fn parse_watts(message: &str) -> Option<f64> {
    let trimmed = message.trim();
    if let Ok(watts) = trimmed.parse::<f64>() {
        return Some(watts);
    }
    let document: Value = serde_json::from_str(trimmed).ok()?;
    ["power", "Power", "watts"]
        .iter()
        .find_map(|key| document.get(key).and_then(Value::as_f64))
}

async fn handle_list_devices(State(state): State<AppState>) -> impl IntoResponse {
    let statuses = state.hub.lock().await.statuses(Utc::now());
    Json(statuses)
}

async fn handle_get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let now = Utc::now();
    let status = state
        .hub
        .lock()
        .await
        .with_device(&id, |controller, ports| controller.status(now, ports));

    match status {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown appliance"),
    }
}

async fn handle_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(raw) = params.get("at") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'at' parameter");
    };
    let at = match parse_instant(raw, state.timezone) {
        Ok(at) => at,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let now = Utc::now();
    let mut hub = state.hub.lock().await;
    let outcome = hub.with_device(&id, |controller, ports| controller.schedule_at(at, now, ports));
    hub.flush().await;

    match outcome {
        Some(outcome) => Json(outcome).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown appliance"),
    }
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let mut hub = state.hub.lock().await;
    let cancelled = hub.with_device(&id, |controller, ports| controller.cancel(true, ports));
    hub.flush().await;

    match cancelled {
        Some(cancelled) => Json(CancelResponse { cancelled }).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown appliance"),
    }
}

async fn handle_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let mut hub = state.hub.lock().await;
    let result = hub.plan(&id, Utc::now());
    hub.flush().await;

    match result {
        Some(Ok(plan)) => Json(plan).into_response(),
        Some(Err(err @ PlanError::Prices(_))) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
        Some(Err(err)) => error_response(StatusCode::CONFLICT, &err.to_string()),
        None => error_response(StatusCode::NOT_FOUND, "Unknown appliance"),
    }
}

async fn handle_get_prices(State(state): State<AppState>) -> axum::response::Response {
    let hub = state.hub.lock().await;
    let Some(points) = hub.prices.points() else {
        return error_response(StatusCode::NOT_FOUND, "No price data received yet");
    };

    Json(PricesView {
        prices: points.to_vec(),
        cheapest_hour: find_cheapest_window(points, 60, Utc::now()),
    })
    .into_response()
}

impl ConfigStore {
    fn new(data_dir: &FsPath) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
