//! Simulated smart plugs: follow switch and press commands and publish a
//! rough appliance power curve once per second.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{info, warn};

use appliance_common::{
    parse_device_topic, power_command_topic, power_topic, press_command_topic, DeviceTopic,
};

const STANDBY_W: f64 = 0.3;

#[derive(Debug, Clone, Default)]
struct Plug {
    on: bool,
    needs_press: bool,
    pressed: bool,
    running_secs: u64,
}

impl Plug {
    fn switch(&mut self, on: bool) {
        self.on = on;
        self.pressed = false;
        self.running_secs = 0;
    }

    fn press(&mut self) {
        if self.on {
            self.pressed = true;
        }
    }

    /// Advances one second and returns the draw in watts.
    fn step(&mut self, program_secs: u64) -> f64 {
        if !self.on {
            return 0.0;
        }
        if self.needs_press && !self.pressed {
            return STANDBY_W;
        }

        let elapsed = self.running_secs;
        self.running_secs = self.running_secs.saturating_add(1);
        match elapsed {
            t if t >= program_secs => STANDBY_W,
            t if t < program_secs / 5 => 2_000.0,
            t if t % 120 < 90 => 180.0,
            // Drum pauses and rinse gaps read as zero on the meter.
            _ => 0.0,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let program_secs = std::env::var("PLUG_PROGRAM_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(900);
    let devices = std::env::var("PLUG_DEVICES").unwrap_or_else(|_| "washer,dryer,dishwasher".to_string());
    let press_devices = std::env::var("PLUG_PRESS_DEVICES").unwrap_or_else(|_| "dishwasher".to_string());

    let plugs: HashMap<String, Plug> = devices
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            let needs_press = press_devices.split(',').any(|press| press.trim() == id);
            (
                id.to_string(),
                Plug {
                    needs_press,
                    ..Plug::default()
                },
            )
        })
        .collect();
    let plugs = Arc::new(Mutex::new(plugs));

    let mut mqtt_options = MqttOptions::new("appliance-plug-sim", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    for id in plugs.lock().await.keys() {
        for topic in [power_command_topic(id), press_command_topic(id)] {
            mqtt.subscribe(topic, QoS::AtLeastOnce)
                .await
                .context("failed to subscribe to plug commands")?;
        }
    }

    let command_plugs = plugs.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let payload = String::from_utf8_lossy(&message.payload).to_string();
                    apply_command(&command_plugs, &message.topic, &payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("plug mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!("plug simulator started");

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        let readings: Vec<(String, f64)> = {
            let mut plugs = plugs.lock().await;
            plugs
                .iter_mut()
                .map(|(id, plug)| (id.clone(), plug.step(program_secs)))
                .collect()
        };

        for (id, watts) in readings {
            mqtt.publish(power_topic(&id), QoS::AtMostOnce, false, format!("{watts:.1}"))
                .await
                .with_context(|| format!("failed to publish power for {id}"))?;
        }
    }
}

async fn apply_command(plugs: &Mutex<HashMap<String, Plug>>, topic: &str, payload: &str) {
    let mut plugs = plugs.lock().await;
    match parse_device_topic(topic) {
        Some(DeviceTopic::PowerCommand(id)) => {
            if let Some(plug) = plugs.get_mut(id) {
                let on = payload.trim().eq_ignore_ascii_case("on");
                info!("{id}: plug {}", if on { "on" } else { "off" });
                plug.switch(on);
            }
        }
        Some(DeviceTopic::PressCommand(id)) => {
            if let Some(plug) = plugs.get_mut(id) {
                info!("{id}: button pressed");
                plug.press();
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_plug_draws_nothing() {
        let mut plug = Plug::default();
        assert_eq!(plug.step(600), 0.0);
    }

    #[test]
    fn press_gates_the_program() {
        let mut plug = Plug {
            needs_press: true,
            ..Plug::default()
        };
        plug.switch(true);
        assert_eq!(plug.step(600), STANDBY_W);

        plug.press();
        assert_eq!(plug.step(600), 2_000.0);
    }

    #[test]
    fn program_ends_in_standby() {
        let mut plug = Plug::default();
        plug.switch(true);
        let last = (0..=600).map(|_| plug.step(600)).last();
        assert_eq!(last, Some(STANDBY_W));
    }
}
