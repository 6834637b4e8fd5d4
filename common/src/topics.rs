//! MQTT topic layout shared by the controller and the plug simulator.

use crate::store::StateField;

pub const TOPIC_PREFIX: &str = "appliances";
pub const TOPIC_PRICES: &str = "appliances/prices";
pub const TOPIC_NOTIFY: &str = "appliances/notify";

pub const SUB_POWER: &str = "appliances/+/power";
pub const SUB_SET: &str = "appliances/+/set/+";
pub const SUB_PLAN: &str = "appliances/+/cmnd/plan";

pub fn power_topic(device: &str) -> String {
    format!("{TOPIC_PREFIX}/{device}/power")
}

pub fn state_topic(device: &str) -> String {
    format!("{TOPIC_PREFIX}/{device}/state")
}

pub fn set_topic(device: &str, field: StateField) -> String {
    format!("{TOPIC_PREFIX}/{device}/set/{}", field.as_str())
}

pub fn power_command_topic(device: &str) -> String {
    format!("{TOPIC_PREFIX}/{device}/cmnd/power")
}

pub fn press_command_topic(device: &str) -> String {
    format!("{TOPIC_PREFIX}/{device}/cmnd/press")
}

pub fn plan_command_topic(device: &str) -> String {
    format!("{TOPIC_PREFIX}/{device}/cmnd/plan")
}

/// A topic addressed to one appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTopic<'a> {
    Power(&'a str),
    Set(&'a str, StateField),
    Plan(&'a str),
    PowerCommand(&'a str),
    PressCommand(&'a str),
}

pub fn parse_device_topic(topic: &str) -> Option<DeviceTopic<'_>> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
    let (device, tail) = rest.split_once('/')?;
    if device.is_empty() {
        return None;
    }

    match tail.split_once('/') {
        None if tail == "power" => Some(DeviceTopic::Power(device)),
        Some(("set", field)) => StateField::parse(field).map(|field| DeviceTopic::Set(device, field)),
        Some(("cmnd", "plan")) => Some(DeviceTopic::Plan(device)),
        Some(("cmnd", "power")) => Some(DeviceTopic::PowerCommand(device)),
        Some(("cmnd", "press")) => Some(DeviceTopic::PressCommand(device)),
        _ => None,
    }
}
