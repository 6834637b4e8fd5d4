//! Boundary traits between the appliance core and the outside world.
//!
//! The host implements these over MQTT and the file system; tests implement
//! them in memory.

use crate::error::{ActuatorError, PriceFeedError};
use crate::store::StateStore;
use crate::types::PricePoint;

pub trait PriceFeed {
    fn fetch_prices(&self) -> Result<Vec<PricePoint>, PriceFeedError>;
}

/// Fire-and-forget. Implementations log and swallow their own failures.
pub trait Notifier {
    fn notify(&mut self, text: &str);
}

pub trait SwitchActuator {
    fn set_switch(&mut self, device: &str, on: bool) -> Result<(), ActuatorError>;

    /// Momentary button press for appliances that need one after power-on.
    fn press(&mut self, device: &str) -> Result<(), ActuatorError>;
}

/// Everything a device controller talks to, borrowed for one call.
pub struct Ports<'a> {
    pub store: &'a mut dyn StateStore,
    pub switch: &'a mut dyn SwitchActuator,
    pub notifier: &'a mut dyn Notifier,
    pub prices: &'a dyn PriceFeed,
}

impl PriceFeed for Vec<PricePoint> {
    fn fetch_prices(&self) -> Result<Vec<PricePoint>, PriceFeedError> {
        if self.is_empty() {
            return Err(PriceFeedError::Empty);
        }
        Ok(self.clone())
    }
}

/// Collects notifications in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    pub messages: Vec<String>,
}

impl Notifier for RecordingNotifier {
    fn notify(&mut self, text: &str) {
        self.messages.push(text.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchCommand {
    Power { device: String, on: bool },
    Press { device: String },
}

/// Records switch commands; can be told to fail every command.
#[derive(Debug, Default, Clone)]
pub struct RecordingSwitch {
    pub commands: Vec<SwitchCommand>,
    pub fail: bool,
}

impl RecordingSwitch {
    fn result(&self, device: &str) -> Result<(), ActuatorError> {
        if self.fail {
            return Err(ActuatorError::CommandFailed {
                device: device.to_string(),
                reason: "switch offline".to_string(),
            });
        }
        Ok(())
    }
}

impl SwitchActuator for RecordingSwitch {
    fn set_switch(&mut self, device: &str, on: bool) -> Result<(), ActuatorError> {
        self.commands.push(SwitchCommand::Power {
            device: device.to_string(),
            on,
        });
        self.result(device)
    }

    fn press(&mut self, device: &str) -> Result<(), ActuatorError> {
        self.commands.push(SwitchCommand::Press {
            device: device.to_string(),
        });
        self.result(device)
    }
}
