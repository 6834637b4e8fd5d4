pub mod config;
pub mod controller;
pub mod detection;
pub mod error;
pub mod instant;
pub mod ports;
pub mod schedule;
pub mod store;
pub mod timers;
pub mod topics;
pub mod types;
pub mod window;

pub use config::{ApplianceConfig, ApplianceKind, DetectionConfig, RuntimeConfig, ScheduleConfig};
pub use controller::{build_controllers, ControllerEvent, DeviceController, LinkedStart, Plan};
pub use detection::{DetectionEngine, DetectionEvent};
pub use error::{ActuatorError, InstantError, PlanError, PriceFeedError, StoreError};
pub use ports::{Notifier, Ports, PriceFeed, SwitchActuator};
pub use schedule::{ScheduleManager, ScheduleOutcome};
pub use store::{MemoryStore, Origin, StateChange, StateField, StateStore};
pub use timers::{TimerSlot, TimerTable};
pub use topics::*;
pub use types::{DetectionPhase, DeviceStatus, PricePoint, PriceWindow};
pub use window::{find_cheapest_window, plan_chained, ChainVariant, ChainedPlan};
