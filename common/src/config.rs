use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Readings above this many watts count as drawing power.
    pub power_threshold_w: f64,
    pub detect_time_ms: u64,
    pub min_runtime_before_end_ms: u64,
    pub zero_grace_ms: u64,
    pub post_confirm_ms: u64,
    pub cooldown_after_finish_ms: u64,
    /// How long a commanded start may take to show up as power draw.
    pub start_suppression_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            power_threshold_w: 0.5,
            detect_time_ms: 10_000,
            min_runtime_before_end_ms: 600_000,
            zero_grace_ms: 180_000,
            post_confirm_ms: 60_000,
            cooldown_after_finish_ms: 300_000,
            start_suppression_ms: 120_000,
        }
    }
}

impl DetectionConfig {
    pub fn sanitize(&mut self) {
        if !self.power_threshold_w.is_finite() || self.power_threshold_w < 0.0 {
            self.power_threshold_w = DetectionConfig::default().power_threshold_w;
        }
        self.detect_time_ms = self.detect_time_ms.clamp(1_000, 600_000);
        self.zero_grace_ms = self.zero_grace_ms.clamp(1_000, 3_600_000);
        self.post_confirm_ms = self.post_confirm_ms.clamp(1_000, 3_600_000);
        self.min_runtime_before_end_ms = self.min_runtime_before_end_ms.min(14_400_000);
        self.cooldown_after_finish_ms = self.cooldown_after_finish_ms.min(3_600_000);
        self.start_suppression_ms = self
            .start_suppression_ms
            .clamp(self.detect_time_ms, 1_800_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Persisted start times further out than this are treated as stale.
    pub max_schedule_horizon_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_schedule_horizon_ms: 48 * 3_600_000,
        }
    }
}

impl ScheduleConfig {
    pub fn sanitize(&mut self) {
        self.max_schedule_horizon_ms = self
            .max_schedule_horizon_ms
            .clamp(24 * 3_600_000, 48 * 3_600_000);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApplianceKind {
    Washer {
        #[serde(default)]
        dryer: Option<String>,
    },
    Dryer,
    Dishwasher,
    Generic,
}

impl ApplianceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Washer { .. } => "washer",
            Self::Dryer => "dryer",
            Self::Dishwasher => "dishwasher",
            Self::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplianceConfig {
    pub id: String,
    pub name: String,
    pub kind: ApplianceKind,
    /// Expected program length used for price planning.
    pub program_minutes: u32,
    /// Delay before the button press that follows power-on, if the appliance
    /// needs one.
    #[serde(default)]
    pub press_delay_ms: Option<u64>,
    #[serde(default = "default_dry_reminder_ms")]
    pub dry_reminder_ms: u64,
    #[serde(default)]
    pub transfer_buffer_min: u32,
    #[serde(default)]
    pub detection: DetectionConfig,
}

fn default_dry_reminder_ms() -> u64 {
    900_000
}

impl ApplianceConfig {
    pub fn new(id: &str, name: &str, kind: ApplianceKind, program_minutes: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            program_minutes,
            press_delay_ms: None,
            dry_reminder_ms: default_dry_reminder_ms(),
            transfer_buffer_min: 0,
            detection: DetectionConfig::default(),
        }
    }

    pub fn sanitize(&mut self) {
        self.detection.sanitize();
        self.program_minutes = self.program_minutes.clamp(1, 24 * 60);
        self.transfer_buffer_min = self.transfer_buffer_min.min(12 * 60);
        self.dry_reminder_ms = self.dry_reminder_ms.clamp(60_000, 86_400_000);
        self.press_delay_ms = self.press_delay_ms.map(|delay| delay.min(300_000));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub appliances: Vec<ApplianceConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut washer = ApplianceConfig::new(
            "washer",
            "Washing machine",
            ApplianceKind::Washer {
                dryer: Some("dryer".to_string()),
            },
            150,
        );
        washer.transfer_buffer_min = 15;

        let mut dishwasher =
            ApplianceConfig::new("dishwasher", "Dishwasher", ApplianceKind::Dishwasher, 180);
        dishwasher.press_delay_ms = Some(5_000);

        Self {
            appliances: vec![
                washer,
                ApplianceConfig::new("dryer", "Tumble dryer", ApplianceKind::Dryer, 120),
                dishwasher,
            ],
            schedule: ScheduleConfig::default(),
            timezone: "Europe/Berlin".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.schedule.sanitize();

        let mut seen = std::collections::HashSet::new();
        self.appliances
            .retain(|appliance| !appliance.id.trim().is_empty() && seen.insert(appliance.id.clone()));

        let ids: Vec<String> = self.appliances.iter().map(|a| a.id.clone()).collect();
        for appliance in &mut self.appliances {
            appliance.sanitize();
            if let ApplianceKind::Washer { dryer } = &mut appliance.kind {
                if dryer.as_ref().is_some_and(|id| !ids.contains(id)) {
                    *dryer = None;
                }
            }
        }
    }

    pub fn appliance(&self, id: &str) -> Option<&ApplianceConfig> {
        self.appliances.iter().find(|appliance| appliance.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_drops_duplicates_and_dangling_links() {
        let mut runtime = RuntimeConfig {
            appliances: vec![
                ApplianceConfig::new(
                    "washer",
                    "Washer",
                    ApplianceKind::Washer {
                        dryer: Some("missing".to_string()),
                    },
                    120,
                ),
                ApplianceConfig::new("washer", "Again", ApplianceKind::Generic, 10),
                ApplianceConfig::new(" ", "Blank", ApplianceKind::Generic, 10),
            ],
            ..RuntimeConfig::default()
        };

        runtime.sanitize();

        assert_eq!(runtime.appliances.len(), 1);
        assert_eq!(
            runtime.appliances[0].kind,
            ApplianceKind::Washer { dryer: None }
        );
    }

    #[test]
    fn horizon_is_clamped_to_a_plausible_range() {
        let mut schedule = ScheduleConfig {
            max_schedule_horizon_ms: 7 * 24 * 3_600_000,
        };
        schedule.sanitize();
        assert_eq!(schedule.max_schedule_horizon_ms, 48 * 3_600_000);
    }

    #[test]
    fn appliance_kind_is_tagged_in_json() {
        let raw = r#"{"id":"w","name":"W","kind":{"type":"washer","dryer":"d"},"program_minutes":90}"#;
        let appliance: ApplianceConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(
            appliance.kind,
            ApplianceKind::Washer {
                dryer: Some("d".to_string())
            }
        );
        assert_eq!(appliance.detection.detect_time_ms, 10_000);
    }
}
