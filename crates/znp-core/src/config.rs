//! Controller configuration surface

use std::time::Duration;

use znp_protocol::types::{Channels, Eui64, KeyData};
use znp_protocol::{SerialConfig, ZnpConfig};

/// Default watchdog ping period
pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(30);

/// Default delay between reconnection attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default bound on the AF data-confirm wait; must not exceed the ARSP
/// timeout
pub const DEFAULT_DATA_CONFIRM_TIMEOUT: Duration = Duration::from_secs(3);

/// Network parameters used when forming; unset fields are generated
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// PAN id; 0xFFFF (the default) lets the firmware pick one
    pub pan_id: Option<u16>,
    pub extended_pan_id: Option<Eui64>,
    pub network_key: Option<KeyData>,
    /// Channel mask; defaults to the primary channels 15, 20 and 25
    pub channels: Option<Channels>,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub serial: SerialConfig,
    pub network: NetworkConfig,

    /// SREQ to SRSP deadline
    pub sreq_timeout: Duration,
    /// End-to-end deadline for requests answered by a callback
    pub arsp_timeout: Duration,
    /// Bound on the AF data-confirm wait
    pub data_confirm_timeout: Duration,

    /// Radio TX power in dBm, applied at startup when set
    pub tx_power: Option<i8>,
    /// Board LED state, applied at startup when set
    pub led_mode: Option<bool>,

    /// In-flight data request limit; defaults by firmware generation
    /// (16 on Z-Stack 3.30+, 2 on 1.2)
    pub max_concurrent_requests: Option<usize>,

    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub watchdog_period: Duration,
}

impl ControllerConfig {
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            serial: SerialConfig::new(port),
            network: NetworkConfig::default(),
            sreq_timeout: znp_protocol::dispatcher::DEFAULT_SREQ_TIMEOUT,
            arsp_timeout: znp_protocol::dispatcher::DEFAULT_ARSP_TIMEOUT,
            data_confirm_timeout: DEFAULT_DATA_CONFIRM_TIMEOUT,
            tx_power: None,
            led_mode: None,
            max_concurrent_requests: None,
            auto_reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            watchdog_period: DEFAULT_WATCHDOG_PERIOD,
        }
    }

    #[must_use]
    pub(crate) fn znp_config(&self) -> ZnpConfig {
        ZnpConfig {
            sreq_timeout: self.sreq_timeout,
            arsp_timeout: self.arsp_timeout,
        }
    }

    /// Effective data-confirm deadline, clamped to the ARSP timeout
    #[must_use]
    pub fn effective_data_confirm_timeout(&self) -> Duration {
        self.data_confirm_timeout.min(self.arsp_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_confirm_timeout_is_clamped() {
        let mut config = ControllerConfig::new("/dev/ttyUSB0");
        config.data_confirm_timeout = Duration::from_secs(60);
        assert_eq!(
            config.effective_data_confirm_timeout(),
            config.arsp_timeout
        );
    }
}
