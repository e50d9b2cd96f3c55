//! channel-condition presets and scenarios for exercising a crlink pair in one process

pub mod scenarios;

use std::time::Duration;

use crlink_radio::ChannelConfig;

pub struct ChannelPresets;

impl ChannelPresets {
    pub fn good_conditions() -> ChannelConfig {
        ChannelConfig {
            bandwidth_bps: 9600,
            loss: 0.02,
            header_corruption: 0.01,
            payload_corruption: 0.01,
            underrun: 0.0,
            overrun: 0.0,
            latency: Duration::from_millis(10),
            latency_jitter: Duration::from_millis(2),
            block_interval: Duration::from_millis(20),
        }
    }

    pub fn average_conditions() -> ChannelConfig {
        ChannelConfig {
            bandwidth_bps: 4800,
            loss: 0.10,
            header_corruption: 0.03,
            payload_corruption: 0.03,
            underrun: 0.01,
            overrun: 0.01,
            latency: Duration::from_millis(30),
            latency_jitter: Duration::from_millis(10),
            block_interval: Duration::from_millis(20),
        }
    }

    pub fn poor_conditions() -> ChannelConfig {
        ChannelConfig {
            bandwidth_bps: 1200,
            loss: 0.25,
            header_corruption: 0.05,
            payload_corruption: 0.08,
            underrun: 0.02,
            overrun: 0.02,
            latency: Duration::from_millis(80),
            latency_jitter: Duration::from_millis(30),
            block_interval: Duration::from_millis(20),
        }
    }

    // deep fade: most frames never make it
    pub fn extreme_conditions() -> ChannelConfig {
        ChannelConfig {
            bandwidth_bps: 300,
            loss: 0.45,
            header_corruption: 0.10,
            payload_corruption: 0.15,
            underrun: 0.05,
            overrun: 0.05,
            latency: Duration::from_millis(200),
            latency_jitter: Duration::from_millis(60),
            block_interval: Duration::from_millis(20),
        }
    }

    pub fn by_name(name: &str) -> Option<ChannelConfig> {
        match name {
            "ideal" => Some(ChannelConfig::ideal()),
            "good" => Some(Self::good_conditions()),
            "average" => Some(Self::average_conditions()),
            "poor" => Some(Self::poor_conditions()),
            "extreme" => Some(Self::extreme_conditions()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_degrade_in_order() {
        let presets = [
            ChannelPresets::good_conditions(),
            ChannelPresets::average_conditions(),
            ChannelPresets::poor_conditions(),
            ChannelPresets::extreme_conditions(),
        ];
        for pair in presets.windows(2) {
            assert!(pair[0].loss < pair[1].loss);
            assert!(pair[0].bandwidth_bps > pair[1].bandwidth_bps);
            assert!(pair[0].latency < pair[1].latency);
        }
    }

    #[test]
    fn lookup_by_name() {
        assert!(ChannelPresets::by_name("poor").is_some());
        assert_eq!(ChannelPresets::by_name("ideal").map(|c| c.loss), Some(0.0));
        assert!(ChannelPresets::by_name("solar storm").is_none());
    }
}
