use crate::error::SessionError;
use crate::frame::MacAddr;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// SV dataset channel order. Four currents, then four voltages.
pub const CHANNEL_LABELS: [&str; 8] = ["IA", "IB", "IC", "IN", "VA", "VB", "VC", "VN"];

/// One phasor as magnitude (engineering units) and phase angle (degrees).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Phasor {
    pub magnitude: f64,
    pub angle_deg: f64,
}

/// A balanced three-phase set: 100 A currents and 69.5 kV phase voltages,
/// neutrals at zero.
pub fn default_phasors() -> [Phasor; 8] {
    [
        Phasor { magnitude: 100.0, angle_deg: 0.0 },
        Phasor { magnitude: 100.0, angle_deg: -120.0 },
        Phasor { magnitude: 100.0, angle_deg: 120.0 },
        Phasor { magnitude: 0.0, angle_deg: 0.0 },
        Phasor { magnitude: 69_500.0, angle_deg: 0.0 },
        Phasor { magnitude: 69_500.0, angle_deg: -120.0 },
        Phasor { magnitude: 69_500.0, angle_deg: 120.0 },
        Phasor { magnitude: 0.0, angle_deg: 0.0 },
    ]
}

/// COMTRADE replay parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    pub cfg_path: PathBuf,
    /// Derived from `cfg_path` by extension substitution when absent.
    pub dat_path: Option<PathBuf>,
    /// Ordered mapping of COMTRADE channel names onto SV channels 0-7.
    pub channel_mapping: Vec<(String, usize)>,
    pub loop_playback: bool,
    /// Reserved for time-windowed playback.
    pub start_time_offset: f64,
    pub end_time_offset: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            cfg_path: PathBuf::new(),
            dat_path: None,
            channel_mapping: Vec::new(),
            loop_playback: false,
            start_time_offset: 0.0,
            end_time_offset: 0.0,
        }
    }
}

/// What the transmit loop publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SourceConfig {
    /// Continuous sinusoid synthesis from eight phasors.
    Phasors([Phasor; 8]),
    /// Replay of a COMTRADE recording, resampled to the SV rate.
    Replay(ReplayConfig),
}

/// Everything fixed at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub iface: String,
    pub dst_mac: String,
    /// Empty string requests auto-detection from the interface.
    pub src_mac: String,
    pub vlan_id: u16,
    pub vlan_priority: u8,
    pub app_id: u16,
    pub sv_id: String,
    pub sample_rate: u16,
    pub goose_trigger: String,
    pub enable_goose_monitoring: bool,
    /// Log progress every N packets; 0 disables.
    pub progress_interval: u32,
    pub source: SourceConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            iface: String::new(),
            dst_mac: "01:0C:CD:01:00:00".to_string(),
            src_mac: String::new(),
            vlan_id: 4,
            vlan_priority: 4,
            app_id: 0x4000,
            sv_id: "TestSV01".to_string(),
            sample_rate: 4800,
            goose_trigger: "STOP".to_string(),
            enable_goose_monitoring: true,
            progress_interval: 1000,
            source: SourceConfig::Phasors(default_phasors()),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.iface.is_empty() {
            return Err(SessionError::Config("interface name cannot be empty".into()));
        }
        if self.sample_rate == 0 {
            return Err(SessionError::Config("sample rate must be greater than 0".into()));
        }
        if self.vlan_priority > 7 {
            return Err(SessionError::Config(format!(
                "VLAN priority must be 0-7, got {}",
                self.vlan_priority
            )));
        }
        if self.vlan_id > 4095 {
            return Err(SessionError::Config(format!(
                "VLAN ID must be 0-4095, got {}",
                self.vlan_id
            )));
        }
        if self.sv_id.is_empty() || self.sv_id.len() > 127 {
            return Err(SessionError::Config(format!(
                "svID must be 1-127 characters, got {}",
                self.sv_id.len()
            )));
        }
        MacAddr::parse(&self.dst_mac)?;
        if !self.src_mac.is_empty() {
            let src = MacAddr::parse(&self.src_mac)?;
            if src.is_zero() {
                return Err(SessionError::Config("source MAC must not be all-zero".into()));
            }
        }

        if let SourceConfig::Replay(replay) = &self.source {
            if replay.cfg_path.as_os_str().is_empty() {
                return Err(SessionError::Config("COMTRADE .cfg path cannot be empty".into()));
            }
            for (name, sv_channel) in &replay.channel_mapping {
                if *sv_channel >= CHANNEL_LABELS.len() {
                    return Err(SessionError::Config(format!(
                        "SV channel index {} for '{}' out of range 0-7",
                        sv_channel, name
                    )));
                }
            }
            if replay.start_time_offset < 0.0 || replay.end_time_offset < 0.0 {
                return Err(SessionError::Config("time offsets must be non-negative".into()));
            }
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> SessionConfig {
        SessionConfig {
            iface: "eth0".to_string(),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_default_values() {
        let config = SessionConfig::default();
        assert_eq!(config.dst_mac, "01:0C:CD:01:00:00");
        assert_eq!(config.vlan_id, 4);
        assert_eq!(config.vlan_priority, 4);
        assert_eq!(config.app_id, 0x4000);
        assert_eq!(config.sample_rate, 4800);
        assert_eq!(config.goose_trigger, "STOP");
        assert!(config.enable_goose_monitoring);

        match config.source {
            SourceConfig::Phasors(phasors) => {
                assert_eq!(phasors[0].magnitude, 100.0);
                assert_eq!(phasors[1].angle_deg, -120.0);
                assert_eq!(phasors[4].magnitude, 69_500.0);
                assert_eq!(phasors[7].magnitude, 0.0);
            }
            SourceConfig::Replay(_) => panic!("default source should be phasors"),
        }
    }

    #[test]
    fn test_validate_accepts_defaults_with_iface() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_iface() {
        let config = SessionConfig::default();
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut config = valid_config();
        config.sample_rate = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.vlan_id = 4096;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.vlan_priority = 8;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.dst_mac = "not-a-mac".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.src_mac = "00:00:00:00:00:00".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.sv_id = "x".repeat(128);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_replay_mapping_range() {
        let mut config = valid_config();
        config.source = SourceConfig::Replay(ReplayConfig {
            cfg_path: PathBuf::from("fault.cfg"),
            channel_mapping: vec![("IA".to_string(), 8)],
            ..ReplayConfig::default()
        });
        assert!(config.validate().is_err());

        if let SourceConfig::Replay(replay) = &mut config.source {
            replay.channel_mapping = vec![("IA".to_string(), 7)];
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_replay_requires_cfg_path() {
        let mut config = valid_config();
        config.source = SourceConfig::Replay(ReplayConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let mut config = SessionConfig {
            iface: "eth1".to_string(),
            ..SessionConfig::default()
        };
        config.source = SourceConfig::Replay(ReplayConfig {
            cfg_path: PathBuf::from("fault.cfg"),
            dat_path: None,
            channel_mapping: vec![("3TCC9:I A".to_string(), 0), ("3TPM3:V A".to_string(), 4)],
            loop_playback: true,
            start_time_offset: 0.0,
            end_time_offset: 0.0,
        });

        let json = serde_json::to_string_pretty(&config).expect("serialize failed");
        assert!(json.contains("channel_mapping"));

        let restored: SessionConfig = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(restored.iface, "eth1");
        match restored.source {
            SourceConfig::Replay(replay) => {
                assert!(replay.loop_playback);
                assert_eq!(replay.channel_mapping.len(), 2);
                assert_eq!(replay.channel_mapping[1].1, 4);
            }
            SourceConfig::Phasors(_) => panic!("expected replay source"),
        }
    }
}
