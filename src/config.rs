//! Gateway configuration (spec.md §6), loaded from a TOML file the way
//! Homegear's own `familySettings`/`physicalinterfaces` files are laid
//! out, using `serde` + `toml` as the rest of the radio/embedded corpus
//! does for this (see DESIGN.md).

use std::path::Path;

use serde::Deserialize;

use crate::error::GatewayError;

fn default_true() -> bool {
    true
}

fn default_response_delay() -> u64 {
    95
}

fn default_worker_thread_window() -> u32 {
    1000
}

/// Per-family tuning knobs that apply across every physical interface
/// (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralSettings {
    /// Prefer the interface reporting the strongest signal when the same
    /// message counter is seen on more than one (spec.md §4.E).
    #[serde(default = "default_true")]
    pub roaming_enabled: bool,
    #[serde(default)]
    pub worker_thread_priority: i32,
    #[serde(default)]
    pub worker_thread_policy: String,
    #[serde(default = "default_worker_thread_window")]
    pub worker_thread_window_ms: u32,
    /// Milliseconds to wait for an ACK before a queue step is considered
    /// unanswered (spec.md §4.D, §8).
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: u64,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        GeneralSettings {
            roaming_enabled: default_true(),
            worker_thread_priority: 0,
            worker_thread_policy: "other".into(),
            worker_thread_window_ms: default_worker_thread_window(),
            response_delay_ms: default_response_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Cul,
    Coc,
    Cuno,
    Cc1101,
}

/// One `[[interface]]` table (spec.md §6, §4.A). Fields not relevant to
/// `kind` are simply ignored by whichever transport is constructed from
/// this entry.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceSettings {
    pub id: String,
    pub kind: InterfaceKind,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub lock_file_path: String,
    #[serde(default = "default_true")]
    pub drop_first_packet: bool,
    #[serde(default = "default_oscillator_frequency")]
    pub oscillator_frequency: u32,
    #[serde(default)]
    pub tx_power_setting: u8,
    /// 0, 1, or 2; which CC1101 GDO pin the interrupt line is wired to.
    #[serde(default)]
    pub interrupt_pin: u8,
    #[serde(default)]
    pub gpio_interrupt_pin: u32,
}

fn default_baud_rate() -> u32 {
    38400
}

fn default_oscillator_frequency() -> u32 {
    26_000_000
}

/// AES key material shared by every interface capable of the handshake
/// (spec.md §4.B). Keys are hex strings in the TOML file and decoded on
/// load.
#[derive(Debug, Clone, Deserialize)]
pub struct AesSettings {
    pub my_address: String,
    pub current_key: String,
    #[serde(default)]
    pub old_key: String,
    #[serde(default)]
    pub key_index: u8,
}

impl AesSettings {
    pub fn my_address(&self) -> Result<u32, GatewayError> {
        parse_hex_address(&self.my_address)
    }

    pub fn current_key(&self) -> Result<[u8; 16], GatewayError> {
        parse_hex_key(&self.current_key)
    }

    pub fn old_key(&self) -> Result<[u8; 16], GatewayError> {
        if self.old_key.is_empty() {
            Ok([0u8; 16])
        } else {
            parse_hex_key(&self.old_key)
        }
    }
}

fn parse_hex_address(s: &str) -> Result<u32, GatewayError> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| GatewayError::Protocol(format!("invalid address '{s}': {e}")))
}

fn parse_hex_key(s: &str) -> Result<[u8; 16], GatewayError> {
    let bytes = hex_decode(s).map_err(|e| GatewayError::Protocol(format!("invalid key '{s}': {e}")))?;
    bytes
        .try_into()
        .map_err(|_| GatewayError::Protocol(format!("key '{s}' is not 16 bytes")))
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let mut chars = s.chars();
    while let (Some(a), Some(b)) = (chars.next(), chars.next()) {
        out.push(u8::from_str_radix(&format!("{a}{b}"), 16).map_err(|e| e.to_string())?);
    }
    Ok(out)
}

/// Persisted-state slot numbering (spec.md §6). Each peer's retained
/// runtime values (key index, counters, team membership) are written
/// under one of these slots so a restart can resume without a re-pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveSlot {
    Counters,
    AesKeyIndex,
    Team,
    VariablesToReset,
}

impl SaveSlot {
    pub fn column(self) -> &'static str {
        match self {
            SaveSlot::Counters => "counters",
            SaveSlot::AesKeyIndex => "aesKeyIndex",
            SaveSlot::Team => "team",
            SaveSlot::VariablesToReset => "variablesToReset",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSettings>,
    pub aes: Option<AesSettings>,
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|source| GatewayError::Io {
            interface: path.as_ref().display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| GatewayError::Protocol(format!("config parse error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let toml = r#"
            [general]
            roaming_enabled = false

            [[interfaces]]
            id = "CUL1"
            kind = "cul"
            device = "/dev/ttyUSB0"

            [aes]
            my_address = "1A2B3C"
            current_key = "00112233445566778899AABBCCDDEE00"
        "#;
        let cfg: GatewayConfig = toml::from_str(toml).unwrap();
        assert!(!cfg.general.roaming_enabled);
        assert_eq!(cfg.interfaces.len(), 1);
        assert_eq!(cfg.interfaces[0].kind, InterfaceKind::Cul);
        let aes = cfg.aes.unwrap();
        assert_eq!(aes.my_address().unwrap(), 0x1A2B3C);
        assert_eq!(aes.current_key().unwrap().len(), 16);
    }

    #[test]
    fn defaults_apply_when_general_is_absent() {
        let cfg: GatewayConfig = toml::from_str("").unwrap();
        assert!(cfg.general.roaming_enabled);
        assert_eq!(cfg.general.response_delay_ms, 95);
    }

    #[test]
    fn rejects_key_with_wrong_length() {
        let aes = AesSettings {
            my_address: "1".into(),
            current_key: "AABB".into(),
            old_key: String::new(),
            key_index: 0,
        };
        assert!(aes.current_key().is_err());
    }
}
