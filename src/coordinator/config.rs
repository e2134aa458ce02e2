//! Coordinator configuration. Controlling timelocks, deadlines and ports.

use std::{io, io::Write, path::Path};

use crate::utill::{get_swapd_dir, parse_field, parse_toml};

/// Coordinator configuration, controlling various daemon behavior.
///
/// The timelock asymmetry is load-bearing: the initiator's refund path must
/// open strictly later than the responder's (`T_init > T_resp`), so the
/// responder always observes the revealed preimage in time to claim.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// P2P swap-message listening port.
    pub network_port: u16,
    /// JSON-RPC listening port.
    pub rpc_port: u16,
    /// Our advertised peer identity.
    pub peer_id: String,
    /// Confirmations required before a funding output counts.
    pub required_confirms: u32,
    /// Hard deadline for direct message delivery, seconds.
    pub message_deadline_secs: u64,
    /// Responder-side HTLC timeout on Bitcoin-family chains, blocks.
    pub responder_timelock_blocks: u16,
    /// Initiator-side HTLC timeout on Bitcoin-family chains, blocks.
    pub initiator_timelock_blocks: u16,
    /// Responder-side HTLC timeout on EVM chains, seconds.
    pub responder_timelock_secs: u64,
    /// Initiator-side HTLC timeout on EVM chains, seconds.
    pub initiator_timelock_secs: u64,
    /// CSV delta of the MuSig2 escrow refund leaf, blocks.
    pub refund_csv_delta: u16,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            network_port: 7702,
            rpc_port: 7703,
            peer_id: String::new(),
            required_confirms: 1,
            message_deadline_secs: 24 * 60 * 60,
            responder_timelock_blocks: 144,
            initiator_timelock_blocks: 288,
            responder_timelock_secs: 12 * 60 * 60,
            initiator_timelock_secs: 24 * 60 * 60,
            refund_csv_delta: 288,
        }
    }
}

impl CoordinatorConfig {
    /// Constructs a [CoordinatorConfig] from a specified data directory, or
    /// creates default configs and loads them.
    ///
    /// The config.toml file should exist at the provided data-dir location.
    /// Or else, a new default-config will be loaded and created at the given
    /// data-dir location.
    ///
    /// Default data-dir for linux: `~/.crosswap/swapd`.
    pub fn new(config_path: Option<&Path>) -> io::Result<Self> {
        let default_config_path = get_swapd_dir().join("config.toml");
        let config_path = config_path.unwrap_or(&default_config_path);
        let default_config = Self::default();

        // Creates a default config file at the specified path if it doesn't
        // exist or is empty.
        if !config_path.exists() || std::fs::metadata(config_path)?.len() == 0 {
            log::warn!(
                "Coordinator config file not found, creating default config file at path: {}",
                config_path.display()
            );
            default_config.write_to_file(config_path)?;
        }

        let config_map = parse_toml(config_path)?;
        log::info!(
            "Successfully loaded config file from : {}",
            config_path.display()
        );

        let config = CoordinatorConfig {
            network_port: parse_field(
                config_map.get("network_port"),
                default_config.network_port,
            ),
            rpc_port: parse_field(config_map.get("rpc_port"), default_config.rpc_port),
            peer_id: parse_field(config_map.get("peer_id"), default_config.peer_id),
            required_confirms: parse_field(
                config_map.get("required_confirms"),
                default_config.required_confirms,
            ),
            message_deadline_secs: parse_field(
                config_map.get("message_deadline_secs"),
                default_config.message_deadline_secs,
            ),
            responder_timelock_blocks: parse_field(
                config_map.get("responder_timelock_blocks"),
                default_config.responder_timelock_blocks,
            ),
            initiator_timelock_blocks: parse_field(
                config_map.get("initiator_timelock_blocks"),
                default_config.initiator_timelock_blocks,
            ),
            responder_timelock_secs: parse_field(
                config_map.get("responder_timelock_secs"),
                default_config.responder_timelock_secs,
            ),
            initiator_timelock_secs: parse_field(
                config_map.get("initiator_timelock_secs"),
                default_config.initiator_timelock_secs,
            ),
            refund_csv_delta: parse_field(
                config_map.get("refund_csv_delta"),
                default_config.refund_csv_delta,
            ),
        };
        Ok(config.validated())
    }

    /// Force the timelock gap if a hand-edited config inverted it.
    fn validated(mut self) -> Self {
        if self.initiator_timelock_blocks <= self.responder_timelock_blocks {
            log::warn!("initiator timelock must exceed responder timelock, applying default gap");
            self.initiator_timelock_blocks = self.responder_timelock_blocks.saturating_mul(2);
        }
        if self.initiator_timelock_secs <= self.responder_timelock_secs {
            self.initiator_timelock_secs = self.responder_timelock_secs.saturating_mul(2);
        }
        self
    }

    // Method to serialize the config into a TOML string and write it to a file.
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        let toml_data = format!(
            "network_port = {}
rpc_port = {}
peer_id = {}
required_confirms = {}
message_deadline_secs = {}
responder_timelock_blocks = {}
initiator_timelock_blocks = {}
responder_timelock_secs = {}
initiator_timelock_secs = {}
refund_csv_delta = {}",
            self.network_port,
            self.rpc_port,
            self.peer_id,
            self.required_confirms,
            self.message_deadline_secs,
            self.responder_timelock_blocks,
            self.initiator_timelock_blocks,
            self.responder_timelock_secs,
            self.initiator_timelock_secs,
            self.refund_csv_delta,
        );
        std::fs::create_dir_all(path.parent().expect("Path should NOT be root!"))?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(toml_data.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        fs::{self, File},
        io::Write,
        path::PathBuf,
    };

    fn create_temp_config(contents: &str, file_name: &str) -> PathBuf {
        let file_path = std::env::temp_dir().join(file_name);
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{}", contents).unwrap();
        file_path
    }

    fn remove_temp_config(path: &Path) {
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_valid_config() {
        let contents = r#"
            network_port = 7702
            rpc_port = 7703
            required_confirms = 1
            message_deadline_secs = 86400
            responder_timelock_blocks = 144
            initiator_timelock_blocks = 288
            responder_timelock_secs = 43200
            initiator_timelock_secs = 86400
            refund_csv_delta = 288
        "#;
        let config_path = create_temp_config(contents, "valid_coordinator_config.toml");
        let config = CoordinatorConfig::new(Some(&config_path)).unwrap();
        remove_temp_config(&config_path);
        assert_eq!(config, CoordinatorConfig::default());
    }

    #[test]
    fn test_missing_fields() {
        let contents = r#"
            network_port = 9999
        "#;
        let config_path = create_temp_config(contents, "missing_fields_coordinator_config.toml");
        let config = CoordinatorConfig::new(Some(&config_path)).unwrap();
        remove_temp_config(&config_path);

        assert_eq!(config.network_port, 9999);
        assert_eq!(
            CoordinatorConfig {
                network_port: 7702,
                ..config
            },
            CoordinatorConfig::default()
        );
    }

    #[test]
    fn test_timelock_gap_enforced() {
        let contents = r#"
            responder_timelock_blocks = 300
            initiator_timelock_blocks = 200
        "#;
        let config_path = create_temp_config(contents, "inverted_timelock_config.toml");
        let config = CoordinatorConfig::new(Some(&config_path)).unwrap();
        remove_temp_config(&config_path);
        assert!(config.initiator_timelock_blocks > config.responder_timelock_blocks);
    }

    #[test]
    fn test_incorrect_data_type() {
        let contents = r#"
            network_port = "not_a_number"
        "#;
        let config_path = create_temp_config(contents, "incorrect_type_coordinator_config.toml");
        let config = CoordinatorConfig::new(Some(&config_path)).unwrap();
        remove_temp_config(&config_path);
        assert_eq!(config, CoordinatorConfig::default());
    }
}
