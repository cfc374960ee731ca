use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub networks: HashMap<String, NetworkConfig>,
    pub default_network: String,
    pub contract: ContractConfig,
    pub security: SecurityConfig,
    pub subscription: SubscriptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub gas: GasConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    pub default_gas_limit: u64,
    pub max_gas_price: Option<u64>,
    pub priority_fee: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    /// Address of the deployed relay contract.
    pub address: Option<String>,
    /// Block the contract was deployed in; default start for event queries.
    pub deployment_block: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub allow_write_operations: bool,
    pub require_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Capacity of the live log delivery channel.
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let mut networks = HashMap::new();

        networks.insert(
            "local".to_string(),
            NetworkConfig {
                rpc_url: "ws://127.0.0.1:8545".to_string(),
                chain_id: 1337,
                gas: GasConfig {
                    default_gas_limit: 3_000_000,
                    max_gas_price: Some(20_000_000_000), // 20 Gwei
                    priority_fee: None,
                },
            },
        );

        networks.insert(
            "sepolia".to_string(),
            NetworkConfig {
                rpc_url: "wss://eth-sepolia.g.alchemy.com/v2/demo".to_string(),
                chain_id: 11155111,
                gas: GasConfig {
                    default_gas_limit: 3_000_000,
                    max_gas_price: Some(20_000_000_000), // 20 Gwei
                    priority_fee: Some(1_000_000_000),   // 1 Gwei
                },
            },
        );

        networks.insert(
            "ethereum".to_string(),
            NetworkConfig {
                rpc_url: "wss://eth-mainnet.g.alchemy.com/v2/demo".to_string(),
                chain_id: 1,
                gas: GasConfig {
                    default_gas_limit: 3_000_000,
                    max_gas_price: Some(50_000_000_000), // 50 Gwei
                    priority_fee: Some(2_000_000_000),   // 2 Gwei
                },
            },
        );

        Self {
            networks,
            default_network: "local".to_string(),
            contract: ContractConfig {
                address: None,
                deployment_block: None,
            },
            security: SecurityConfig {
                allow_write_operations: false,
                require_confirmation: true,
            },
            subscription: SubscriptionConfig { buffer_size: 128 },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    anyhow!("Failed to create config directory {:?}: {}", parent, e)
                })?;
            }
        }

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {:?}: {}", path, e))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub async fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Self {
        let mut config = match path {
            Some(path) => match Self::load_from_file(path).await {
                Ok(config) => {
                    tracing::info!("Loaded configuration from file");
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to load config file, using defaults: {}", e);
                    Self::default()
                }
            },
            None => Self::default(),
        };

        config.apply_env_vars();
        config
    }

    pub fn network(&self, name: Option<&str>) -> Result<&NetworkConfig> {
        let name = name.unwrap_or(&self.default_network);
        self.networks.get(name).ok_or_else(|| {
            let mut available: Vec<&String> = self.networks.keys().collect();
            available.sort();
            anyhow!(
                "Network '{}' not configured. Available networks: {}",
                name,
                available
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
    }

    /// Apply environment variable overrides
    fn apply_env_vars(&mut self) {
        if let Ok(rpc_url) = std::env::var("TESTIMONIUM_RPC_URL") {
            if let Some(network) = self.networks.get_mut(&self.default_network) {
                tracing::info!("Using TESTIMONIUM_RPC_URL for network {}", self.default_network);
                network.rpc_url = rpc_url;
            }
        }

        if let Ok(address) = std::env::var("TESTIMONIUM_CONTRACT") {
            tracing::debug!("Using TESTIMONIUM_CONTRACT for contract address");
            self.contract.address = Some(address);
        }

        for (network_name, network_config) in &self.networks {
            if network_config.rpc_url.contains("/demo") {
                tracing::warn!(
                    "Using demo RPC endpoint for {}, set TESTIMONIUM_RPC_URL for better reliability",
                    network_name
                );
            }
        }
    }

    /// Get default config file path
    pub fn default_config_path() -> Result<std::path::PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("testimonium").join("config.toml"))
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let sample_config = r#"# Testimonium client configuration

# Default network to use when none is specified
default_network = "local"

# Network configurations. Use ws:// or wss:// endpoints for live event
# subscriptions; http(s) endpoints only support calls, transactions and
# historical event queries.
[networks.local]
rpc_url = "ws://127.0.0.1:8545"
chain_id = 1337

[networks.local.gas]
default_gas_limit = 3000000
max_gas_price = 20_000_000_000  # 20 Gwei

[networks.sepolia]
rpc_url = "wss://eth-sepolia.g.alchemy.com/v2/YOUR_API_KEY_HERE"
chain_id = 11155111

[networks.sepolia.gas]
default_gas_limit = 3000000
max_gas_price = 20_000_000_000  # 20 Gwei
priority_fee = 1_000_000_000    # 1 Gwei

# Deployed relay contract
[contract]
address = "0x0000000000000000000000000000000000000000"
# deployment_block = 0

# Security settings
[security]
allow_write_operations = false
require_confirmation = true

# Live event delivery
[subscription]
buffer_size = 128

# Environment variables that can be used:
# TESTIMONIUM_RPC_URL - overrides the default network's rpc_url
# TESTIMONIUM_CONTRACT - overrides contract.address
# TESTIMONIUM_PRIVATE_KEY - signing key for submit-header / dispute-block
"#;
        sample_config.to_string()
    }
}
