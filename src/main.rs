use std::io::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use serde_json::json;
use testimonium_client::config::Config;
use testimonium_client::error::BindError;
use testimonium_client::ethereum::provider::{self, Backend};
use testimonium_client::ethereum::utils::{
    describe_bind_error, parse_b256, parse_hex_bytes, parse_uint, validate_address,
};
use testimonium_client::ethereum::{CallOpts, FilterOpts, TransactOpts, WatchOpts};
use testimonium_client::testimonium::{SubmitBlockHeader, Testimonium};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn hash_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).value_name("HASH").required(true).help(help)
}

fn cli() -> Command {
    Command::new("testimonium")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Client for the Testimonium block header relay contract")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Path to configuration file"),
        )
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .global(true)
                .help("Network to use (local, sepolia, ethereum)"),
        )
        .arg(
            Arg::new("rpc-url")
                .short('r')
                .long("rpc-url")
                .value_name("URL")
                .global(true)
                .help("RPC endpoint URL (ws:// or wss:// for live events)"),
        )
        .arg(
            Arg::new("contract")
                .short('a')
                .long("contract")
                .value_name("ADDRESS")
                .global(true)
                .help("Address of the deployed Testimonium contract"),
        )
        .arg(
            Arg::new("allow-writes")
                .long("allow-writes")
                .global(true)
                .help("Allow write operations (transactions)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("private-key")
                .long("private-key")
                .value_name("HEX")
                .global(true)
                .help("Signing key for transactions (or TESTIMONIUM_PRIVATE_KEY)"),
        )
        .arg(
            Arg::new("yes")
                .short('y')
                .long("yes")
                .global(true)
                .help("Skip the confirmation prompt for transactions")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a sample configuration file and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config-path")
                .long("config-path")
                .help("Print the default configuration file path and exit")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("is-block")
                .about("Check whether a block hash is stored")
                .arg(hash_arg("hash", "Block hash")),
        )
        .subcommand(
            Command::new("is-unlocked")
                .about("Check whether a stored block is past its lock period")
                .arg(hash_arg("hash", "Block hash")),
        )
        .subcommand(
            Command::new("get-block")
                .about("Show the bookkeeping data of a stored block")
                .arg(hash_arg("hash", "Block hash")),
        )
        .subcommand(
            Command::new("headers")
                .about("Show a stored header")
                .arg(hash_arg("hash", "Block hash")),
        )
        .subcommand(
            Command::new("endpoint")
                .about("Block hash of a fork endpoint")
                .arg(
                    Arg::new("index")
                        .value_name("INDEX")
                        .required(true)
                        .help("Endpoint index (decimal or 0x hex)"),
                ),
        )
        .subcommand(Command::new("forks").about("Number of forks tracked by the contract"))
        .subcommand(
            Command::new("verify-tx")
                .about("Verify a transaction is included in a confirmed block")
                .arg(hash_arg("tx-hash", "Transaction hash"))
                .arg(hash_arg("block-hash", "Block hash claimed to contain the transaction"))
                .arg(
                    Arg::new("confirmations")
                        .long("confirmations")
                        .value_name("N")
                        .default_value("6")
                        .value_parser(clap::value_parser!(u8))
                        .help("Number of confirming blocks required"),
                ),
        )
        .subcommand(
            Command::new("submit-header")
                .about("Submit an RLP-encoded block header")
                .arg(
                    Arg::new("rlp")
                        .value_name("HEX")
                        .required(true)
                        .help("RLP-encoded header as 0x hex"),
                ),
        )
        .subcommand(
            Command::new("dispute-block")
                .about("Dispute a stored block")
                .arg(hash_arg("hash", "Block hash")),
        )
        .subcommand(
            Command::new("events")
                .about("List SubmitBlockHeader events")
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_name("BLOCK")
                        .value_parser(clap::value_parser!(u64))
                        .help("First block to query (defaults to contract.deployment_block)"),
                )
                .arg(
                    Arg::new("to")
                        .long("to")
                        .value_name("BLOCK")
                        .value_parser(clap::value_parser!(u64))
                        .conflicts_with("follow")
                        .help("Last block to query (defaults to the current head)"),
                )
                .arg(
                    Arg::new("follow")
                        .short('f')
                        .long("follow")
                        .help("Keep printing live events after the backlog")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("watch").about("Print new SubmitBlockHeader events until Ctrl-C"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries JSON output, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let matches = cli().get_matches();

    // Handle special commands first
    if matches.get_flag("generate-config") {
        let sample_config = Config::generate_sample();
        println!("{}", sample_config);
        return Ok(());
    }

    if matches.get_flag("config-path") {
        match Config::default_config_path() {
            Ok(path) => {
                println!("{}", path.display());
                return Ok(());
            }
            Err(e) => {
                error!("Could not determine default config path: {}", e);
                return Err(e);
            }
        }
    }

    let Some((command, args)) = matches.subcommand() else {
        cli().print_help()?;
        return Ok(());
    };

    // Load configuration
    let config_path = match matches.get_one::<String>("config") {
        Some(path) => Some(std::path::PathBuf::from(path)),
        None => Config::default_config_path().ok().filter(|p| p.exists()),
    };
    let mut config = Config::load_or_default(config_path).await;

    // Override with command line arguments
    if let Some(network) = matches.get_one::<String>("network") {
        config.default_network = network.clone();
    }

    if let Some(rpc_url) = matches.get_one::<String>("rpc-url") {
        if let Some(network_config) = config.networks.get_mut(&config.default_network) {
            network_config.rpc_url = rpc_url.clone();
        }
    }

    if let Some(address) = matches.get_one::<String>("contract") {
        config.contract.address = Some(address.clone());
    }

    if matches.get_flag("allow-writes") {
        config.security.allow_write_operations = true;
    }

    let result = run(command, args, &matches, &config).await;
    if let Err(e) = &result {
        match e.downcast_ref::<BindError>() {
            Some(bind) => error!("{}", describe_bind_error(bind)),
            None => error!("{:#}", e),
        }
    }
    result
}

fn is_write(command: &str) -> bool {
    matches!(command, "submit-header" | "dispute-block")
}

async fn run(command: &str, args: &ArgMatches, global: &ArgMatches, config: &Config) -> Result<()> {
    let network = config.network(None)?;
    let address = contract_address(config)?;

    let signer = if is_write(command) {
        if !config.security.allow_write_operations {
            bail!(
                "Write operations are disabled. Pass --allow-writes or set security.allow_write_operations = true"
            );
        }
        Some(load_signer(global)?)
    } else {
        None
    };

    info!(
        network = %config.default_network,
        contract = %address,
        "Connecting to {}",
        network.rpc_url
    );
    let backend = provider::connect(network, config.subscription.buffer_size, signer).await?;
    let relay = Testimonium::new(address, backend.clone())?;
    let call = CallOpts::default();

    match command {
        "is-block" => {
            let hash = parse_b256(required(args, "hash")?)?;
            let stored = relay.caller.is_block(&call, hash).await?;
            print_json(&json!({ "hash": hash, "isBlock": stored }))
        }
        "is-unlocked" => {
            let hash = parse_b256(required(args, "hash")?)?;
            let unlocked = relay.caller.is_unlocked(&call, hash).await?;
            print_json(&json!({ "hash": hash, "isUnlocked": unlocked }))
        }
        "get-block" => {
            let hash = parse_b256(required(args, "hash")?)?;
            print_json(&relay.caller.get_block(&call, hash).await?)
        }
        "headers" => {
            let hash = parse_b256(required(args, "hash")?)?;
            print_json(&relay.caller.headers(&call, hash).await?)
        }
        "endpoint" => {
            let index = parse_uint(required(args, "index")?)?;
            let hash = relay.caller.get_block_hash_of_endpoint(&call, index).await?;
            print_json(&json!({ "index": index, "hash": hash }))
        }
        "forks" => {
            let forks = relay.caller.get_no_of_forks(&call).await?;
            print_json(&json!({ "forks": forks }))
        }
        "verify-tx" => {
            let tx_hash = parse_b256(required(args, "tx-hash")?)?;
            let block_hash = parse_b256(required(args, "block-hash")?)?;
            let confirmations = args.get_one::<u8>("confirmations").copied().unwrap_or(6);
            let verified = relay
                .caller
                .verify_transaction(&call, tx_hash, block_hash, confirmations)
                .await?;
            print_json(&json!({
                "txHash": tx_hash,
                "blockHash": block_hash,
                "confirmations": confirmations,
                "verified": verified,
            }))
        }
        "submit-header" => {
            let rlp = parse_hex_bytes(required(args, "rlp")?)?;
            confirm(config, global, &format!("submit a {}-byte header", rlp.len()))?;
            let tx = relay
                .transactor
                .submit_header(&transact_opts(config)?, rlp)
                .await?;
            print_json(&json!({ "transactionHash": tx }))
        }
        "dispute-block" => {
            let hash = parse_b256(required(args, "hash")?)?;
            confirm(config, global, &format!("dispute block {}", hash))?;
            let tx = relay
                .transactor
                .dispute_block(&transact_opts(config)?, hash)
                .await?;
            print_json(&json!({ "transactionHash": tx }))
        }
        "events" => list_events(&relay, backend, args, config).await,
        "watch" => watch(&relay).await,
        other => Err(anyhow!("Unknown command: {}", other)),
    }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing argument <{}>", name))
}

fn contract_address(config: &Config) -> Result<Address> {
    let address = config.contract.address.as_deref().ok_or_else(|| {
        anyhow!("No contract address configured. Pass --contract, set TESTIMONIUM_CONTRACT or contract.address")
    })?;
    validate_address(address)
}

fn load_signer(global: &ArgMatches) -> Result<PrivateKeySigner> {
    let key = match global.get_one::<String>("private-key") {
        Some(key) => key.clone(),
        None => std::env::var("TESTIMONIUM_PRIVATE_KEY").map_err(|_| {
            anyhow!("Write operations need a signing key. Pass --private-key or set TESTIMONIUM_PRIVATE_KEY")
        })?,
    };
    PrivateKeySigner::from_str(key.trim()).map_err(|e| anyhow!("Invalid private key: {}", e))
}

fn transact_opts(config: &Config) -> Result<TransactOpts> {
    let gas = &config.network(None)?.gas;
    Ok(TransactOpts {
        gas_limit: Some(gas.default_gas_limit),
        max_fee_per_gas: gas.max_gas_price.map(u128::from),
        max_priority_fee_per_gas: gas.priority_fee.map(u128::from),
        ..Default::default()
    })
}

fn confirm(config: &Config, global: &ArgMatches, action: &str) -> Result<()> {
    if !config.security.require_confirmation || global.get_flag("yes") {
        return Ok(());
    }

    eprint!("About to {} on {}. Continue? [y/N] ", action, config.default_network);
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;

    match answer.trim() {
        "y" | "Y" | "yes" => Ok(()),
        _ => bail!("Aborted"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow!("Failed to serialize output: {}", e))?;
    println!("{}", output);
    Ok(())
}

fn print_event(event: &SubmitBlockHeader) -> Result<()> {
    let line = serde_json::to_string(event)
        .map_err(|e| anyhow!("Failed to serialize event: {}", e))?;
    println!("{}", line);
    Ok(())
}

/// Token cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            trigger.cancel();
        }
    });
    token
}

async fn list_events(
    relay: &Testimonium,
    backend: Arc<dyn Backend>,
    args: &ArgMatches,
    config: &Config,
) -> Result<()> {
    let start = args
        .get_one::<u64>("from")
        .copied()
        .or(config.contract.deployment_block)
        .unwrap_or(0);

    let end = if args.get_flag("follow") {
        None
    } else {
        match args.get_one::<u64>("to") {
            Some(to) => Some(*to),
            None => Some(backend.block_number().await.map_err(BindError::Filter)?),
        }
    };

    let opts = FilterOpts {
        start,
        end,
        cancel: ctrl_c_token(),
    };
    let mut events = relay.filterer.filter_submit_block_header(&opts).await?;

    let mut count = 0usize;
    while events.next().await {
        if let Some(event) = events.event() {
            print_event(event)?;
            count += 1;
        }
    }
    events.close();

    if let Some(e) = events.error() {
        return Err(e.clone().into());
    }
    info!(count, "Listed events");
    Ok(())
}

async fn watch(relay: &Testimonium) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let stop = ctrl_c_token();
    let opts = WatchOpts {
        start: None,
        cancel: stop.clone(),
    };
    let handle = relay
        .filterer
        .watch_submit_block_header(&opts, tx)
        .await?;
    info!("Watching SubmitBlockHeader events, press Ctrl-C to stop");

    // The channel closes once the watch task exits and drops its sender.
    while let Some(event) = rx.recv().await {
        print_event(&event)?;
    }

    if let Err(e) = handle.wait().await {
        warn!("Watch ended with an error");
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    #[test]
    fn test_cli_parses_read_command() {
        let matches = cli()
            .try_get_matches_from(["testimonium", "-n", "sepolia", "is-block", "0xabc"])
            .unwrap();
        let (command, args) = matches.subcommand().unwrap();
        assert_eq!(command, "is-block");
        assert_eq!(args.get_one::<String>("hash").unwrap(), "0xabc");
        assert_eq!(matches.get_one::<String>("network").unwrap(), "sepolia");
    }

    #[test]
    fn test_events_follow_conflicts_with_to() {
        let result =
            cli().try_get_matches_from(["testimonium", "events", "--follow", "--to", "10"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_writes_are_classified() {
        assert!(is_write("submit-header"));
        assert!(is_write("dispute-block"));
        assert!(!is_write("verify-tx"));
    }

    #[test]
    fn test_transact_opts_use_network_gas() {
        let config = Config::default();
        let opts = transact_opts(&config).unwrap();
        assert_eq!(opts.gas_limit, Some(3_000_000));
        assert_eq!(opts.value, U256::ZERO);
    }

    #[test]
    fn test_contract_address_required() {
        let mut config = Config::default();
        config.contract.address = None;
        assert!(contract_address(&config).is_err());
        config.contract.address = Some("0x742d35Cc6435C9c1c72c5E7b18BaB7e1DB7a5d6e".to_string());
        assert!(contract_address(&config).is_ok());
    }
}
