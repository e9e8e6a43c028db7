//! Keystone CLI - call wallet exports of a sandboxed guest module.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keystone_bridge::{AddressRequest, Bridge, BridgeConfig};
use keystone_hostapi::Capabilities;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keystone")]
#[command(author, version, about = "Keystone - run wallet exports inside a wasm sandbox", long_about = None)]
struct Cli {
    /// Guest module (.wasm or .wat)
    #[arg(short, long, global = true, default_value = "keystone_guest.wasm")]
    wasm: PathBuf,

    /// JSON bridge configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new mnemonic
    Mnemonic,

    /// Derive an address from a mnemonic
    Address {
        #[command(flatten)]
        request: AddressArgs,
    },

    /// Derive an address and print the guest's derivation log
    AddressWithLogs {
        #[command(flatten)]
        request: AddressArgs,
    },

    /// Re-encode a bech32 address under another human-readable part
    ChangeHrp {
        /// Bech32 address
        address: String,

        /// New human-readable part
        hrp: String,
    },

    /// Encode a hex address as bech32
    ToBech32 {
        /// Hex address
        address: String,

        /// Human-readable part
        hrp: String,

        /// Address kind byte
        #[arg(short = 't', long, default_value = "0")]
        address_type: u8,
    },
}

#[derive(clap::Args)]
struct AddressArgs {
    /// Space separated mnemonic words
    mnemonic: String,

    /// SLIP-44 coin type
    #[arg(long, default_value = "4218")]
    coin_type: u32,

    /// Account index
    #[arg(long, default_value = "0")]
    account: u32,

    /// Derive a change (internal) address
    #[arg(long)]
    internal: bool,

    /// Address index
    #[arg(long, default_value = "0")]
    index: u32,

    /// Bech32 human-readable part
    #[arg(long, default_value = "rms")]
    hrp: String,
}

impl From<AddressArgs> for AddressRequest {
    fn from(args: AddressArgs) -> Self {
        AddressRequest {
            mnemonic: args.mnemonic,
            coin_type: args.coin_type,
            account_index: args.account,
            internal: args.internal,
            address_index: args.index,
            bech32_hrp: args.hrp,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::default(),
    };
    debug!(?config, "bridge config");
    let mut bridge = Bridge::from_file(&cli.wasm, config, Capabilities::os())
        .with_context(|| format!("loading guest {}", cli.wasm.display()))?;
    info!(
        wasm = %cli.wasm.display(),
        digest = %bridge.digest().to_hex(),
        "guest loaded"
    );

    match cli.command {
        Commands::Mnemonic => {
            println!("{}", bridge.generate_mnemonic()?);
        }
        Commands::Address { request } => {
            let address = bridge.generate_address(&request.into())?;
            print_list(&address)?;
        }
        Commands::AddressWithLogs { request } => {
            let address = bridge.generate_address_with_logs(&request.into())?;
            print_list(&address)?;
        }
        Commands::ChangeHrp { address, hrp } => {
            let changed = bridge.change_bech32_hrp(&address, &hrp)?;
            print_list(&changed)?;
        }
        Commands::ToBech32 {
            address,
            hrp,
            address_type,
        } => {
            println!("{}", bridge.to_bech32_address(&address, &hrp, address_type)?);
        }
    }

    Ok(())
}

fn print_list(items: &[String]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(items)?);
    Ok(())
}

/// `RUST_LOG` wins over `-v` when set.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "keystone_bridge=info,info",
        2 => "keystone_bridge=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
