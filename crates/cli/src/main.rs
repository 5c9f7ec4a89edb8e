//! Internal Call CLI for key management and signed request debugging.
//!
//! This tool provides commands for:
//! - Generating RSA key pairs
//! - Validating and inspecting configuration files
//! - Signing and verifying signature header triples offline
//! - Issuing a signed call against a live endpoint

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;

use internal_call_common::constants::DEFAULT_RSA_KEY_BITS;
use internal_call_common::logging::init_logging;

mod call;
mod config;
mod error;
mod keys;

use error::CliError;

#[derive(Parser)]
#[command(name = "iccli")]
#[command(about = "Internal Call CLI for keys, config and signed requests")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an RSA key pair
    Keygen {
        /// Key size in bits
        #[arg(long, default_value_t = DEFAULT_RSA_KEY_BITS)]
        bits: usize,

        /// Directory to write private.key and public.key into; prints TOML when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Produce the signature headers for a request id and timestamp
    Sign {
        /// Path to the TOML configuration file
        #[arg(long, short, env = "INTERNAL_CALL_CONFIG")]
        file: PathBuf,

        /// Request id; a fresh one is generated when omitted
        #[arg(long)]
        request_id: Option<String>,

        /// Epoch milliseconds; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Check a signature header triple against the configured or given public key
    Verify {
        /// Path to the TOML configuration file
        #[arg(long, short, env = "INTERNAL_CALL_CONFIG")]
        file: Option<PathBuf>,

        /// Public key (PEM or base64 DER) to use instead of the configured one
        #[arg(long)]
        public_key: Option<String>,

        #[arg(long)]
        request_id: String,

        #[arg(long)]
        timestamp: i64,

        /// Value of the `sign` header
        #[arg(long)]
        sign: String,
    },

    /// Send a signed call and print the result
    Call {
        /// Path to the TOML configuration file
        #[arg(long, short, env = "INTERNAL_CALL_CONFIG")]
        file: PathBuf,

        /// Target URL
        #[arg(long)]
        url: String,

        /// JSON parameters; defaults to `{}`
        #[arg(long)]
        params: Option<String>,

        /// Identity header to propagate, as name=value (repeatable)
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate config against settings validation and parse configured keys
    Validate {
        /// Path to the TOML configuration file
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Print the merged configuration with the private key redacted
    Show {
        /// Path to the TOML configuration file
        #[arg(long, short)]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    if let Err(e) = init_logging(level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Keygen { bits, output } => keys::keygen(bits, output, cli.verbose),
        Commands::Config { action } => match action {
            ConfigAction::Validate { file } => config::validate(&file, cli.verbose),
            ConfigAction::Show { file } => config::show(&file, cli.verbose),
        },
        Commands::Sign {
            file,
            request_id,
            timestamp,
            format,
        } => keys::sign(&file, request_id, timestamp, format, cli.verbose),
        Commands::Verify {
            file,
            public_key,
            request_id,
            timestamp,
            sign,
        } => keys::verify_headers(
            file.as_deref(),
            public_key.as_deref(),
            &request_id,
            timestamp,
            &sign,
            cli.verbose,
        ),
        Commands::Call {
            file,
            url,
            params,
            headers,
        } => call::call(&file, &url, params.as_deref(), &headers, cli.verbose),
    }
}
