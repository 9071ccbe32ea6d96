//! custocrypt - Chunked hybrid file encryption with remote key custody
//!
//! Usage:
//!   custocrypt init                 - Write a default configuration
//!   custocrypt encrypt <file>       - Encrypt a file into <file>.enc
//!   custocrypt decrypt <file.enc>   - Decrypt a container
//!   custocrypt backends             - List usable AES backends
//!   custocrypt status               - Show configuration and custodian status
//!   custocrypt register             - Register a new approval session

use clap::{Parser, Subcommand};
use custocrypt::{
    accel::BackendKind,
    config::Config,
    crypto::PrivateKey,
    executor::ProgressEvent,
    ClientContext, DecryptOptions, EncryptOptions, Engine, Error, Result,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "custocrypt")]
#[command(author = "custocrypt Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chunked hybrid file encryption with remote key custody")]
struct Cli {
    /// Configuration file path (JSON or YAML)
    #[arg(short, long, env = "CUSTOCRYPT_CONFIG", default_value = "~/.config/custocrypt/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Custodian base URL
        #[arg(long)]
        server: Option<String>,

        /// User whose custodian key protects the files
        #[arg(long)]
        user: Option<String>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Encrypt a file
    Encrypt {
        /// File to encrypt
        input: PathBuf,

        /// Container path (defaults to <input>.enc)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Wait for approval on the secondary device
        #[arg(long, conflicts_with = "no_approval")]
        approve: bool,

        /// Skip the approval step even if the configuration requires it
        #[arg(long)]
        no_approval: bool,

        /// Prompt for a passphrase to derive the key from
        #[arg(long)]
        passphrase: bool,

        /// Read the passphrase from a file
        #[arg(long, conflicts_with = "passphrase")]
        passphrase_file: Option<PathBuf>,

        /// Preferred AES backend (cuda, opencl, cpu, software)
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Decrypt a container
    Decrypt {
        /// Container to decrypt
        input: PathBuf,

        /// Output path (defaults to the input without .enc)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Unwrap the key locally with this RSA private key (PEM)
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Preferred AES backend (cuda, opencl, cpu, software)
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// List usable AES backends
    Backends,

    /// Show configuration and custodian status
    Status,

    /// Register a new approval session
    Register,
}

fn main() {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);

    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_logging(cli.verbose, &Config::default());
            error!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    init_logging(cli.verbose, &config);

    if let Err(e) = run_command(cli.command, &config_path, config) {
        match e.chunk_index() {
            Some(index) => error!("Error (chunk {}): {}", index, e),
            None => error!("Error: {}", e),
        }
        std::process::exit(e.exit_code());
    }
}

/// Install the fmt subscriber; `RUST_LOG` overrides the configured level
fn init_logging(verbose: bool, config: &Config) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let log_file = config.logging.file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("Cannot open log file {}: {}", path.display(), e))
            .ok()
    });

    let result = match log_file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    if let Err(e) = result {
        eprintln!("Failed to set subscriber: {}", e);
    }
}

fn run_command(command: Commands, config_path: &Path, config: Config) -> Result<()> {
    match command {
        Commands::Init { server, user, force } => cmd_init(config_path, server, user, force),

        Commands::Encrypt {
            input,
            output,
            approve,
            no_approval,
            passphrase,
            passphrase_file,
            backend,
        } => {
            let require_approval = match (approve, no_approval) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let passphrase = read_passphrase(passphrase, passphrase_file.as_deref())?;
            let options = EncryptOptions {
                output,
                passphrase,
                require_approval,
            };
            cmd_encrypt(config, &input, options, backend)
        }

        Commands::Decrypt {
            input,
            output,
            private_key,
            backend,
        } => {
            let private_key = private_key
                .as_deref()
                .map(PrivateKey::from_file)
                .transpose()?;
            let options = DecryptOptions { output, private_key };
            cmd_decrypt(config, &input, options, backend)
        }

        Commands::Backends => cmd_backends(config),

        Commands::Status => cmd_status(config_path, config),

        Commands::Register => cmd_register(config),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))
}

fn build_engine(mut config: Config, backend: Option<BackendKind>) -> Result<Engine> {
    if let Some(kind) = backend {
        config.acceleration.preferred = kind;
    }
    config.ensure_directories()?;
    let context = Arc::new(ClientContext::new(config)?);
    Ok(Engine::new(context))
}

fn cmd_init(config_path: &Path, server: Option<String>, user: Option<String>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }

    info!("Initializing custocrypt...");

    let mut config = Config::default();
    if let Some(url) = server {
        config.server.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(user) = user {
        config.server.user_id = user;
    }
    config.validate()?;

    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    info!("");
    info!("Next steps:");
    info!("  1. Run 'custocrypt status' to check the custodian connection");
    info!("  2. Run 'custocrypt encrypt <file>' to encrypt a file");

    Ok(())
}

fn read_passphrase(prompt: bool, file: Option<&Path>) -> Result<Option<Zeroizing<String>>> {
    if let Some(path) = file {
        let content = Zeroizing::new(std::fs::read_to_string(path)?);
        let trimmed = content.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Err(Error::Config(format!("passphrase file {} is empty", path.display())));
        }
        return Ok(Some(Zeroizing::new(trimmed.to_string())));
    }

    if !prompt {
        return Ok(None);
    }

    let first = Zeroizing::new(
        rpassword::prompt_password("Enter passphrase: ").map_err(|e| Error::Internal(e.to_string()))?,
    );
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm passphrase: ").map_err(|e| Error::Internal(e.to_string()))?,
    );
    if first.is_empty() || *first != *second {
        return Err(Error::Config("passphrases are empty or do not match".to_string()));
    }
    Ok(Some(first))
}

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}% {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Render progress events until the sender side is dropped
async fn render_progress(mut events: mpsc::UnboundedReceiver<ProgressEvent>, pb: ProgressBar) {
    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::Percent(p) => pb.set_position(p as u64),
            ProgressEvent::Status(message) => pb.set_message(message),
            ProgressEvent::ApprovalToken(token) => {
                pb.println("Approve this request on your secondary device:");
                pb.println(token);
            }
            ProgressEvent::Reset => pb.reset(),
        }
    }
}

fn cmd_encrypt(
    config: Config,
    input: &Path,
    options: EncryptOptions,
    backend: Option<BackendKind>,
) -> Result<()> {
    let engine = build_engine(config, backend)?;
    let runtime = runtime()?;

    let report = runtime.block_on(async {
        let (tx, rx) = mpsc::unbounded_channel();
        let pb = make_progress_bar("encrypt");
        let renderer = tokio::spawn(render_progress(rx, pb.clone()));

        let result = engine.encrypt_file(input, options, &tx).await;
        drop(tx);
        let _ = renderer.await;
        match &result {
            Ok(_) => pb.finish_with_message("done"),
            Err(_) => pb.abandon_with_message("failed"),
        }
        result
    })?;

    if report.variant == custocrypt::container::ContainerVariant::Local {
        warn!("Custodian unavailable: {} holds its key in the clear", report.output.display());
    }

    println!("Encrypted: {}", report.output.display());
    println!("Container: {:?} ({} bytes, {} chunks)", report.variant, report.container_len, report.chunk_count);
    if let Some(session) = &report.session_id {
        println!("Approved under session {}", session);
    }
    Ok(())
}

fn cmd_decrypt(
    config: Config,
    input: &Path,
    options: DecryptOptions,
    backend: Option<BackendKind>,
) -> Result<()> {
    let engine = build_engine(config, backend)?;
    let runtime = runtime()?;

    let report = runtime.block_on(async {
        let (tx, rx) = mpsc::unbounded_channel();
        let pb = make_progress_bar("decrypt");
        let renderer = tokio::spawn(render_progress(rx, pb.clone()));

        let result = engine.decrypt_file(input, options, &tx).await;
        drop(tx);
        let _ = renderer.await;
        match &result {
            Ok(_) => pb.finish_with_message("done"),
            Err(_) => pb.abandon_with_message("failed"),
        }
        result
    })?;

    println!("Decrypted: {} ({} bytes)", report.output.display(), report.plaintext_len);
    Ok(())
}

fn cmd_backends(config: Config) -> Result<()> {
    let preferred = config.acceleration.preferred;
    let engine = build_engine(config, None)?;

    println!("AES backends");
    println!("============");
    for kind in custocrypt::accel::PRIORITY {
        let available = engine.dispatcher().capabilities().contains(kind);
        let marker = if kind == preferred { " (preferred)" } else { "" };
        println!(
            "  {:<16} {}{}",
            kind.as_str(),
            if available { "available" } else { "unavailable" },
            marker
        );
    }
    println!("Fallback order: {}", preferred
        .fallback_chain()
        .filter(|k| engine.dispatcher().capabilities().contains(*k))
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(" -> "));
    Ok(())
}

fn cmd_status(config_path: &Path, config: Config) -> Result<()> {
    println!("custocrypt Status");
    println!("=================");
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("Custodian: {}", config.server.base_url);
    println!("User: {}", config.server.user_id);
    println!("Chunk size: {} KiB", custocrypt::container::CHUNK_SIZE / 1024);
    println!("Workers: {}", config.encryption.workers());
    println!("Approval: {}", if config.approval.required { "required" } else { "optional" });
    println!("Key source: {:?}", config.encryption.key_source);

    let session = custocrypt::approval::SessionStore::new(config.session_file()).load()?;
    match session {
        Some(id) => println!("Session: {}", id),
        None => println!("Session: not registered (run 'custocrypt register')"),
    }

    let context = ClientContext::new(config)?;
    let runtime = runtime()?;
    runtime.block_on(async {
        match context.custodian().health().await {
            Ok(()) => println!("Custodian: reachable"),
            Err(e) => println!("Custodian: unreachable - {}", e),
        }
    });

    Ok(())
}

fn cmd_register(config: Config) -> Result<()> {
    config.ensure_directories()?;
    let context = ClientContext::new(config)?;
    let runtime = runtime()?;
    let session = runtime.block_on(context.register())?;
    println!("Registered session {}", session);
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
