//! docseal - signing token command-line tool
//!
//! Talks to a PKCS#11 module through the token coordinator: list the
//! present tokens, follow insertions and removals, or sign a precomputed
//! digest with the active signing credential.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docseal_core::{DigestMethod, TokenHandle};
use docseal_token::{
    open_driver, CoordinatorConfig, Pin, PinPrompt, PinRequest, PinResponse, SignOutcome,
    TokenCoordinator, TokenEvent,
};

#[derive(Parser)]
#[command(name = "docseal")]
#[command(about = "Signing token access for document containers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $DOCSEAL_CONFIG, then the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one detection pass and show the present tokens
    Status,

    /// Follow token insertions and removals until interrupted
    Watch,

    /// Sign a precomputed digest with the active signing credential
    SignDigest {
        /// XML-DSig digest method URI
        #[arg(short, long, default_value = "http://www.w3.org/2001/04/xmlenc#sha256")]
        method: String,

        /// Digest to sign (hex)
        digest: String,
    },
}

/// Answers the first PIN request from `DOCSEAL_PIN`, then cancels
///
/// Retrying a rejected PIN from the environment would only count down the
/// token's retry counter.
struct EnvPrompt {
    pin: Pin,
    used: AtomicBool,
}

#[async_trait]
impl PinPrompt for EnvPrompt {
    async fn request_pin(&self, _request: &PinRequest) -> PinResponse {
        if self.used.swap(true, Ordering::SeqCst) {
            warn!("PIN from DOCSEAL_PIN was rejected, not retrying");
            PinResponse::Canceled
        } else {
            PinResponse::Entered(self.pin.clone())
        }
    }
}

/// Reads the PIN as one line from standard input; an empty line cancels
struct StdinPrompt {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinPrompt {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl PinPrompt for StdinPrompt {
    async fn request_pin(&self, request: &PinRequest) -> PinResponse {
        let mut stderr = tokio::io::stderr();
        let mut text = String::new();
        if let Some(warning) = request.warning() {
            text.push_str(warning);
            text.push('\n');
        }
        text.push_str(&format!(
            "PIN for {} (attempt {}): ",
            request.subject.as_deref().unwrap_or(request.card.as_str()),
            request.attempt
        ));
        let _ = stderr.write_all(text.as_bytes()).await;
        let _ = stderr.flush().await;

        match self.lines.lock().await.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                PinResponse::Entered(Pin::new(line.trim()))
            }
            Ok(_) => PinResponse::Canceled,
            Err(e) => {
                warn!("Failed to read PIN: {}", e);
                PinResponse::Canceled
            }
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<CoordinatorConfig> {
    let path = path
        .or_else(|| std::env::var_os("DOCSEAL_CONFIG").map(PathBuf::from))
        .unwrap_or_else(CoordinatorConfig::default_path);

    if path.exists() {
        info!("Loading config from {}", path.display());
        CoordinatorConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))
    } else {
        info!("No config at {}, using defaults", path.display());
        Ok(CoordinatorConfig::default())
    }
}

fn pin_prompt() -> Arc<dyn PinPrompt> {
    match std::env::var("DOCSEAL_PIN") {
        Ok(pin) if !pin.is_empty() => Arc::new(EnvPrompt {
            pin: Pin::new(pin),
            used: AtomicBool::new(false),
        }),
        _ => Arc::new(StdinPrompt::new()),
    }
}

fn describe(handle: &TokenHandle) -> String {
    let subject = handle
        .certificate()
        .info()
        .map(|info| info.subject)
        .unwrap_or_else(|_| "<unreadable certificate>".to_string());
    let flags = handle.flags();
    let mut notes = Vec::new();
    if flags.pin_locked {
        notes.push("PIN locked");
    } else if flags.pin_final_try {
        notes.push("final PIN try");
    } else if flags.pin_count_low {
        notes.push("PIN count low");
    }
    if flags.protected_auth_path {
        notes.push("pinpad");
    }

    let mut line = format!(
        "{} {} [{}] {}",
        handle.card(),
        handle.key_algorithm(),
        handle.certificate().short(),
        subject
    );
    if !notes.is_empty() {
        line.push_str(&format!(" ({})", notes.join(", ")));
    }
    line
}

async fn status(coordinator: &TokenCoordinator) -> Result<()> {
    coordinator.refresh().await;

    let cards = coordinator.cards().await;
    if cards.is_empty() {
        println!("No tokens present");
        return Ok(());
    }

    println!("Cards:");
    for card in &cards {
        println!("  {}", card);
    }
    match coordinator.current_token().await {
        Some(handle) => println!("Signing credential:\n  {}", describe(&handle)),
        None => println!("No valid signing credential"),
    }
    Ok(())
}

async fn watch(coordinator: Arc<TokenCoordinator>) -> Result<()> {
    let mut events = coordinator.subscribe();
    let detection = coordinator.spawn_detection();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(TokenEvent::Changed { active, cards }) => {
                        println!("Cards present: {}", cards.len());
                        match active {
                            Some(handle) => println!("  active: {}", describe(&handle)),
                            None => println!("  no signing credential"),
                        }
                    }
                    Ok(TokenEvent::PinIncorrect { card, attempt, final_try }) => {
                        let note = if final_try { ", final try left" } else { "" };
                        println!("Incorrect PIN on {} (attempt {}{})", card, attempt, note);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} token events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    detection.stop().await;
    Ok(())
}

async fn sign_digest(coordinator: &TokenCoordinator, method: &str, digest: &str) -> Result<()> {
    let method = DigestMethod::from_uri(method)?;
    let digest = hex::decode(digest.trim()).context("Digest is not valid hex")?;
    method.check_len(&digest)?;

    coordinator.refresh().await;
    let Some(handle) = coordinator.current_token().await else {
        bail!("No signing token present");
    };
    info!("Signing with {}", describe(&handle));

    match coordinator.sign(method, &digest).await? {
        SignOutcome::Signed(signature) => println!("{}", hex::encode(signature)),
        SignOutcome::Canceled => println!("Canceled"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docseal=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    let driver = open_driver(&config.driver, pin_prompt()).context("Failed to open token driver")?;
    let coordinator = Arc::new(TokenCoordinator::new(driver, config));

    match cli.command {
        Commands::Status => status(&coordinator).await,
        Commands::Watch => watch(coordinator).await,
        Commands::SignDigest { method, digest } => {
            sign_digest(&coordinator, &method, &digest).await
        }
    }
}
