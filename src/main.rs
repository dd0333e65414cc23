use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colloquy::{create_router, AppState, Config, Dialogue, Persona};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "colloquy")]
#[command(about = "Spoken, interruptible conversations with a realtime agent")]
struct Cli {
    /// Config file (without extension)
    #[arg(short, long, default_value = "config/colloquy")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP control API
    Serve,

    /// Talk to a persona from the terminal
    Talk {
        /// Persona key (hr, ceo)
        #[arg(short, long, default_value = "hr")]
        persona: String,

        /// Start in text-only mode
        #[arg(long)]
        text_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));
    info!("Realtime endpoint: {}", cfg.realtime.endpoint());

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Talk { persona, text_only } => talk(cfg, &persona, text_only).await,
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let dialogue = Arc::new(Dialogue::from_config(&cfg)?);
    let app = create_router(AppState::new(Arc::clone(&dialogue)));

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    dialogue.end().await;
    Ok(())
}

async fn talk(cfg: Config, persona: &str, text_only: bool) -> Result<()> {
    let Some(persona) = Persona::builtin(persona) else {
        bail!(
            "Unknown persona {} (expected one of: {})",
            persona,
            Persona::builtin_keys().join(", ")
        );
    };

    let dialogue = Dialogue::from_config(&cfg)?;
    let name = persona.name.clone();

    dialogue.start(persona, None).await;
    if text_only {
        dialogue.toggle_speech_mode().await?;
    }

    let mut view = dialogue.subscribe();
    let captions = tokio::spawn(async move {
        let mut last = String::new();
        while view.changed().await.is_ok() {
            let caption = view.borrow_and_update().caption.clone();
            if !caption.is_empty() && caption != last {
                println!("{}: {}", name, caption);
                last = caption;
            }
        }
    });

    println!("Type a message, /speech to toggle speech mode, /stop to interrupt, /quit to end.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match line.trim() {
            "/quit" => break,
            "/stop" => dialogue.interrupt().await?,
            "/speech" => {
                let enabled = dialogue.toggle_speech_mode().await?;
                println!("Speech mode {}", if enabled { "on" } else { "off" });
            }
            "" => {}
            text => dialogue.submit_text(text).await?,
        }
    }

    dialogue.end().await;
    captions.abort();
    Ok(())
}
