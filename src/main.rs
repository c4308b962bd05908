// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};

use dlserve::config;
use dlserve::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "dlserve")]
#[command(version = VERSION)]
#[command(about = "Local download server. Queues downloads and drives yt-dlp/gallery-dl.")]
#[command(long_about = "dlserve - Local download orchestration server\n\n\
    Start the server:    dlserve\n\
    Submit a download:   dlserve add \"https://example.com/watch?v=...\"\n\
    Check progress:      dlserve status\n\
    Inspect the queue:   dlserve queue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (the default when no command is given)
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Submit a download to a running server
    ///
    /// Examples:
    ///   dlserve add "https://example.com/watch?v=abc"
    ///   dlserve add "https://example.com/gallery/123" --gallery
    Add {
        /// The URL to download
        url: String,
        /// Use gallery-dl instead of yt-dlp
        #[arg(long)]
        gallery: bool,
        /// yt-dlp format selector
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Show every tracked download and its progress
    Status,

    /// Show the pending queue, in dispatch order
    Queue,

    /// Cancel a running download, or remove it from the queue
    Cancel {
        /// The download id
        id: String,
    },

    /// Show the terminal outcome history
    History,

    /// Show or change configuration
    Config {
        /// Set the concurrent download limit
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Set the server port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    match cli.command {
        None | Some(Commands::Serve { port: None }) => serve(None).await,
        Some(Commands::Serve { port }) => serve(port).await,
        Some(Commands::Add {
            url,
            gallery,
            format,
        }) => add(&url, gallery, format).await,
        Some(Commands::Status) => status().await,
        Some(Commands::Queue) => queue().await,
        Some(Commands::Cancel { id }) => cancel(&id).await,
        Some(Commands::History) => history().await,
        Some(Commands::Config {
            max_concurrent,
            port,
        }) => configure(max_concurrent, port),
    }
}

async fn serve(port_override: Option<u16>) -> Result<()> {
    let mut config = config::load_config()?;
    if let Some(port) = port_override {
        config.port = port;
    }

    println!(
        "{} v{} listening on {}",
        "dlserve".bright_cyan().bold(),
        VERSION,
        format!("http://{}:{}", config.bind_address, config.port).cyan()
    );
    println!(
        "Downloads land in {}\n",
        config.download_dir.display().to_string().cyan()
    );

    Server::new(config).start().await
}

fn api_base() -> Result<String> {
    let config = config::load_config()?;
    Ok(format!("http://{}:{}", config.bind_address, config.port))
}

async fn api_get(path: &str) -> Result<Value> {
    let url = format!("{}{}", api_base()?, path);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Is the server running? Could not reach {}", url))?;
    response.json().await.context("Invalid server response")
}

async fn api_post(path: &str, body: Value) -> Result<Value> {
    let url = format!("{}{}", api_base()?, path);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Is the server running? Could not reach {}", url))?;
    response.json().await.context("Invalid server response")
}

async fn add(url: &str, gallery: bool, format: Option<String>) -> Result<()> {
    let mut body = json!({ "url": url });
    if gallery {
        body["tool"] = json!("gallery-dl");
    }
    if let Some(format) = format {
        body["format"] = json!(format);
    }

    let response = api_post("/api/download", body).await?;
    let id = response["downloadId"].as_str().unwrap_or("?");
    let disposition = response["status"].as_str().unwrap_or("?");
    println!(
        "{} {} ({})",
        "[OK]".green(),
        id.bold(),
        disposition
    );
    Ok(())
}

async fn status() -> Result<()> {
    let response = api_get("/api/status").await?;
    let Some(downloads) = response["downloads"].as_object() else {
        println!("No downloads.");
        return Ok(());
    };
    if downloads.is_empty() {
        println!("No downloads.");
        return Ok(());
    }

    for (id, entry) in downloads {
        let status = entry["status"].as_str().unwrap_or("?");
        let colored_status = match status {
            "finished" => status.green(),
            "error" | "canceled" => status.red(),
            "downloading" => status.cyan(),
            _ => status.yellow(),
        };
        let percent = entry["percent"].as_str().unwrap_or("-");
        let speed = entry["speed"].as_str().unwrap_or("-");
        let eta = entry["improved_eta"]
            .as_str()
            .or_else(|| entry["eta"].as_str())
            .unwrap_or("-");
        println!(
            "{}  {}  {}  {}  ETA {}",
            id.bold(),
            colored_status,
            percent,
            speed,
            eta
        );
        if let Some(error) = entry["error"].as_str() {
            println!("    {}", error.red());
        }
    }
    Ok(())
}

async fn queue() -> Result<()> {
    let response = api_get("/api/queue").await?;
    let queue = response["queue"].as_array().cloned().unwrap_or_default();
    if queue.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for (i, task) in queue.iter().enumerate() {
        println!(
            "{:>3}. {}  {}",
            i + 1,
            task["downloadId"].as_str().unwrap_or("?").bold(),
            task["url"].as_str().unwrap_or("?")
        );
    }
    Ok(())
}

async fn cancel(id: &str) -> Result<()> {
    let response = api_post(&format!("/api/download/{}/cancel", id), json!({})).await?;
    match response["status"].as_str() {
        Some(status) => println!("{} {} ({})", "[OK]".green(), id, status),
        None => println!(
            "{} {}",
            "[X]".red(),
            response["error"].as_str().unwrap_or("unknown download id")
        ),
    }
    Ok(())
}

async fn history() -> Result<()> {
    let response = api_get("/api/history").await?;
    let entries = response["history"].as_array().cloned().unwrap_or_default();
    if entries.is_empty() {
        println!("No history yet.");
        return Ok(());
    }
    for entry in entries {
        let status = entry["status"].as_str().unwrap_or("?");
        let colored_status = match status {
            "finished" => status.green(),
            _ => status.red(),
        };
        println!(
            "{}  {}  {}  {}",
            entry["timestamp"].as_str().unwrap_or("?").dimmed(),
            colored_status,
            entry["downloadId"].as_str().unwrap_or("?").bold(),
            entry["url"].as_str().unwrap_or("?")
        );
    }
    Ok(())
}

fn configure(max_concurrent: Option<usize>, port: Option<u16>) -> Result<()> {
    let mut config = config::load_config()?;

    if max_concurrent.is_none() && port.is_none() {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if let Some(max) = max_concurrent {
        config.max_concurrent_downloads = max.max(1);
        println!(
            "{} max_concurrent_downloads = {}",
            "[OK]".green(),
            config.max_concurrent_downloads
        );
    }
    if let Some(port) = port {
        config.port = port;
        println!("{} port = {}", "[OK]".green(), port);
    }

    config::save_config(&config)?;
    println!("A running server picks up the concurrency change on its next scheduling pass.");
    Ok(())
}
