mod cli;

use sizeforge::{config, server};
use sizeforge_av::{BitrateParams, BitratePlan, FfprobeProber, Prober, ToolRegistry};
use sizeforge_core::Error;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // Override host/port from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.check()?;

    tracing::info!("Starting sizeforge server");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "sizeforge=trace,sizeforge_av=trace,sizeforge_core=trace,tower_http=debug".to_string()
        } else {
            "sizeforge=debug,sizeforge_av=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&file, json, cli.config.as_deref()))
        }
        Commands::Bitrate {
            target_bytes,
            duration_secs,
        } => plan_bitrate(target_bytes, duration_secs, cli.config.as_deref()),
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("sizeforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn probe_file(file: &Path, json: bool, config_path: Option<&Path>) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.encoder);
    let prober = FfprobeProber::new(tools.require("ffprobe")?.to_path_buf());
    let info = prober.probe(file).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    println!("Container: {}", info.format);
    println!("Size: {} bytes", info.size);
    match info.duration {
        Some(duration) => {
            let secs = duration as u64;
            println!(
                "Duration: {:02}:{:02}:{:02} ({:.3} s)",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60,
                duration
            );
        }
        None => println!("Duration: unknown"),
    }
    println!("Audio: {}", if info.has_audio { "yes" } else { "no" });

    Ok(())
}

fn plan_bitrate(target_bytes: u64, duration_secs: f64, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let params = BitrateParams::from(&config.encoder);

    match BitratePlan::compute(target_bytes, Some(duration_secs), &params) {
        Ok(plan) => {
            println!("Target: {} bytes over {:.3} s", target_bytes, duration_secs);
            println!("Video bitrate: {} bps", plan.video_bitrate_bps);
            println!("Audio bitrate: {} bps", plan.audio_bitrate_bps);
            Ok(())
        }
        Err(e @ Error::TargetTooSmall { .. }) => {
            println!("{}", e);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.encoder).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. sizeforge needs both ffmpeg and ffprobe.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Uploads: {}", config.storage.upload_dir.display());
    println!("  Outputs: {}", config.storage.output_dir.display());
    println!(
        "  Encoder: {} ({}), audio {} bps",
        config.encoder.video_codec, config.encoder.preset, config.encoder.audio_bitrate_bps
    );
    println!(
        "  Concurrent encodes: {}",
        match config.jobs.max_concurrent_encodes {
            0 => "unlimited".to_string(),
            n => n.to_string(),
        }
    );

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for warning in warnings {
            println!("  - {}", warning);
        }
    }

    Ok(())
}
