use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, ValueEnum};
use log::{LevelFilter, error, info};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use tokio::net::TcpListener;
use vtsd::decode::FfmpegDecoder;
use vtsd::server::Server;
use vtsd::source::{DEFAULT_CACHE_SIZE, SourceHandle};
use vtsource::formats::{PixelLayout, VideoFormat};

/// VTS - Virtual Toaster Source Daemon
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 5400)]
    port: u16,

    /// Default video format
    #[arg(long, value_enum, default_value_t = StandardArg::Ntsc)]
    format: StandardArg,

    /// Default colorspace
    #[arg(long, value_enum, default_value_t = LayoutArg::Rgb24)]
    colorspace: LayoutArg,

    /// Media root directory
    #[arg(long)]
    media: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StandardArg {
    Ntsc,
    Pal,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    Rgb24,
    Yuv422,
    Yuv420p,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    TermLogger::init(
        if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("failed to init logger");

    if let Err(err) = run(cli).await {
        error!("{err:?}");
        exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let layout = match cli.colorspace {
        LayoutArg::Rgb24 => PixelLayout::Rgb24,
        LayoutArg::Yuv422 => PixelLayout::Yuv422,
        LayoutArg::Yuv420p => PixelLayout::Yuv420p,
    };
    let format = match cli.format {
        StandardArg::Ntsc => VideoFormat::ntsc(layout),
        StandardArg::Pal => VideoFormat::pal(layout),
    };

    let listener = TcpListener::bind((cli.host.as_str(), cli.port)).await?;
    info!("Default format: {format}");
    if let Some(media) = &cli.media {
        info!("Media root: {}", media.display());
    }

    let source = SourceHandle::<FfmpegDecoder>::spawn(format, DEFAULT_CACHE_SIZE);
    let server = Server::new(source, cli.media);

    tokio::select! {
        result = server.run(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
