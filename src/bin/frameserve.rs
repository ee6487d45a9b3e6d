use std::{net::SocketAddr, path::PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_stream::StreamExt;

use frameserve::{
    FfmpegDecoder, FfmpegLogLevel, PngEncoder, ServerConfig, StreamOptions, ingest, server,
    spawn_pipeline,
};

const CLI_AFTER_HELP: &str = "Examples:\n  frameserve serve --bind 0.0.0.0:3000\n  frameserve serve --interval 0.5 --verbose\n  frameserve extract https://example.com/clip.mp4 --out frames.multipart\n  frameserve completions zsh > _frameserve";

#[derive(Debug, Parser)]
#[command(
    name = "frameserve",
    version,
    about = "Stream periodic still frames from a remote MP4",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone)]
struct GlobalOptions {
    /// Show debug logging output.
    #[arg(long, global = true)]
    verbose: bool,

    /// FFmpeg's own console verbosity.
    #[arg(long, value_enum, global = true, default_value_t = FfmpegLogLevel::Error)]
    ffmpeg_log_level: FfmpegLogLevel,

    /// Seconds between extracted frames.
    #[arg(long, global = true, default_value_t = 1.0)]
    interval: f64,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server.
    #[command(about = "Serve /extract-frames over HTTP")]
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:3000")]
        bind: SocketAddr,
    },

    /// Run one extraction and write the multipart body.
    #[command(about = "Extract frames from a URL without a server")]
    Extract {
        /// Source video URL.
        url: String,
        /// Output file. Writes to stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .target(env_logger::Target::Stderr)
        .init();
}

async fn extract(
    url: &str,
    options: &StreamOptions,
    output: &mut (impl AsyncWrite + Unpin),
) -> Result<u64, Box<dyn std::error::Error>> {
    let source = server::parse_source_url(url)?.to_string();
    let client = reqwest::Client::new();
    let mut stream = spawn_pipeline(
        async move { ingest::fetch(&client, &source).await },
        FfmpegDecoder::new,
        PngEncoder,
        options,
    );

    let mut written = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        output.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    output.flush().await?;
    Ok(written)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        clap_complete::generate(shell, &mut command, "frameserve", &mut std::io::stdout());
        return Ok(());
    }

    init_logging(cli.global.verbose);
    frameserve::set_ffmpeg_log_level(cli.global.ffmpeg_log_level);
    let options = StreamOptions::new().with_interval_seconds(cli.global.interval)?;

    match cli.command {
        Commands::Serve { bind } => {
            let config = ServerConfig::new(bind).with_stream_options(options);
            frameserve::serve(config).await?;
        }
        Commands::Extract { url, out } => match out {
            Some(path) => {
                let mut file = tokio::fs::File::create(&path).await?;
                let written = extract(&url, &options, &mut file).await?;
                eprintln!(
                    "{} {}",
                    "saved".green().bold(),
                    format!("{} ({written} bytes)", path.display()).green()
                );
            }
            None => {
                let mut stdout = tokio::io::stdout();
                extract(&url, &options, &mut stdout).await?;
            }
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("{} {error}", "error:".red().bold());
        std::process::exit(1);
    }
}
