mod youtube;

use clap::{Parser, Subcommand};
use std::time::Duration;
use yt_oauth::{
    AuthorizationCoordinator, ClientConfig, CoordinatorOptions, TokenStore, YOUTUBE_READONLY_SCOPE,
};

use crate::youtube::{DEFAULT_API_ADDRESS, YouTubeApi};

/// YouTube Video Lister - Lists the videos uploaded to your YouTube channel
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the client secret JSON downloaded from the Google Cloud console
    #[arg(long, default_value = "client_secret.json")]
    client_secret_path: String,

    /// Path to the OAuth token file (created on first authorization)
    #[arg(long, default_value = "token.json")]
    token_path: String,

    /// OAuth scope to request (repeat for several)
    #[arg(long = "scope", default_value = YOUTUBE_READONLY_SCOPE)]
    scopes: Vec<String>,

    /// Listen for the OAuth callback on this port instead of the redirect URI's
    #[arg(long)]
    fixed_port: Option<u16>,

    /// Give up waiting for the browser after this many seconds (default: wait forever)
    #[arg(long)]
    callback_timeout_secs: Option<u64>,

    /// Maximum number of videos to list (default: 50)
    #[arg(long, default_value = "50")]
    max_results: u32,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// List the titles and IDs of your uploaded videos (default)
    Videos,
    /// Show your channel
    Channel,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    yt_oauth::init_tracing();
    let args = Args::parse();

    let config = ClientConfig::load(&args.client_secret_path)?;
    let options = CoordinatorOptions {
        scopes: args.scopes,
        fixed_port: args.fixed_port,
        callback_timeout: args.callback_timeout_secs.map(Duration::from_secs),
        force_consent: false,
    };
    let coordinator =
        AuthorizationCoordinator::new(TokenStore::new(&args.token_path)).with_options(options);
    let client = coordinator.obtain_google_client(&config).await?;

    // Get REST API address from environment variable or use default
    let api_address =
        std::env::var("YOUTUBE_API_ADDRESS").unwrap_or_else(|_| DEFAULT_API_ADDRESS.to_string());
    tracing::info!(%api_address, "using YouTube Data API");
    let api = YouTubeApi::new(&client, api_address);

    match args.command.unwrap_or(Command::Videos) {
        Command::Videos => {
            let videos = api.uploaded_videos(args.max_results).await?;
            println!("Videos:");
            for video in videos {
                println!("{} ({})", video.title, video.id);
            }
        }
        Command::Channel => {
            let channel = api.channel().await?;
            println!("{} ({})", channel.snippet.title, channel.id);
            if !channel.snippet.description.is_empty() {
                println!("{}", channel.snippet.description);
            }
        }
    }

    Ok(())
}
