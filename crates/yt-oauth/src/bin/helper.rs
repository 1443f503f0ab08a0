use clap::Parser;
use std::time::Duration;
use yt_oauth::{
    AuthorizationCoordinator, ClientConfig, CoordinatorOptions, TokenStore, YOUTUBE_READONLY_SCOPE,
};

/// OAuth 2.0 helper tool for YouTube API authentication
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the client secret JSON downloaded from the Google Cloud console
    #[arg(long, default_value = "client_secret.json")]
    client_secret_path: String,

    /// Path to save the OAuth token file
    #[arg(long, default_value = "token.json")]
    token_path: String,

    /// OAuth scope to request (repeat for several)
    #[arg(long = "scope", default_value = YOUTUBE_READONLY_SCOPE)]
    scopes: Vec<String>,

    /// Listen for the callback on this port instead of the redirect URI's
    #[arg(long)]
    fixed_port: Option<u16>,

    /// Give up waiting for the browser after this many seconds
    #[arg(long)]
    callback_timeout_secs: Option<u64>,

    /// Authorize again even if a token file already exists
    #[arg(long)]
    force: bool,
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
        force_consent: args.force,
    };
    let coordinator =
        AuthorizationCoordinator::new(TokenStore::new(&args.token_path)).with_options(options);

    let client = coordinator.obtain_google_client(&config).await?;

    // Saving the token is the whole point of this tool
    if let Some(e) = client.persistence_error() {
        return Err(format!("OAuth token could not be saved: {}", e).into());
    }

    eprintln!("\nOAuth token saved to: {}", args.token_path);
    eprintln!("You can now use this token with yt-video-lister");

    Ok(())
}
