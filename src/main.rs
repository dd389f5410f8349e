use chrono::{Local, Timelike};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use discord::{DiscordClient, Session};

mod audio;
mod discord;
mod discovery;
mod error;

const SOUND_FILE: &str = "bigben.dca";

/// Joins the first occupied voice channel and rings the hour.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Bot token
    #[arg(short = 't', long)]
    token: Option<String>,

    /// Guild to ring in
    #[arg(short = 'g', long = "guild", default_value = "")]
    guild: String,
}

impl Args {
    /// The bot token, if one was given. `-t ""` counts as none.
    fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|token| !token.is_empty())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let now = Local::now();
    info!("Running chime-bot for {now}");

    let Some(token) = args.token() else {
        info!("No token provided. Please run: chime-bot -t <bot token>");
        return;
    };

    let frames = match audio::load_sound(SOUND_FILE) {
        Ok(frames) => frames,
        Err(e) => {
            error!("Error loading sound: {e}");
            info!("Please copy {SOUND_FILE} to this directory.");
            return;
        }
    };

    let client = match DiscordClient::new(token) {
        Ok(client) => client,
        Err(e) => {
            error!("Error creating Discord session: {e}");
            return;
        }
    };

    let session = match Session::open(client).await {
        Ok(session) => session,
        Err(e) => {
            error!("Error opening Discord session: {e}");
            return;
        }
    };

    ring(&session, &args.guild, &frames, audio::chime_count(now.hour())).await;
    session.close().await;
}

async fn ring(session: &Session, guild_id: &str, frames: &[bytes::Bytes], chimes: u32) {
    let channel = match discovery::find_populated_voice(session, guild_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            info!("No users in any channels");
            return;
        }
        // already logged where the fetch failed
        Err(_) => return,
    };

    info!("Joining channel {}", channel.display_name());
    let mut voice = match session.join_voice(guild_id, &channel.id).await {
        Ok(voice) => voice,
        Err(e) => {
            error!("Error joining channel: {e}");
            return;
        }
    };

    if let Err(e) = audio::playback::play_chimes(&mut voice, frames, chimes).await {
        error!("Error playing sound: {e}");
    }

    voice.disconnect().await;
    if let Err(e) = session.leave_voice(guild_id).await {
        warn!("Error leaving voice: {e}");
    }
}
