use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::discord::model::{Channel, ChannelType, Member};
use crate::discord::Session;
use crate::error::Result;

/// Most members looked at when counting voice participants.
pub(crate) const MEMBER_FETCH_LIMIT: usize = 1000;

/// What channel discovery needs to know about a guild.
#[async_trait]
pub(crate) trait GuildDirectory: Sync {
    async fn channels(&self, guild_id: &str) -> Result<Vec<Channel>>;

    async fn members(&self, guild_id: &str, limit: usize) -> Result<Vec<Member>>;

    /// Voice channel `user_id` currently sits in, if any.
    async fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> Option<Box<str>>;
}

#[async_trait]
impl GuildDirectory for Session {
    async fn channels(&self, guild_id: &str) -> Result<Vec<Channel>> {
        self.client().guild_channels(guild_id).await
    }

    async fn members(&self, guild_id: &str, limit: usize) -> Result<Vec<Member>> {
        self.client().guild_members(guild_id, limit).await
    }

    async fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> Option<Box<str>> {
        Session::voice_channel_of(self, guild_id, user_id).await
    }
}

/// Finds the first voice channel, in guild order, with somebody in it.
///
/// Fetch failures are returned as errors so the caller can tell them apart
/// from a guild where nobody is in voice.
pub(crate) async fn find_populated_voice<D>(directory: &D, guild_id: &str) -> Result<Option<Channel>>
where
    D: GuildDirectory + ?Sized,
{
    let channels = directory
        .channels(guild_id)
        .await
        .inspect_err(|e| error!("Error fetching channels: {e}"))?;
    let members = directory
        .members(guild_id, MEMBER_FETCH_LIMIT)
        .await
        .inspect_err(|e| error!("Error fetching members: {e}"))?;

    let mut counts: HashMap<Box<str>, usize> = HashMap::new();
    for member in &members {
        if let Some(channel_id) = directory.voice_channel_of(guild_id, &member.user.id).await {
            *counts.entry(channel_id).or_default() += 1;
        }
    }
    debug!(channels = channels.len(), members = members.len(), ?counts, "voice participation");

    Ok(select_channel(channels, &counts))
}

pub(crate) fn select_channel(channels: Vec<Channel>, counts: &HashMap<Box<str>, usize>) -> Option<Channel> {
    channels.into_iter().find(|channel| {
        channel.kind == ChannelType::GuildVoice && counts.get(&channel.id).is_some_and(|&n| n > 0)
    })
}
