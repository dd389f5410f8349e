use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Channel {
    pub(crate) id: Box<str>,
    #[serde(rename = "type")]
    pub(crate) kind: ChannelType,
    #[serde(default)]
    pub(crate) name: Option<Box<str>>,
}

impl Channel {
    pub(crate) fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "u8")]
#[repr(u8)]
pub(crate) enum ChannelType {
    GuildText = 0,
    Dm = 1,
    GuildVoice = 2,
    GroupDm = 3,
    GuildCategory = 4,
    GuildAnnouncement = 5,
    AnnouncementThread = 10,
    PublicThread = 11,
    PrivateThread = 12,
    GuildStageVoice = 13,
    GuildDirectory = 14,
    GuildForum = 15,
    GuildMedia = 16,
    Unknown = u8::MAX,
}

impl From<u8> for ChannelType {
    fn from(kind: u8) -> Self {
        use ChannelType::*;
        match kind {
            0 => GuildText,
            1 => Dm,
            2 => GuildVoice,
            3 => GroupDm,
            4 => GuildCategory,
            5 => GuildAnnouncement,
            10 => AnnouncementThread,
            11 => PublicThread,
            12 => PrivateThread,
            13 => GuildStageVoice,
            14 => GuildDirectory,
            15 => GuildForum,
            16 => GuildMedia,
            _ => Unknown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct User {
    pub(crate) id: Box<str>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Member {
    pub(crate) user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VoiceState {
    #[serde(default)]
    pub(crate) guild_id: Option<Box<str>>,
    pub(crate) channel_id: Option<Box<str>>,
    pub(crate) user_id: Box<str>,
    pub(crate) session_id: Box<str>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VoiceServerUpdate {
    pub(crate) token: Box<str>,
    pub(crate) guild_id: Box<str>,
    pub(crate) endpoint: Option<Box<str>>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Ready {
    pub(super) user: User,
    pub(super) session_id: Box<str>,
    #[serde(default)]
    pub(super) guilds: Vec<UnavailableGuild>,
}

#[derive(Debug, Deserialize)]
pub(super) struct UnavailableGuild {
    pub(super) id: Box<str>,
}

#[derive(Debug, Deserialize)]
pub(super) struct GuildCreate {
    pub(super) id: Box<str>,
    #[serde(default)]
    pub(super) voice_states: Vec<VoiceState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_channel_types_still_parse() {
        let channels: Vec<Channel> = serde_json::from_str(
            r#"[
                {"id": "1", "type": 2, "name": "General", "guild_id": "9"},
                {"id": "2", "type": 99}
            ]"#,
        )
        .unwrap();

        assert_eq!(channels[0].kind, ChannelType::GuildVoice);
        assert_eq!(channels[0].display_name(), "General");
        assert_eq!(channels[1].kind, ChannelType::Unknown);
        assert_eq!(channels[1].display_name(), "2");
    }

    #[test]
    fn voice_state_without_channel_means_left() {
        let state: VoiceState = serde_json::from_str(
            r#"{"channel_id": null, "user_id": "5", "session_id": "abc", "deaf": false}"#,
        )
        .unwrap();
        assert!(state.channel_id.is_none());
        assert!(state.guild_id.is_none());
    }
}
