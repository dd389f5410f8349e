use const_format::formatcp;
use serde::Deserialize;
use tracing::debug;

use crate::error::Result;

use super::model::{Channel, Member};
use super::{DiscordClient, API};

/// Most members the API returns in one page.
const MEMBER_PAGE_LIMIT: usize = 1000;

impl DiscordClient {
    pub(super) async fn get_gateway_url(&self) -> Result<Box<str>> {
        #[derive(Deserialize)]
        struct Response {
            url: Box<str>,
        }

        Ok(self
            .http
            .get(formatcp!("{API}/gateway"))
            .send()
            .await?
            .error_for_status()?
            .json::<Response>()
            .await?
            .url)
    }

    /// Channels of a guild in the order the API lists them.
    pub(crate) async fn guild_channels(&self, guild_id: &str) -> Result<Vec<Channel>> {
        Ok(self
            .http
            .get(format!("{API}/guilds/{guild_id}/channels"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Up to `limit` members of a guild, fetched page by page.
    pub(crate) async fn guild_members(&self, guild_id: &str, limit: usize) -> Result<Vec<Member>> {
        let mut members: Vec<Member> = Vec::new();
        let mut after: Box<str> = "0".into();

        while members.len() < limit {
            let page_size = (limit - members.len()).min(MEMBER_PAGE_LIMIT);
            let page: Vec<Member> = self
                .http
                .get(format!("{API}/guilds/{guild_id}/members"))
                .query(&[("limit", page_size.to_string()), ("after", after.to_string())])
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let full = page.len() == page_size;
            if let Some(last) = page.last() {
                after = last.user.id.clone();
            }
            members.extend(page);
            if !full {
                break;
            }
        }

        debug!(guild_id, count = members.len(), "fetched members");
        Ok(members)
    }
}
