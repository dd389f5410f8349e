use const_format::formatcp;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;

use crate::error::{Error, Result};

mod gateway;
pub(crate) mod model;
mod payload;
mod rest;
pub(crate) mod voice;

pub(crate) use gateway::Session;

const API: &str = formatcp!("https://discord.com/api/v{API_VERSION}");
const API_VERSION: u8 = 10;

#[derive(Clone)]
pub(crate) struct DiscordClient {
    http: Client,
    token: Box<str>,
}

impl DiscordClient {
    pub(crate) fn new(token: &str) -> Result<Self> {
        let mut auth =
            HeaderValue::from_str(&format!("Bot {token}")).map_err(|_| Error::InvalidToken)?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        Ok(DiscordClient {
            http: Client::builder()
                .user_agent(formatcp!(
                    "DiscordBot ({}, {})",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION")
                ))
                .default_headers(headers)
                .build()?,
            token: token.into(),
        })
    }
}
