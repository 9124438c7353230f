//! JSON directory file seeding identities, bearer tokens and bot links.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use ward_bot::BotLinkDirectory;
use ward_call_runtime::BotLink;
use ward_identity::{DirectoryIdentityResolver, Identity, Principal, StaticTokenAuthenticator};

const WARD_DIRECTORY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct WardDirectoryFile {
    schema_version: u32,
    #[serde(default)]
    identities: Vec<Identity>,
    #[serde(default)]
    tokens: Vec<DirectoryToken>,
    #[serde(default)]
    bot_links: Vec<BotLink>,
}

#[derive(Debug, Clone, Deserialize)]
struct DirectoryToken {
    token: String,
    identity_id: String,
}

/// Everything the gateway needs from the directory file.
#[derive(Debug, Default)]
pub struct WardDirectory {
    pub identities: DirectoryIdentityResolver,
    pub authenticator: StaticTokenAuthenticator,
    pub bot_links: BotLinkDirectory,
}

pub fn parse_ward_directory(raw: &str) -> Result<WardDirectory> {
    let file = serde_json::from_str::<WardDirectoryFile>(raw)
        .context("failed to parse ward directory JSON")?;
    if file.schema_version != WARD_DIRECTORY_SCHEMA_VERSION {
        bail!(
            "unsupported ward directory schema_version {} (expected {})",
            file.schema_version,
            WARD_DIRECTORY_SCHEMA_VERSION
        );
    }

    let mut authenticator = StaticTokenAuthenticator::new();
    for entry in &file.tokens {
        let identity = file
            .identities
            .iter()
            .find(|identity| identity.id == entry.identity_id)
            .with_context(|| {
                format!(
                    "directory token references unknown identity '{}'",
                    entry.identity_id
                )
            })?;
        authenticator.insert(entry.token.clone(), Principal::from(identity));
    }

    Ok(WardDirectory {
        identities: DirectoryIdentityResolver::new(file.identities),
        authenticator,
        bot_links: BotLinkDirectory::new(file.bot_links),
    })
}

pub fn load_ward_directory(path: &Path) -> Result<WardDirectory> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_ward_directory(&raw).with_context(|| format!("invalid directory {}", path.display()))
}
