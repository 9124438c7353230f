use ward_call_runtime::BotLink;
use ward_core::normalize_identifier;

/// Identifier to Telegram chat links, matched on normalized identifiers.
#[derive(Debug, Clone, Default)]
pub struct BotLinkDirectory {
    links: Vec<BotLink>,
}

impl BotLinkDirectory {
    pub fn new(links: Vec<BotLink>) -> Self {
        let mut directory = Self::default();
        for link in links {
            directory.insert(link);
        }
        directory
    }

    /// Adds or replaces the link for `link.identifier`. Blank entries are ignored.
    pub fn insert(&mut self, link: BotLink) {
        let key = normalize_identifier(&link.identifier);
        let chat_id = link.chat_id.trim().to_string();
        if key.is_empty() || chat_id.is_empty() {
            return;
        }
        let link = BotLink {
            identifier: link.identifier.trim().to_string(),
            chat_id,
        };
        match self
            .links
            .iter_mut()
            .find(|existing| normalize_identifier(&existing.identifier) == key)
        {
            Some(existing) => *existing = link,
            None => self.links.push(link),
        }
    }

    pub fn link_for_identifier(&self, identifier: &str) -> Option<&BotLink> {
        let key = normalize_identifier(identifier);
        if key.is_empty() {
            return None;
        }
        self.links
            .iter()
            .find(|link| normalize_identifier(&link.identifier) == key)
    }

    pub fn link_for_chat(&self, chat_id: &str) -> Option<&BotLink> {
        let chat_id = chat_id.trim();
        self.links.iter().find(|link| link.chat_id == chat_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
