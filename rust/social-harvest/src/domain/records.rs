//! Harvested record types.
//!
//! Network adapters produce these records and publish them on the event bus
//! under [`HARVEST_TOPIC`]. The bus routes them without looking inside.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic shared by every harvested record.
pub const HARVEST_TOPIC: &str = "harvest.records";

/// Kind of harvested record; each kind has its own storage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A post, tweet or comment.
    Message,
    /// A user mentioned inside a message.
    Mention,
    /// A link shared inside a message.
    SharedLink,
    /// A hashtag used inside a message.
    Hashtag,
    /// Periodic follower/like counts for a tracked account.
    ContributorGrowth,
}

impl RecordKind {
    /// Every kind, in dispatch order.
    pub const ALL: [Self; 5] = [
        Self::Message,
        Self::Mention,
        Self::SharedLink,
        Self::Hashtag,
        Self::ContributorGrowth,
    ];

    /// Storage collection holding records of this kind.
    #[must_use]
    pub fn collection(self) -> &'static str {
        match self {
            Self::Message => "messages",
            Self::Mention => "mentions",
            Self::SharedLink => "shared_links",
            Self::Hashtag => "hashtags",
            Self::ContributorGrowth => "contributor_growth",
        }
    }

    /// Wire name (matches the `type` tag of [`HarvestEvent`]).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Mention => "mention",
            Self::SharedLink => "shared_link",
            Self::Hashtag => "hashtag",
            Self::ContributorGrowth => "contributor_growth",
        }
    }

    /// Look up the kind stored in a collection.
    #[must_use]
    pub fn from_collection(collection: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.collection() == collection)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown record kind: {wanted}"))
    }
}

/// A harvested message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestMessage {
    pub time: DateTime<Utc>,
    pub harvest_id: String,
    pub territory: String,
    pub network: String,
    pub message_id: String,
    pub contributor_id: String,
    pub contributor_screen_name: String,
    #[serde(default)]
    pub contributor_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor_lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor_country: Option<String>,
    /// -1 female, 0 unknown, 1 male.
    #[serde(default)]
    pub contributor_gender: i8,
    #[serde(default)]
    pub contributor_followers: u64,
    pub message: String,
    #[serde(default)]
    pub is_question: bool,
    #[serde(default)]
    pub share_count: u64,
    #[serde(default)]
    pub like_count: u64,
}

/// A user mentioned in a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestMention {
    pub time: DateTime<Utc>,
    pub harvest_id: String,
    pub territory: String,
    pub network: String,
    pub message_id: String,
    pub contributor_id: String,
    pub contributor_screen_name: String,
    pub mentioned_id: String,
    pub mentioned_screen_name: String,
    #[serde(default)]
    pub mentioned_name: String,
}

/// A link shared in a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestSharedLink {
    pub time: DateTime<Utc>,
    pub harvest_id: String,
    pub territory: String,
    pub network: String,
    pub message_id: String,
    pub contributor_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_url: Option<String>,
    #[serde(default)]
    pub host: String,
    /// `link`, `photo`, `video`, ...
    #[serde(default)]
    pub link_type: String,
}

/// A hashtag used in a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarvestHashtag {
    pub time: DateTime<Utc>,
    pub harvest_id: String,
    pub territory: String,
    pub network: String,
    pub message_id: String,
    pub contributor_id: String,
    pub tag: String,
    /// Territory keyword that matched, when the harvest was a keyword search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

/// Account growth counters sampled at harvest time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContributorGrowth {
    pub time: DateTime<Utc>,
    pub harvest_id: String,
    pub territory: String,
    pub network: String,
    pub contributor_id: String,
    #[serde(default)]
    pub followers: u64,
    #[serde(default)]
    pub following: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub talking_about: u64,
    #[serde(default)]
    pub statuses: u64,
    #[serde(default)]
    pub listed: u64,
    #[serde(default)]
    pub views: u64,
}

/// One harvested record as carried on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarvestEvent {
    Message(HarvestMessage),
    Mention(HarvestMention),
    SharedLink(HarvestSharedLink),
    Hashtag(HarvestHashtag),
    ContributorGrowth(ContributorGrowth),
}

impl HarvestEvent {
    /// Record kind of this event.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Message(_) => RecordKind::Message,
            Self::Mention(_) => RecordKind::Mention,
            Self::SharedLink(_) => RecordKind::SharedLink,
            Self::Hashtag(_) => RecordKind::Hashtag,
            Self::ContributorGrowth(_) => RecordKind::ContributorGrowth,
        }
    }

    /// Territory the record was harvested for.
    #[must_use]
    pub fn territory(&self) -> &str {
        match self {
            Self::Message(r) => &r.territory,
            Self::Mention(r) => &r.territory,
            Self::SharedLink(r) => &r.territory,
            Self::Hashtag(r) => &r.territory,
            Self::ContributorGrowth(r) => &r.territory,
        }
    }

    /// Source network (`twitter`, `facebook`, ...).
    #[must_use]
    pub fn network(&self) -> &str {
        match self {
            Self::Message(r) => &r.network,
            Self::Mention(r) => &r.network,
            Self::SharedLink(r) => &r.network,
            Self::Hashtag(r) => &r.network,
            Self::ContributorGrowth(r) => &r.network,
        }
    }

    /// Identifier of the harvest run that produced the record.
    #[must_use]
    pub fn harvest_id(&self) -> &str {
        match self {
            Self::Message(r) => &r.harvest_id,
            Self::Mention(r) => &r.harvest_id,
            Self::SharedLink(r) => &r.harvest_id,
            Self::Hashtag(r) => &r.harvest_id,
            Self::ContributorGrowth(r) => &r.harvest_id,
        }
    }

    /// Record time.
    #[must_use]
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::Message(r) => r.time,
            Self::Mention(r) => r.time,
            Self::SharedLink(r) => r.time,
            Self::Hashtag(r) => r.time,
            Self::ContributorGrowth(r) => r.time,
        }
    }

    /// The record body as a storage document (without the `type` tag).
    pub fn to_document(&self) -> serde_json::Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("type");
        }
        Ok(value)
    }
}
