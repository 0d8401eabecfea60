//! Common types for Bulkline

use mime_guess::mime;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Unique identifier for users (quota owners)
pub type UserId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for recipients
pub type RecipientId = Uuid;

/// Logical send endpoint on the messaging transport
pub type DeviceId = String;

/// Wall-clock time of day in "HH:mm" form
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    /// Create a time of day, validating the 24h range
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    /// Parse a strict "HH:mm" string
    pub fn parse(s: &str) -> Option<Self> {
        let (h, m) = s.split_once(':')?;
        if h.len() != 2 || m.len() != 2 {
            return None;
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        Self::new(h.parse().ok()?, m.parse().ok()?)
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl std::str::FromStr for TimeOfDay {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| crate::Error::Validation(format!("Invalid time of day: {}", s)))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = crate::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

/// Kind of attachment carried by a campaign, inferred from the media URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// Infer the media kind from the extension of a URL or file name.
    ///
    /// Query strings and fragments are ignored. Unknown or missing extensions
    /// are sent as documents.
    pub fn from_url(raw: &str) -> Self {
        let parsed = Url::parse(raw)
            .or_else(|_| Url::parse("file:///").and_then(|base| base.join(raw)));
        let Ok(parsed) = parsed else {
            return MediaKind::Document;
        };

        match mime_guess::from_path(parsed.path()).first() {
            Some(m) if m.type_() == mime::IMAGE => MediaKind::Image,
            Some(m) if m.type_() == mime::VIDEO => MediaKind::Video,
            Some(m) if m.type_() == mime::AUDIO => MediaKind::Audio,
            _ => MediaKind::Document,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Document => write!(f, "document"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            "document" => Ok(MediaKind::Document),
            _ => Err(crate::Error::Validation(format!("Invalid media kind: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_of_day_parse() {
        assert_eq!(TimeOfDay::parse("09:00"), TimeOfDay::new(9, 0));
        assert_eq!(TimeOfDay::parse("23:59"), TimeOfDay::new(23, 59));
        assert!(TimeOfDay::parse("24:00").is_none());
        assert!(TimeOfDay::parse("9:00").is_none());
        assert!(TimeOfDay::parse("09:60").is_none());
        assert!(TimeOfDay::parse("ab:cd").is_none());
        assert!(TimeOfDay::parse("+9:00").is_none());
    }

    #[test]
    fn test_time_of_day_display() {
        let t = TimeOfDay::new(7, 5).unwrap();
        assert_eq!(t.to_string(), "07:05");
    }

    #[test]
    fn test_media_kind_from_url() {
        assert_eq!(MediaKind::from_url("https://cdn.example.com/a/promo.JPG"), MediaKind::Image);
        assert_eq!(MediaKind::from_url("https://cdn.example.com/clip.mp4?sig=abc"), MediaKind::Video);
        assert_eq!(MediaKind::from_url("voice.ogg"), MediaKind::Audio);
        assert_eq!(MediaKind::from_url("https://cdn.example.com/price-list.pdf"), MediaKind::Document);
        assert_eq!(MediaKind::from_url("https://cdn.example.com/download"), MediaKind::Document);
        assert_eq!(MediaKind::from_url("https://cdn.example.com/file.xyz"), MediaKind::Document);
        assert_eq!(MediaKind::from_url("https://cdn.example.com/a.pdf#page=2"), MediaKind::Document);
        assert_eq!(MediaKind::from_url("https://cdn.example.com/song.mp3?x=a.png"), MediaKind::Audio);
    }
}
