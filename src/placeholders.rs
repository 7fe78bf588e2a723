//! Display helpers for the command layer.

use crate::error::{Result, VoicelinkError};
use crate::model::Milli;
use crate::player::PlayerSnapshot;
use crate::track::Source;

/// Embed color used when a guild doesn't set one.
pub const DEFAULT_EMBED_COLOR: u32 = 0xb3b3b3;

/// Formats `ms` as `m:ss`, or `h:mm:ss` past one hour.
pub fn format_time(ms: Milli) -> String {
    let total = ms / 1000;
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Parses `ss`, `m:ss` or `h:mm:ss` into milliseconds.
pub fn parse_time(raw: &str) -> Result<Milli> {
    let malformed = || VoicelinkError::MalformedTime(raw.to_string());

    let parts = raw
        .trim()
        .split(':')
        .map(|part| part.trim().parse::<u64>().map_err(|_| malformed()))
        .collect::<Result<Vec<_>>>()?;

    let seconds = match parts.as_slice() {
        [s] => Some(*s),
        [m, s] if *s < 60 => m.checked_mul(60).and_then(|m| m.checked_add(*s)),
        [h, m, s] if *m < 60 && *s < 60 => h.checked_mul(3600).and_then(|h| h.checked_add(m * 60 + s)),
        _ => None,
    };

    seconds
        .and_then(|seconds| seconds.checked_mul(1000))
        .ok_or_else(malformed)
}

/// Emoji shown next to tracks of `source`.
pub fn source_emoji(source: &Source) -> &'static str {
    match source {
        Source::Youtube => "<:youtube:826661982760992778>",
        Source::YoutubeMusic => "<:youtubemusic:954046930713985074>",
        Source::Soundcloud => "<:soundcloud:852729280027033632>",
        Source::Spotify => "<:spotify:826661996615172146>",
        Source::AppleMusic => "<:applemusic:994844332374884413>",
        Source::Deezer => "<:deezer:1061590063826878515>",
        Source::Twitch => "<:twitch:852729278285086741>",
        Source::Bandcamp => "<:bandcamp:864694003811221526>",
        Source::Vimeo => "<:vimeo:864694002695421962>",
        Source::Http | Source::Local | Source::Other(_) => "🔗",
    }
}

/// Fills `{{...}}` keys of message templates from a player snapshot.
pub struct Placeholders<'a> {
    snapshot: &'a PlayerSnapshot,
    embed_color: u32,
}

impl<'a> Placeholders<'a> {
    #[allow(missing_docs)]
    pub fn new(snapshot: &'a PlayerSnapshot) -> Self {
        Self { snapshot, embed_color: DEFAULT_EMBED_COLOR }
    }

    /// Uses the guild embed color instead of [`DEFAULT_EMBED_COLOR`].
    pub fn with_embed_color(mut self, color: u32) -> Self {
        self.embed_color = color;
        self
    }

    /// Value of `key`, or `None` if the key is unknown.
    ///
    /// Track keys resolve to an empty string when nothing is playing.
    pub fn get(&self, key: &str) -> Option<String> {
        let track = self.snapshot.current();

        let value = match key {
            "track_name" => track.map(|t| t.title().to_string()),
            "track_url" => track.and_then(|t| t.uri().map(str::to_string)),
            "track_author" => track.map(|t| t.author().to_string()),
            "track_duration" => track.map(|t| {
                if t.is_stream() {
                    "LIVE".to_string()
                } else {
                    format_time(t.length())
                }
            }),
            "track_thumbnail" => track.and_then(|t| t.artwork().map(str::to_string)),
            "track_requester_id" => track.map(|t| t.requester.to_string()),
            "track_source_emoji" => track.map(|t| source_emoji(&t.source).to_string()),
            "queue_length" => Some(self.snapshot.queue.len().to_string()),
            "volume" => Some(self.snapshot.volume.to_string()),
            "loop_mode" => Some(self.snapshot.repeat().to_string()),
            "channel_id" => Some(self.snapshot.channel.to_string()),
            "default_embed_color" => Some(self.embed_color.to_string()),
            _ => return None,
        };

        Some(value.unwrap_or_default())
    }

    /// Replaces every known key of `template`. Unknown keys are left as is.
    pub fn replace(&self, template: &str) -> String {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let key = &rest[start + 2..start + 2 + len];

            output.push_str(&rest[..start]);
            match self.get(key.trim()) {
                Some(value) => output.push_str(&value),
                None => output.push_str(&rest[start..start + len + 4]),
            }
            rest = &rest[start + len + 4..];
        }

        output.push_str(rest);
        output
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::TrackInfo;
    use crate::queue::{LoopMode, Queue};
    use crate::track::Track;

    fn snapshot() -> PlayerSnapshot {
        let info = TrackInfo {
            identifier: "abc".to_string(),
            is_seekable: true,
            author: "Someone".to_string(),
            length: 3_725_000,
            is_stream: false,
            position: 0,
            title: "Song".to_string(),
            uri: Some("https://example.com/abc".to_string()),
            artwork_url: None,
            isrc: None,
            source_name: "soundcloud".to_string(),
        };
        let mut queue = Queue::default();
        queue.add(Track::from_info(info, 42), false).unwrap();
        queue.next();
        queue.set_repeat(LoopMode::Queue);

        PlayerSnapshot {
            guild: 1,
            channel: 2,
            node: "main".to_string(),
            queue,
            playing: true,
            paused: false,
            position: 0,
            volume: 80,
            filters: Vec::new(),
            autoplay: false,
        }
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "0:00");
        assert_eq!(format_time(80_000), "1:20");
        assert_eq!(format_time(3_725_000), "1:02:05");
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("1:20").unwrap(), 80_000);
        assert_eq!(parse_time("45").unwrap(), 45_000);
        assert_eq!(parse_time("1:02:05").unwrap(), 3_725_000);

        for raw in ["", "1:60", "a:10", "1:2:3:4", "-1"] {
            assert!(
                matches!(parse_time(raw), Err(VoicelinkError::MalformedTime(_))),
                "accepted `{raw}`"
            );
        }

        let huge = u64::MAX / 100;
        for raw in [format!("{huge}"), format!("{huge}:00"), format!("{huge}:00:00")] {
            assert!(
                matches!(parse_time(&raw), Err(VoicelinkError::MalformedTime(_))),
                "overflowed on `{raw}`"
            );
        }
    }

    #[test]
    fn test_template_replacement() {
        let snapshot = snapshot();
        let placeholders = Placeholders::new(&snapshot);

        let text = placeholders.replace(
            "{{track_name}} by {{track_author}} [{{track_duration}}] <@{{track_requester_id}}> {{loop_mode}} {{unknown}} {{",
        );

        assert_eq!(text, "Song by Someone [1:02:05] <@42> queue {{unknown}} {{");
        assert_eq!(placeholders.get("track_thumbnail").as_deref(), Some(""));
        assert_eq!(
            placeholders.with_embed_color(7).get("default_embed_color").as_deref(),
            Some("7")
        );
    }
}
