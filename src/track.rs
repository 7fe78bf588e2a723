//! Tracks and playlists as the player sees them.

use std::fmt::Display;
use std::str::FromStr;

use crate::codec;
use crate::error::{Result, VoicelinkError};
use crate::model::{Milli, PlaylistData, TrackData, TrackInfo, UserId};

/// Platform a track comes from.
///
/// Unknown source names are kept as [`Source::Other`] so they survive a
/// round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Source {
    Youtube,
    YoutubeMusic,
    Soundcloud,
    Spotify,
    AppleMusic,
    Deezer,
    Twitch,
    Bandcamp,
    Vimeo,
    Http,
    Local,
    Other(String),
}

impl Source {
    /// Name used by the node.
    pub fn name(&self) -> &str {
        match self {
            Source::Youtube => "youtube",
            Source::YoutubeMusic => "youtubemusic",
            Source::Soundcloud => "soundcloud",
            Source::Spotify => "spotify",
            Source::AppleMusic => "applemusic",
            Source::Deezer => "deezer",
            Source::Twitch => "twitch",
            Source::Bandcamp => "bandcamp",
            Source::Vimeo => "vimeo",
            Source::Http => "http",
            Source::Local => "local",
            Source::Other(name) => name,
        }
    }
}

impl From<&str> for Source {
    fn from(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "youtube" => Source::Youtube,
            "youtubemusic" | "youtube music" => Source::YoutubeMusic,
            "soundcloud" => Source::Soundcloud,
            "spotify" => Source::Spotify,
            "applemusic" | "apple music" => Source::AppleMusic,
            "deezer" => Source::Deezer,
            "twitch" => Source::Twitch,
            "bandcamp" => Source::Bandcamp,
            "vimeo" => Source::Vimeo,
            "http" => Source::Http,
            "local" => Source::Local,
            _ => Source::Other(name.to_string()),
        }
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Search engine prefix understood by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum SearchType {
    Ytsearch,
    Ytmsearch,
    Scsearch,
    Amsearch,
    Spsearch,
}

impl SearchType {
    /// Every known prefix.
    pub const ALL: [SearchType; 5] = [
        SearchType::Ytsearch,
        SearchType::Ytmsearch,
        SearchType::Scsearch,
        SearchType::Amsearch,
        SearchType::Spsearch,
    ];

    /// Prefix without the trailing colon.
    pub fn prefix(&self) -> &'static str {
        match self {
            SearchType::Ytsearch => "ytsearch",
            SearchType::Ytmsearch => "ytmsearch",
            SearchType::Scsearch => "scsearch",
            SearchType::Amsearch => "amsearch",
            SearchType::Spsearch => "spsearch",
        }
    }

    /// Builds the node identifier for `query`.
    pub fn query(&self, query: &str) -> String {
        format!("{}:{}", self.prefix(), query)
    }

    /// Returns true if `query` already carries a known search prefix.
    pub fn is_prefixed(query: &str) -> bool {
        Self::ALL
            .iter()
            .any(|search| query.starts_with(search.prefix()) && query[search.prefix().len()..].starts_with(':'))
    }
}

impl Default for SearchType {
    fn default() -> Self {
        SearchType::Ytsearch
    }
}

impl FromStr for SearchType {
    type Err = VoicelinkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|search| search.prefix() == s)
            .ok_or_else(|| VoicelinkError::ConfigError(format!("unknown search type `{s}`")))
    }
}

/// A playable item.
///
/// Immutable once built. `encoded` is the token the node needs to play the
/// track again without searching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Backend track token.
    pub encoded: String,
    /// Cached metadata.
    pub info: TrackInfo,
    /// Where the track comes from.
    pub source: Source,
    /// Who asked for it.
    pub requester: UserId,
    /// Name of the playlist it was loaded from, if any.
    pub playlist: Option<String>,
}

impl Track {
    /// Builds a track from what the node returned.
    pub fn from_data(data: TrackData, requester: UserId) -> Self {
        let source = Source::from(data.info.source_name.as_str());
        Self {
            encoded: data.encoded,
            info: data.info,
            source,
            requester,
            playlist: None,
        }
    }

    /// Builds a track from metadata, producing its token locally.
    pub fn from_info(info: TrackInfo, requester: UserId) -> Self {
        let encoded = codec::encode(&info);
        let source = Source::from(info.source_name.as_str());
        Self { encoded, info, source, requester, playlist: None }
    }

    /// Rebuilds a track from a persisted token.
    pub fn from_token(token: &str, requester: UserId) -> Result<Self> {
        let decoded = codec::decode(token)?;
        let source = Source::from(decoded.info.source_name.as_str());
        Ok(Self {
            encoded: token.to_string(),
            info: decoded.info,
            source,
            requester,
            playlist: None,
        })
    }

    /// Stable identity used for duplicate suppression.
    pub fn identifier(&self) -> &str {
        &self.info.identifier
    }

    #[allow(missing_docs)]
    pub fn title(&self) -> &str {
        &self.info.title
    }

    #[allow(missing_docs)]
    pub fn author(&self) -> &str {
        &self.info.author
    }

    #[allow(missing_docs)]
    pub fn uri(&self) -> Option<&str> {
        self.info.uri.as_deref()
    }

    #[allow(missing_docs)]
    pub fn artwork(&self) -> Option<&str> {
        self.info.artwork_url.as_deref()
    }

    /// Length in milliseconds.
    pub fn length(&self) -> Milli {
        self.info.length
    }

    /// Whether the track is a live stream.
    pub fn is_stream(&self) -> bool {
        self.info.is_stream
    }

    fn with_playlist(mut self, name: &str) -> Self {
        self.playlist = Some(name.to_string());
        self
    }
}

/// Ordered tracks loaded from a playlist link. Never persisted as a unit.
#[derive(Debug, Clone)]
pub struct Playlist {
    /// Playlist name.
    pub name: String,
    /// Index of the track the link pointed at, if any.
    pub selected: Option<usize>,
    /// Loaded tracks, each tagged with the playlist name.
    pub tracks: Vec<Track>,
}

impl Playlist {
    /// Builds a playlist from what the node returned.
    pub fn from_data(data: PlaylistData, requester: UserId) -> Self {
        let name = data.info.name;
        let tracks = data
            .tracks
            .into_iter()
            .map(|track| Track::from_data(track, requester).with_playlist(&name))
            .collect();

        Self {
            selected: data.info.selected_track.map(|index| index as usize),
            name,
            tracks,
        }
    }
}

/// Outcome of resolving a query.
#[derive(Debug, Clone)]
pub enum SearchResult {
    /// A playlist link.
    Playlist(Playlist),
    /// A single track link or search hits, best first.
    Tracks(Vec<Track>),
    /// Nothing matched.
    Empty,
}

impl SearchResult {
    /// Returns true if nothing matched.
    pub fn is_empty(&self) -> bool {
        match self {
            SearchResult::Playlist(playlist) => playlist.tracks.is_empty(),
            SearchResult::Tracks(tracks) => tracks.is_empty(),
            SearchResult::Empty => true,
        }
    }

    /// Consumes the result into the tracks it holds.
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            SearchResult::Playlist(playlist) => playlist.tracks,
            SearchResult::Tracks(tracks) => tracks,
            SearchResult::Empty => Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unknown_source_falls_back() {
        assert_eq!(Source::from("YouTube"), Source::Youtube);
        assert_eq!(Source::from("mixcloud"), Source::Other("mixcloud".to_string()));
        assert_eq!(Source::from("mixcloud").name(), "mixcloud");
    }

    #[test]
    fn test_search_prefix_detection() {
        assert!(SearchType::is_prefixed("ytsearch:never gonna"));
        assert!(SearchType::is_prefixed("scsearch:lofi"));
        assert!(!SearchType::is_prefixed("ytsearching for something"));
        assert!(!SearchType::is_prefixed("never gonna"));
        assert_eq!(SearchType::Ytmsearch.query("lofi"), "ytmsearch:lofi");
        assert_eq!("spsearch".parse::<SearchType>().unwrap(), SearchType::Spsearch);
    }

    #[test]
    fn test_token_rebuilds_track() {
        let info = TrackInfo {
            identifier: "abc".to_string(),
            is_seekable: true,
            author: "someone".to_string(),
            length: 1000,
            is_stream: false,
            position: 0,
            title: "song".to_string(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "soundcloud".to_string(),
        };
        let track = Track::from_info(info, 7);

        let rebuilt = Track::from_token(&track.encoded, 7).unwrap();

        assert_eq!(rebuilt, track);
        assert_eq!(rebuilt.source, Source::Soundcloud);
    }
}
