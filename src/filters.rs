//! Audio filters applied on top of a player.
//!
//! Each filter is stored under a tag so it can be removed later on. The node
//! only understands one value per filter kind, so when two tags set the same
//! kind the one added last wins.

use std::str::FromStr;

use crate::error::{Result, VoicelinkError};
use crate::model::{
    ChannelMix, Distortion, Equalizer, FilterVolume, Karaoke, LowPass, PlayerFilters, Rotation,
    Timescale, Tremolo, Vibrato,
};

/// One filter kind with its settings.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Filter {
    Volume(FilterVolume),
    Equalizer(Vec<Equalizer>),
    Karaoke(Karaoke),
    Timescale(Timescale),
    Tremolo(Tremolo),
    Vibrato(Vibrato),
    Rotation(Rotation),
    Distortion(Distortion),
    ChannelMix(ChannelMix),
    LowPass(LowPass),
}

fn check(valid: bool, reason: impl Into<String>) -> Result<()> {
    if valid {
        Ok(())
    } else {
        Err(VoicelinkError::FilterInvalidArgument(reason.into()))
    }
}

fn in_range(value: Option<f64>, min: f64, max: f64) -> bool {
    value.map_or(true, |v| v >= min && v <= max)
}

fn positive(value: Option<f64>) -> bool {
    value.map_or(true, |v| v > 0.0)
}

impl Filter {
    /// Checks the arguments against the ranges the node accepts.
    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::Volume(volume) => {
                check((0.0..=5.0).contains(volume), "volume must be between 0.0 and 5.0")
            }
            Filter::Equalizer(bands) => {
                for band in bands {
                    check(band.band <= 14, format!("band {} must be between 0 and 14", band.band))?;
                    check(
                        (-0.25..=1.0).contains(&band.gain),
                        format!("gain {} must be between -0.25 and 1.0", band.gain),
                    )?;
                }
                Ok(())
            }
            Filter::Karaoke(_) | Filter::Distortion(_) => Ok(()),
            Filter::Timescale(t) => check(
                positive(t.speed) && positive(t.pitch) && positive(t.rate),
                "timescale values must be greater than 0.0",
            ),
            Filter::Tremolo(t) => check(
                positive(t.frequency) && positive(t.depth) && in_range(t.depth, 0.0, 1.0),
                "tremolo frequency must be > 0.0 and depth in (0.0, 1.0]",
            ),
            Filter::Vibrato(v) => check(
                positive(v.frequency)
                    && in_range(v.frequency, 0.0, 14.0)
                    && positive(v.depth)
                    && in_range(v.depth, 0.0, 1.0),
                "vibrato frequency must be in (0.0, 14.0] and depth in (0.0, 1.0]",
            ),
            Filter::Rotation(r) => check(
                r.rotation.map_or(true, f64::is_finite),
                "rotation must be a finite number",
            ),
            Filter::ChannelMix(m) => check(
                [m.left_to_left, m.left_to_right, m.right_to_left, m.right_to_right]
                    .into_iter()
                    .all(|factor| in_range(factor, 0.0, 1.0)),
                "channel mix factors must be between 0.0 and 1.0",
            ),
            Filter::LowPass(l) => check(
                l.smoothing.map_or(true, |s| s > 1.0),
                "low pass smoothing must be greater than 1.0",
            ),
        }
    }

    fn apply(&self, payload: &mut PlayerFilters) {
        match self.clone() {
            Filter::Volume(volume) => payload.volume = Some(volume),
            Filter::Equalizer(bands) => payload.equalizer = Some(bands),
            Filter::Karaoke(k) => payload.karaoke = Some(k),
            Filter::Timescale(t) => payload.timescale = Some(t),
            Filter::Tremolo(t) => payload.tremolo = Some(t),
            Filter::Vibrato(v) => payload.vibrato = Some(v),
            Filter::Rotation(r) => payload.rotation = Some(r),
            Filter::Distortion(d) => payload.distortion = Some(d),
            Filter::ChannelMix(m) => payload.channel_mix = Some(m),
            Filter::LowPass(l) => payload.low_pass = Some(l),
        }
    }
}

/// Ready made filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Preset {
    Nightcore,
    Vaporwave,
    EightD,
    Boost,
}

impl Preset {
    /// Tag the preset is stored under.
    pub fn tag(&self) -> &'static str {
        match self {
            Preset::Nightcore => "nightcore",
            Preset::Vaporwave => "vaporwave",
            Preset::EightD => "8d",
            Preset::Boost => "boost",
        }
    }

    #[allow(missing_docs)]
    pub fn filter(&self) -> Filter {
        match self {
            Preset::Nightcore => Filter::Timescale(Timescale {
                speed: Some(1.25),
                pitch: Some(1.3),
                rate: None,
            }),
            Preset::Vaporwave => Filter::Timescale(Timescale {
                speed: Some(0.8),
                pitch: Some(0.8),
                rate: None,
            }),
            Preset::EightD => Filter::Rotation(Rotation { rotation: Some(0.2) }),
            Preset::Boost => Filter::Equalizer(
                [0.2, 0.15, 0.1, 0.05, 0.0, -0.05, -0.1, -0.1, -0.1, -0.1, -0.1, -0.1, -0.1, -0.1, -0.1]
                    .into_iter()
                    .enumerate()
                    .map(|(band, gain)| Equalizer { band: band as u8, gain })
                    .collect(),
            ),
        }
    }
}

impl FromStr for Preset {
    type Err = VoicelinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nightcore" => Ok(Preset::Nightcore),
            "vaporwave" => Ok(Preset::Vaporwave),
            "8d" => Ok(Preset::EightD),
            "boost" => Ok(Preset::Boost),
            _ => Err(VoicelinkError::FilterTagInvalid(s.to_string())),
        }
    }
}

/// Tagged filters in the order they were added.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    applied: Vec<(String, Filter)>,
}

impl Filters {
    /// Adds a filter under `tag`.
    pub fn add(&mut self, tag: &str, filter: Filter) -> Result<()> {
        if self.has(tag) {
            return Err(VoicelinkError::FilterTagAlreadyInUse(tag.to_string()));
        }
        filter.validate()?;

        self.applied.push((tag.to_string(), filter));
        Ok(())
    }

    /// Adds a preset under its own tag.
    pub fn add_preset(&mut self, preset: Preset) -> Result<()> {
        self.add(preset.tag(), preset.filter())
    }

    /// Removes the filter stored under `tag`.
    pub fn remove(&mut self, tag: &str) -> Result<Filter> {
        let index = self
            .applied
            .iter()
            .position(|(applied, _)| applied == tag)
            .ok_or_else(|| VoicelinkError::FilterTagInvalid(tag.to_string()))?;

        Ok(self.applied.remove(index).1)
    }

    #[allow(missing_docs)]
    pub fn has(&self, tag: &str) -> bool {
        self.applied.iter().any(|(applied, _)| applied == tag)
    }

    #[allow(missing_docs)]
    pub fn reset(&mut self) {
        self.applied.clear();
    }

    #[allow(missing_docs)]
    pub fn tags(&self) -> Vec<&str> {
        self.applied.iter().map(|(tag, _)| tag.as_str()).collect()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Builds the payload sent to the node.
    pub fn payload(&self) -> PlayerFilters {
        let mut payload = PlayerFilters::default();
        for (_, filter) in &self.applied {
            filter.apply(&mut payload);
        }
        payload
    }
}
