//! # hrfkit Core
//!
//! Shared types and utilities for shape-free hemodynamic response estimation.
//!
//! ## Contents
//!
//! | Type | Role |
//! |------|------|
//! | [`Event`] / [`EventTable`] | Stimulus onsets grouped by condition code |
//! | [`Window`] | Peristimulus interval around each onset |
//! | [`RetrievalConfig`] | TR, effective resolution, window, channel pooling |
//! | [`HrfError`] | Error kinds shared by every crate in the workspace |
//!
//! ## Conventions
//!
//! 1. All times are in seconds
//! 2. Time series matrices are `[channels, samples]`
//! 3. Lags are integer multiples of the effective resolution

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum HrfError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Numerical error: {0}")]
    Numerical(String),
}

pub type Result<T> = std::result::Result<T, HrfError>;

/// Time (s)
pub type Seconds = f64;

/// Condition identifier taken from the event table
pub type ConditionCode = u32;

/// Tolerance used when snapping a ratio of times onto the integer grid
pub const GRID_TOLERANCE: f64 = 1e-9;

/// Round `x` to the nearest integer when it is within [`GRID_TOLERANCE`],
/// otherwise leave it untouched. Keeps `-4.0 / 0.1` from flooring to -41.
pub fn snap_to_integer(x: f64) -> f64 {
    let r = x.round();
    if (x - r).abs() < GRID_TOLERANCE {
        r
    } else {
        x
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// A single stimulus event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Onset relative to the first acquired sample (s)
    pub onset: Seconds,
    /// Condition code
    pub code: ConditionCode,
    /// Duration (s)
    pub duration: Seconds,
    /// Free-text label, e.g. "face"
    pub label: Option<String>,
}

impl Event {
    pub fn new(onset: Seconds, code: ConditionCode, duration: Seconds) -> Self {
        Self {
            onset,
            code,
            duration,
            label: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Check onset and duration are finite and non-negative
    pub fn validate(&self) -> Result<()> {
        if !self.onset.is_finite() || self.onset < 0.0 {
            return Err(HrfError::InvalidEvent(format!(
                "onset {} of condition {} must be a finite non-negative time",
                self.onset, self.code
            )));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(HrfError::InvalidEvent(format!(
                "duration {} of event at {} s must be a finite non-negative time",
                self.duration, self.onset
            )));
        }
        Ok(())
    }
}

/// Ordered sequence of events, as read from an event-timing table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTable {
    events: Vec<Event>,
}

impl EventTable {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    /// Parse whitespace-separated rows `onset code duration [label...]`.
    ///
    /// Blank lines and lines starting with `#` are skipped. The label is
    /// everything after the third column, joined by single spaces.
    pub fn parse(content: &str) -> Result<Self> {
        let mut events = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(HrfError::Parse(format!(
                    "line {}: expected at least 3 columns (onset code duration), got {}",
                    lineno + 1,
                    fields.len()
                )));
            }

            let onset = parse_number(fields[0], lineno, "onset")?;
            let duration = parse_number(fields[2], lineno, "duration")?;
            let code: i64 = fields[1].parse().map_err(|_| {
                HrfError::Parse(format!(
                    "line {}: condition code '{}' is not an integer",
                    lineno + 1,
                    fields[1]
                ))
            })?;
            let code = ConditionCode::try_from(code).map_err(|_| {
                HrfError::InvalidEvent(format!(
                    "line {}: condition code {} is out of range",
                    lineno + 1,
                    code
                ))
            })?;

            let mut event = Event::new(onset, code, duration);
            if fields.len() > 3 {
                event.label = Some(fields[3..].join(" "));
            }
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Distinct condition codes, ascending
    pub fn codes(&self) -> Vec<ConditionCode> {
        self.events
            .iter()
            .map(|e| e.code)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Label of the first event of `code` in input order
    pub fn label_of(&self, code: ConditionCode) -> Option<&str> {
        self.events
            .iter()
            .find(|e| e.code == code)
            .and_then(|e| e.label.as_deref())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn parse_number(field: &str, lineno: usize, what: &str) -> Result<f64> {
    field.parse::<f64>().map_err(|_| {
        HrfError::Parse(format!(
            "line {}: {} '{}' is not a number",
            lineno + 1,
            what,
            field
        ))
    })
}

// ============================================================================
// PERISTIMULUS WINDOW
// ============================================================================

/// Peristimulus interval `[pre, post]` relative to an onset (s)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pre: Seconds,
    post: Seconds,
}

impl Window {
    pub fn new(pre: Seconds, post: Seconds) -> Result<Self> {
        let window = Self { pre, post };
        window.validate()?;
        Ok(window)
    }

    pub fn pre(&self) -> Seconds {
        self.pre
    }

    pub fn post(&self) -> Seconds {
        self.post
    }

    pub fn validate(&self) -> Result<()> {
        if !self.pre.is_finite() || !self.post.is_finite() {
            return Err(HrfError::Configuration(format!(
                "window [{}, {}] must be finite",
                self.pre, self.post
            )));
        }
        if self.pre >= self.post {
            return Err(HrfError::Configuration(format!(
                "window start {} must precede window end {}",
                self.pre, self.post
            )));
        }
        Ok(())
    }

    /// Lags (in steps of `er`) covered by the window.
    ///
    /// Half-open: `floor(pre/er) .. ceil(post/er)`. For `[-4, 15]` at 0.5 s
    /// this is `-8..30`, i.e. 38 lags.
    pub fn lag_range(&self, er: Seconds) -> Range<i64> {
        let start = snap_to_integer(self.pre / er).floor() as i64;
        let end = snap_to_integer(self.post / er).ceil() as i64;
        start..end
    }
}

impl Default for Window {
    fn default() -> Self {
        Self {
            pre: -4.0,
            post: 24.0,
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How a multi-channel (voxel) time series is reduced to one curve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelPooling {
    /// Average channels into one representative course, then estimate
    #[default]
    MeanSignal,
    /// Estimate per channel, then average the curves lag by lag
    MeanOfEstimates,
}

impl FromStr for ChannelPooling {
    type Err = HrfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mean-signal" | "signal" => Ok(Self::MeanSignal),
            "mean-of-estimates" | "estimates" => Ok(Self::MeanOfEstimates),
            other => Err(HrfError::Configuration(format!(
                "unknown channel pooling '{}': expected mean-signal or mean-of-estimates",
                other
            ))),
        }
    }
}

impl fmt::Display for ChannelPooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MeanSignal => write!(f, "mean-signal"),
            Self::MeanOfEstimates => write!(f, "mean-of-estimates"),
        }
    }
}

/// Whether onsets can land exactly on the TR-locked fine grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GridAlignment {
    /// ER divides TR
    Exact { upsampling: usize },
    /// ER does not divide TR; onsets and TR samples are rounded to the
    /// nearest fine-grid index
    Approximate { ratio: f64 },
}

/// Acquisition and analysis parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Repetition time (s)
    pub tr: Seconds,
    /// Effective resolution (s); `None` means ER = TR
    pub er: Option<Seconds>,
    /// Peristimulus window
    pub window: Window,
    /// Channel reduction strategy
    #[serde(default)]
    pub pooling: ChannelPooling,
}

impl RetrievalConfig {
    pub fn new(tr: Seconds) -> Self {
        Self {
            tr,
            er: None,
            window: Window::default(),
            pooling: ChannelPooling::default(),
        }
    }

    pub fn with_er(mut self, er: Seconds) -> Self {
        self.er = Some(er);
        self
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn with_pooling(mut self, pooling: ChannelPooling) -> Self {
        self.pooling = pooling;
        self
    }

    /// ER, falling back to TR
    pub fn effective_resolution(&self) -> Seconds {
        self.er.unwrap_or(self.tr)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tr.is_finite() || self.tr <= 0.0 {
            return Err(HrfError::Configuration(format!(
                "TR must be a positive time, got {}",
                self.tr
            )));
        }
        let er = self.effective_resolution();
        if !er.is_finite() || er <= 0.0 {
            return Err(HrfError::Configuration(format!(
                "ER must be a positive time, got {}",
                er
            )));
        }
        if er > self.tr * (1.0 + GRID_TOLERANCE) {
            return Err(HrfError::Configuration(format!(
                "ER {} must not exceed TR {}",
                er, self.tr
            )));
        }
        self.window.validate()?;

        let lags = self.window.lag_range(er);
        if lags.is_empty() {
            return Err(HrfError::Configuration(format!(
                "window [{}, {}] covers no lag at ER {}",
                self.window.pre(),
                self.window.post(),
                er
            )));
        }
        Ok(())
    }

    /// Classify the TR/ER relationship. Call after [`validate`](Self::validate).
    pub fn alignment(&self) -> GridAlignment {
        let ratio = self.tr / self.effective_resolution();
        let snapped = snap_to_integer(ratio);
        if snapped.fract() == 0.0 {
            GridAlignment::Exact {
                upsampling: snapped as usize,
            }
        } else {
            GridAlignment::Approximate { ratio }
        }
    }
}

// ============================================================================
// TIME SERIES READERS
// ============================================================================

/// Parse a whitespace-separated numeric matrix into `[channels, samples]`.
///
/// One row per channel. A file with a single value per line is read as a
/// single channel.
pub fn parse_time_series(content: &str) -> Result<Array2<f64>> {
    let mut rows: Vec<Vec<f64>> = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty())
            .map(|f| parse_number(f, lineno, "sample"))
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(HrfError::Parse("time series contains no samples".into()));
    }

    let width = rows[0].len();
    if rows.iter().any(|r| r.len() != width) {
        return Err(HrfError::Parse(
            "time series rows have different lengths".into(),
        ));
    }

    let n_rows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    let matrix = Array2::from_shape_vec((n_rows, width), flat)
        .map_err(|e| HrfError::Parse(e.to_string()))?;

    // A column vector is one course, not `n` single-sample channels
    if width == 1 && n_rows > 1 {
        tracing::debug!(samples = n_rows, "reading column time series as one channel");
        return Ok(matrix.reversed_axes());
    }
    Ok(matrix)
}

pub fn read_time_series<P: AsRef<Path>>(path: P) -> Result<Array2<f64>> {
    let content = std::fs::read_to_string(path)?;
    parse_time_series(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_table() {
        let content = "\
# onset code duration label
2   1 0 house
11  0 0 face
32  0 0 face
21  2 0 scrambled face
";
        let table = EventTable::parse(content).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.codes(), vec![0, 1, 2]);
        assert_eq!(table.label_of(0), Some("face"));
        assert_eq!(table.label_of(2), Some("scrambled face"));
        assert_eq!(table.events()[1].onset, 11.0);
    }

    #[test]
    fn test_event_table_rejects_short_rows() {
        let err = EventTable::parse("2 1\n").unwrap_err();
        assert!(matches!(err, HrfError::Parse(_)));
    }

    #[test]
    fn test_event_table_rejects_negative_code() {
        let err = EventTable::parse("2 -1 0\n").unwrap_err();
        assert!(matches!(err, HrfError::InvalidEvent(_)));
    }

    #[test]
    fn test_event_validation() {
        assert!(Event::new(0.0, 0, 0.0).validate().is_ok());
        assert!(Event::new(-0.5, 0, 0.0).validate().is_err());
        assert!(Event::new(1.0, 0, -1.0).validate().is_err());
        assert!(Event::new(f64::NAN, 0, 0.0).validate().is_err());
    }

    #[test]
    fn test_window_lag_range() {
        let window = Window::new(-4.0, 15.0).unwrap();
        let lags = window.lag_range(0.5);
        assert_eq!(lags, -8..30);
        assert_eq!(lags.count(), 38);

        // 0.1 s does not divide exactly in binary floating point
        let window = Window::new(-4.0, 24.0).unwrap();
        assert_eq!(window.lag_range(0.1), -40..240);
    }

    #[test]
    fn test_window_requires_order() {
        assert!(matches!(
            Window::new(5.0, 5.0),
            Err(HrfError::Configuration(_))
        ));
        assert!(Window::new(2.0, 10.0).is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(RetrievalConfig::new(1.5).with_er(0.5).validate().is_ok());
        assert!(RetrievalConfig::new(0.0).validate().is_err());
        assert!(RetrievalConfig::new(1.5).with_er(0.0).validate().is_err());
        assert!(RetrievalConfig::new(1.5).with_er(2.0).validate().is_err());
    }

    #[test]
    fn test_config_rejects_window_without_lags() {
        // Both ends snap to lag 1, leaving an empty lag range
        let window = Window::new(1.0, 1.0 + 1e-10).unwrap();
        assert!(window.lag_range(1.0).is_empty());

        let config = RetrievalConfig::new(1.0).with_window(window);
        assert!(matches!(config.validate(), Err(HrfError::Configuration(_))));
    }

    #[test]
    fn test_config_alignment() {
        let exact = RetrievalConfig::new(1.5).with_er(0.5);
        assert_eq!(exact.alignment(), GridAlignment::Exact { upsampling: 3 });

        let same = RetrievalConfig::new(2.0);
        assert_eq!(same.alignment(), GridAlignment::Exact { upsampling: 1 });

        let approx = RetrievalConfig::new(2.0).with_er(0.7);
        assert!(matches!(approx.alignment(), GridAlignment::Approximate { .. }));
    }

    #[test]
    fn test_config_json() {
        let config = RetrievalConfig::new(2.0).with_er(0.5);
        let json = serde_json::to_string(&config).unwrap();
        let back: RetrievalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let minimal: RetrievalConfig = serde_json::from_str(
            r#"{"tr": 1.5, "er": null, "window": {"pre": -2.0, "post": 10.0}}"#,
        )
        .unwrap();
        assert_eq!(minimal.pooling, ChannelPooling::MeanSignal);
        approx::assert_relative_eq!(minimal.effective_resolution(), 1.5);
    }

    #[test]
    fn test_parse_time_series() {
        let rows = parse_time_series("1 2 3\n4 5 6\n").unwrap();
        assert_eq!(rows.dim(), (2, 3));

        let column = parse_time_series("1\n2\n3\n4\n").unwrap();
        assert_eq!(column.dim(), (1, 4));
        assert_eq!(column[[0, 3]], 4.0);

        assert!(parse_time_series("1 2\n3\n").is_err());
        assert!(parse_time_series("").is_err());
    }
}
