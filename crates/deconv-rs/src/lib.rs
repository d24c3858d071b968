//! # Deconv-RS
//!
//! Shape-free estimation of the hemodynamic response function (HRF) from a
//! region-of-interest time course and a table of stimulus onsets.
//!
//! ## Pipeline
//!
//! 1. **Temporal resampling**: the TR-sampled course is linearly
//!    interpolated onto a fine grid with step ER (effective resolution)
//! 2. **Event indexing**: onsets are rounded to fine-grid indices and grouped
//!    by condition code
//! 3. **FIR design**: one indicator regressor per condition and peristimulus
//!    lag, concatenated condition-major into a `[samples, conditions * lags]`
//!    matrix
//! 4. **Estimation**: either an ordinary least-squares fit of the FIR model
//!    (thin SVD, least-norm on rank deficiency) or event-locked averaging
//!    with pre-stimulus baseline correction
//!
//! Both estimators write into a [`ResultStore`] keyed by condition code.
//!
//! ## Example
//!
//! ```
//! use hrfkit_core::{Event, EventTable, RetrievalConfig, Window};
//! use hrfkit_deconv::{HrfRetrieval, Method, TimeSeries};
//! use ndarray::Array1;
//!
//! let course = TimeSeries::from_course(Array1::from_iter((0..40).map(|i| (i as f64).sin())))?;
//! let events = EventTable::new(vec![
//!     Event::new(2.0, 1, 0.0),
//!     Event::new(11.0, 0, 0.0),
//!     Event::new(32.0, 0, 0.0),
//!     Event::new(21.0, 2, 0.0),
//! ]);
//! let config = RetrievalConfig::new(1.5)
//!     .with_er(0.5)
//!     .with_window(Window::new(-4.0, 15.0)?);
//!
//! let mut retrieval = HrfRetrieval::new(&course, &events, config)?;
//! assert_eq!(retrieval.build_fir_model().n_columns(), 114);
//! retrieval.estimate_hrf(Method::Average)?;
//! assert_eq!(retrieval.get_result(0, Method::Average)?.len(), 38);
//! # Ok::<(), hrfkit_core::HrfError>(())
//! ```

use hrfkit_core::{
    snap_to_integer, ChannelPooling, ConditionCode, Event, EventTable, GridAlignment, HrfError,
    Result, RetrievalConfig, Seconds, Window,
};
use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use tracing::{debug, warn};

// ============================================================================
// TIME SERIES
// ============================================================================

/// Observed signal, `[channels, samples]`, sampled at TR
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    data: Array2<f64>,
}

impl TimeSeries {
    /// Single representative time course
    pub fn from_course(values: Array1<f64>) -> Result<Self> {
        Self::from_channels(values.insert_axis(Axis(0)))
    }

    /// One row per channel (voxel)
    pub fn from_channels(data: Array2<f64>) -> Result<Self> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(HrfError::Configuration(format!(
                "time series must have at least one channel and one sample, got {:?}",
                data.dim()
            )));
        }
        Ok(Self { data })
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn channel(&self, index: usize) -> Option<ArrayView1<'_, f64>> {
        (index < self.n_channels()).then(|| self.data.row(index))
    }

    /// Channel average, one value per sample
    pub fn pooled(&self) -> Array1<f64> {
        mean_rows(self.data.view())
    }
}

fn mean_rows(data: ArrayView2<'_, f64>) -> Array1<f64> {
    data.sum_axis(Axis(0)) / data.nrows() as f64
}

// ============================================================================
// TEMPORAL RESAMPLER
// ============================================================================

/// Discrete timeline with step ER covering the acquired span.
///
/// Fine index `i` is time `i * ER`. The grid ends at the last TR sample;
/// nothing past it is extrapolated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FineGrid {
    tr: Seconds,
    step: Seconds,
    n_samples: usize,
    len: usize,
}

impl FineGrid {
    pub fn new(n_samples: usize, tr: Seconds, er: Seconds) -> Result<Self> {
        if !tr.is_finite() || tr <= 0.0 {
            return Err(HrfError::Configuration(format!("TR must be positive, got {}", tr)));
        }
        if !er.is_finite() || er <= 0.0 || er > tr * (1.0 + hrfkit_core::GRID_TOLERANCE) {
            return Err(HrfError::Configuration(format!(
                "ER must lie in (0, TR] = (0, {}], got {}",
                tr, er
            )));
        }
        if n_samples == 0 {
            return Err(HrfError::Configuration("cannot resample an empty time series".into()));
        }

        let span = (n_samples - 1) as f64 * tr;
        let len = snap_to_integer(span / er).floor() as usize + 1;

        Ok(Self {
            tr,
            step: er,
            n_samples,
            len,
        })
    }

    pub fn tr(&self) -> Seconds {
        self.tr
    }

    pub fn step(&self) -> Seconds {
        self.step
    }

    /// Number of TR samples the grid was built from
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn time_of(&self, index: usize) -> Seconds {
        index as f64 * self.step
    }

    /// Nearest fine-grid index of a time
    pub fn index_of(&self, time: Seconds) -> f64 {
        (time / self.step).round()
    }
}

/// Linearly interpolate a TR-sampled course onto `grid`.
///
/// With ER == TR this is a copy. `course` must hold `grid.n_samples()` samples.
pub fn resample_to_grid(course: ArrayView1<'_, f64>, grid: &FineGrid) -> Result<Array1<f64>> {
    let n = course.len();
    if n == 0 || n != grid.n_samples() {
        return Err(HrfError::Configuration(format!(
            "course has {} samples but the grid was built for {}",
            n,
            grid.n_samples()
        )));
    }

    Ok(Array1::from_shape_fn(grid.len(), |i| {
        let position = snap_to_integer(grid.time_of(i) / grid.tr());
        let j = position.floor() as usize;
        if j + 1 >= n {
            return course[n - 1];
        }
        let frac = position - j as f64;
        if frac == 0.0 {
            course[j]
        } else {
            course[j] * (1.0 - frac) + course[j + 1] * frac
        }
    }))
}

/// Pick the fine-grid sample nearest to each TR sample
pub fn downsample_to_tr(fine: ArrayView1<'_, f64>, grid: &FineGrid) -> Result<Array1<f64>> {
    if fine.len() != grid.len() {
        return Err(HrfError::Configuration(format!(
            "fine signal has {} samples but the grid has {}",
            fine.len(),
            grid.len()
        )));
    }

    let last = grid.len() - 1;
    Ok(Array1::from_shape_fn(grid.n_samples(), |j| {
        let i = (j as f64 * grid.tr() / grid.step()).round() as usize;
        fine[i.min(last)]
    }))
}

fn resample_channels(series: &TimeSeries, grid: &FineGrid) -> Result<Array2<f64>> {
    let mut fine = Array2::zeros((series.n_channels(), grid.len()));
    for (mut row, course) in fine.outer_iter_mut().zip(series.data().outer_iter()) {
        row.assign(&resample_to_grid(course, grid)?);
    }
    Ok(fine)
}

// ============================================================================
// EVENT INDEX
// ============================================================================

/// Onsets of one condition on the fine grid, in input order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionOnsets {
    pub code: ConditionCode,
    /// Label of the first event with this code
    pub label: Option<String>,
    pub onsets: Vec<usize>,
    pub durations: Vec<Seconds>,
}

/// Events grouped by condition, ascending by code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventIndex {
    conditions: Vec<ConditionOnsets>,
}

impl EventIndex {
    pub fn build(events: &[Event], grid: &FineGrid) -> Result<Self> {
        if events.is_empty() {
            return Err(HrfError::InvalidEvent("event table contains no events".into()));
        }

        let mut by_code: BTreeMap<ConditionCode, ConditionOnsets> = BTreeMap::new();
        for event in events {
            event.validate()?;

            let index = grid.index_of(event.onset);
            if index >= grid.len() as f64 {
                return Err(HrfError::InvalidEvent(format!(
                    "onset {} s of condition {} lies beyond the recording ({} s)",
                    event.onset,
                    event.code,
                    grid.time_of(grid.len() - 1)
                )));
            }

            let entry = by_code.entry(event.code).or_insert_with(|| ConditionOnsets {
                code: event.code,
                label: event.label.clone(),
                onsets: Vec::new(),
                durations: Vec::new(),
            });
            entry.onsets.push(index as usize);
            entry.durations.push(event.duration);
        }

        debug!(
            events = events.len(),
            conditions = by_code.len(),
            "indexed events on fine grid"
        );

        Ok(Self {
            conditions: by_code.into_values().collect(),
        })
    }

    pub fn conditions(&self) -> &[ConditionOnsets] {
        &self.conditions
    }

    pub fn condition(&self, code: ConditionCode) -> Option<&ConditionOnsets> {
        self.conditions.iter().find(|c| c.code == code)
    }

    pub fn codes(&self) -> Vec<ConditionCode> {
        self.conditions.iter().map(|c| c.code).collect()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

// ============================================================================
// FIR DESIGN MATRIX
// ============================================================================

/// Column label of the FIR design
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignColumn {
    pub code: ConditionCode,
    /// Peristimulus lag in fine-grid steps
    pub lag: i64,
}

/// Indicator regressors, `[fine samples, conditions * lags]`, condition-major
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    matrix: Array2<f64>,
    columns: Vec<DesignColumn>,
    codes: Vec<ConditionCode>,
    lags: Range<i64>,
}

impl DesignMatrix {
    /// Column `(c, l)` holds a 1 at `onset + l` for every onset of `c` that
    /// stays inside the grid. Out-of-range entries are dropped.
    pub fn build(index: &EventIndex, window: &Window, grid: &FineGrid) -> Self {
        let lags = window.lag_range(grid.step());
        let n_lags = (lags.end - lags.start) as usize;
        let rows = grid.len() as i64;

        let codes = index.codes();
        let columns: Vec<DesignColumn> = codes
            .iter()
            .flat_map(|&code| lags.clone().map(move |lag| DesignColumn { code, lag }))
            .collect();

        let mut matrix = Array2::zeros((grid.len(), columns.len()));
        let mut dropped = 0usize;

        for (c, condition) in index.conditions().iter().enumerate() {
            for &onset in &condition.onsets {
                for (k, lag) in lags.clone().enumerate() {
                    let row = onset as i64 + lag;
                    if row < 0 || row >= rows {
                        dropped += 1;
                        continue;
                    }
                    matrix[[row as usize, c * n_lags + k]] = 1.0;
                }
            }
        }

        debug!(
            rows = matrix.nrows(),
            columns = matrix.ncols(),
            lags = n_lags,
            dropped,
            "built FIR design matrix"
        );

        Self {
            matrix,
            columns,
            codes,
            lags,
        }
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    pub fn columns(&self) -> &[DesignColumn] {
        &self.columns
    }

    pub fn codes(&self) -> &[ConditionCode] {
        &self.codes
    }

    pub fn lags(&self) -> Range<i64> {
        self.lags.clone()
    }

    pub fn n_lags(&self) -> usize {
        (self.lags.end - self.lags.start) as usize
    }

    pub fn n_rows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.matrix.ncols()
    }

    /// Column range of one condition
    pub fn condition_columns(&self, code: ConditionCode) -> Option<Range<usize>> {
        let position = self.codes.iter().position(|&c| c == code)?;
        let start = position * self.n_lags();
        Some(start..start + self.n_lags())
    }

    /// The `[fine samples, lags]` sub-matrix of one condition
    pub fn condition_block(&self, code: ConditionCode) -> Option<ArrayView2<'_, f64>> {
        let range = self.condition_columns(code)?;
        Some(self.matrix.slice(s![.., range]))
    }

    /// Number of observations carried by each column
    pub fn column_support(&self) -> Array1<f64> {
        self.matrix.sum_axis(Axis(0))
    }
}

// ============================================================================
// GLM ESTIMATOR
// ============================================================================

/// Least-squares fit of the FIR model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlmFit {
    /// `[design columns, channels]`
    pub betas: Array2<f64>,
    /// Constant term per channel
    pub intercepts: Array1<f64>,
    /// Numerical rank of the design including the constant
    pub rank: usize,
}

impl GlmFit {
    /// Betas averaged across channels
    pub fn mean_betas(&self) -> Array1<f64> {
        self.betas.sum_axis(Axis(1)) / self.betas.ncols() as f64
    }

    pub fn intercept(&self) -> f64 {
        self.intercepts.mean().unwrap_or(0.0)
    }

    /// Channel-averaged betas of one condition, one per lag
    pub fn curve(&self, design: &DesignMatrix, code: ConditionCode) -> Option<Vec<f64>> {
        let range = design.condition_columns(code)?;
        Some(self.mean_betas().slice(s![range]).to_vec())
    }

    pub fn is_rank_deficient(&self, design: &DesignMatrix) -> bool {
        self.rank < design.n_columns() + 1
    }
}

/// Solve `signal ≈ [design - mean | 1] · beta` for every row of `signals`.
///
/// Columns are demeaned before the constant is appended, so the intercept
/// is the signal mean. `signals` is `[channels, fine samples]`. Thin SVD with singular values
/// below `max(m, n) · ε · σ_max` discarded, so a rank-deficient design yields
/// the least-norm solution.
pub fn fit_glm(design: &DesignMatrix, signals: ArrayView2<'_, f64>) -> Result<GlmFit> {
    let rows = design.n_rows();
    let cols = design.n_columns();
    if signals.ncols() != rows {
        return Err(HrfError::Configuration(format!(
            "signal has {} samples but the design has {} rows",
            signals.ncols(),
            rows
        )));
    }

    let regressors = design.matrix();
    let means = design.column_support() / rows as f64;
    let x = DMatrix::from_fn(rows, cols + 1, |i, j| {
        if j < cols {
            regressors[[i, j]] - means[j]
        } else {
            1.0
        }
    });
    let y = DMatrix::from_fn(rows, signals.nrows(), |i, c| signals[[c, i]]);

    let svd = x.svd(true, true);
    let sigma_max = svd.singular_values.iter().cloned().fold(0.0, f64::max);
    let eps = rows.max(cols + 1) as f64 * f64::EPSILON * sigma_max;
    let rank = svd.rank(eps);
    if rank < cols + 1 {
        warn!(
            rank,
            columns = cols + 1,
            "FIR design is rank deficient, using least-norm solution"
        );
    }

    let solution = svd
        .solve(&y, eps)
        .map_err(|e| HrfError::Numerical(format!("least-squares solve failed: {}", e)))?;

    let betas = Array2::from_shape_fn((cols, signals.nrows()), |(j, c)| solution[(j, c)]);
    let intercepts = Array1::from_shape_fn(signals.nrows(), |c| solution[(cols, c)]);

    Ok(GlmFit {
        betas,
        intercepts,
        rank,
    })
}

// ============================================================================
// EVENT-LOCKED AVERAGER
// ============================================================================

/// Baseline-corrected mean of the segments around a set of onsets
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentAverage {
    /// One value per lag; NaN when no segment fits the recording
    pub values: Vec<f64>,
    pub segments_used: usize,
    pub segments_dropped: usize,
}

/// Average the segments `[onset + lags.start, onset + lags.end)` of `signal`.
///
/// Segments reaching outside the recording are discarded. Each kept segment
/// has the mean of its negative-lag samples subtracted; without negative lags
/// its first sample is the baseline.
pub fn event_locked_average(
    signal: ArrayView1<'_, f64>,
    onsets: &[usize],
    lags: Range<i64>,
) -> SegmentAverage {
    let n_lags = (lags.end - lags.start).max(0) as usize;
    let baseline_len = lags.clone().filter(|&l| l < 0).count();
    let n = signal.len() as i64;

    let mut sum = Array1::<f64>::zeros(n_lags);
    let mut used = 0usize;
    let mut dropped = 0usize;

    for &onset in onsets {
        let start = onset as i64 + lags.start;
        let end = onset as i64 + lags.end;
        if start < 0 || end > n {
            dropped += 1;
            continue;
        }

        let segment = signal.slice(s![start as usize..end as usize]);
        let baseline = if baseline_len > 0 {
            segment.slice(s![..baseline_len]).mean().unwrap_or(0.0)
        } else {
            segment.first().copied().unwrap_or(0.0)
        };

        sum.zip_mut_with(&segment, |acc, &v| *acc += v - baseline);
        used += 1;
    }

    let values = if used == 0 {
        vec![f64::NAN; n_lags]
    } else {
        (sum / used as f64).to_vec()
    };

    SegmentAverage {
        values,
        segments_used: used,
        segments_dropped: dropped,
    }
}

// ============================================================================
// RESULT STORE
// ============================================================================

/// Estimator that produced a curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Event-locked averaging
    Average,
    /// FIR general linear model
    Fir,
}

impl Method {
    /// Result tag ("average_hrf" / "FIR_hrf")
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Average => "average_hrf",
            Self::Fir => "FIR_hrf",
        }
    }
}

impl FromStr for Method {
    type Err = HrfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "average" => Ok(Self::Average),
            "fir" => Ok(Self::Fir),
            other => Err(HrfError::Configuration(format!(
                "unknown method '{}': expected FIR or average",
                other
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Average => write!(f, "average"),
            Self::Fir => write!(f, "FIR"),
        }
    }
}

/// One estimated peristimulus curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrfEstimate {
    pub method: Method,
    /// Lag of each value, in fine-grid steps
    pub lags: Vec<i64>,
    /// Lag times relative to onset (s)
    pub times: Vec<Seconds>,
    pub values: Vec<f64>,
    /// Segments averaged, or onsets modelled for FIR
    pub events_used: usize,
}

impl HrfEstimate {
    /// No segment contributed; `values` are NaN
    pub fn insufficient_data(&self) -> bool {
        self.events_used == 0
    }

    /// Largest amplitude and its time, ignoring NaN
    pub fn peak(&self) -> Option<(Seconds, f64)> {
        self.times
            .iter()
            .zip(&self.values)
            .filter(|(_, v)| !v.is_nan())
            .fold(None, |best: Option<(Seconds, f64)>, (&t, &v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((t, v)),
            })
    }
}

/// Estimates of one condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRecord {
    pub code: ConditionCode,
    pub label: Option<String>,
    pub estimates: BTreeMap<Method, HrfEstimate>,
}

/// Per-condition results; re-running a method overwrites its curve
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultStore {
    records: BTreeMap<ConditionCode, ConditionRecord>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: ConditionCode, label: Option<String>, estimate: HrfEstimate) {
        let record = self.records.entry(code).or_insert_with(|| ConditionRecord {
            code,
            label,
            estimates: BTreeMap::new(),
        });
        record.estimates.insert(estimate.method, estimate);
    }

    pub fn get(&self, code: ConditionCode, method: Method) -> Result<&HrfEstimate> {
        self.records
            .get(&code)
            .and_then(|r| r.estimates.get(&method))
            .ok_or_else(|| {
                HrfError::NotFound(format!("no {} estimate for condition {}", method.tag(), code))
            })
    }

    pub fn record(&self, code: ConditionCode) -> Option<&ConditionRecord> {
        self.records.get(&code)
    }

    pub fn records(&self) -> impl Iterator<Item = &ConditionRecord> {
        self.records.values()
    }

    pub fn codes(&self) -> Vec<ConditionCode> {
        self.records.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// RETRIEVAL SESSION
// ============================================================================

/// HRF retrieval session.
///
/// Owns every derived structure: the fine grid, the resampled signal, the
/// event index, the FIR design and the result store. The caller's time series
/// and events are only read.
#[derive(Debug, Clone)]
pub struct HrfRetrieval {
    config: RetrievalConfig,
    grid: FineGrid,
    alignment: GridAlignment,
    fine_signals: Array2<f64>,
    index: EventIndex,
    lags: Range<i64>,
    design: Option<DesignMatrix>,
    glm_fit: Option<GlmFit>,
    store: ResultStore,
}

impl HrfRetrieval {
    pub fn new(series: &TimeSeries, events: &EventTable, config: RetrievalConfig) -> Result<Self> {
        config.validate()?;

        let er = config.effective_resolution();
        let alignment = config.alignment();
        if let GridAlignment::Approximate { ratio } = alignment {
            warn!(
                tr = config.tr,
                er,
                ratio,
                "ER does not divide TR; onsets and samples round to the nearest fine-grid index"
            );
        }

        let grid = FineGrid::new(series.n_samples(), config.tr, er)?;
        let fine_signals = resample_channels(series, &grid)?;
        let index = EventIndex::build(events.events(), &grid)?;
        let lags = config.window.lag_range(er);

        debug!(
            channels = series.n_channels(),
            samples = series.n_samples(),
            fine = grid.len(),
            lags = lags.end - lags.start,
            "initialised HRF retrieval"
        );

        Ok(Self {
            config,
            grid,
            alignment,
            fine_signals,
            index,
            lags,
            design: None,
            glm_fit: None,
            store: ResultStore::new(),
        })
    }

    /// Build the FIR design matrix. Rebuilding yields an identical matrix.
    pub fn build_fir_model(&mut self) -> &DesignMatrix {
        let design = DesignMatrix::build(&self.index, &self.config.window, &self.grid);
        self.design.insert(design)
    }

    /// Run one estimator for every condition
    pub fn estimate_hrf(&mut self, method: Method) -> Result<()> {
        match method {
            Method::Fir => self.estimate_fir(),
            Method::Average => {
                self.estimate_average();
                Ok(())
            }
        }
    }

    fn estimate_fir(&mut self) -> Result<()> {
        let signals = self.analysis_signals();
        let lags: Vec<i64> = self.lags.clone().collect();
        let times = self.time_scale();

        let design = self.design.as_ref().ok_or_else(|| {
            HrfError::NotReady("FIR estimate requested before build_fir_model()".into())
        })?;
        let fit = fit_glm(design, signals.view())?;

        for condition in self.index.conditions() {
            let values = fit.curve(design, condition.code).ok_or_else(|| {
                HrfError::NotFound(format!("condition {} missing from design", condition.code))
            })?;
            self.store.insert(
                condition.code,
                condition.label.clone(),
                HrfEstimate {
                    method: Method::Fir,
                    lags: lags.clone(),
                    times: times.clone(),
                    values,
                    events_used: condition.onsets.len(),
                },
            );
        }

        self.glm_fit = Some(fit);
        Ok(())
    }

    fn estimate_average(&mut self) {
        let signals = self.analysis_signals();
        let lags: Vec<i64> = self.lags.clone().collect();
        let times = self.time_scale();

        for condition in self.index.conditions() {
            let per_channel: Vec<SegmentAverage> = signals
                .outer_iter()
                .map(|channel| event_locked_average(channel, &condition.onsets, self.lags.clone()))
                .collect();

            // Segment validity depends only on onsets, so it is channel independent
            let used = per_channel.first().map_or(0, |a| a.segments_used);
            let dropped = per_channel.first().map_or(0, |a| a.segments_dropped);
            if dropped > 0 {
                debug!(code = condition.code, dropped, "segments cross the recording boundary");
            }
            if used == 0 {
                warn!(
                    code = condition.code,
                    "no complete peristimulus segment; average is undefined"
                );
            }

            let mut values = vec![0.0; lags.len()];
            for average in &per_channel {
                for (acc, v) in values.iter_mut().zip(&average.values) {
                    *acc += v;
                }
            }
            let n = per_channel.len().max(1) as f64;
            values.iter_mut().for_each(|v| *v /= n);

            self.store.insert(
                condition.code,
                condition.label.clone(),
                HrfEstimate {
                    method: Method::Average,
                    lags: lags.clone(),
                    times: times.clone(),
                    values,
                    events_used: used,
                },
            );
        }
    }

    /// `[channels, fine samples]` handed to the estimators
    fn analysis_signals(&self) -> Array2<f64> {
        match self.config.pooling {
            ChannelPooling::MeanSignal => {
                mean_rows(self.fine_signals.view()).insert_axis(Axis(0))
            }
            ChannelPooling::MeanOfEstimates => self.fine_signals.clone(),
        }
    }

    /// HRF curve of one condition and method
    pub fn get_result(&self, code: ConditionCode, method: Method) -> Result<&[f64]> {
        self.store.get(code, method).map(|e| e.values.as_slice())
    }

    pub fn estimate(&self, code: ConditionCode, method: Method) -> Result<&HrfEstimate> {
        self.store.get(code, method)
    }

    pub fn conditions(&self) -> &[ConditionOnsets] {
        self.index.conditions()
    }

    /// Lag times relative to onset (s), aligned with every curve
    pub fn time_scale(&self) -> Vec<Seconds> {
        let er = self.grid.step();
        self.lags.clone().map(|l| l as f64 * er).collect()
    }

    pub fn alignment(&self) -> GridAlignment {
        self.alignment
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn grid(&self) -> &FineGrid {
        &self.grid
    }

    pub fn design(&self) -> Option<&DesignMatrix> {
        self.design.as_ref()
    }

    pub fn glm_fit(&self) -> Option<&GlmFit> {
        self.glm_fit.as_ref()
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn into_store(self) -> ResultStore {
        self.store
    }
}
