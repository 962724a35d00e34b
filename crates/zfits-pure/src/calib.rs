//! Conversion of raw ADC samples into calibrated waveforms.
//!
//! Calibration is per pixel over the readout window: scale to millivolts,
//! subtract the baseline slice addressed by the start cell, subtract the
//! trigger offset, divide by the gain slice, and normalize. On top of the
//! per-event formula the engine corrects baseline steps left behind by
//! earlier readouts: for each recent start-cell vector it estimates the
//! step height across the camera and subtracts it from one side of the
//! per-pixel step position. Spike removal is an injected collaborator that
//! mutates each waveform row in place.
//!
//! An engine owns all of its cross-event state (the start-cell history and
//! a single-slot row cache) and must not be shared; calibration constants
//! are immutable and may back any number of engines.

use std::collections::VecDeque;
use std::sync::Arc;

use ndarray::Array2;

use crate::column::ColumnData;
use crate::drs::CalibrationConstants;
use crate::error::{Error, Result};
use crate::event::{RawEvent, RawEventSource};
use crate::table::TableReader;
use crate::NUM_PIXELS;

/// How many previous start-cell vectors feed the step correction.
pub const HISTORY_WINDOW: usize = 5;

/// ADC counts to millivolts.
pub const COUNTS_TO_MILLIVOLT: f32 = 2000.0 / 4096.0;
/// Empirical sensor gain normalization.
pub const GAIN_NORMALIZATION: f32 = 1907.35;

/// Pixels per readout patch; patches share one step position.
const PATCH_SIZE: usize = 9;
/// Pixels of a patch that enter its step average.
const PATCH_KEEP: usize = 8;
/// Entries dropped from each end for the truncated mean.
const TRUNCATE_DROP: usize = 10;
/// Patch-step spread above which the truncated mean is used.
const STEP_DEVIATION_LIMIT: f32 = 5.0;
/// Step positions probed per historical event, relative to the window.
const STEP_OFFSET_PAST_WINDOW: i64 = 10;
const STEP_OFFSET_NEAR_START: i64 = 3;

/// Bounded FIFO of recent start-cell vectors, oldest first.
#[derive(Debug, Clone)]
pub struct StartCellHistory {
    cells: VecDeque<Vec<i16>>,
    capacity: usize,
}

impl StartCellHistory {
    /// Create a history that retains at most `capacity` vectors.
    pub fn new(capacity: usize) -> Self {
        StartCellHistory {
            cells: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a start-cell vector, evicting the oldest beyond capacity.
    pub fn push(&mut self, start_cells: Vec<i16>) {
        if self.cells.len() == self.capacity {
            self.cells.pop_front();
        }
        self.cells.push_back(start_cells);
    }

    /// Iterate the retained vectors, oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Vec<i16>> {
        self.cells.iter()
    }

    /// Number of retained vectors.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if no event has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// In-place spike removal over one calibrated waveform row.
///
/// The kernel detects and replaces anomalous transient samples; it reports
/// nothing back beyond the mutated buffer.
pub trait SpikeRemoval {
    fn remove_spikes(&self, waveform: &mut [f32]);
}

/// A spike-removal stand-in that leaves waveforms untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSpikeRemoval;

impl SpikeRemoval for NoopSpikeRemoval {
    fn remove_spikes(&self, _waveform: &mut [f32]) {}
}

/// One calibrated event: the waveform plus the raw columns it came from.
#[derive(Debug, Clone)]
pub struct CalibratedEvent {
    /// Table row this event was read from.
    pub row: u64,
    /// Calibrated waveform, one row per pixel.
    pub waveform: Array2<f32>,
    /// The decoded raw event, passed through untouched.
    pub raw: RawEvent,
}

/// Iteration progress of the streaming reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    NotStarted,
    Reading(u64),
    Exhausted,
}

/// Streams calibrated events out of a data file.
pub struct CalibrationEngine<R: TableReader> {
    source: RawEventSource<R>,
    constants: Arc<CalibrationConstants>,
    spikes: Box<dyn SpikeRemoval>,
    history: StartCellHistory,
    cached: Option<CalibratedEvent>,
    state: ReadState,
}

impl<R: TableReader> CalibrationEngine<R> {
    /// Build an engine over an already-open event source.
    pub fn new(
        source: RawEventSource<R>,
        constants: Arc<CalibrationConstants>,
        spikes: Box<dyn SpikeRemoval>,
    ) -> Self {
        CalibrationEngine {
            source,
            constants,
            spikes,
            history: StartCellHistory::new(HISTORY_WINDOW),
            cached: None,
            state: ReadState::NotStarted,
        }
    }

    /// Open the event extension of a data file and load the calibration
    /// constants from a companion calibration file.
    pub fn open<D: TableReader>(
        data: R,
        events_extension: &str,
        calibration: &mut D,
        calibration_extension: &str,
        spikes: Box<dyn SpikeRemoval>,
    ) -> Result<Self> {
        let source = RawEventSource::open(data, events_extension)?;
        let constants = Arc::new(CalibrationConstants::load(
            calibration,
            calibration_extension,
        )?);
        Ok(CalibrationEngine::new(source, constants, spikes))
    }

    /// Number of event rows in the data file.
    pub fn rows(&self) -> u64 {
        self.source.rows()
    }

    /// The shared calibration constants.
    pub fn constants(&self) -> &Arc<CalibrationConstants> {
        &self.constants
    }

    /// The retained start-cell history.
    pub fn history(&self) -> &StartCellHistory {
        &self.history
    }

    /// Decode a column cell without calibrating it.
    pub fn get(&mut self, column: &str, row: u64) -> Result<ColumnData> {
        self.source.get(column, row)
    }

    /// Calibrate one row, serving a repeat of the most recent row from the
    /// cache without touching the history.
    pub fn calibrate_row(&mut self, row: u64) -> Result<CalibratedEvent> {
        if let Some(cached) = &self.cached {
            if cached.row == row {
                return Ok(cached.clone());
            }
        }
        let raw = self.source.read_event(row)?;
        let event = self.calibrate(raw)?;
        self.cached = Some(event.clone());
        Ok(event)
    }

    /// Advance the stream by one row, or signal the end of the table.
    pub fn next_event(&mut self) -> Option<Result<CalibratedEvent>> {
        let row = match self.state {
            ReadState::NotStarted => 0,
            ReadState::Reading(row) => row,
            ReadState::Exhausted => return None,
        };
        if row >= self.rows() {
            self.state = ReadState::Exhausted;
            return None;
        }
        self.state = ReadState::Reading(row + 1);
        Some(self.calibrate_row(row))
    }

    /// Apply the calibration formula, the step correction, and the spike
    /// removal to one decoded event.
    fn calibrate(&mut self, raw: RawEvent) -> Result<CalibratedEvent> {
        let roi = raw.roi();
        let ring = self.constants.ring_size();
        if roi > ring {
            return Err(Error::UnexpectedLength {
                column: "Data",
                len: NUM_PIXELS * roi,
            });
        }
        if self.constants.trigger_width() < roi {
            return Err(Error::UnexpectedLength {
                column: "TriggerOffsetMean",
                len: NUM_PIXELS * self.constants.trigger_width(),
            });
        }

        let baseline = self.constants.baseline();
        let gain = self.constants.gain();
        let trigger = self.constants.trigger_offset();

        let mut waveform = Array2::<f32>::zeros((NUM_PIXELS, roi));
        for pixel in 0..NUM_PIXELS {
            let cell = raw.start_cells[pixel];
            if cell < 0 || cell as usize >= ring {
                return Err(Error::StartCellOutOfRange {
                    pixel,
                    cell: cell as i64,
                });
            }
            let start = cell as usize;
            for s in 0..roi {
                let mut v = raw.samples[[pixel, s]] as f32 * COUNTS_TO_MILLIVOLT;
                v -= baseline[[pixel, start + s]];
                v -= trigger[[pixel, s]];
                v /= gain[[pixel, start + s]];
                v *= GAIN_NORMALIZATION;
                waveform[[pixel, s]] = v;
            }
        }

        self.remove_jumps(&mut waveform, &raw.start_cells, ring);
        self.history.push(raw.start_cells.clone());

        for mut row in waveform.rows_mut() {
            if let Some(slice) = row.as_slice_mut() {
                self.spikes.remove_spikes(slice);
            }
        }

        Ok(CalibratedEvent {
            row: raw.row,
            waveform,
            raw,
        })
    }

    /// Undo baseline steps imprinted by recently read-out windows. Each
    /// historical start-cell vector marks two candidate step positions in
    /// the current window: just past the old window's end and just past
    /// its start.
    fn remove_jumps(&self, waveform: &mut Array2<f32>, start_cells: &[i16], ring: usize) {
        let roi = waveform.ncols() as i64;
        for old in self.history.iter() {
            for offset in [roi + STEP_OFFSET_PAST_WINDOW, STEP_OFFSET_NEAR_START] {
                let mut dists: Vec<usize> = (0..NUM_PIXELS)
                    .map(|pixel| {
                        (old[pixel] as i64 - start_cells[pixel] as i64 + offset)
                            .rem_euclid(ring as i64) as usize
                    })
                    .collect();
                correct_step(waveform, &mut dists);
            }
        }
    }
}

impl<R: TableReader> Iterator for CalibrationEngine<R> {
    type Item = Result<CalibratedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}

/// First difference of each pixel's waveform at its step position.
///
/// Positions at the window boundary (0 or the window length) cannot carry a
/// difference and are masked as NaN.
fn find_steps(waveform: &Array2<f32>, dists: &[usize]) -> Vec<f32> {
    let roi = waveform.ncols();
    let mut steps = vec![f32::NAN; waveform.nrows()];
    for (pixel, step) in steps.iter_mut().enumerate() {
        let d = dists[pixel];
        if d == 0 || d == roi {
            continue;
        }
        *step = waveform[[pixel, d]] - waveform[[pixel, d - 1]];
    }
    steps
}

/// Estimate the camera-wide step height at the given per-pixel positions
/// and subtract it from the stepped side of each pixel's window.
///
/// The estimate is the mean over 9-pixel patch averages (first 8 pixels per
/// patch). A spread above [`STEP_DEVIATION_LIMIT`] switches to a truncated
/// mean that drops the [`TRUNCATE_DROP`] smallest and largest entries.
/// Returns the applied step, or `None` when no correction was possible:
/// positions beyond the window are treated as position 0, an all-NaN
/// population or a zero estimate leaves the waveform untouched.
pub fn correct_step(waveform: &mut Array2<f32>, dists: &mut [usize]) -> Option<f32> {
    let roi = waveform.ncols();
    for d in dists.iter_mut() {
        if *d >= roi {
            *d = 0;
        }
    }

    let steps = find_steps(waveform, dists);
    let mut patch_steps: Vec<f32> = steps
        .chunks_exact(PATCH_SIZE)
        .map(|patch| patch[..PATCH_KEEP].iter().sum::<f32>() / PATCH_KEEP as f32)
        .collect();

    let mut average = nan_mean(&patch_steps)?;
    if average == 0.0 {
        return None;
    }

    if nan_std(&patch_steps).is_some_and(|std| std > STEP_DEVIATION_LIMIT) {
        patch_steps.sort_by(nan_last);
        if patch_steps.len() <= 2 * TRUNCATE_DROP {
            return None;
        }
        let kept = &patch_steps[TRUNCATE_DROP..patch_steps.len() - TRUNCATE_DROP];
        average = nan_mean(kept)?;
    }
    if !average.is_finite() {
        return None;
    }

    // The sign decides which side of the step position carries the jump;
    // the magnitude is always subtracted, never added.
    let magnitude = average.abs();
    for (pixel, &d) in dists.iter().enumerate() {
        if average > 0.0 {
            for s in d..roi {
                waveform[[pixel, s]] -= magnitude;
            }
        } else {
            for s in 0..d {
                waveform[[pixel, s]] -= magnitude;
            }
        }
    }
    Some(average)
}

/// Mean over the non-NaN entries; `None` if there are none.
fn nan_mean(values: &[f32]) -> Option<f32> {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for &v in values {
        if !v.is_nan() {
            sum += v as f64;
            count += 1;
        }
    }
    if count == 0 {
        None
    } else {
        Some((sum / count as f64) as f32)
    }
}

/// Population standard deviation over the non-NaN entries.
fn nan_std(values: &[f32]) -> Option<f32> {
    let mean = nan_mean(values)? as f64;
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for &v in values {
        if !v.is_nan() {
            let d = v as f64 - mean;
            sum += d * d;
            count += 1;
        }
    }
    Some(((sum / count as f64).sqrt()) as f32)
}

/// Total order that sorts NaN entries after every number.
fn nan_last(a: &f32, b: &f32) -> core::cmp::Ordering {
    use core::cmp::Ordering;
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
    }
}
