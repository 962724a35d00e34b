//! DRS calibration constants.
//!
//! The calibration file carries three reference curves, one table row each:
//! per-pixel baseline and gain as functions of the ring-buffer capacitor,
//! and a per-pixel trigger offset as a function of readout position.
//! Baseline and gain are duplicated along the sample axis after reshaping,
//! so a readout window of `roi` samples starting at any start cell is one
//! contiguous slice with no wraparound arithmetic.

use ndarray::Array2;

use crate::column::{ColumnData, ElementType};
use crate::error::{Error, Result};
use crate::table::TableReader;
use crate::NUM_PIXELS;

/// Per-capacitor mean baseline column.
pub const BASELINE_COLUMN: &str = "BaselineMean";
/// Per-capacitor mean gain column.
pub const GAIN_COLUMN: &str = "GainMean";
/// Per-readout-position mean trigger offset column.
pub const TRIGGER_OFFSET_COLUMN: &str = "TriggerOffsetMean";

/// Immutable per-pixel reference curves loaded from a calibration file.
///
/// Read-only after construction; one set may be shared across any number
/// of calibration engines.
#[derive(Debug, Clone)]
pub struct CalibrationConstants {
    baseline: Array2<f32>,
    gain: Array2<f32>,
    trigger_offset: Array2<f32>,
    ring: usize,
}

impl CalibrationConstants {
    /// Load the three reference curves from row 0 of a calibration table.
    pub fn load<R: TableReader>(reader: &mut R, extension: &str) -> Result<Self> {
        let baseline = read_curve(reader, extension, BASELINE_COLUMN)?;
        let gain = read_curve(reader, extension, GAIN_COLUMN)?;
        let trigger_offset = read_curve(reader, extension, TRIGGER_OFFSET_COLUMN)?;

        let ring = curve_width(BASELINE_COLUMN, &baseline)?;
        if curve_width(GAIN_COLUMN, &gain)? != ring {
            return Err(Error::UnexpectedLength {
                column: GAIN_COLUMN,
                len: gain.len(),
            });
        }
        let trigger_width = curve_width(TRIGGER_OFFSET_COLUMN, &trigger_offset)?;

        Ok(CalibrationConstants {
            baseline: duplicated(baseline, ring),
            gain: duplicated(gain, ring),
            trigger_offset: reshaped(trigger_offset, trigger_width),
            ring,
        })
    }

    /// Ring-buffer capacity derived from the curve length.
    pub fn ring_size(&self) -> usize {
        self.ring
    }

    /// Width of the duplicated baseline/gain matrices.
    pub fn window_width(&self) -> usize {
        2 * self.ring
    }

    /// Number of readout positions the trigger offset curve covers.
    pub fn trigger_width(&self) -> usize {
        self.trigger_offset.ncols()
    }

    /// Duplicated `[pixel, 2 * ring]` baseline matrix.
    pub fn baseline(&self) -> &Array2<f32> {
        &self.baseline
    }

    /// Duplicated `[pixel, 2 * ring]` gain matrix.
    pub fn gain(&self) -> &Array2<f32> {
        &self.gain
    }

    /// `[pixel, readout position]` trigger offset matrix.
    pub fn trigger_offset(&self) -> &Array2<f32> {
        &self.trigger_offset
    }
}

fn read_curve<R: TableReader>(reader: &mut R, extension: &str, column: &str) -> Result<Vec<f32>> {
    let cell = reader.read_cell(extension, column, 0)?;
    match ColumnData::from_le_bytes(&cell, ElementType::Float)? {
        ColumnData::Float(values) => Ok(values),
        _ => Err(Error::InvalidValue),
    }
}

fn curve_width(column: &'static str, values: &[f32]) -> Result<usize> {
    if values.is_empty() || !values.len().is_multiple_of(NUM_PIXELS) {
        return Err(Error::UnexpectedLength {
            column,
            len: values.len(),
        });
    }
    Ok(values.len() / NUM_PIXELS)
}

/// Reshape a flat curve to `[NUM_PIXELS, width]`.
fn reshaped(values: Vec<f32>, width: usize) -> Array2<f32> {
    let mut matrix = Array2::zeros((NUM_PIXELS, width));
    for (pixel, chunk) in values.chunks_exact(width).enumerate() {
        for (i, &v) in chunk.iter().enumerate() {
            matrix[[pixel, i]] = v;
        }
    }
    matrix
}

/// Reshape a flat curve to `[NUM_PIXELS, ring]` and concatenate it with
/// itself along the sample axis.
fn duplicated(values: Vec<f32>, ring: usize) -> Array2<f32> {
    let mut matrix = Array2::zeros((NUM_PIXELS, 2 * ring));
    for (pixel, chunk) in values.chunks_exact(ring).enumerate() {
        for (i, &v) in chunk.iter().enumerate() {
            matrix[[pixel, i]] = v;
            matrix[[pixel, ring + i]] = v;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{MemoryExtension, MemoryTable};

    const DRS_EXTENSION: &str = "DrsCalibration";

    fn curve_cell<F: Fn(usize, usize) -> f32>(width: usize, f: F) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NUM_PIXELS * width * 4);
        for pixel in 0..NUM_PIXELS {
            for i in 0..width {
                bytes.extend_from_slice(&f(pixel, i).to_le_bytes());
            }
        }
        bytes
    }

    fn drs_fixture(ring: usize, trigger_width: usize) -> MemoryTable {
        let mut ext = MemoryExtension::new();
        ext.push_column(
            BASELINE_COLUMN,
            vec![curve_cell(ring, |p, i| (p % 10) as f32 + i as f32 / 100.0)],
        );
        ext.push_column(
            GAIN_COLUMN,
            vec![curve_cell(ring, |p, i| 0.9 + ((p + i) % 5) as f32 / 50.0)],
        );
        ext.push_column(
            TRIGGER_OFFSET_COLUMN,
            vec![curve_cell(trigger_width, |p, i| (p + i) as f32 / 1000.0)],
        );

        let mut table = MemoryTable::new();
        table.push_extension(DRS_EXTENSION, ext);
        table
    }

    #[test]
    fn load_shapes() {
        let mut table = drs_fixture(16, 8);
        let constants = CalibrationConstants::load(&mut table, DRS_EXTENSION).unwrap();
        assert_eq!(constants.ring_size(), 16);
        assert_eq!(constants.window_width(), 32);
        assert_eq!(constants.baseline().dim(), (NUM_PIXELS, 32));
        assert_eq!(constants.gain().dim(), (NUM_PIXELS, 32));
        assert_eq!(constants.trigger_offset().dim(), (NUM_PIXELS, 8));
        assert_eq!(constants.trigger_width(), 8);
    }

    #[test]
    fn duplication_wraps_the_ring() {
        let mut table = drs_fixture(16, 8);
        let constants = CalibrationConstants::load(&mut table, DRS_EXTENSION).unwrap();
        let baseline = constants.baseline();
        for i in 0..16 {
            assert_eq!(baseline[[3, i]], baseline[[3, 16 + i]]);
        }
    }

    #[test]
    fn any_window_fits_without_wraparound() {
        let mut table = drs_fixture(16, 16);
        let constants = CalibrationConstants::load(&mut table, DRS_EXTENSION).unwrap();
        let ring = constants.ring_size();
        let roi = ring;
        // Every legal start cell leaves a full contiguous window.
        for start in 0..ring {
            assert!(start + roi <= constants.window_width());
        }
    }

    #[test]
    fn missing_curve_column() {
        let mut ext = MemoryExtension::new();
        ext.push_column(BASELINE_COLUMN, vec![curve_cell(4, |_, _| 0.0)]);
        let mut table = MemoryTable::new();
        table.push_extension(DRS_EXTENSION, ext);
        assert!(matches!(
            CalibrationConstants::load(&mut table, DRS_EXTENSION),
            Err(Error::MissingColumn(_))
        ));
    }

    #[test]
    fn missing_extension() {
        let mut table = MemoryTable::new();
        table.push_extension(DRS_EXTENSION, MemoryExtension::new());
        assert!(matches!(
            CalibrationConstants::load(&mut table, "Other"),
            Err(Error::MissingExtension(_))
        ));
    }

    #[test]
    fn ragged_curve_is_rejected() {
        let mut ext = MemoryExtension::new();
        // One float short of a whole per-pixel reshape.
        let mut bytes = curve_cell(4, |_, _| 1.0);
        bytes.truncate(bytes.len() - 4);
        ext.push_column(BASELINE_COLUMN, vec![bytes]);
        ext.push_column(GAIN_COLUMN, vec![curve_cell(4, |_, _| 1.0)]);
        ext.push_column(TRIGGER_OFFSET_COLUMN, vec![curve_cell(4, |_, _| 0.0)]);
        let mut table = MemoryTable::new();
        table.push_extension(DRS_EXTENSION, ext);
        assert!(matches!(
            CalibrationConstants::load(&mut table, DRS_EXTENSION),
            Err(Error::UnexpectedLength { .. })
        ));
    }

    #[test]
    fn mismatched_gain_ring_is_rejected() {
        let mut ext = MemoryExtension::new();
        ext.push_column(BASELINE_COLUMN, vec![curve_cell(8, |_, _| 0.0)]);
        ext.push_column(GAIN_COLUMN, vec![curve_cell(4, |_, _| 1.0)]);
        ext.push_column(TRIGGER_OFFSET_COLUMN, vec![curve_cell(4, |_, _| 0.0)]);
        let mut table = MemoryTable::new();
        table.push_extension(DRS_EXTENSION, ext);
        assert!(matches!(
            CalibrationConstants::load(&mut table, DRS_EXTENSION),
            Err(Error::UnexpectedLength { .. })
        ));
    }
}
