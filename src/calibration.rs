//! Per-channel affine calibration.
//!
//! A [`CalibrationTable`] maps a physical channel index to `(slope, intercept)`.
//! [`calibrate`] turns a [`RawSampleBlock`] into a [`MeasurementBatch`] with
//! `value = slope * raw + intercept` for every sample of every calibrated channel.
//!
//! Channels without an entry produce no measurements at all. Entries are always
//! resolved by explicit channel index; the order in which they were configured is
//! irrelevant, and entries naming channels the block does not have are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::measurement::{
    channel_id, Measurement, MeasurementBatch, MeasurementStatus, RawSampleBlock,
};

/// Calibration of one physical channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    /// Physical channel index on the device
    #[serde(alias = "Channel")]
    pub channel_index: usize,
    /// Engineering units per volt
    #[serde(alias = "Slope")]
    pub slope: f64,
    /// Engineering-unit offset
    #[serde(alias = "Intercept")]
    pub intercept: f64,
}

impl ChannelCalibration {
    /// Create a calibration entry.
    pub fn new(channel_index: usize, slope: f64, intercept: f64) -> Self {
        Self {
            channel_index,
            slope,
            intercept,
        }
    }

    /// Apply the affine transform to one raw reading.
    #[inline]
    pub fn apply(&self, raw: f64) -> f64 {
        self.slope * raw + self.intercept
    }
}

/// Immutable channel-index → calibration lookup for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    entries: BTreeMap<usize, ChannelCalibration>,
}

impl CalibrationTable {
    /// Build a table; when a channel appears twice the first entry wins.
    pub fn new(entries: impl IntoIterator<Item = ChannelCalibration>) -> Self {
        let mut table = BTreeMap::new();
        for entry in entries {
            if table.contains_key(&entry.channel_index) {
                warn!(
                    channel = entry.channel_index,
                    "Duplicate calibration entry ignored"
                );
                continue;
            }
            table.insert(entry.channel_index, entry);
        }
        Self { entries: table }
    }

    /// Calibration for a channel, if it is published.
    pub fn get(&self, channel_index: usize) -> Option<&ChannelCalibration> {
        self.entries.get(&channel_index)
    }

    /// Entries in ascending channel order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelCalibration> {
        self.entries.values()
    }

    /// Number of calibrated channels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no channel is calibrated.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<ChannelCalibration> for CalibrationTable {
    fn from_iter<I: IntoIterator<Item = ChannelCalibration>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Calibrate one raw block.
///
/// Every measurement carries the block's capture instant. A non-finite result
/// (the device handed back NaN or infinity) is kept but marked `Invalid`.
pub fn calibrate(
    block: &RawSampleBlock,
    table: &CalibrationTable,
    sequence: u64,
) -> MeasurementBatch {
    let timestamp = block.captured_at();
    let mut measurements = Vec::with_capacity(table.len() * block.samples_per_channel());

    for calibration in table.iter() {
        let Some(raw) = block.channel(calibration.channel_index) else {
            continue;
        };
        let id = channel_id(calibration.channel_index);
        measurements.extend(raw.iter().map(|&r| {
            let value = calibration.apply(r);
            Measurement {
                channel_id: id.clone(),
                value,
                timestamp,
                status: if value.is_finite() {
                    MeasurementStatus::Valid
                } else {
                    MeasurementStatus::Invalid
                },
            }
        }));
    }

    MeasurementBatch {
        sequence,
        captured_at: timestamp,
        measurements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracing_test::traced_test;

    const TOL: f64 = 1e-9;

    fn block(channels: Vec<Vec<f64>>) -> RawSampleBlock {
        RawSampleBlock::from_channels(channels, Utc::now()).unwrap()
    }

    #[test]
    fn single_channel_scenario() {
        let table = CalibrationTable::new([ChannelCalibration::new(0, 2.0, 0.5)]);
        let raw = block(vec![vec![1.0, 2.0]]);
        let batch = calibrate(&raw, &table, 0);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.measurements[0].channel_id, "Channel0");
        assert!((batch.measurements[0].value - 2.5).abs() < TOL);
        assert!((batch.measurements[1].value - 4.5).abs() < TOL);
        assert_eq!(batch.measurements[0].timestamp, batch.measurements[1].timestamp);
        assert_eq!(batch.measurements[0].timestamp, raw.captured_at());
    }

    #[test]
    fn uncalibrated_channels_are_omitted() {
        let table = CalibrationTable::new([ChannelCalibration::new(1, 1.0, 0.0)]);
        let batch = calibrate(&block(vec![vec![9.0; 3], vec![1.0; 3], vec![9.0; 3]]), &table, 0);

        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|m| m.channel_id == "Channel1"));
    }

    #[test]
    fn table_order_does_not_matter() {
        let table = CalibrationTable::new([
            ChannelCalibration::new(2, 1.0, 200.0),
            ChannelCalibration::new(0, 1.0, 0.0),
        ]);
        let batch = calibrate(&block(vec![vec![1.0, 2.0], vec![0.0, 0.0], vec![3.0, 4.0]]), &table, 7);

        let ids: Vec<_> = batch.iter().map(|m| m.channel_id.as_str()).collect();
        assert_eq!(ids, ["Channel0", "Channel0", "Channel2", "Channel2"]);
        let values: Vec<_> = batch.iter().map(|m| m.value).collect();
        assert_eq!(values, [1.0, 2.0, 203.0, 204.0]);
        assert_eq!(batch.sequence, 7);
    }

    #[test]
    fn entries_beyond_block_are_ignored() {
        let table = CalibrationTable::new([
            ChannelCalibration::new(0, 1.0, 0.0),
            ChannelCalibration::new(15, 1.0, 0.0),
        ]);
        let batch = calibrate(&block(vec![vec![1.0]]), &table, 0);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    #[traced_test]
    fn first_duplicate_wins() {
        let table = CalibrationTable::new([
            ChannelCalibration::new(0, 3.0, 0.0),
            ChannelCalibration::new(0, 5.0, 0.0),
        ]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0).map(|c| c.slope), Some(3.0));
        assert!(logs_contain("Duplicate calibration entry ignored"));
    }

    #[test]
    fn non_finite_reading_is_invalid() {
        let table = CalibrationTable::new([ChannelCalibration::new(0, 1.0, 0.0)]);
        let batch = calibrate(&block(vec![vec![f64::NAN, 1.0]]), &table, 0);
        assert_eq!(batch.measurements[0].status, MeasurementStatus::Invalid);
        assert_eq!(batch.measurements[1].status, MeasurementStatus::Valid);
    }

    #[test]
    fn legacy_field_names_deserialize() {
        let entry: ChannelCalibration =
            serde_json::from_str(r#"{"Channel": 3, "Slope": 1.5, "Intercept": -0.25}"#).unwrap();
        assert_eq!(entry, ChannelCalibration::new(3, 1.5, -0.25));
    }
}
