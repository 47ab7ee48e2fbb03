//! Measurement data types flowing through the pipeline.
//!
//! - [`RawSampleBlock`] is what one completed device read yields: a rectangular
//!   `[channel][sample]` matrix of raw volts plus the capture instant.
//! - [`Measurement`] is one calibrated `(channel, sample)` value.
//! - [`MeasurementBatch`] is everything calibrated out of one block, in scan order
//!   (channel ascending, then sample ascending). One batch is one publish message.
//!
//! The serialized field names follow the `ChannelID`/`Value`/`Timestamp`/`Status`
//! layout downstream dashboards already read from the data channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// One completed read: raw volts, channel-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSampleBlock {
    samples: Vec<f64>,
    n_channels: usize,
    samples_per_channel: usize,
    captured_at: DateTime<Utc>,
}

impl RawSampleBlock {
    /// Build a block from per-channel sample vectors.
    ///
    /// Every channel must carry the same number of samples.
    pub fn from_channels(
        channels: Vec<Vec<f64>>,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, DeviceError> {
        let samples_per_channel = channels.first().map_or(0, Vec::len);
        if let Some((index, ragged)) = channels
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != samples_per_channel)
        {
            return Err(DeviceError::ReadComplete {
                message: format!(
                    "ragged block: channel {index} has {} samples, expected {samples_per_channel}",
                    ragged.len()
                ),
            });
        }

        let n_channels = channels.len();
        let samples = channels.into_iter().flatten().collect();
        Ok(Self {
            samples,
            n_channels,
            samples_per_channel,
            captured_at,
        })
    }

    /// Number of physical channels in the block.
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// Number of samples each channel carries.
    pub fn samples_per_channel(&self) -> usize {
        self.samples_per_channel
    }

    /// Instant the read completed; shared by every sample in the block.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Samples of one channel, or `None` if the block has no such channel.
    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        if index >= self.n_channels {
            return None;
        }
        let start = index * self.samples_per_channel;
        self.samples.get(start..start + self.samples_per_channel)
    }

    /// Total number of samples across all channels.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the block holds no samples at all.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Validity of a calibrated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementStatus {
    /// Finite calibrated value
    Valid,
    /// NaN or infinite after calibration
    Invalid,
}

/// One calibrated sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Measurement {
    /// `Channel{index}`
    #[serde(rename = "ChannelID")]
    pub channel_id: String,
    /// Engineering-unit value; non-finite values travel as `null`
    #[serde(with = "value_serde")]
    pub value: f64,
    /// Capture instant of the source block
    pub timestamp: DateTime<Utc>,
    /// Whether `value` is usable
    pub status: MeasurementStatus,
}

/// Serde helper for measurement values.
///
/// JSON has no NaN or infinity. Non-finite values are written as `null` and a
/// `null` reads back as NaN, so an `Invalid` measurement survives a round trip.
mod value_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.is_finite().then_some(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Identifier published for a physical channel index.
pub fn channel_id(index: usize) -> String {
    format!("Channel{index}")
}

/// Calibrated output of one raw block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeasurementBatch {
    /// Per-session sequence number, starting at 0
    pub sequence: u64,
    /// Capture instant of the source block
    pub captured_at: DateTime<Utc>,
    /// Measurements in scan order
    pub measurements: Vec<Measurement>,
}

impl MeasurementBatch {
    /// Number of measurements in the batch.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Whether the batch carries no measurements.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Iterate measurements in scan order.
    pub fn iter(&self) -> std::slice::Iter<'_, Measurement> {
        self.measurements.iter()
    }

    /// Last measurement of every channel, in order of first appearance.
    ///
    /// Scan order is channel-ascending, so the result is channel-ascending too.
    pub fn latest_per_channel(&self) -> Vec<&Measurement> {
        let mut latest: Vec<&Measurement> = Vec::new();
        for m in &self.measurements {
            match latest.iter_mut().find(|seen| seen.channel_id == m.channel_id) {
                Some(slot) => *slot = m,
                None => latest.push(m),
            }
        }
        latest
    }
}

impl<'a> IntoIterator for &'a MeasurementBatch {
    type Item = &'a Measurement;
    type IntoIter = std::slice::Iter<'a, Measurement>;

    fn into_iter(self) -> Self::IntoIter {
        self.measurements.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(channel: usize, value: f64, at: DateTime<Utc>) -> Measurement {
        Measurement {
            channel_id: channel_id(channel),
            value,
            timestamp: at,
            status: MeasurementStatus::Valid,
        }
    }

    #[test]
    fn block_channel_slices() {
        let block =
            RawSampleBlock::from_channels(vec![vec![1.0, 2.0], vec![3.0, 4.0]], Utc::now())
                .unwrap();
        assert_eq!(block.n_channels(), 2);
        assert_eq!(block.samples_per_channel(), 2);
        assert_eq!(block.channel(1), Some(&[3.0, 4.0][..]));
        assert_eq!(block.channel(2), None);
    }

    #[test]
    fn ragged_block_is_rejected() {
        let err = RawSampleBlock::from_channels(vec![vec![1.0, 2.0], vec![3.0]], Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("ragged"));
    }

    #[test]
    fn latest_per_channel_keeps_last_in_scan_order() {
        let at = Utc::now();
        let batch = MeasurementBatch {
            sequence: 0,
            captured_at: at,
            measurements: vec![m(0, 1.0, at), m(0, 2.0, at), m(3, 7.0, at), m(3, 8.0, at)],
        };
        let latest = batch.latest_per_channel();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].channel_id, "Channel0");
        assert_eq!(latest[0].value, 2.0);
        assert_eq!(latest[1].channel_id, "Channel3");
        assert_eq!(latest[1].value, 8.0);
    }

    #[test]
    fn measurement_wire_names() {
        let json = serde_json::to_value(m(5, 1.5, Utc::now())).unwrap();
        assert_eq!(json["ChannelID"], "Channel5");
        assert_eq!(json["Value"], 1.5);
        assert_eq!(json["Status"], "Valid");
        assert!(json.get("Timestamp").is_some());
    }

    #[test]
    fn non_finite_value_is_written_as_null() {
        let mut invalid = m(0, f64::INFINITY, Utc::now());
        invalid.status = MeasurementStatus::Invalid;
        let json = serde_json::to_value(&invalid).unwrap();
        assert!(json["Value"].is_null());

        let back: Measurement = serde_json::from_value(json).unwrap();
        assert!(back.value.is_nan());
        assert_eq!(back.status, MeasurementStatus::Invalid);
    }
}
