//! This module is responsible for exfilling accumulated ACMs in the layout
//! downstream calibration tools read: datasets `{prefix}data`
//! (`[cycle][frequency][row][col]`), plus `{prefix}count`, `{prefix}status` and
//! `skyFrequency` (`[cycle][frequency]`).

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use byte_slice_cast::AsByteSlice;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    acm::AcmAccumulator,
    complex::ComplexAcc,
    error::{CodifError, Result},
};

pub const DEFAULT_PREFIX: &str = "ACM";
/// Cross-correlation containers use this prefix instead
pub const CC_PREFIX: &str = "CC";
/// Integration counts at or below this are not trusted
pub const MIN_COUNT: u64 = 10;

pub const STATUS_OK: u8 = 0;
/// Set on entries zeroed because of a low integration count
pub const STATUS_LOW_COUNT: u8 = 1;

/// How channel numbers map onto the sky. The default yields plain channel
/// numbers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrequencyPlan {
    pub first_channel_mhz: f64,
    pub channel_width_mhz: f64,
}

impl Default for FrequencyPlan {
    fn default() -> Self {
        Self {
            first_channel_mhz: 0.0,
            channel_width_mhz: 1.0,
        }
    }
}

impl FrequencyPlan {
    pub fn sky_frequency(&self, channel: u32) -> f64 {
        self.first_channel_mhz + channel as f64 * self.channel_width_mhz
    }
}

/// One integration cycle of ACMs, one matrix per frequency
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcmCycle {
    /// `[frequency][row][col]`
    pub data: Vec<Vec<Vec<ComplexAcc>>>,
    pub count: Vec<u64>,
    pub status: Vec<u8>,
    pub sky_frequency: Vec<f64>,
}

impl AcmCycle {
    /// Flatten per-group accumulators into frequency order. Channel `c` of
    /// group `g` is sky channel `g + c`.
    pub fn from_accumulators(
        accumulators: &BTreeMap<u16, AcmAccumulator>,
        plan: &FrequencyPlan,
    ) -> Self {
        let mut cycle = Self::default();
        for (&group, acc) in accumulators {
            for (channel, matrix) in acc.matrices().iter().enumerate() {
                let rows = matrix.data().chunks(matrix.dim()).map(<[_]>::to_vec);
                cycle.data.push(rows.collect());
                cycle.count.push(acc.snapshot_count());
                cycle.status.push(STATUS_OK);
                cycle
                    .sky_frequency
                    .push(plan.sky_frequency(group as u32 + channel as u32));
            }
        }
        cycle
    }

    pub fn frequencies(&self) -> usize {
        self.data.len()
    }

    /// Divide every matrix by its integration count. Matrices with a bad status
    /// or a count of `min_count` or less are zeroed and flagged instead.
    pub fn normalized(&self, min_count: u64) -> Self {
        let mut out = self.clone();
        let entries = out.data.iter_mut().zip(&self.count).zip(&mut out.status);
        for ((matrix, &count), status) in entries {
            if *status == STATUS_OK && count > min_count {
                let scale = 1.0 / count as f64;
                matrix.iter_mut().flatten().for_each(|x| *x *= scale);
            } else {
                if *status == STATUS_OK {
                    *status = STATUS_LOW_COUNT;
                }
                matrix.iter_mut().flatten().for_each(|x| *x = ComplexAcc::default());
            }
        }
        let dropped = out.status.iter().filter(|&&s| s != STATUS_OK).count();
        if dropped > 0 {
            warn!(dropped, min_count, "Zeroed ACMs with bad status or low count");
        }
        out
    }

    fn check_shape(&self, index: usize) -> Result<()> {
        let n = self.frequencies();
        if self.count.len() != n || self.status.len() != n || self.sky_frequency.len() != n {
            return Err(CodifError::MalformedContainer(format!(
                "cycle {}: {} matrices but {} counts, {} statuses and {} frequencies",
                index,
                n,
                self.count.len(),
                self.status.len(),
                self.sky_frequency.len()
            )));
        }
        for matrix in &self.data {
            if matrix.iter().any(|row| row.len() != matrix.len()) {
                return Err(CodifError::MalformedContainer(format!(
                    "cycle {}: matrix with {} rows isn't square",
                    index,
                    matrix.len()
                )));
            }
        }
        Ok(())
    }
}

/// Every cycle of an ACM file, written out under one dataset prefix
#[derive(Clone, Debug, PartialEq)]
pub struct AcmContainer {
    pub prefix: String,
    pub cycles: Vec<AcmCycle>,
}

impl AcmContainer {
    pub fn new(cycles: Vec<AcmCycle>) -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_owned(),
            cycles,
        }
    }

    pub fn normalized(&self, min_count: u64) -> Self {
        Self {
            prefix: self.prefix.clone(),
            cycles: self.cycles.iter().map(|c| c.normalized(min_count)).collect(),
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        let per_cycle = |f: fn(&AcmCycle) -> serde_json::Result<Value>| -> Result<Value> {
            let cycles = self.cycles.iter().map(f).collect::<serde_json::Result<Vec<_>>>()?;
            Ok(Value::Array(cycles))
        };
        let mut map = Map::new();
        let data = per_cycle(|c| serde_json::to_value(&c.data))?;
        map.insert(format!("{}data", self.prefix), data);
        let count = per_cycle(|c| serde_json::to_value(&c.count))?;
        map.insert(format!("{}count", self.prefix), count);
        let status = per_cycle(|c| serde_json::to_value(&c.status))?;
        map.insert(format!("{}status", self.prefix), status);
        let sky_frequency = per_cycle(|c| serde_json::to_value(&c.sky_frequency))?;
        map.insert("skyFrequency".to_owned(), sky_frequency);
        Ok(Value::Object(map))
    }

    /// Read a container back, detecting its prefix from the count dataset
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| CodifError::MalformedContainer("not an object".to_owned()))?;
        let prefix = if map.contains_key(&format!("{}count", CC_PREFIX)) {
            CC_PREFIX
        } else {
            DEFAULT_PREFIX
        };
        let dataset = |name: String| {
            map.get(&name)
                .cloned()
                .ok_or_else(|| CodifError::MalformedContainer(format!("missing dataset {}", name)))
        };
        let data: Vec<Vec<Vec<Vec<ComplexAcc>>>> =
            serde_json::from_value(dataset(format!("{}data", prefix))?)?;
        let count: Vec<Vec<u64>> = serde_json::from_value(dataset(format!("{}count", prefix))?)?;
        let status: Vec<Vec<u8>> = serde_json::from_value(dataset(format!("{}status", prefix))?)?;
        let sky_frequency: Vec<Vec<f64>> =
            serde_json::from_value(dataset("skyFrequency".to_owned())?)?;
        let n = data.len();
        if count.len() != n || status.len() != n || sky_frequency.len() != n {
            return Err(CodifError::MalformedContainer(format!(
                "{} cycles of data but {} of counts, {} of statuses and {} of frequencies",
                n,
                count.len(),
                status.len(),
                sky_frequency.len()
            )));
        }
        let cycles: Vec<AcmCycle> = data
            .into_iter()
            .zip(count)
            .zip(status)
            .zip(sky_frequency)
            .map(|(((data, count), status), sky_frequency)| AcmCycle {
                data,
                count,
                status,
                sky_frequency,
            })
            .collect();
        for (i, cycle) in cycles.iter().enumerate() {
            cycle.check_shape(i)?;
        }
        Ok(Self {
            prefix: prefix.to_owned(),
            cycles,
        })
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(&mut writer, &self.to_json()?)?;
        writer.flush()?;
        info!(
            path = %path.as_ref().display(),
            cycles = self.cycles.len(),
            "Wrote ACM container"
        );
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let value: Value = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        Self::from_json(&value)
    }

    /// Dump the matrices as native-endian `f64` pairs,
    /// `[cycle][frequency][row][col]`
    pub fn write_raw<W: Write>(&self, writer: &mut W) -> Result<()> {
        let flat: Vec<f64> = self
            .cycles
            .iter()
            .flat_map(|c| c.data.iter().flatten().flatten())
            .flat_map(|x| [x.re, x.im])
            .collect();
        writer.write_all(flat.as_byte_slice())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acm::Integration, assembler::CompleteFrame, complex::ComplexSample, header::CodifHeader,
        packet::CodifPacket, payload::Payload, StreamConfig, CHANNELS,
    };

    const N: usize = 2;

    fn accumulator(group: u16, frames: usize) -> AcmAccumulator {
        let mut acc = AcmAccumulator::new(&StreamConfig::new(N), Integration::FirstSample);
        let packets: Vec<_> = (0..N as u16)
            .map(|beam_id| {
                let mut payload = Payload::zeroed();
                payload.set_sample(0, 0, 0, ComplexSample::new(2, 0));
                CodifPacket::new(
                    CodifHeader {
                        beam_id,
                        freq_group: group,
                        ..Default::default()
                    },
                    payload,
                )
            })
            .collect();
        let frame = CompleteFrame {
            epoch_seconds: 0,
            frame_number: 0,
            freq_group: group,
            packets,
        };
        for _ in 0..frames {
            acc.accumulate(&frame).unwrap();
        }
        acc
    }

    fn cycle() -> AcmCycle {
        let accs = BTreeMap::from([(7, accumulator(7, 20)), (0, accumulator(0, 3))]);
        AcmCycle::from_accumulators(&accs, &FrequencyPlan::default())
    }

    #[test]
    fn test_layout() {
        let cycle = cycle();
        assert_eq!(cycle.frequencies(), 2 * CHANNELS);
        assert_eq!(cycle.sky_frequency[0], 0.0);
        assert_eq!(cycle.sky_frequency[CHANNELS], 7.0);
        assert_eq!(cycle.count[0], 3);
        assert_eq!(cycle.count[CHANNELS], 20);
        assert_eq!(cycle.data[0].len(), 2 * N);
        assert_eq!(cycle.data[CHANNELS][0][1], ComplexAcc::new(80.0, 0.0));
    }

    #[test]
    fn test_normalized() {
        let norm = cycle().normalized(MIN_COUNT);
        assert_eq!(norm.data[CHANNELS][0][0], ComplexAcc::new(4.0, 0.0));
        assert_eq!(norm.status[CHANNELS], STATUS_OK);
        // Three integrations isn't enough
        assert_eq!(norm.data[0][0][0], ComplexAcc::new(0.0, 0.0));
        assert_eq!(norm.status[0], STATUS_LOW_COUNT);
    }

    fn container() -> AcmContainer {
        let mut later = cycle();
        later.count[0] = 32;
        AcmContainer::new(vec![cycle(), later])
    }

    #[test]
    fn test_json_cycle_axis() {
        let container = container();
        let value = container.to_json().unwrap();
        let data = value["ACMdata"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].as_array().unwrap().len(), 2 * CHANNELS);
        assert_eq!(value["ACMcount"][1][0], 32);
        assert_eq!(value["ACMstatus"][0].as_array().unwrap().len(), 2 * CHANNELS);
        assert_eq!(value["skyFrequency"][1][CHANNELS], 7.0);
        assert_eq!(AcmContainer::from_json(&value).unwrap(), container);
    }

    #[test]
    fn test_json_rejects_bad_shape() {
        assert!(AcmContainer::from_json(&serde_json::json!({ "ACMcount": [] })).is_err());
        let mut value = container().to_json().unwrap();
        // Counts indexed by frequency only, with no cycle axis
        value["ACMcount"] = serde_json::to_value(&cycle().count).unwrap();
        assert!(AcmContainer::from_json(&value).is_err());

        let mut value = container().to_json().unwrap();
        value["skyFrequency"].as_array_mut().unwrap().pop();
        assert!(matches!(
            AcmContainer::from_json(&value),
            Err(CodifError::MalformedContainer(_))
        ));

        let mut value = container().to_json().unwrap();
        value["ACMstatus"][1].as_array_mut().unwrap().pop();
        assert!(AcmContainer::from_json(&value).is_err());
    }

    #[test]
    fn test_cc_prefix() {
        let mut container = container();
        container.prefix = CC_PREFIX.to_owned();
        let value = container.to_json().unwrap();
        assert!(value.get("CCcount").is_some());
        assert_eq!(AcmContainer::from_json(&value).unwrap().prefix, CC_PREFIX);
    }

    #[test]
    fn test_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acm.json");
        let container = container();
        container.save_json(&path).unwrap();
        assert_eq!(AcmContainer::load_json(&path).unwrap(), container);

        let mut raw = vec![];
        container.write_raw(&mut raw).unwrap();
        assert_eq!(raw.len(), 2 * 2 * CHANNELS * (2 * N) * (2 * N) * 16);
    }

    #[test]
    fn test_container_normalized() {
        let norm = container().normalized(MIN_COUNT);
        assert_eq!(norm.cycles[0].status[0], STATUS_LOW_COUNT);
        // A sum over 3 frames, scaled by the count it claims
        assert_eq!(norm.cycles[1].status[0], STATUS_OK);
        assert_eq!(norm.cycles[1].data[0][0][0], ComplexAcc::new(12.0 / 32.0, 0.0));
    }
}
