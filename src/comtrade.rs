//! IEEE C37.111 (COMTRADE) recording reader.
//!
//! Parses the `.cfg` text header (1991/1999/2013 revisions) and the `.dat`
//! payload in ASCII, 16-bit binary or 32-bit binary form. Analog values are
//! converted to engineering-unit primary values on load:
//! `eng = (a * raw + b) * (primary / secondary)` when `secondary != 0`.
//!
//! Binary records are read little-endian; the format keyword does not
//! declare a byte order, and little-endian is what recording tools produce.

use crate::error::SessionError;
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Ascii,
    Binary16,
    Binary32,
}

#[derive(Debug, Clone)]
pub struct AnalogChannel {
    /// 0-based in memory; the file numbers channels from 1.
    pub index: usize,
    pub name: String,
    pub phase: String,
    pub units: String,
    pub a: f64,
    pub b: f64,
    pub skew: f64,
    pub min: f64,
    pub max: f64,
    pub primary: f64,
    pub secondary: f64,
    pub ps: char,
}

impl AnalogChannel {
    /// Raw sample to engineering-unit primary value.
    pub fn engineering(&self, raw: f64) -> f64 {
        let secondary_value = self.a * raw + self.b;
        if self.secondary != 0.0 {
            secondary_value * (self.primary / self.secondary)
        } else {
            secondary_value
        }
    }
}

#[derive(Debug, Clone)]
pub struct DigitalChannel {
    pub index: usize,
    pub name: String,
    pub normal_state: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct RateSegment {
    pub rate: f64,
    pub end_sample: usize,
}

#[derive(Debug, Clone)]
pub struct ComtradeConfig {
    pub station_name: String,
    pub rec_device_id: String,
    pub revision_year: i32,
    pub total_channels: usize,
    pub num_analog: usize,
    pub num_digital: usize,
    pub analog: Vec<AnalogChannel>,
    pub digital: Vec<DigitalChannel>,
    pub line_freq: f64,
    pub segments: Vec<RateSegment>,
    pub start_date: String,
    pub start_time: String,
    pub trigger_date: String,
    pub trigger_time: String,
    pub format: DataFormat,
    pub time_factor: f64,
    pub total_samples: usize,
}

#[derive(Debug, Clone)]
pub struct ComtradeSample {
    pub number: u32,
    /// Microseconds since recording start: `raw_time * time_factor * 1e6`.
    pub timestamp_us: u64,
    pub analog: Vec<f64>,
    pub digital: Vec<bool>,
}

#[derive(Debug)]
pub struct ComtradeRecording {
    config: ComtradeConfig,
    samples: Vec<ComtradeSample>,
}

fn file_err(what: &str, path: &Path, err: impl std::fmt::Display) -> SessionError {
    SessionError::File(format!("{} {}: {}", what, path.display(), err))
}

fn split_line(line: &str) -> Vec<String> {
    line.split(',').map(|t| t.trim().to_string()).collect()
}

fn parse_num<T: std::str::FromStr>(token: &str, what: &str) -> Result<T, SessionError> {
    token
        .parse::<T>()
        .map_err(|_| SessionError::File(format!("invalid {} '{}'", what, token)))
}

/// Channel counts may carry a trailing A/D type letter ("16A", "4D").
fn parse_channel_count(token: &str) -> Result<usize, SessionError> {
    let digits = token.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    parse_num(digits, "channel count")
}

impl ComtradeRecording {
    /// Load a recording. When `dat_path` is absent it is derived from the
    /// `.cfg` path by extension substitution.
    pub fn load(cfg_path: &Path, dat_path: Option<&Path>) -> Result<ComtradeRecording, SessionError> {
        let config = parse_cfg(cfg_path)?;

        let derived: PathBuf;
        let dat = match dat_path {
            Some(p) => p,
            None => {
                derived = cfg_path.with_extension("dat");
                &derived
            }
        };

        let samples = match config.format {
            DataFormat::Ascii => parse_dat_ascii(dat, &config)?,
            DataFormat::Binary16 => parse_dat_binary(dat, &config, false)?,
            DataFormat::Binary32 => parse_dat_binary(dat, &config, true)?,
        };

        let mut config = config;
        config.total_samples = samples.len();
        Ok(ComtradeRecording { config, samples })
    }

    pub fn config(&self) -> &ComtradeConfig {
        &self.config
    }

    pub fn samples(&self) -> &[ComtradeSample] {
        &self.samples
    }

    /// Rate of the first segment whose end sample exceeds `sample_index`,
    /// falling back to the last segment.
    pub fn sample_rate_at(&self, sample_index: usize) -> f64 {
        for segment in &self.config.segments {
            if sample_index < segment.end_sample {
                return segment.rate;
            }
        }
        self.config.segments.last().map_or(0.0, |s| s.rate)
    }

    pub fn analog_channel(&self, name: &str) -> Option<&AnalogChannel> {
        self.config.analog.iter().find(|c| c.name == name)
    }

    /// The engineering-unit series of one analog channel across all samples.
    pub fn analog_series(&self, channel_index: usize) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.analog.get(channel_index).copied().unwrap_or(0.0))
            .collect()
    }
}

fn parse_cfg(path: &Path) -> Result<ComtradeConfig, SessionError> {
    let file = File::open(path).map_err(|e| file_err("failed to open .cfg file", path, e))?;
    let mut lines = BufReader::new(file).lines();
    let mut next_line = |what: &str| -> Result<String, SessionError> {
        match lines.next() {
            Some(Ok(line)) => Ok(line),
            Some(Err(e)) => Err(file_err("failed to read .cfg file", path, e)),
            None => Err(SessionError::File(format!("missing {} line in .cfg", what))),
        }
    };

    // Station name, recording device, optional revision year.
    let tokens = split_line(&next_line("station")?);
    if tokens.len() < 2 {
        return Err(SessionError::File("invalid station line in .cfg".into()));
    }
    let station_name = tokens[0].clone();
    let rec_device_id = tokens[1].clone();
    let revision_year = if tokens.len() >= 3 && !tokens[2].is_empty() {
        parse_num(&tokens[2], "revision year")?
    } else {
        1991
    };

    // Channel counts.
    let tokens = split_line(&next_line("channel count")?);
    if tokens.len() < 3 {
        return Err(SessionError::File("invalid channel count line in .cfg".into()));
    }
    let total_channels: usize = parse_num(&tokens[0], "total channel count")?;
    let num_analog = parse_channel_count(&tokens[1])?;
    let num_digital = parse_channel_count(&tokens[2])?;

    let mut analog = Vec::with_capacity(num_analog);
    for _ in 0..num_analog {
        analog.push(parse_analog_line(&next_line("analog channel")?)?);
    }

    let mut digital = Vec::with_capacity(num_digital);
    for _ in 0..num_digital {
        digital.push(parse_digital_line(&next_line("digital channel")?)?);
    }

    let line_freq: f64 = parse_num(next_line("line frequency")?.trim(), "line frequency")?;

    let num_segments: usize = parse_num(next_line("sample rate count")?.trim(), "sample rate count")?;
    let mut segments = Vec::with_capacity(num_segments);
    for _ in 0..num_segments {
        let tokens = split_line(&next_line("sample rate")?);
        if tokens.len() >= 2 {
            segments.push(RateSegment {
                rate: parse_num(&tokens[0], "sample rate")?,
                end_sample: parse_num(&tokens[1], "end sample")?,
            });
        }
    }

    // Start and trigger timestamps are retained verbatim.
    let tokens = split_line(&next_line("start time")?);
    let (start_date, start_time) = match tokens.len() {
        0 => (String::new(), String::new()),
        1 => (tokens[0].clone(), String::new()),
        _ => (tokens[0].clone(), tokens[1].clone()),
    };
    let tokens = split_line(&next_line("trigger time")?);
    let (trigger_date, trigger_time) = match tokens.len() {
        0 => (String::new(), String::new()),
        1 => (tokens[0].clone(), String::new()),
        _ => (tokens[0].clone(), tokens[1].clone()),
    };

    let format = match next_line("data format")?.trim() {
        "ASCII" | "ascii" => DataFormat::Ascii,
        "BINARY" | "binary" => DataFormat::Binary16,
        "BINARY32" | "binary32" => DataFormat::Binary32,
        other => {
            return Err(SessionError::File(format!("unknown data format: {}", other)));
        }
    };

    // Optional time multiplication factor.
    let time_factor = match lines.next() {
        Some(Ok(line)) if !line.trim().is_empty() => parse_num(line.trim(), "time factor")?,
        _ => 1.0,
    };

    Ok(ComtradeConfig {
        station_name,
        rec_device_id,
        revision_year,
        total_channels,
        num_analog,
        num_digital,
        analog,
        digital,
        line_freq,
        segments,
        start_date,
        start_time,
        trigger_date,
        trigger_time,
        format,
        time_factor,
        total_samples: 0,
    })
}

fn parse_analog_line(line: &str) -> Result<AnalogChannel, SessionError> {
    let tokens = split_line(line);
    if tokens.len() < 13 {
        return Err(SessionError::File(format!("invalid analog channel line: {}", line)));
    }
    let index_1based: usize = parse_num(&tokens[0], "analog channel index")?;
    Ok(AnalogChannel {
        index: index_1based.saturating_sub(1),
        name: tokens[1].clone(),
        phase: tokens[2].clone(),
        units: tokens[4].clone(),
        a: parse_num(&tokens[5], "scaling factor a")?,
        b: parse_num(&tokens[6], "scaling offset b")?,
        skew: parse_num(&tokens[7], "skew")?,
        min: parse_num(&tokens[8], "min")?,
        max: parse_num(&tokens[9], "max")?,
        primary: parse_num(&tokens[10], "primary factor")?,
        secondary: parse_num(&tokens[11], "secondary factor")?,
        ps: tokens[12].chars().next().unwrap_or('P'),
    })
}

fn parse_digital_line(line: &str) -> Result<DigitalChannel, SessionError> {
    let tokens = split_line(line);
    if tokens.len() < 5 {
        return Err(SessionError::File(format!("invalid digital channel line: {}", line)));
    }
    let index_1based: usize = parse_num(&tokens[0], "digital channel index")?;
    Ok(DigitalChannel {
        index: index_1based.saturating_sub(1),
        name: tokens[1].clone(),
        normal_state: parse_num(&tokens[4], "normal state")?,
    })
}

/// One record per line: `sample#, time, A1..An, D1..Dm`. Digitals are
/// standalone 0/1 tokens. Malformed records are skipped, not fatal.
fn parse_dat_ascii(path: &Path, config: &ComtradeConfig) -> Result<Vec<ComtradeSample>, SessionError> {
    let file = File::open(path).map_err(|e| file_err("failed to open .dat file", path, e))?;
    let expected_tokens = 2 + config.num_analog + config.num_digital;
    let mut samples = Vec::new();

    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| file_err("failed to read .dat file", path, e))?;
        let tokens = split_line(&line);
        if tokens.len() < expected_tokens {
            continue;
        }
        if let Some(sample) = parse_ascii_record(&tokens, config) {
            samples.push(sample);
        }
    }
    Ok(samples)
}

fn parse_ascii_record(tokens: &[String], config: &ComtradeConfig) -> Option<ComtradeSample> {
    let number: u32 = tokens[0].parse().ok()?;
    let time_sec: f64 = tokens[1].parse().ok()?;
    let timestamp_us = (time_sec * config.time_factor * 1e6) as u64;

    let mut analog = Vec::with_capacity(config.num_analog);
    for (i, channel) in config.analog.iter().enumerate() {
        let raw: f64 = tokens[2 + i].parse().ok()?;
        analog.push(channel.engineering(raw));
    }

    let mut digital = Vec::with_capacity(config.num_digital);
    for i in 0..config.num_digital {
        let value: i32 = tokens[2 + config.num_analog + i].parse().ok()?;
        digital.push(value != 0);
    }

    Some(ComtradeSample {
        number,
        timestamp_us,
        analog,
        digital,
    })
}

/// Binary records: `u32 sample | u32 time | intN[analog] | digital words`,
/// all little-endian. Digital bits are packed LSB-first per word. A file
/// ending mid-record terminates parsing normally.
fn parse_dat_binary(
    path: &Path,
    config: &ComtradeConfig,
    wide: bool,
) -> Result<Vec<ComtradeSample>, SessionError> {
    let file = File::open(path).map_err(|e| file_err("failed to open .dat file", path, e))?;
    let mut reader = BufReader::new(file);

    let (analog_size, word_bits) = if wide { (4, 32) } else { (2, 16) };
    let digital_words = config.num_digital.div_ceil(word_bits);
    let record_size = 8 + config.num_analog * analog_size + digital_words * (word_bits / 8);

    let mut record = vec![0u8; record_size];
    let mut samples = Vec::new();

    loop {
        match reader.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(file_err("failed to read .dat file", path, e)),
        }

        let number = LittleEndian::read_u32(&record[0..4]);
        let raw_time = LittleEndian::read_u32(&record[4..8]);
        let timestamp_us = (f64::from(raw_time) * config.time_factor * 1e6) as u64;

        let mut analog = Vec::with_capacity(config.num_analog);
        for (i, channel) in config.analog.iter().enumerate() {
            let off = 8 + i * analog_size;
            let raw = if wide {
                f64::from(LittleEndian::read_i32(&record[off..off + 4]))
            } else {
                f64::from(LittleEndian::read_i16(&record[off..off + 2]))
            };
            analog.push(channel.engineering(raw));
        }

        let digital_off = 8 + config.num_analog * analog_size;
        let mut digital = Vec::with_capacity(config.num_digital);
        for w in 0..digital_words {
            let off = digital_off + w * (word_bits / 8);
            let word = if wide {
                LittleEndian::read_u32(&record[off..off + 4])
            } else {
                u32::from(LittleEndian::read_u16(&record[off..off + 2]))
            };
            for bit in 0..word_bits {
                if w * word_bits + bit >= config.num_digital {
                    break;
                }
                digital.push(word & (1 << bit) != 0);
            }
        }

        samples.push(ComtradeSample {
            number,
            timestamp_us,
            analog,
            digital,
        });
    }
    Ok(samples)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_files(dir: &Path, cfg: &str, dat: &[u8]) -> PathBuf {
        let cfg_path = dir.join("case.cfg");
        std::fs::write(&cfg_path, cfg).unwrap();
        let mut f = File::create(dir.join("case.dat")).unwrap();
        f.write_all(dat).unwrap();
        cfg_path
    }

    const ASCII_CFG: &str = "\
STATION A,DEV1,1999
3,2A,1D
1,IA,A,,A,1.0,0.0,0.0,-32768,32767,1,1,P
2,VA,A,,kV,2.0,10.0,0.0,-32768,32767,400,100,S
1,BRK,A,,1
60
1
4800,4
01/01/2024,00:00:00.000000
01/01/2024,00:00:00.100000
ASCII
1.0
";

    #[test]
    fn test_ascii_load_and_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let dat = "\
1,0,100,5,0
2,0.000208,200,6,1
3,0.000417,-300,7,0
4,0.000625,400,8,1
";
        let cfg_path = write_files(dir.path(), ASCII_CFG, dat.as_bytes());
        let rec = ComtradeRecording::load(&cfg_path, None).unwrap();

        let cfg = rec.config();
        assert_eq!(cfg.station_name, "STATION A");
        assert_eq!(cfg.revision_year, 1999);
        assert_eq!(cfg.num_analog, 2);
        assert_eq!(cfg.num_digital, 1);
        assert_eq!(cfg.line_freq, 60.0);
        assert_eq!(cfg.format, DataFormat::Ascii);
        assert_eq!(cfg.total_samples, 4);

        // Identity channel: a=1, b=0, primary=secondary=1.
        let ia = rec.analog_series(0);
        assert_eq!(ia, vec![100.0, 200.0, -300.0, 400.0]);

        // Scaled channel: (2*raw + 10) * 400/100.
        let va = rec.analog_series(1);
        assert_eq!(va[0], (2.0 * 5.0 + 10.0) * 4.0);

        assert_eq!(rec.samples()[1].digital, vec![true]);
        assert_eq!(rec.samples()[0].timestamp_us, 0);
        let us = rec.samples()[1].timestamp_us as i64;
        assert!((us - 208).abs() <= 1, "timestamp_us = {}", us);
    }

    #[test]
    fn test_ascii_skips_malformed_records() {
        let dir = tempfile::tempdir().unwrap();
        let dat = "\
1,0,100,5,0
garbage line
2,0.000208,not-a-number,6,1
3,0.000417,300,7,0
";
        let cfg_path = write_files(dir.path(), ASCII_CFG, dat.as_bytes());
        let rec = ComtradeRecording::load(&cfg_path, None).unwrap();
        assert_eq!(rec.config().total_samples, 2);
        assert_eq!(rec.samples()[1].number, 3);
    }

    #[test]
    fn test_channel_lookup_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = write_files(dir.path(), ASCII_CFG, b"1,0,1,1,0\n");
        let rec = ComtradeRecording::load(&cfg_path, None).unwrap();

        let va = rec.analog_channel("VA").unwrap();
        assert_eq!(va.index, 1);
        assert_eq!(va.units, "kV");
        assert_eq!(va.ps, 'S');
        assert!(rec.analog_channel("VB").is_none());
    }

    #[test]
    fn test_sample_rate_segments() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = "\
S,D,2013
1,1A,0D
1,IA,A,,A,1.0,0.0,0.0,-1,1,1,1,P
60
2
960,10
4800,30
01/01/2024,00:00:00.000000
01/01/2024,00:00:00.000000
ASCII
";
        let cfg_path = write_files(dir.path(), cfg, b"1,0,0\n");
        let rec = ComtradeRecording::load(&cfg_path, None).unwrap();
        assert_eq!(rec.sample_rate_at(0), 960.0);
        assert_eq!(rec.sample_rate_at(9), 960.0);
        assert_eq!(rec.sample_rate_at(10), 4800.0);
        // Past the last declared segment: fall back to the last rate.
        assert_eq!(rec.sample_rate_at(100), 4800.0);
    }

    #[test]
    fn test_missing_time_factor_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = "\
S,D
1,1A,0D
1,IA,A,,A,1.0,0.0,0.0,-1,1,1,1,P
60
1
4800,1
01/01/2024,00:00:00.000000
01/01/2024,00:00:00.000000
ASCII
";
        let cfg_path = write_files(dir.path(), cfg, b"1,0,0\n");
        let rec = ComtradeRecording::load(&cfg_path, None).unwrap();
        assert_eq!(rec.config().revision_year, 1991);
        assert_eq!(rec.config().time_factor, 1.0);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ASCII_CFG.replace("ASCII", "FLOAT32");
        let cfg_path = write_files(dir.path(), &cfg, b"");
        let err = ComtradeRecording::load(&cfg_path, None).unwrap_err();
        assert!(err.to_string().contains("unknown data format"));
    }

    #[test]
    fn test_missing_cfg_file() {
        let err = ComtradeRecording::load(Path::new("/nonexistent/x.cfg"), None).unwrap_err();
        assert!(matches!(err, SessionError::File(_)));
    }

    const BINARY_CFG: &str = "\
S,D,1999
4,2A,2D
1,IA,A,,A,1.0,0.0,0.0,-32768,32767,1,1,P
2,IB,B,,A,1.0,0.0,0.0,-32768,32767,1,1,P
1,D1,A,,0
2,D2,A,,1
60
1
4800,2
01/01/2024,00:00:00.000000
01/01/2024,00:00:00.000000
BINARY
1.0
";

    #[test]
    fn test_binary16_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut dat = Vec::new();
        // Record 1: sample 1, time 0, analogs 100/-200, digitals D1=1, D2=0.
        dat.extend_from_slice(&1u32.to_le_bytes());
        dat.extend_from_slice(&0u32.to_le_bytes());
        dat.extend_from_slice(&100i16.to_le_bytes());
        dat.extend_from_slice(&(-200i16).to_le_bytes());
        dat.extend_from_slice(&0b01u16.to_le_bytes());
        // Record 2: sample 2, time 208, analogs 300/400, digitals D1=0, D2=1.
        dat.extend_from_slice(&2u32.to_le_bytes());
        dat.extend_from_slice(&208u32.to_le_bytes());
        dat.extend_from_slice(&300i16.to_le_bytes());
        dat.extend_from_slice(&400i16.to_le_bytes());
        dat.extend_from_slice(&0b10u16.to_le_bytes());
        // Trailing partial record is discarded.
        dat.extend_from_slice(&[0xAB, 0xCD]);

        let cfg_path = write_files(dir.path(), BINARY_CFG, &dat);
        let rec = ComtradeRecording::load(&cfg_path, None).unwrap();

        assert_eq!(rec.config().total_samples, 2);
        assert_eq!(rec.samples()[0].analog, vec![100.0, -200.0]);
        assert_eq!(rec.samples()[0].digital, vec![true, false]);
        assert_eq!(rec.samples()[1].analog, vec![300.0, 400.0]);
        assert_eq!(rec.samples()[1].digital, vec![false, true]);
        assert_eq!(rec.samples()[1].timestamp_us, 208_000_000);
    }

    #[test]
    fn test_binary32_records() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BINARY_CFG.replace("BINARY", "BINARY32");
        let mut dat = Vec::new();
        dat.extend_from_slice(&1u32.to_le_bytes());
        dat.extend_from_slice(&0u32.to_le_bytes());
        dat.extend_from_slice(&70_000i32.to_le_bytes());
        dat.extend_from_slice(&(-70_000i32).to_le_bytes());
        dat.extend_from_slice(&0b11u32.to_le_bytes());

        let cfg_path = write_files(dir.path(), &cfg, &dat);
        let rec = ComtradeRecording::load(&cfg_path, None).unwrap();

        assert_eq!(rec.config().total_samples, 1);
        assert_eq!(rec.samples()[0].analog, vec![70_000.0, -70_000.0]);
        assert_eq!(rec.samples()[0].digital, vec![true, true]);
    }

    #[test]
    fn test_explicit_dat_path() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("case.cfg");
        std::fs::write(&cfg_path, ASCII_CFG).unwrap();
        let dat_path = dir.path().join("other.dat");
        std::fs::write(&dat_path, "1,0,7,0,0\n").unwrap();

        let rec = ComtradeRecording::load(&cfg_path, Some(&dat_path)).unwrap();
        assert_eq!(rec.analog_series(0), vec![7.0]);
    }
}
