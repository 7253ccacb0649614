use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::scan::SampleMap;
use crate::settings::Settings;


pub const SAMPLE_MAP_FILE: &str = "sample_map.txt";
pub const SUMMARY_FILE: &str = "summary.json";
pub const SETTINGS_FILE: &str = "settings.toml";

/// Writes one `x z loss_db` row per sample.
pub fn write_rows(map: &SampleMap, writer: impl Write) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    for (x, z, loss) in map.iter() {
        writeln!(writer, "{} {} {}", x, z, loss)?;
    }
    writer.flush()?;
    Ok(())
}

/// Parses rows written by [`write_rows`]. Blank lines and lines starting
/// with `#` are ignored.
pub fn parse_rows(reader: impl BufRead) -> Result<SampleMap> {
    let mut map = SampleMap::new();
    for (number, line) in reader.lines().enumerate() {
        let number = number + 1;
        let line = line.with_context(|| format!("reading line {}", number))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let values: Vec<f32> = line
            .split_whitespace()
            .map(|field| field.parse::<f32>())
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("malformed sample on line {}: '{}'", number, line))?;
        let [x, z, loss] = values[..] else {
            return Err(anyhow!(
                "expected 3 values on line {}, found {}",
                number,
                values.len()
            ));
        };
        map.insert(x, z, loss);
    }
    Ok(map)
}

pub fn write_sample_map(map: &SampleMap, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_rows(map, file)
}

pub fn read_sample_map(path: impl AsRef<Path>) -> Result<SampleMap> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    parse_rows(BufReader::new(file)).with_context(|| format!("parsing {}", path.display()))
}

/// Headline numbers of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub timestamp: String,
    pub frequency: f32,
    pub resolution: f32,
    pub cells: usize,
    pub reachable: usize,
    pub mean_loss_db: Option<f32>,
    pub min_loss_db: Option<f32>,
    pub max_loss_db: Option<f32>,
    pub duration_secs: f64,
}

impl ScanSummary {
    pub fn new(map: &SampleMap, resolution: f32, frequency: f32, duration: Duration) -> Self {
        let reachable: Vec<f32> = map.reachable().collect();
        let mean_loss_db = (!reachable.is_empty())
            .then(|| reachable.iter().sum::<f32>() / reachable.len() as f32);

        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            frequency,
            resolution,
            cells: map.len(),
            reachable: reachable.len(),
            mean_loss_db,
            min_loss_db: reachable.iter().copied().reduce(f32::min),
            max_loss_db: reachable.iter().copied().reduce(f32::max),
            duration_secs: duration.as_secs_f64(),
        }
    }
}

pub fn write_summary(summary: &ScanSummary, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

pub fn write_settings(settings: &Settings, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = toml::to_string(settings)?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

/// Writes the sample map, the summary and the settings used into `directory`,
/// creating it if needed.
pub fn write_outputs(
    directory: impl AsRef<Path>,
    map: &SampleMap,
    summary: &ScanSummary,
    settings: &Settings,
) -> Result<()> {
    let directory = directory.as_ref();
    fs::create_dir_all(directory)
        .with_context(|| format!("creating output directory {}", directory.display()))?;

    write_sample_map(map, directory.join(SAMPLE_MAP_FILE))?;
    write_summary(summary, directory.join(SUMMARY_FILE))?;
    write_settings(settings, directory.join(SETTINGS_FILE))?;

    log::info!("results written to {}", directory.display());
    Ok(())
}
