use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;


/// Speed of light in vacuum, in metres per second.
pub const SPEED_OF_LIGHT: f32 = 299_792_458.0;
/// Nodes holding more triangles than this are split.
pub const SPLIT_THRESHOLD: usize = 128;
/// Maximum depth of the spatial index.
pub const MAX_TREE_DEPTH: usize = 8;
/// Padding added to node bounding boxes so box and triangle tests agree at the boundary.
pub const BOUNDS_PADDING: f32 = 1e-4;
/// Intersections closer than this along a ray are ignored.
pub const RAYCAST_MINIMUM_DISTANCE: f32 = 1e-5;
/// Denominators smaller than this are treated as a ray parallel to the triangle.
pub const PARALLEL_EPSILON: f32 = 1e-8;
/// Offset past a reflecting triangle so the reflection point does not re-hit it.
pub const REFLECTION_EPSILON: f32 = 1e-3;
/// Meshes with more triangles than this get a silhouette pre-filter for reflections.
pub const SILHOUETTE_THRESHOLD: usize = 512;
/// Angular step of the silhouette scan, in degrees.
pub const SILHOUETTE_STEP_DEG: f32 = 1.0;
/// Maximum number of edge-pair iterations in the diffraction search.
pub const DIFFRACTION_MAX_ITERATIONS: usize = 5;
/// Angular step of the rotary edge scan, in degrees.
pub const EDGE_SCAN_STEP_DEG: f32 = 0.5;
/// Bisection passes used to refine the edge between the last hit and the first miss.
pub const EDGE_REFINE_PASSES: usize = 12;
/// Height added above the grazing hit so the edge point clears the obstruction.
pub const EDGE_CLEARANCE: f32 = 1e-2;
/// Tolerance when testing a hit against the horizontal rectangle of the endpoints.
pub const EDGE_RECT_TOLERANCE: f32 = 1e-3;
/// Edges from both ends closer than this are merged into one.
pub const EDGE_MERGE_DISTANCE: f32 = 0.5;
/// Edges closer than this are considered duplicates and averaged.
pub const EDGE_DEDUP_DISTANCE: f32 = 0.1;
/// Relative permittivity of air.
pub const AIR_PERMITTIVITY: f32 = 1.0003;
/// Relative permittivity of the reflecting material.
pub const MATERIAL_PERMITTIVITY: f32 = 5.31;
/// Fraction of reflected power kept to account for imperfect specularity.
pub const SPECULAR_FRACTION: f32 = 0.8;
/// Value stored in a sample map for points no receiver could reach.
pub const UNREACHABLE_LOSS_DB: f32 = -200.0;
/// Sample map keys are rounded to this many steps per unit length.
pub const KEY_PRECISION: f32 = 1e3;
/// Cells handed to the worker pool per batch, as a multiple of the pool size.
pub const BATCH_FACTOR: usize = 4;

/// Polarization used when computing the Fresnel reflection coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Polarization {
    /// Electric field perpendicular to the plane of incidence (TE).
    #[default]
    Perpendicular,
    /// Electric field parallel to the plane of incidence (TM).
    Parallel,
}

/// Runtime configuration for the application.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    pub scene: String,
    pub frequency: f32,
    pub resolution: f32,
    pub transmitter: [f32; 3],
    #[serde(default)]
    pub receivers: Vec<[f32; 3]>,
    #[serde(default)]
    pub polarization: Polarization,
    #[serde(default = "default_air_permittivity")]
    pub air_permittivity: f32,
    #[serde(default = "default_material_permittivity")]
    pub material_permittivity: f32,
    #[serde(default = "default_specular_fraction")]
    pub specular_fraction: f32,
    #[serde(default = "default_pool_factor")]
    pub pool_factor: usize,
    #[serde(default = "default_directory")]
    pub directory: String,
}

fn default_air_permittivity() -> f32 {
    AIR_PERMITTIVITY
}

fn default_material_permittivity() -> f32 {
    MATERIAL_PERMITTIVITY
}

fn default_specular_fraction() -> f32 {
    SPECULAR_FRACTION
}

fn default_pool_factor() -> usize {
    2
}

fn default_directory() -> String {
    "output".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scene: String::new(),
            frequency: 2.4e9,
            resolution: 1.0,
            transmitter: [0.0, 1.5, 0.0],
            receivers: Vec::new(),
            polarization: Polarization::default(),
            air_permittivity: AIR_PERMITTIVITY,
            material_permittivity: MATERIAL_PERMITTIVITY,
            specular_fraction: SPECULAR_FRACTION,
            pool_factor: default_pool_factor(),
            directory: default_directory(),
        }
    }
}

impl Settings {
    /// Free-space wavelength of the configured carrier.
    pub fn wavelength(&self) -> f32 {
        SPEED_OF_LIGHT / self.frequency
    }

    /// Location of the scene file. Relative paths are taken from the
    /// directory holding `config/`, not the working directory.
    pub fn scene_path(&self) -> Result<PathBuf> {
        let path = PathBuf::from(&self.scene);
        if path.as_os_str().is_empty() {
            return Err(anyhow!("no scene configured"));
        }
        if path.is_absolute() {
            return Ok(path);
        }
        Ok(retrieve_project_root()?.join(path))
    }
}

/// Loads `config/default.toml` without consulting the environment or the command line.
pub fn load_default_config() -> Result<Settings> {
    let root = retrieve_project_root()?;
    let default_config_file = root.join("config/default.toml");

    let settings = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .build()
        .context("loading default configuration")?;

    let config: Settings = settings
        .try_deserialize()
        .context("deserializing default configuration")?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads the configuration file, applies `RFPROP_*` environment variables, then
/// command-line overrides.
pub fn load_config() -> Result<Settings> {
    let root = retrieve_project_root()?;

    let default_config_file = root.join("config/default.toml");
    let local_config = root.join("config/local.toml");

    let config_file = if local_config.exists() {
        log::info!("using local configuration: {:?}", local_config);
        local_config
    } else {
        log::info!("using default configuration: {:?}", default_config_file);
        default_config_file
    };

    let settings = Config::builder()
        .add_source(File::from(config_file).required(true))
        .add_source(Environment::with_prefix("rfprop"))
        .build()
        .context("loading configuration")?;

    let mut config: Settings = settings
        .try_deserialize()
        .context("deserializing configuration")?;

    let args = CliArgs::parse();

    if let Some(scene) = args.scene {
        config.scene = scene;
    }
    if let Some(frequency) = args.frequency {
        config.frequency = frequency;
    }
    if let Some(resolution) = args.resolution {
        config.resolution = resolution;
    }
    if let Some(tx) = args.tx {
        config.transmitter = tx;
    }
    if let Some(rx) = args.rx {
        config.receivers = rx;
    }
    if let Some(polarization) = args.polarization {
        config.polarization = polarization;
    }
    if let Some(material) = args.material {
        config.material_permittivity = material;
    }
    if let Some(pool) = args.pool {
        config.pool_factor = pool;
    }
    if let Some(directory) = args.directory {
        config.directory = directory;
    }

    validate_config(&config)?;

    log::debug!("{:#?}", config);

    Ok(config)
}

/// Finds the directory holding `config/`.
///
/// Looks at `CARGO_MANIFEST_DIR`, then `RFPROP_ROOT_DIR`, then walks up from
/// the executable until a `config` subdirectory appears.
fn retrieve_project_root() -> Result<PathBuf> {
    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        return Ok(PathBuf::from(manifest_dir));
    }
    if let Ok(path) = env::var("RFPROP_ROOT_DIR") {
        return Ok(PathBuf::from(path));
    }

    let exe_path = env::current_exe().context("locating current executable")?;
    let mut current = exe_path.parent();
    while let Some(dir) = current {
        if dir.join("config").is_dir() {
            return Ok(dir.to_path_buf());
        }
        current = dir.parent();
    }

    Err(anyhow!("could not find a directory containing config/"))
}

pub fn validate_config(config: &Settings) -> Result<()> {
    if !(config.frequency > 0.0) {
        return Err(anyhow!("frequency must be greater than 0"));
    }
    if !(config.resolution > 0.0) {
        return Err(anyhow!("resolution must be greater than 0"));
    }
    if config.pool_factor == 0 {
        return Err(anyhow!("pool factor must be at least 1"));
    }
    if !(0.0..=1.0).contains(&config.specular_fraction) {
        return Err(anyhow!("specular fraction must lie in [0, 1]"));
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(version, about = "rfprop - ray-traced radio propagation loss")]
pub struct CliArgs {
    /// Path to the Wavefront .obj scene.
    #[arg(short, long)]
    scene: Option<String>,

    /// Carrier frequency in Hz.
    #[arg(short, long)]
    frequency: Option<f32>,

    /// Spacing of the scan grid in scene units.
    #[arg(short, long)]
    resolution: Option<f32>,

    /// Transmitter position, format: x,y,z
    #[arg(long, value_parser = parse_position, allow_hyphen_values = true)]
    tx: Option<[f32; 3]>,

    /// Receiver positions separated by spaces, format: x1,y1,z1 x2,y2,z2 ...
    #[arg(long, value_parser = parse_position, num_args = 1.., value_delimiter = ' ', allow_hyphen_values = true)]
    rx: Option<Vec<[f32; 3]>>,

    /// Polarization used for the reflection coefficient.
    #[arg(long, value_enum)]
    polarization: Option<Polarization>,

    /// Relative permittivity of reflecting surfaces.
    #[arg(long)]
    material: Option<f32>,

    /// Worker pool size as a multiple of the available parallelism.
    #[arg(long)]
    pool: Option<usize>,

    /// Output directory.
    #[arg(short, long)]
    directory: Option<String>,
}

/// Parse a position in the format "x,y,z"
fn parse_position(s: &str) -> Result<[f32; 3], String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("Invalid position: '{}'. Expected 'x,y,z'", s));
    }

    let mut position = [0.0; 3];
    for (slot, part) in position.iter_mut().zip(parts) {
        *slot = part
            .trim()
            .parse::<f32>()
            .map_err(|_| format!("Failed to parse coordinate: {}", part))?;
    }

    Ok(position)
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings:
  - Scene: {}
  - Frequency: {:.3e} Hz
  - Resolution: {:.3}
  - Transmitter: {:?}
  - Receivers: {}
  - Polarization: {:?}
  - Permittivity (air/material): {:.4} / {:.4}
  - Pool Factor: {}
  ",
            self.scene,
            self.frequency,
            self.resolution,
            self.transmitter,
            self.receivers.len(),
            self.polarization,
            self.air_permittivity,
            self.material_permittivity,
            self.pool_factor,
        )
    }
}
