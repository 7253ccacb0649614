//! Average-loss maps over a horizontal grid of transmitter positions.
//!
//! Each grid cell centre is treated as a hypothetical transmitter location at
//! the transmitter's height. Cells are independent and are evaluated in
//! batches on a fixed-size worker pool; every finished cell inserts one value
//! into the shared map.

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::Point3;
use ndarray::Array1;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use crate::antenna::{Receiver, Transmitter};
use crate::geom::Aabb;
use crate::loss::LossModel;
use crate::settings::{BATCH_FACTOR, KEY_PRECISION, UNREACHABLE_LOSS_DB};
use crate::trace::Tracer;


/// Rectangle in the horizontal x/z plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Area {
    pub x_min: f32,
    pub x_max: f32,
    pub z_min: f32,
    pub z_max: f32,
}

impl Area {
    pub fn new(x0: f32, x1: f32, z0: f32, z1: f32) -> Self {
        Self {
            x_min: x0.min(x1),
            x_max: x0.max(x1),
            z_min: z0.min(z1),
            z_max: z0.max(z1),
        }
    }

    /// Horizontal footprint of a bounding box.
    pub fn from_bounds(bounds: &Aabb) -> Self {
        Self::new(bounds.min.x, bounds.max.x, bounds.min.z, bounds.max.z)
    }

    /// Centres of the `resolution`-sized cells tiling the area, row by row.
    /// An axis narrower than one cell gets a single centre at its midpoint.
    pub fn cell_centres(&self, resolution: f32) -> Vec<(f32, f32)> {
        let xs = axis_centres(self.x_min, self.x_max, resolution);
        let zs = axis_centres(self.z_min, self.z_max, resolution);
        zs.iter()
            .flat_map(|&z| xs.iter().map(move |&x| (x, z)))
            .collect()
    }
}

fn axis_centres(min: f32, max: f32, resolution: f32) -> Array1<f32> {
    let centres = Array1::range(min + 0.5 * resolution, max, resolution);
    if centres.is_empty() {
        Array1::from_elem(1, 0.5 * (min + max))
    } else {
        centres
    }
}

/// Averaged loss in dB keyed by rounded `(x, z)` position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleMap {
    samples: BTreeMap<(i64, i64), f32>,
}

fn key(x: f32, z: f32) -> (i64, i64) {
    (
        (x * KEY_PRECISION).round() as i64,
        (z * KEY_PRECISION).round() as i64,
    )
}

impl SampleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing whatever was stored under the same rounded key.
    pub fn insert(&mut self, x: f32, z: f32, loss_db: f32) {
        self.samples.insert(key(x, z), loss_db);
    }

    pub fn get(&self, x: f32, z: f32) -> Option<f32> {
        self.samples.get(&key(x, z)).copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `(x, z, loss_db)` rows ordered by x, then z.
    pub fn iter(&self) -> impl Iterator<Item = (f32, f32, f32)> + '_ {
        self.samples.iter().map(|(&(x, z), &loss)| {
            (x as f32 / KEY_PRECISION, z as f32 / KEY_PRECISION, loss)
        })
    }

    /// Values of the cells at least one receiver could be reached from.
    pub fn reachable(&self) -> impl Iterator<Item = f32> + '_ {
        self.samples
            .values()
            .copied()
            .filter(|&loss| loss != UNREACHABLE_LOSS_DB)
    }
}

/// One scan: a transmitter template moved over a grid, linked to a fixed set
/// of receivers.
pub struct ScanMap<'a> {
    tracer: Tracer<'a>,
    model: &'a LossModel,
    transmitter: &'a Transmitter,
    receivers: Vec<&'a Receiver>,
    pool_factor: usize,
}

impl<'a> ScanMap<'a> {
    pub fn new(
        tracer: Tracer<'a>,
        model: &'a LossModel,
        transmitter: &'a Transmitter,
        receivers: Vec<&'a Receiver>,
        pool_factor: usize,
    ) -> Self {
        Self {
            tracer,
            model,
            transmitter,
            receivers,
            pool_factor,
        }
    }

    /// Evaluates every cell of `area` and collects the averages.
    pub fn run(&self, area: &Area, resolution: f32) -> Result<SampleMap> {
        if !(resolution > 0.0) {
            return Err(anyhow!("scan resolution must be greater than 0, got {}", resolution));
        }

        let start = Instant::now();
        let cells = area.cell_centres(resolution);
        let threads = self.pool_factor.max(1)
            * thread::available_parallelism().map_or(1, |n| n.get());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("building scan worker pool")?;

        log::info!(
            "scanning {} cells against {} receivers on {} workers",
            cells.len(),
            self.receivers.len(),
            threads
        );
        if self.receivers.is_empty() {
            log::warn!("no receivers connected, every cell will be unreachable");
        }

        // receivers stay put for the whole scan
        let candidates: Vec<Vec<usize>> = pool.install(|| {
            self.receivers
                .par_iter()
                .map(|rx| self.tracer.candidate_list(&rx.position))
                .collect()
        });

        let pb = ProgressBar::new(cells.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
            )?
            .progress_chars("█▇▆▅▄▃▂▁"),
        );
        pb.set_message("cells".to_string());

        let map = Mutex::new(SampleMap::new());
        for batch in cells.chunks(threads * BATCH_FACTOR) {
            pool.install(|| {
                batch.par_iter().for_each(|&(x, z)| {
                    let loss = self.sample(x, z, &candidates);
                    map.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(x, z, loss);
                    pb.inc(1);
                });
            });
        }
        pb.finish_with_message("cells done");

        let map = map.into_inner().unwrap_or_else(PoisonError::into_inner);
        let duration = start.elapsed();
        log::info!(
            "scan finished in {:.2?} ({} of {} cells reachable)",
            duration,
            map.reachable().count(),
            map.len()
        );

        Ok(map)
    }

    /// Mean loss over the receivers reachable from a transmitter at `(x, z)`,
    /// or the sentinel when none is.
    pub fn sample(&self, x: f32, z: f32, candidates: &[Vec<usize>]) -> f32 {
        let mut transmitter = self.transmitter.clone();
        transmitter.position = Point3::new(x, self.transmitter.position.y, z);

        let losses: Vec<f32> = self
            .receivers
            .iter()
            .zip(candidates)
            .filter_map(|(rx, candidates)| {
                let records =
                    self.tracer
                        .trace_paths_among(&transmitter.position, &rx.position, candidates);
                let results = self.model.compute_link(&transmitter, rx, &records);
                (results.valid && results.total_loss_db.is_finite())
                    .then_some(results.total_loss_db)
            })
            .collect();

        if losses.is_empty() {
            UNREACHABLE_LOSS_DB
        } else {
            losses.iter().sum::<f32>() / losses.len() as f32
        }
    }
}
