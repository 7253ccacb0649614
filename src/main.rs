use std::time::Instant;

use anyhow::Result;
use nalgebra::Point3;
use rfprop::environment::Environment;
use rfprop::geom::Scene;
use rfprop::output::{self, ScanSummary};
use rfprop::settings;

fn main() -> Result<()> {
    env_logger::init();

    let settings = settings::load_config()?;
    log::info!("{}", settings);

    let scene = Scene::from_file(settings.scene_path()?)?;

    let mut environment = Environment::new(scene, &settings);
    let tx = environment.add_transmitter(
        Point3::from(settings.transmitter),
        settings.frequency,
        None,
    );
    for position in &settings.receivers {
        let rx = environment.add_receiver(Point3::from(*position), None);
        environment.connect(tx, rx)?;
    }

    let start = Instant::now();
    let map = environment.scan_map(tx, settings.resolution)?;
    let summary = ScanSummary::new(&map, settings.resolution, settings.frequency, start.elapsed());

    match summary.mean_loss_db {
        Some(mean) => log::info!(
            "{} of {} cells reachable, mean loss {:.2} dB",
            summary.reachable,
            summary.cells,
            mean
        ),
        None => log::warn!("no cell reached any receiver"),
    }

    output::write_outputs(&settings.directory, &map, &summary, &settings)?;

    Ok(())
}
