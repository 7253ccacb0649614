//! The scene together with the transmitters and receivers placed in it.
//!
//! Entities never point at each other. A receiver is linked to its
//! transmitter through the [`Connections`] table, and identifiers come from
//! the environment's own [`IdAllocator`].

use anyhow::{anyhow, Result};
use nalgebra::Point3;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::antenna::{GainPattern, Receiver, ReceiverId, Transmitter, TransmitterId};
use crate::geom::{Aabb, Scene};
use crate::loss::LossModel;
use crate::result::Results;
use crate::scan::{Area, SampleMap, ScanMap};
use crate::settings::Settings;
use crate::trace::{drawable_segments, DrawableSegment, Record, Tracer};
use crate::tree::SpatialIndex;

#[cfg(test)]
mod tests {

    use super::*;
    use crate::geom::Triangle;

    const FREQUENCY: f32 = 2.4e9;

    fn open_environment() -> Environment {
        Environment::new(Scene::default(), &Settings::default())
    }

    fn ground_environment() -> Environment {
        let ground = Triangle::new(
            Point3::new(-100.0, 0.0, 100.0),
            Point3::new(100.0, 0.0, 100.0),
            Point3::new(0.0, 0.0, -100.0),
        );
        Environment::new(Scene::new(vec![ground]), &Settings::default())
    }

    #[test]
    fn ids_are_never_reused() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.transmitter(), TransmitterId(0));
        assert_eq!(ids.transmitter(), TransmitterId(1));
        assert_eq!(ids.receiver(), ReceiverId(0));

        let mut env = open_environment();
        let rx = env.add_receiver(Point3::origin(), None);
        env.remove_receiver(rx).unwrap();
        assert_ne!(env.add_receiver(Point3::origin(), None), rx);
    }

    #[test]
    fn receiver_follows_its_latest_transmitter() {
        let mut connections = Connections::default();
        let (t0, t1, r) = (TransmitterId(0), TransmitterId(1), ReceiverId(0));

        assert_eq!(connections.connect(t0, r), None);
        assert_eq!(connections.connect(t1, r), Some(t0));
        assert_eq!(connections.transmitter_of(r), Some(t1));
        assert_eq!(connections.receivers_of(t0).count(), 0);
        assert_eq!(connections.receivers_of(t1).collect::<Vec<_>>(), vec![r]);

        assert_eq!(connections.disconnect(r), Some(t1));
        assert_eq!(connections.transmitter_of(r), None);
        assert_eq!(connections.receivers_of(t1).count(), 0);
    }

    #[test]
    fn removing_a_transmitter_drops_its_links() {
        let mut connections = Connections::default();
        let t = TransmitterId(3);
        connections.connect(t, ReceiverId(0));
        connections.connect(t, ReceiverId(1));
        connections.remove_transmitter(t);
        assert_eq!(connections.transmitter_of(ReceiverId(0)), None);
        assert_eq!(connections.transmitter_of(ReceiverId(1)), None);
    }

    #[test]
    fn connect_rejects_unknown_entities() {
        let mut env = open_environment();
        let tx = env.add_transmitter(Point3::origin(), FREQUENCY, None);
        assert!(env.connect(tx, ReceiverId(42)).is_err());
        let rx = env.add_receiver(Point3::new(1.0, 0.0, 0.0), None);
        assert!(env.connect(TransmitterId(42), rx).is_err());
        assert!(env.connect(tx, rx).is_ok());
        assert_eq!(env.connected_receivers(tx).len(), 1);
    }

    #[test]
    fn removing_a_receiver_disconnects_it() {
        let mut env = open_environment();
        let tx = env.add_transmitter(Point3::origin(), FREQUENCY, None);
        let rx = env.add_receiver(Point3::new(1.0, 0.0, 0.0), None);
        env.connect(tx, rx).unwrap();

        let removed = env.remove_receiver(rx).unwrap();
        assert_eq!(removed.id, rx);
        assert!(env.connected_receivers(tx).is_empty());
        assert!(env.remove_receiver(rx).is_err());
    }

    #[test]
    fn link_loss_tracks_moves() {
        let mut env = open_environment();
        let tx = env.add_transmitter(Point3::origin(), FREQUENCY, None);
        let rx = env.add_receiver(Point3::new(10.0, 0.0, 0.0), None);

        let before = env.compute_link(tx, rx).unwrap();
        env.move_receiver(rx, Point3::new(20.0, 0.0, 0.0)).unwrap();
        let after = env.compute_link(tx, rx).unwrap();
        // doubling the distance costs 6 dB in free space
        assert!((before.total_loss_db - after.total_loss_db - 6.0206).abs() < 1e-2);

        env.move_transmitter(tx, Point3::new(10.0, 0.0, 0.0)).unwrap();
        let moved = env.compute_link(tx, rx).unwrap();
        assert!((moved.total_loss_db - before.total_loss_db).abs() < 1e-3);
    }

    #[test]
    fn cached_candidates_find_the_same_paths() {
        let mut env = ground_environment();
        let a = Point3::new(-5.0, 2.0, 0.0);
        let b = Point3::new(5.0, 3.0, 0.0);
        let tx = env.add_transmitter(a, FREQUENCY, None);

        let fresh = env.trace_paths(&a, &b);
        let cached = env.trace_paths_from(tx, &b).unwrap();
        assert_eq!(fresh, cached);
        assert_eq!(fresh.len(), 2);
        assert!(matches!(fresh[1], Record::Reflect(ref points) if points.len() == 1));
    }

    #[test]
    fn scan_needs_a_scene_extent() {
        let mut env = open_environment();
        let tx = env.add_transmitter(Point3::origin(), FREQUENCY, None);
        assert!(env.scan_map(tx, 1.0).is_err());
        assert!(env.scan_map(TransmitterId(9), 1.0).is_err());
    }

    #[test]
    fn scan_covers_the_scene_footprint() {
        let mut env = ground_environment();
        let tx = env.add_transmitter(Point3::new(0.0, 2.0, 0.0), FREQUENCY, None);
        let rx = env.add_receiver(Point3::new(0.0, 2.0, 150.0), None);
        env.connect(tx, rx).unwrap();

        let map = env.scan_map(tx, 50.0).unwrap();
        // footprint is 200 x 200
        assert_eq!(map.len(), 16);
        assert_eq!(map.reachable().count(), 16);
    }

    #[test]
    fn segments_for_traced_paths() {
        let env = ground_environment();
        let a = Point3::new(-5.0, 2.0, 0.0);
        let b = Point3::new(5.0, 3.0, 0.0);
        let records = env.trace_paths(&a, &b);
        let segments = env.drawable_segments(&a, &b, &records);
        // one direct segment plus two legs of the ground bounce
        assert_eq!(segments.len(), 3);
    }
}

/// Hands out identifiers for the entities of one environment.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_transmitter: usize,
    next_receiver: usize,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transmitter(&mut self) -> TransmitterId {
        let id = TransmitterId(self.next_transmitter);
        self.next_transmitter += 1;
        id
    }

    pub fn receiver(&mut self) -> ReceiverId {
        let id = ReceiverId(self.next_receiver);
        self.next_receiver += 1;
        id
    }
}

/// Which receivers listen to which transmitter. A receiver is connected to
/// at most one transmitter at a time.
#[derive(Debug, Default, Clone)]
pub struct Connections {
    by_transmitter: HashMap<TransmitterId, BTreeSet<ReceiverId>>,
    by_receiver: HashMap<ReceiverId, TransmitterId>,
}

impl Connections {
    /// Links `rx` to `tx`, returning the transmitter it was linked to before.
    pub fn connect(&mut self, tx: TransmitterId, rx: ReceiverId) -> Option<TransmitterId> {
        let previous = self.disconnect(rx);
        self.by_transmitter.entry(tx).or_default().insert(rx);
        self.by_receiver.insert(rx, tx);
        previous
    }

    pub fn disconnect(&mut self, rx: ReceiverId) -> Option<TransmitterId> {
        let tx = self.by_receiver.remove(&rx)?;
        if let Some(receivers) = self.by_transmitter.get_mut(&tx) {
            receivers.remove(&rx);
            if receivers.is_empty() {
                self.by_transmitter.remove(&tx);
            }
        }
        Some(tx)
    }

    pub fn remove_transmitter(&mut self, tx: TransmitterId) {
        for rx in self.by_transmitter.remove(&tx).unwrap_or_default() {
            self.by_receiver.remove(&rx);
        }
    }

    pub fn transmitter_of(&self, rx: ReceiverId) -> Option<TransmitterId> {
        self.by_receiver.get(&rx).copied()
    }

    /// Receivers of `tx` in id order.
    pub fn receivers_of(&self, tx: TransmitterId) -> impl Iterator<Item = ReceiverId> + '_ {
        self.by_transmitter
            .get(&tx)
            .into_iter()
            .flat_map(|receivers| receivers.iter().copied())
    }
}

/// A static scene with its spatial index and the radio entities placed in it.
#[derive(Debug)]
pub struct Environment {
    index: SpatialIndex,
    bounds: Option<Aabb>,
    model: LossModel,
    pool_factor: usize,
    ids: IdAllocator,
    transmitters: BTreeMap<TransmitterId, Transmitter>,
    receivers: BTreeMap<ReceiverId, Receiver>,
    connections: Connections,
    /// Reflection candidates per transmitter, refreshed when it moves.
    candidates: HashMap<TransmitterId, Vec<usize>>,
}

impl Environment {
    /// Builds the spatial index for `scene` and takes the loss model and
    /// worker pool size from `settings`.
    pub fn new(scene: Scene, settings: &Settings) -> Self {
        let bounds = scene.bounds();
        let index = SpatialIndex::build(scene.triangles);
        log::debug!("built spatial index over {} triangles", index.len());

        Self {
            index,
            bounds,
            model: LossModel::from(settings),
            pool_factor: settings.pool_factor,
            ids: IdAllocator::new(),
            transmitters: BTreeMap::new(),
            receivers: BTreeMap::new(),
            connections: Connections::default(),
            candidates: HashMap::new(),
        }
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn tracer(&self) -> Tracer<'_> {
        Tracer::new(&self.index)
    }

    pub fn model(&self) -> &LossModel {
        &self.model
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn transmitter(&self, id: TransmitterId) -> Option<&Transmitter> {
        self.transmitters.get(&id)
    }

    pub fn receiver(&self, id: ReceiverId) -> Option<&Receiver> {
        self.receivers.get(&id)
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn add_transmitter(
        &mut self,
        position: Point3<f32>,
        frequency: f32,
        pattern: Option<GainPattern>,
    ) -> TransmitterId {
        let id = self.ids.transmitter();
        let mut transmitter = Transmitter::new(id, position, frequency);
        transmitter.pattern = pattern;
        self.transmitters.insert(id, transmitter);
        self.refresh_candidates(id, &position);
        log::debug!("added {} at {}", id, position);
        id
    }

    pub fn add_receiver(&mut self, position: Point3<f32>, pattern: Option<GainPattern>) -> ReceiverId {
        let id = self.ids.receiver();
        let mut receiver = Receiver::new(id, position);
        receiver.pattern = pattern;
        self.receivers.insert(id, receiver);
        log::debug!("added {} at {}", id, position);
        id
    }

    pub fn move_transmitter(&mut self, id: TransmitterId, position: Point3<f32>) -> Result<()> {
        let transmitter = self
            .transmitters
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown transmitter {}", id))?;
        transmitter.position = position;
        self.refresh_candidates(id, &position);
        Ok(())
    }

    pub fn move_receiver(&mut self, id: ReceiverId, position: Point3<f32>) -> Result<()> {
        let receiver = self
            .receivers
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown receiver {}", id))?;
        receiver.position = position;
        Ok(())
    }

    /// Removes a transmitter and every link to it.
    pub fn remove_transmitter(&mut self, id: TransmitterId) -> Result<Transmitter> {
        let transmitter = self
            .transmitters
            .remove(&id)
            .ok_or_else(|| anyhow!("unknown transmitter {}", id))?;
        self.connections.remove_transmitter(id);
        self.candidates.remove(&id);
        Ok(transmitter)
    }

    /// Removes a receiver and its link, if any.
    pub fn remove_receiver(&mut self, id: ReceiverId) -> Result<Receiver> {
        let receiver = self
            .receivers
            .remove(&id)
            .ok_or_else(|| anyhow!("unknown receiver {}", id))?;
        self.connections.disconnect(id);
        Ok(receiver)
    }

    pub fn connect(&mut self, tx: TransmitterId, rx: ReceiverId) -> Result<()> {
        if !self.transmitters.contains_key(&tx) {
            return Err(anyhow!("unknown transmitter {}", tx));
        }
        if !self.receivers.contains_key(&rx) {
            return Err(anyhow!("unknown receiver {}", rx));
        }
        if let Some(previous) = self.connections.connect(tx, rx) {
            log::debug!("{} moved from {} to {}", rx, previous, tx);
        }
        Ok(())
    }

    pub fn disconnect(&mut self, rx: ReceiverId) -> Option<TransmitterId> {
        self.connections.disconnect(rx)
    }

    pub fn connected_receivers(&self, tx: TransmitterId) -> Vec<&Receiver> {
        self.connections
            .receivers_of(tx)
            .filter_map(|rx| self.receivers.get(&rx))
            .collect()
    }

    /// Every propagation mechanism between two arbitrary points.
    pub fn trace_paths(&self, tx: &Point3<f32>, rx: &Point3<f32>) -> Vec<Record> {
        self.tracer().trace_paths(tx, rx)
    }

    /// Every propagation mechanism between a placed transmitter and a point,
    /// reusing the transmitter's cached reflection candidates.
    pub fn trace_paths_from(&self, tx: TransmitterId, rx: &Point3<f32>) -> Result<Vec<Record>> {
        let transmitter = self
            .transmitter(tx)
            .ok_or_else(|| anyhow!("unknown transmitter {}", tx))?;
        let tracer = self.tracer();
        Ok(match self.candidates.get(&tx) {
            Some(candidates) => tracer.trace_paths_among(&transmitter.position, rx, candidates),
            None => tracer.trace_paths(&transmitter.position, rx),
        })
    }

    /// Loss between isotropic antennas.
    pub fn compute_loss(
        &self,
        tx: &Point3<f32>,
        frequency: f32,
        rx: &Point3<f32>,
        records: &[Record],
    ) -> Results {
        self.model.compute_loss(tx, frequency, rx, records)
    }

    /// Traces and evaluates the link between two placed entities, including
    /// their gain patterns.
    pub fn compute_link(&self, tx: TransmitterId, rx: ReceiverId) -> Result<Results> {
        let transmitter = self
            .transmitter(tx)
            .ok_or_else(|| anyhow!("unknown transmitter {}", tx))?;
        let receiver = self
            .receiver(rx)
            .ok_or_else(|| anyhow!("unknown receiver {}", rx))?;
        let records = self.trace_paths_from(tx, &receiver.position)?;
        Ok(self.model.compute_link(transmitter, receiver, &records))
    }

    /// Average-loss map of `tx` against its connected receivers over the
    /// horizontal extent of the scene.
    pub fn scan_map(&self, tx: TransmitterId, resolution: f32) -> Result<SampleMap> {
        let transmitter = self
            .transmitter(tx)
            .ok_or_else(|| anyhow!("unknown transmitter {}", tx))?;
        let bounds = self
            .bounds
            .ok_or_else(|| anyhow!("scene is empty, nothing to scan"))?;

        ScanMap::new(
            self.tracer(),
            &self.model,
            transmitter,
            self.connected_receivers(tx),
            self.pool_factor,
        )
        .run(&Area::from_bounds(&bounds), resolution)
    }

    pub fn drawable_segments(
        &self,
        tx: &Point3<f32>,
        rx: &Point3<f32>,
        records: &[Record],
    ) -> Vec<DrawableSegment> {
        drawable_segments(tx, rx, records)
    }

    fn refresh_candidates(&mut self, id: TransmitterId, position: &Point3<f32>) {
        let candidates = self.tracer().candidate_list(position);
        self.candidates.insert(id, candidates);
    }
}
