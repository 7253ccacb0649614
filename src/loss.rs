//! Conversion of traced propagation paths into received power.
//!
//! Every mechanism is evaluated in the linear power domain and the
//! contributions are summed before the total is expressed in dB:
//!
//! - direct paths follow the Friis equation,
//! - reflections scale the Friis term over the unfolded path by the Fresnel
//!   reflection coefficient and a specular fraction,
//! - diffraction chains use the knife-edge approximation, with the
//!   Epstein–Peterson construction and a Millington-style spacing correction
//!   when three or more edges obstruct the path.

use nalgebra::Point3;
use std::f32::consts::PI;

use crate::antenna::{linear_gain, GainPattern, Receiver, Transmitter};
use crate::fresnel::reflection_coefficient;
use crate::powers::Powers;
use crate::result::Results;
use crate::settings::{
    Polarization, Settings, AIR_PERMITTIVITY, MATERIAL_PERMITTIVITY, RAYCAST_MINIMUM_DISTANCE,
    SPEED_OF_LIGHT, SPECULAR_FRACTION,
};
use crate::trace::Record;

#[cfg(test)]
mod tests {

    use super::*;
    use crate::antenna::{ReceiverId, TransmitterId};

    const FREQUENCY: f32 = 2.4e9;

    #[test]
    fn free_space_loss_known_value() {
        // 1 km at 900 MHz
        let wavelength = SPEED_OF_LIGHT / 900e6;
        let loss = free_space_loss_db(1000.0, wavelength);
        assert!((loss - 91.53).abs() < 0.05, "loss: {}", loss);
    }

    #[test]
    fn diffraction_loss_is_monotonic() {
        let mut previous = diffraction_loss_db(-0.1);
        for step in 1..=400 {
            let v = -0.1 + step as f32 * 0.025;
            let loss = diffraction_loss_db(v);
            assert!(loss >= previous, "v: {}, loss: {} < {}", v, loss, previous);
            previous = loss;
        }
    }

    #[test]
    fn grazing_edge_costs_six_decibels() {
        assert!((diffraction_loss_db(0.0) - 6.03).abs() < 0.01);
    }

    #[test]
    fn clear_edge_costs_nothing() {
        assert_eq!(diffraction_loss_db(-0.78), 0.0);
        assert_eq!(diffraction_loss_db(-3.0), 0.0);
        assert!(diffraction_loss_db(-0.77) < 0.1);
    }

    #[test]
    fn fresnel_parameter_sign_follows_clearance() {
        let start = Point3::new(-10.0, 0.0, 0.0);
        let end = Point3::new(10.0, 0.0, 0.0);
        let wavelength = SPEED_OF_LIGHT / FREQUENCY;
        let above = fresnel_parameter(&Point3::new(0.0, 2.0, 0.0), &start, &end, wavelength);
        let below = fresnel_parameter(&Point3::new(0.0, -2.0, 0.0), &start, &end, wavelength);
        assert!(above > 0.0);
        assert!((above + below).abs() < 1e-4);

        // h * sqrt(2 (d1 + d2) / (lambda d1 d2)) with d1 = d2 = sqrt(104)
        let d = 104.0_f32.sqrt();
        let expected = 2.0 * (2.0 * 2.0 * d / (wavelength * d * d)).sqrt();
        assert!((above - expected).abs() < 1e-3, "v: {}", above);
    }

    #[test]
    fn empty_records_are_invalid() {
        let model = LossModel::default();
        let results = model.compute_loss(
            &Point3::origin(),
            FREQUENCY,
            &Point3::new(5.0, 0.0, 0.0),
            &[],
        );
        assert!(!results.valid);
    }

    #[test]
    fn direct_path_is_free_space() {
        let model = LossModel::default();
        let tx = Point3::new(0.0, 1.5, 0.0);
        let rx = Point3::new(30.0, 1.5, 40.0);
        let results = model.compute_loss(&tx, FREQUENCY, &rx, &[Record::Direct]);
        let expected = free_space_loss_db(50.0, SPEED_OF_LIGHT / FREQUENCY);
        assert!(results.valid);
        assert!((results.path_loss_db() - expected).abs() < 1e-3);
        assert_eq!(results.powers.reflected, 0.0);
        assert_eq!(results.powers.diffracted, 0.0);
    }

    #[test]
    fn reflection_adds_power() {
        let model = LossModel::default();
        let tx = Point3::new(-10.0, 0.0, 0.0);
        let rx = Point3::new(10.0, 0.0, 0.0);
        let direct = model.compute_loss(&tx, FREQUENCY, &rx, &[Record::Direct]);
        let both = model.compute_loss(
            &tx,
            FREQUENCY,
            &rx,
            &[Record::Direct, Record::Reflect(vec![Point3::new(0.0, 0.0, 10.0)])],
        );
        assert!(both.powers.reflected > 0.0);
        assert!(both.powers.reflected < both.powers.direct);
        assert!(both.total_loss_db > direct.total_loss_db);
    }

    #[test]
    fn reflected_power_matches_formula() {
        let model = LossModel::default();
        let tx = Point3::new(-10.0, 0.0, 0.0);
        let rx = Point3::new(10.0, 0.0, 0.0);
        let point = Point3::new(0.0, 0.0, 10.0);
        let results = model.compute_loss(&tx, FREQUENCY, &rx, &[Record::Reflect(vec![point])]);

        let wavelength = SPEED_OF_LIGHT / FREQUENCY;
        let leg = 200.0_f32.sqrt();
        let gamma = reflection_coefficient(
            AIR_PERMITTIVITY,
            MATERIAL_PERMITTIVITY,
            45.0_f32.to_radians(),
            Polarization::Perpendicular,
        );
        let expected =
            SPECULAR_FRACTION * (wavelength * gamma / (4.0 * PI * 2.0 * leg)).powi(2);
        assert!((results.powers.reflected / expected - 1.0).abs() < 1e-3);
    }

    #[test]
    fn diffraction_is_weaker_than_line_of_sight() {
        let model = LossModel::default();
        let tx = Point3::new(-20.0, 0.0, 0.0);
        let rx = Point3::new(20.0, 0.0, 0.0);
        let edge = Point3::new(0.0, 10.0, 0.0);
        let direct = model.compute_loss(&tx, FREQUENCY, &rx, &[Record::Direct]);
        let diffracted =
            model.compute_loss(&tx, FREQUENCY, &rx, &[Record::EdgeDiffraction(vec![edge])]);
        assert!(diffracted.valid);
        assert!(diffracted.powers.diffracted > 0.0);
        assert!(diffracted.total_loss_db < direct.total_loss_db - 6.0);
    }

    #[test]
    fn cascade_is_at_least_the_worst_edge() {
        let tx = Point3::new(-30.0, 0.0, 0.0);
        let rx = Point3::new(30.0, 0.0, 0.0);
        let edges = [
            Point3::new(-10.0, 6.0, 0.0),
            Point3::new(0.0, 8.0, 0.0),
            Point3::new(10.0, 5.0, 0.0),
        ];
        let wavelength = SPEED_OF_LIGHT / FREQUENCY;
        let cascade = edge_chain_loss_db(&tx, &edges, &rx, wavelength);
        let worst = edges
            .iter()
            .map(|e| diffraction_loss_db(fresnel_parameter(e, &tx, &rx, wavelength)))
            .fold(f32::NEG_INFINITY, f32::max);
        assert!(cascade >= worst, "cascade: {}, worst: {}", cascade, worst);
    }

    #[test]
    fn cleared_cascade_costs_only_the_spacing_correction() {
        // each edge sits well below the line between its neighbours, so only
        // the two spacing terms remain: legs 20, 10, 10, 20 give
        // cos²α = 1/3 per pair, i.e. 20·log10(3) in total
        let tx = Point3::new(-30.0, 0.0, 0.0);
        let rx = Point3::new(30.0, 0.0, 0.0);
        let edges = [
            Point3::new(-10.0, -40.0, 0.0),
            Point3::new(0.0, -45.0, 0.0),
            Point3::new(10.0, -40.0, 0.0),
        ];
        let wavelength = SPEED_OF_LIGHT / FREQUENCY;
        let cascade = edge_chain_loss_db(&tx, &edges, &rx, wavelength);
        assert!((cascade - 9.5424).abs() < 1e-3, "cascade: {}", cascade);
    }

    #[test]
    fn weakest_of_four_edges_is_dropped() {
        let tx = Point3::new(-40.0, 0.0, 0.0);
        let rx = Point3::new(40.0, 0.0, 0.0);
        let wavelength = SPEED_OF_LIGHT / FREQUENCY;
        let strong = [
            Point3::new(-20.0, 6.0, 0.0),
            Point3::new(0.0, 8.0, 0.0),
            Point3::new(20.0, 5.0, 0.0),
        ];
        let with_weak = [
            strong[0],
            Point3::new(-10.0, 0.5, 0.0),
            strong[1],
            strong[2],
        ];
        let a = edge_chain_loss_db(&tx, &strong, &rx, wavelength);
        let b = edge_chain_loss_db(&tx, &with_weak, &rx, wavelength);
        assert!((a - b).abs() < 1e-4);
    }

    #[test]
    fn transmitter_gain_scales_every_mechanism() {
        let model = LossModel::default();
        let pattern = GainPattern::from_fn(19, 36, |_, _| 10.0);
        let tx = Transmitter::new(TransmitterId(0), Point3::new(-10.0, 0.0, 0.0), FREQUENCY);
        let directional = tx.clone().with_pattern(pattern);
        let rx = Receiver::new(ReceiverId(0), Point3::new(10.0, 0.0, 0.0));
        let records = [
            Record::Direct,
            Record::Reflect(vec![Point3::new(0.0, 0.0, 10.0)]),
        ];

        let plain = model.compute_link(&tx, &rx, &records);
        let boosted = model.compute_link(&directional, &rx, &records);
        assert!((boosted.total_loss_db - plain.total_loss_db - 10.0).abs() < 1e-3);
    }
}

/// Free-space path loss in dB over `distance` for the given wavelength.
pub fn free_space_loss_db(distance: f32, wavelength: f32) -> f32 {
    20.0 * (4.0 * PI * distance / wavelength).log10()
}

/// Knife-edge diffraction loss in dB for Fresnel parameter `v`.
///
/// Zero once the edge is well clear of the path (`v <= -0.78`).
pub fn diffraction_loss_db(v: f32) -> f32 {
    if v <= -0.78 {
        return 0.0;
    }
    let x = v - 0.1;
    6.9 + 20.0 * ((x * x + 1.0).sqrt() + x).log10()
}

/// Fresnel–Kirchhoff diffraction parameter of `edge` for the path from `start`
/// to `end`.
///
/// The clearance `h` is the perpendicular distance of the edge from the
/// straight line, positive when the edge lies above it.
pub fn fresnel_parameter(
    edge: &Point3<f32>,
    start: &Point3<f32>,
    end: &Point3<f32>,
    wavelength: f32,
) -> f32 {
    let span = end - start;
    let length = span.norm();
    if length < RAYCAST_MINIMUM_DISTANCE {
        return 0.0;
    }
    let axis = span / length;
    let along = (edge - start).dot(&axis);
    let offset = (edge - start) - axis * along;
    let h = if offset.y < 0.0 {
        -offset.norm()
    } else {
        offset.norm()
    };

    let d1 = (edge - start).norm().max(RAYCAST_MINIMUM_DISTANCE);
    let d2 = (end - edge).norm().max(RAYCAST_MINIMUM_DISTANCE);
    h * (2.0 * (d1 + d2) / (wavelength * d1 * d2)).sqrt()
}

/// Diffraction loss in dB of an ordered chain of edges between `start` and
/// `end`, excluding free-space loss.
pub fn edge_chain_loss_db(
    start: &Point3<f32>,
    edges: &[Point3<f32>],
    end: &Point3<f32>,
    wavelength: f32,
) -> f32 {
    let v = |e: &Point3<f32>| fresnel_parameter(e, start, end, wavelength);

    match edges {
        [] => 0.0,
        [edge] => diffraction_loss_db(v(edge)),
        [first, second] => diffraction_loss_db(v(first).max(v(second))),
        _ => {
            let mut ranked: Vec<usize> = (0..edges.len()).collect();
            ranked.sort_by(|&i, &j| v(&edges[j]).total_cmp(&v(&edges[i])));
            ranked.truncate(3);
            ranked.sort_unstable();

            let chain = [
                *start,
                edges[ranked[0]],
                edges[ranked[1]],
                edges[ranked[2]],
                *end,
            ];

            let edge_losses: f32 = (1..=3)
                .map(|i| {
                    diffraction_loss_db(fresnel_parameter(
                        &chain[i],
                        &chain[i - 1],
                        &chain[i + 1],
                        wavelength,
                    ))
                })
                .sum();

            let legs: Vec<f32> = chain
                .windows(2)
                .map(|w| horizontal_distance(&w[0], &w[1]))
                .collect();
            let correction = spacing_correction_db(legs[0], legs[1], legs[2])
                + spacing_correction_db(legs[1], legs[2], legs[3]);

            edge_losses + correction
        }
    }
}

/// Correction for two closely spaced edges with horizontal legs `d1` before
/// the pair, `d2` between them and `d3` after.
fn spacing_correction_db(d1: f32, d2: f32, d3: f32) -> f32 {
    let denominator = (d1 + d2) * (d2 + d3);
    if denominator <= 0.0 {
        return 0.0;
    }
    let cos_alpha = (d1 * d3 / denominator).sqrt();
    if cos_alpha <= 0.0 {
        return 0.0;
    }
    20.0 * (1.0 / cos_alpha).log10()
}

fn horizontal_distance(a: &Point3<f32>, b: &Point3<f32>) -> f32 {
    (a.x - b.x).hypot(a.z - b.z)
}

/// Material and polarization parameters of the path-loss model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossModel {
    pub air_permittivity: f32,
    pub material_permittivity: f32,
    pub specular_fraction: f32,
    pub polarization: Polarization,
}

impl Default for LossModel {
    fn default() -> Self {
        Self {
            air_permittivity: AIR_PERMITTIVITY,
            material_permittivity: MATERIAL_PERMITTIVITY,
            specular_fraction: SPECULAR_FRACTION,
            polarization: Polarization::default(),
        }
    }
}

impl From<&Settings> for LossModel {
    fn from(settings: &Settings) -> Self {
        Self {
            air_permittivity: settings.air_permittivity,
            material_permittivity: settings.material_permittivity,
            specular_fraction: settings.specular_fraction,
            polarization: settings.polarization,
        }
    }
}

/// One end of a link as seen by the model.
struct Endpoint<'a> {
    position: &'a Point3<f32>,
    pattern: Option<&'a GainPattern>,
}

impl Endpoint<'_> {
    fn gain_towards(&self, target: &Point3<f32>) -> f32 {
        linear_gain(self.pattern, &(target - self.position))
    }
}

impl LossModel {
    /// Received power for isotropic antennas at `tx` and `rx`.
    ///
    /// Positions must be distinct and `frequency` positive.
    pub fn compute_loss(
        &self,
        tx: &Point3<f32>,
        frequency: f32,
        rx: &Point3<f32>,
        records: &[Record],
    ) -> Results {
        let tx = Endpoint {
            position: tx,
            pattern: None,
        };
        let rx = Endpoint {
            position: rx,
            pattern: None,
        };
        self.evaluate(&tx, &rx, SPEED_OF_LIGHT / frequency, records)
    }

    /// Received power including the gain patterns of both antennas.
    pub fn compute_link(
        &self,
        transmitter: &Transmitter,
        receiver: &Receiver,
        records: &[Record],
    ) -> Results {
        let tx = Endpoint {
            position: &transmitter.position,
            pattern: transmitter.pattern.as_ref(),
        };
        let rx = Endpoint {
            position: &receiver.position,
            pattern: receiver.pattern.as_ref(),
        };
        self.evaluate(&tx, &rx, SPEED_OF_LIGHT / transmitter.frequency, records)
    }

    fn evaluate(
        &self,
        tx: &Endpoint,
        rx: &Endpoint,
        wavelength: f32,
        records: &[Record],
    ) -> Results {
        if records.is_empty() {
            return Results::invalid();
        }

        let mut powers = Powers::new();
        for record in records {
            match record {
                Record::Direct => powers.direct += self.direct_power(tx, rx, wavelength),
                Record::Reflect(points) => {
                    powers.reflected += points
                        .iter()
                        .map(|p| self.reflected_power(tx, rx, p, wavelength))
                        .sum::<f32>()
                }
                Record::EdgeDiffraction(edges) => {
                    powers.diffracted += self.diffracted_power(tx, rx, edges, wavelength)
                }
            }
        }

        Results::from_powers(powers)
    }

    fn direct_power(&self, tx: &Endpoint, rx: &Endpoint, wavelength: f32) -> f32 {
        let distance = (rx.position - tx.position).norm();
        let gain = tx.gain_towards(rx.position) * rx.gain_towards(tx.position);
        gain * (wavelength / (4.0 * PI * distance)).powi(2)
    }

    fn reflected_power(
        &self,
        tx: &Endpoint,
        rx: &Endpoint,
        point: &Point3<f32>,
        wavelength: f32,
    ) -> f32 {
        let incoming = tx.position - point;
        let outgoing = rx.position - point;
        let d1 = incoming.norm();
        let d2 = outgoing.norm();
        if d1 < RAYCAST_MINIMUM_DISTANCE || d2 < RAYCAST_MINIMUM_DISTANCE {
            return 0.0;
        }

        let theta_i = incoming.angle(&outgoing) / 2.0;
        let gamma = reflection_coefficient(
            self.air_permittivity,
            self.material_permittivity,
            theta_i,
            self.polarization,
        );

        let gain = tx.gain_towards(point) * rx.gain_towards(point);
        self.specular_fraction * gain * (wavelength * gamma / (4.0 * PI * (d1 + d2))).powi(2)
    }

    fn diffracted_power(
        &self,
        tx: &Endpoint,
        rx: &Endpoint,
        edges: &[Point3<f32>],
        wavelength: f32,
    ) -> f32 {
        let Some(dominant) = edges.iter().max_by(|a, b| {
            fresnel_parameter(a, tx.position, rx.position, wavelength).total_cmp(
                &fresnel_parameter(b, tx.position, rx.position, wavelength),
            )
        }) else {
            return 0.0;
        };

        let length: f32 = std::iter::once(tx.position)
            .chain(edges.iter())
            .chain(std::iter::once(rx.position))
            .collect::<Vec<_>>()
            .windows(2)
            .map(|w| (w[1] - w[0]).norm())
            .sum();

        let loss_db = edge_chain_loss_db(tx.position, edges, rx.position, wavelength)
            + free_space_loss_db(length, wavelength);

        let gain = tx.gain_towards(dominant) * rx.gain_towards(dominant);
        gain * 10.0_f32.powf(-loss_db / 10.0)
    }
}
