//! Fresnel reflection at the boundary between air and a building material.
//!
//! Materials are described by their relative permittivity. The refractive
//! index is its complex square root, so a lossy material (negative imaginary
//! part) goes through the same formulas as a lossless one.

use nalgebra::Complex;

use crate::settings::Polarization;


/// Complex Fresnel amplitude coefficients `(perpendicular, parallel)` for a
/// wave in the medium with index `n1` meeting the medium with index `n2` at
/// incidence angle `theta_i` (radians, from the surface normal).
pub fn coefficients(n1: Complex<f32>, n2: Complex<f32>, theta_i: f32) -> (Complex<f32>, Complex<f32>) {
    let cti = Complex::new(theta_i.cos(), 0.0);
    let sti = Complex::new(theta_i.sin(), 0.0);

    // Snell's law through the complex cosine, so total internal reflection and
    // absorbing media need no special casing
    let ratio = n1 / n2;
    let ctt = (Complex::new(1.0, 0.0) - ratio * ratio * sti * sti).sqrt();

    let perpendicular = (n1 * cti - n2 * ctt) / (n1 * cti + n2 * ctt);
    let parallel = (n2 * cti - n1 * ctt) / (n2 * cti + n1 * ctt);
    (perpendicular, parallel)
}

/// Magnitude of the reflection coefficient for the chosen polarization.
///
/// `eps1` is the relative permittivity of the medium carrying the incident
/// wave and `eps2` that of the reflecting material.
pub fn reflection_coefficient(
    eps1: f32,
    eps2: f32,
    theta_i: f32,
    polarization: Polarization,
) -> f32 {
    let n1 = Complex::new(eps1, 0.0).sqrt();
    let n2 = Complex::new(eps2, 0.0).sqrt();
    let (perpendicular, parallel) = coefficients(n1, n2, theta_i);

    match polarization {
        Polarization::Perpendicular => perpendicular.norm(),
        Polarization::Parallel => parallel.norm(),
    }
}
