//! Digital Butterworth filters applied forward-backward (zero phase).
//!
//! Design goes through the analogue prototype in zero/pole/gain form, a
//! frequency transform (high-pass or band-pass), the bilinear transform with
//! pre-warped edges, and finally a cascade of second-order sections.
//! Filtering runs in `f64`.

use num_complex::Complex64;
use std::f64::consts::PI;

use super::{AudioError, Result};

/// One biquad: `b0 b1 b2 / 1 a1 a2` (a0 is normalised to 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Section {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

/// A cascade of biquads plus the order of the designed filter.
#[derive(Debug, Clone)]
pub struct Sos {
    pub sections: Vec<Section>,
    pub order: usize,
}

struct Zpk {
    z: Vec<Complex64>,
    p: Vec<Complex64>,
    k: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Design
// ─────────────────────────────────────────────────────────────────────────────

fn buttap(order: usize) -> Zpk {
    let n = order as f64;
    let p = (0..order)
        .map(|i| {
            let m = -(n - 1.0) + 2.0 * i as f64;
            -Complex64::from_polar(1.0, PI * m / (2.0 * n))
        })
        .collect();
    Zpk { z: Vec::new(), p, k: 1.0 }
}

fn prod(values: impl Iterator<Item = Complex64>) -> Complex64 {
    values.fold(Complex64::new(1.0, 0.0), |acc, v| acc * v)
}

fn lp2hp(proto: Zpk, wo: f64) -> Zpk {
    let degree = proto.p.len() - proto.z.len();
    let mut z: Vec<Complex64> = proto.z.iter().map(|&z| wo / z).collect();
    let p = proto.p.iter().map(|&p| wo / p).collect();
    z.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
    let k = proto.k * (prod(proto.z.iter().map(|&z| -z)) / prod(proto.p.iter().map(|&p| -p))).re;
    Zpk { z, p, k }
}

fn lp2bp(proto: Zpk, wo: f64, bw: f64) -> Zpk {
    let degree = proto.p.len() - proto.z.len();
    let split = |roots: &[Complex64]| -> Vec<Complex64> {
        let scaled: Vec<Complex64> = roots.iter().map(|&r| r * bw / 2.0).collect();
        let mut out: Vec<Complex64> = scaled
            .iter()
            .map(|&r| r + (r * r - wo * wo).sqrt())
            .collect();
        out.extend(scaled.iter().map(|&r| r - (r * r - wo * wo).sqrt()));
        out
    };
    let mut z = split(&proto.z);
    let p = split(&proto.p);
    z.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
    Zpk { z, p, k: proto.k * bw.powi(degree as i32) }
}

fn bilinear(analog: Zpk, fs: f64) -> Zpk {
    let fs2 = Complex64::new(2.0 * fs, 0.0);
    let degree = analog.p.len() - analog.z.len();
    let mut z: Vec<Complex64> = analog.z.iter().map(|&z| (fs2 + z) / (fs2 - z)).collect();
    let p = analog.p.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect();
    z.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree));
    let k = analog.k
        * (prod(analog.z.iter().map(|&z| fs2 - z)) / prod(analog.p.iter().map(|&p| fs2 - p))).re;
    Zpk { z, p, k }
}

const IMAG_TOL: f64 = 1e-10;

/// Group a digital zpk into biquads: conjugate pole pairs first, then real
/// poles two at a time; zeros are taken from both ends of the sorted list.
fn zpk_to_sos(zpk: Zpk) -> Sos {
    let order = zpk.p.len();

    let mut pole_pairs: Vec<(Complex64, Option<Complex64>)> = Vec::new();
    let mut real_poles: Vec<f64> = Vec::new();
    for &p in &zpk.p {
        if p.im > IMAG_TOL {
            pole_pairs.push((p, Some(p.conj())));
        } else if p.im.abs() <= IMAG_TOL {
            real_poles.push(p.re);
        }
    }
    for pair in real_poles.chunks(2) {
        let first = Complex64::new(pair[0], 0.0);
        let second = pair.get(1).map(|&r| Complex64::new(r, 0.0));
        pole_pairs.push((first, second));
    }

    let mut zeros: Vec<f64> = zpk.z.iter().map(|z| z.re).collect();
    zeros.sort_by(|a, b| a.total_cmp(b));
    let mut lo = 0usize;
    let mut hi = zeros.len();

    let mut sections = Vec::with_capacity(pole_pairs.len());
    for (p1, p2) in pole_pairs {
        let a = match p2 {
            Some(p2) => [1.0, -(p1 + p2).re, (p1 * p2).re],
            None => [1.0, -p1.re, 0.0],
        };
        let mut picked = Vec::with_capacity(2);
        let wanted = if p2.is_some() { 2 } else { 1 };
        while picked.len() < wanted && lo < hi {
            if picked.len() % 2 == 0 {
                picked.push(zeros[lo]);
                lo += 1;
            } else {
                hi -= 1;
                picked.push(zeros[hi]);
            }
        }
        let b = match picked.as_slice() {
            [z1, z2] => [1.0, -(z1 + z2), z1 * z2],
            [z1] => [1.0, -z1, 0.0],
            _ => [1.0, 0.0, 0.0],
        };
        sections.push(Section { b, a });
    }

    if let Some(first) = sections.first_mut() {
        for c in first.b.iter_mut() {
            *c *= zpk.k;
        }
    }
    Sos { sections, order }
}

fn check_wn(wn: f64) -> Result<()> {
    if !(wn > 0.0 && wn < 1.0) {
        return Err(AudioError::InvalidArg(format!(
            "normalised cutoff must be in (0, 1), got {wn}"
        )));
    }
    Ok(())
}

/// Butterworth high-pass; `wn` is the cutoff divided by Nyquist.
pub fn butter_highpass(order: usize, wn: f64) -> Result<Sos> {
    check_wn(wn)?;
    if order == 0 {
        return Err(AudioError::InvalidArg("filter order must be > 0".into()));
    }
    let fs = 2.0;
    let warped = 2.0 * fs * (PI * wn / fs).tan();
    Ok(zpk_to_sos(bilinear(lp2hp(buttap(order), warped), fs)))
}

/// Butterworth band-pass between `low` and `high` (both normalised).
pub fn butter_bandpass(order: usize, low: f64, high: f64) -> Result<Sos> {
    check_wn(low)?;
    check_wn(high)?;
    if low >= high {
        return Err(AudioError::InvalidArg(format!(
            "band edges out of order: {low} >= {high}"
        )));
    }
    if order == 0 {
        return Err(AudioError::InvalidArg("filter order must be > 0".into()));
    }
    let fs = 2.0;
    let w1 = 2.0 * fs * (PI * low / fs).tan();
    let w2 = 2.0 * fs * (PI * high / fs).tan();
    let bw = w2 - w1;
    let wo = (w1 * w2).sqrt();
    Ok(zpk_to_sos(bilinear(lp2bp(buttap(order), wo, bw), fs)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Filtering
// ─────────────────────────────────────────────────────────────────────────────

fn section_zi(s: &Section) -> [f64; 2] {
    let [b0, b1, b2] = s.b;
    let [_, a1, a2] = s.a;
    let denom = 1.0 + a1 + a2;
    let z0 = ((b1 - a1 * b0) + (b2 - a2 * b0)) / denom;
    let z1 = (b2 - a2 * b0) - a2 * z0;
    [z0, z1]
}

/// Steady-state initial conditions for a unit step, one pair per section.
fn sos_zi(sos: &Sos) -> Vec<[f64; 2]> {
    let mut scale = 1.0;
    sos.sections
        .iter()
        .map(|s| {
            let zi = section_zi(s);
            let out = [zi[0] * scale, zi[1] * scale];
            scale *= s.b.iter().sum::<f64>() / s.a.iter().sum::<f64>();
            out
        })
        .collect()
}

fn sosfilt(sos: &Sos, x: &mut [f64], zi: &[[f64; 2]], x0: f64) {
    for (s, init) in sos.sections.iter().zip(zi) {
        let mut z0 = init[0] * x0;
        let mut z1 = init[1] * x0;
        let [b0, b1, b2] = s.b;
        let [_, a1, a2] = s.a;
        for v in x.iter_mut() {
            let xin = *v;
            let y = b0 * xin + z0;
            z0 = b1 * xin - a1 * y + z1;
            z1 = b2 * xin - a2 * y;
            *v = y;
        }
    }
}

/// Zero-phase filtering with odd extension at both ends.
///
/// The edge padding is `3 · (order + 1)` samples, shortened for signals that
/// are not long enough. Signals shorter than two samples are returned as is.
pub fn filtfilt(sos: &Sos, signal: &[f32]) -> Vec<f32> {
    let n = signal.len();
    if n < 2 || sos.sections.is_empty() {
        return signal.to_vec();
    }
    let padlen = (3 * (sos.order + 1)).min(n - 1);
    let x: Vec<f64> = signal.iter().map(|&s| s as f64).collect();

    let first = x[0];
    let last = x[n - 1];
    let mut ext = Vec::with_capacity(n + 2 * padlen);
    ext.extend((1..=padlen).rev().map(|i| 2.0 * first - x[i]));
    ext.extend_from_slice(&x);
    ext.extend((1..=padlen).map(|i| 2.0 * last - x[n - 1 - i]));

    let zi = sos_zi(sos);
    let x0 = ext[0];
    sosfilt(sos, &mut ext, &zi, x0);
    ext.reverse();
    let y0 = ext[0];
    sosfilt(sos, &mut ext, &zi, y0);
    ext.reverse();

    ext[padlen..padlen + n].iter().map(|&v| v as f32).collect()
}

/// Magnitude response of the cascade at normalised frequency `w` (0..1).
pub fn gain_at(sos: &Sos, w: f64) -> f64 {
    let z = Complex64::from_polar(1.0, -PI * w);
    let z2 = z * z;
    sos.sections
        .iter()
        .map(|s| {
            let num = s.b[0] + s.b[1] * z + s.b[2] * z2;
            let den = s.a[0] + s.a[1] * z + s.a[2] * z2;
            (num / den).norm()
        })
        .product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn first_order_highpass_coefficients() {
        // scipy.signal.butter(1, 0.5, 'high') -> b = [0.5, -0.5], a = [1, 0]
        let sos = butter_highpass(1, 0.5).unwrap();
        assert_eq!(sos.sections.len(), 1);
        let s = sos.sections[0];
        assert_abs_diff_eq!(s.b[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(s.b[1], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(s.a[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn highpass_response() {
        let sos = butter_highpass(1, 60.0 / 8000.0).unwrap();
        assert_abs_diff_eq!(gain_at(&sos, 60.0 / 8000.0), 1.0 / 2f64.sqrt(), epsilon = 1e-6);
        assert!(gain_at(&sos, 1e-5) < 0.01);
        assert_abs_diff_eq!(gain_at(&sos, 0.999), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn bandpass_response() {
        let low = 80.0 / 8000.0;
        let high = 7000.0 / 8000.0;
        let sos = butter_bandpass(4, low, high).unwrap();
        assert_eq!(sos.order, 8);
        assert_eq!(sos.sections.len(), 4);
        assert_abs_diff_eq!(gain_at(&sos, 0.1), 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(gain_at(&sos, low), 1.0 / 2f64.sqrt(), epsilon = 1e-4);
        assert_abs_diff_eq!(gain_at(&sos, high), 1.0 / 2f64.sqrt(), epsilon = 1e-4);
        assert!(gain_at(&sos, 0.001) < 1e-3);
    }

    #[test]
    fn bad_cutoffs_are_rejected() {
        assert!(butter_highpass(1, 0.0).is_err());
        assert!(butter_highpass(1, 1.0).is_err());
        assert!(butter_bandpass(4, 0.5, 0.2).is_err());
    }

    #[test]
    fn filtfilt_removes_dc() {
        let sos = butter_highpass(1, 60.0 / 8000.0).unwrap();
        let x: Vec<f32> = (0..16_000)
            .map(|i| 0.5 + 0.3 * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 16_000.0).sin())
            .collect();
        let y = filtfilt(&sos, &x);
        assert_eq!(y.len(), x.len());
        let mean: f32 = y[4_000..12_000].iter().sum::<f32>() / 8_000.0;
        assert!(mean.abs() < 0.01, "mean {mean}");
        let peak = y[4_000..12_000].iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert_abs_diff_eq!(peak, 0.3, epsilon = 0.01);
    }

    #[test]
    fn filtfilt_short_signals() {
        let sos = butter_bandpass(4, 0.01, 0.875).unwrap();
        assert_eq!(filtfilt(&sos, &[0.25]), vec![0.25]);
        assert_eq!(filtfilt(&sos, &[0.1, 0.2, 0.3]).len(), 3);
    }
}
