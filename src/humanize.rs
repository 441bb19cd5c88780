//! Humanized mouse motion: curved waypoint paths with a per-session
//! personality, plus the idle-drift parameters used by the extension's
//! drift scheduler.

use rand::Rng;
use tokio::time::Duration;

/// Fixed biometric profile the personality scales.
#[derive(Debug, Clone, Copy)]
pub struct MotionProfile {
    /// Median pointer velocity in px/s.
    pub median_velocity: f64,
    /// Distances beyond this may overshoot and correct.
    pub overshoot_threshold: f64,
    /// Bounds for the inter-waypoint delay in milliseconds.
    pub min_sample_interval_ms: u64,
    pub max_sample_interval_ms: u64,
    /// Idle-drift magnitude bounds in px.
    pub drift_min_px: f64,
    pub drift_max_px: f64,
    /// Idle-drift scheduling bounds in seconds.
    pub drift_min_interval_secs: u64,
    pub drift_max_interval_secs: u64,
}

/// The profile every session starts from.
pub const PROFILE: MotionProfile = MotionProfile {
    median_velocity: 180.0,
    overshoot_threshold: 200.0,
    min_sample_interval_ms: 15,
    max_sample_interval_ms: 50,
    drift_min_px: 2.0,
    drift_max_px: 5.0,
    drift_min_interval_secs: 10,
    drift_max_interval_secs: 30,
};

/// Movements shorter than this go straight to the target.
pub const MIN_PATH_DISTANCE: f64 = 5.0;

/// Per-session randomized motion character, drawn once and reused so a
/// session moves consistently.
#[derive(Debug, Clone, Copy)]
pub struct Personality {
    /// Scales the profile velocity, in `[0.7, 1.3]`.
    pub speed_multiplier: f64,
    /// Probability of overshooting long movements, in `[0.3, 0.8]`.
    pub overshoot_tendency: f64,
    /// How far paths bow away from the straight line, in `[0.3, 0.7]`.
    pub curvature_bias: f64,
    /// Per-waypoint positional noise in px, in `[0.5, 2.0]`.
    pub jitter_px: f64,
}

impl Personality {
    /// Draw a bounded random personality.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            speed_multiplier: rng.gen_range(0.7..=1.3),
            overshoot_tendency: rng.gen_range(0.3..=0.8),
            curvature_bias: rng.gen_range(0.3..=0.7),
            jitter_px: rng.gen_range(0.5..=2.0),
        }
    }
}

/// One step of a motion path: move to `(x, y)` after `delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    pub delay_ms: u64,
}

/// Generate a humanized path from `from` to `to`.
///
/// Guarantees: the final waypoint equals the target exactly; every
/// waypoint lies within the viewport; every delay is positive; paths
/// under [`MIN_PATH_DISTANCE`] collapse to a single waypoint at the
/// target; longer distances produce more waypoints.
pub fn generate_path<R: Rng + ?Sized>(
    from: (f64, f64),
    to: (f64, f64),
    viewport: (f64, f64),
    personality: Personality,
    rng: &mut R,
) -> Vec<Waypoint> {
    let (x0, y0) = from;
    let (x1, y1) = to;
    let distance = (x1 - x0).hypot(y1 - y0);

    if distance < MIN_PATH_DISTANCE {
        return vec![Waypoint {
            x: x1,
            y: y1,
            delay_ms: PROFILE.min_sample_interval_ms,
        }];
    }

    // Waypoint density scales with distance.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let steps = ((distance / 120.0).ceil() as usize + 3).min(24);

    // Control point bows the path off the straight line.
    let mid_x = f64::midpoint(x0, x1);
    let mid_y = f64::midpoint(y0, y1);
    let (perp_x, perp_y) = (-(y1 - y0) / distance, (x1 - x0) / distance);
    let bow = distance * personality.curvature_bias * 0.25 * sign(rng);
    let ctrl = (mid_x + perp_x * bow, mid_y + perp_y * bow);

    // Long movements may overshoot, then correct back.
    let overshoots = distance > PROFILE.overshoot_threshold
        && rng.gen_bool(personality.overshoot_tendency.clamp(0.0, 1.0));
    let aim = if overshoots {
        let past = rng.gen_range(6.0..18.0);
        (
            x1 + (x1 - x0) / distance * past,
            y1 + (y1 - y0) / distance * past,
        )
    } else {
        (x1, y1)
    };

    let mut points: Vec<(f64, f64)> = Vec::with_capacity(steps + 3);
    for step in 1..=steps {
        let t = step as f64 / steps as f64;
        let (bx, by) = bezier((x0, y0), ctrl, aim, t);
        let jx = rng.gen_range(-personality.jitter_px..=personality.jitter_px);
        let jy = rng.gen_range(-personality.jitter_px..=personality.jitter_px);
        points.push((bx + jx, by + jy));
    }
    if overshoots {
        // Two-step correction back onto the target.
        points.push((
            f64::midpoint(aim.0, x1),
            f64::midpoint(aim.1, y1),
        ));
    }
    // The terminal waypoint is the exact target, jitter-free.
    points.push((x1, y1));

    let speed = PROFILE.median_velocity * personality.speed_multiplier;
    let mut previous = (x0, y0);
    let mut path = Vec::with_capacity(points.len());
    let last = points.len() - 1;
    for (index, point) in points.into_iter().enumerate() {
        let clamped = if index == last {
            point
        } else {
            clamp_to_viewport(point, viewport)
        };
        let segment = (clamped.0 - previous.0).hypot(clamped.1 - previous.1);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay_ms = ((segment / speed * 1000.0).round() as u64)
            .clamp(PROFILE.min_sample_interval_ms, PROFILE.max_sample_interval_ms);
        path.push(Waypoint {
            x: clamped.0,
            y: clamped.1,
            delay_ms,
        });
        previous = clamped;
    }
    path
}

/// A small random offset for idle drift, magnitude within the profile's
/// drift bounds (never more than 5 px).
pub fn drift_offset<R: Rng + ?Sized>(rng: &mut R) -> (f64, f64) {
    let angle = rng.gen_range(0.0..std::f64::consts::TAU);
    let magnitude = rng.gen_range(PROFILE.drift_min_px..=PROFILE.drift_max_px);
    (angle.cos() * magnitude, angle.sin() * magnitude)
}

/// How long until the next idle-drift tick.
pub fn drift_interval<R: Rng + ?Sized>(rng: &mut R) -> Duration {
    Duration::from_secs(
        rng.gen_range(PROFILE.drift_min_interval_secs..=PROFILE.drift_max_interval_secs),
    )
}

fn bezier(p0: (f64, f64), p1: (f64, f64), p2: (f64, f64), t: f64) -> (f64, f64) {
    let u = 1.0 - t;
    (
        u * u * p0.0 + 2.0 * u * t * p1.0 + t * t * p2.0,
        u * u * p0.1 + 2.0 * u * t * p1.1 + t * t * p2.1,
    )
}

fn clamp_to_viewport(point: (f64, f64), viewport: (f64, f64)) -> (f64, f64) {
    (
        point.0.clamp(0.0, (viewport.0 - 1.0).max(0.0)),
        point.1.clamp(0.0, (viewport.1 - 1.0).max(0.0)),
    )
}

fn sign<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    if rng.r#gen::<bool>() { 1.0 } else { -1.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const VIEWPORT: (f64, f64) = (1920.0, 1080.0);

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn personality() -> Personality {
        Personality {
            speed_multiplier: 1.0,
            overshoot_tendency: 0.5,
            curvature_bias: 0.5,
            jitter_px: 1.0,
        }
    }

    #[test]
    fn short_distance_single_waypoint_at_target() {
        let mut rng = rng();
        let path = generate_path((100.0, 100.0), (102.0, 103.0), VIEWPORT, personality(), &mut rng);
        assert_eq!(path.len(), 1);
        assert!((path[0].x - 102.0).abs() < f64::EPSILON);
        assert!((path[0].y - 103.0).abs() < f64::EPSILON);
        assert!(path[0].delay_ms > 0);
    }

    #[test]
    fn path_ends_exactly_at_target() {
        let mut rng = rng();
        for _ in 0..50 {
            let path = generate_path((0.0, 0.0), (500.0, 300.0), VIEWPORT, personality(), &mut rng);
            let last = path.last().unwrap();
            assert!((last.x - 500.0).abs() < f64::EPSILON);
            assert!((last.y - 300.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn waypoints_stay_in_viewport_with_positive_delays() {
        let mut rng = rng();
        for _ in 0..50 {
            let path =
                generate_path((10.0, 10.0), (1900.0, 1060.0), VIEWPORT, personality(), &mut rng);
            assert!(path.len() >= 2);
            for waypoint in &path {
                assert!(waypoint.x >= 0.0 && waypoint.x < VIEWPORT.0);
                assert!(waypoint.y >= 0.0 && waypoint.y < VIEWPORT.1);
                assert!(waypoint.delay_ms > 0);
                assert!(waypoint.delay_ms <= PROFILE.max_sample_interval_ms);
            }
        }
    }

    #[test]
    fn longer_distance_means_more_waypoints() {
        let mut rng_a = rng();
        let mut rng_b = rng();
        let short = generate_path((0.0, 0.0), (120.0, 0.0), VIEWPORT, personality(), &mut rng_a);
        let long = generate_path((0.0, 0.0), (1500.0, 700.0), VIEWPORT, personality(), &mut rng_b);
        assert!(long.len() > short.len());
    }

    #[test]
    fn personality_bounds() {
        let mut rng = rng();
        for _ in 0..100 {
            let p = Personality::random(&mut rng);
            assert!((0.7..=1.3).contains(&p.speed_multiplier));
            assert!((0.3..=0.8).contains(&p.overshoot_tendency));
            assert!((0.3..=0.7).contains(&p.curvature_bias));
            assert!((0.5..=2.0).contains(&p.jitter_px));
        }
    }

    #[test]
    fn drift_offset_bounded() {
        let mut rng = rng();
        for _ in 0..100 {
            let (dx, dy) = drift_offset(&mut rng);
            let magnitude = dx.hypot(dy);
            assert!(magnitude <= PROFILE.drift_max_px + 1e-9);
            assert!(magnitude >= PROFILE.drift_min_px - 1e-9);
        }
    }

    #[test]
    fn drift_interval_bounded() {
        let mut rng = rng();
        for _ in 0..100 {
            let interval = drift_interval(&mut rng);
            assert!(interval >= Duration::from_secs(10));
            assert!(interval <= Duration::from_secs(30));
        }
    }
}
