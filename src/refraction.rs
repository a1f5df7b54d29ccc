//! Subaqueous refraction correction.
//!
//! Photon depth data over water is biased by refraction at the air/water
//! interface: the apparent seabed photon sits deeper and further along the
//! cross-track direction than the true one. The correction follows
//! Parrish et al. 2019 (Remote Sensing 11(14), 1634): Snell's law on the
//! incident vector gives the refracted slant range, the offset is resolved
//! in the local cross-track / vertical plane, and the corrected
//! easting/northing is re-projected to geographic coordinates through the
//! inverse UTM transform.
//!
//! The corrector never fails the frame: photons that cannot be corrected
//! (dry, degenerate geometry, off-mask transforms) keep `delta_h = 0` and
//! their coordinates unchanged.

use crate::config::RefractionConfig;
use crate::crs;
use crate::io::WaterRiMask;
use anyhow::{bail, Context, Result};
use std::f64::consts::FRAC_PI_2;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A photon data frame as parallel column vectors, with the UTM zone its
/// `x`/`y` columns are expressed in.
#[derive(Debug, Clone, Default)]
pub struct PhotonFrame {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    /// UTM easting
    pub x: Vec<f64>,
    /// UTM northing
    pub y: Vec<f64>,
    /// Sea surface height
    pub surface_h: Vec<f64>,
    /// Orthometric photon height
    pub ortho_h: Vec<f64>,
    /// Elevation of the unit pointing vector, radians from nadir
    pub ref_el: Vec<f64>,
    /// Azimuth of the unit pointing vector, radians from north
    pub ref_az: Vec<f64>,
    /// Output: refraction height correction
    pub delta_h: Vec<f64>,
    pub utm_zone: u8,
    pub utm_is_north: bool,
}

impl PhotonFrame {
    pub fn new(utm_zone: u8, utm_is_north: bool) -> Self {
        Self {
            utm_zone,
            utm_is_north,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.lat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lat.is_empty()
    }

    /// Append one photon.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        lat: f64,
        lon: f64,
        x: f64,
        y: f64,
        surface_h: f64,
        ortho_h: f64,
        ref_el: f64,
        ref_az: f64,
    ) {
        self.lat.push(lat);
        self.lon.push(lon);
        self.x.push(x);
        self.y.push(y);
        self.surface_h.push(surface_h);
        self.ortho_h.push(ortho_h);
        self.ref_el.push(ref_el);
        self.ref_az.push(ref_az);
        self.delta_h.push(0.0);
    }

    fn validate(&self) -> Result<()> {
        let n = self.lat.len();
        let columns = [
            self.lon.len(),
            self.x.len(),
            self.y.len(),
            self.surface_h.len(),
            self.ortho_h.len(),
            self.ref_el.len(),
            self.ref_az.len(),
            self.delta_h.len(),
        ];
        if columns.iter().any(|len| *len != n) {
            bail!("Photon frame columns have mismatched lengths");
        }
        Ok(())
    }
}

/// Correct every subaqueous photon of a frame in place.
///
/// The per-photon water refractive index comes from `mask` when supplied,
/// falling back to the configured constant for off-mask photons. The
/// counter is incremented once per subaqueous photon (`depth > 0`).
pub fn correct_frame(
    frame: &mut PhotonFrame,
    params: &RefractionConfig,
    mask: Option<&WaterRiMask>,
    subaqueous: &AtomicU64,
) -> Result<()> {
    frame.validate()?;

    let utm = crs::utm_epsg(frame.utm_zone, frame.utm_is_north);
    let transform = crs::make_transform(&utm, crs::codes::WGS84)?;

    let n1 = params.ri_air;

    for i in 0..frame.len() {
        // Un-refraction-corrected depth; dry photons are untouched
        let depth = frame.surface_h[i] - frame.ortho_h[i];
        if depth <= 0.0 {
            continue;
        }
        subaqueous.fetch_add(1, Ordering::Relaxed);

        let mut n2 = params.ri_water;
        if let Some(mask) = mask {
            if let Some(ri) = mask.refractive_index(frame.lon[i], frame.lat[i]) {
                n2 = ri;
            }
        }

        let theta_1 = FRAC_PI_2 - frame.ref_el[i]; // angle of incidence
        let theta_2 = (n1 * theta_1.sin() / n2).asin(); // angle of refraction
        let phi = theta_1 - theta_2;
        let s = depth / theta_1.cos(); // uncorrected slant range
        let r = s * n1 / n2; // corrected slant range
        let p = (r * r + s * s - 2.0 * r * s * phi.cos()).sqrt();
        let gamma = FRAC_PI_2 - theta_1;
        let alpha = (r * phi.sin() / p).asin();
        let beta = gamma - alpha;
        let d_z = p * beta.sin(); // vertical offset
        let d_y = p * beta.cos(); // cross-track offset
        let d_e = d_y * frame.ref_az[i].sin(); // UTM offsets
        let d_n = d_y * frame.ref_az[i].cos();

        // Degenerate geometry (n1 == n2 collapses p to zero) leaves the
        // photon unchanged
        if !d_z.is_finite() || !d_e.is_finite() || !d_n.is_finite() {
            continue;
        }

        let corr_x = frame.x[i] + d_e;
        let corr_y = frame.y[i] + d_n;
        match transform.convert((corr_x, corr_y)) {
            Ok((lon, lat)) => {
                frame.delta_h[i] = d_z;
                frame.x[i] = corr_x;
                frame.y[i] = corr_y;
                frame.lon[i] = lon;
                frame.lat[i] = lat;
            }
            Err(e) => {
                tracing::debug!("Inverse UTM failed for photon {}: {}", i, e);
            }
        }
    }

    Ok(())
}

/// Runs the refraction pass on a dedicated worker thread.
pub struct RefractionCorrector {
    thread: Option<JoinHandle<Result<PhotonFrame>>>,
    subaqueous: Arc<AtomicU64>,
    complete: Arc<(Mutex<bool>, Condvar)>,
}

impl RefractionCorrector {
    /// Spawn the correction thread, opening the water-RI mask when the
    /// parameters ask for it.
    pub fn spawn(params: RefractionConfig, frame: PhotonFrame) -> Result<Self> {
        let mask = if params.use_water_ri_mask {
            Some(WaterRiMask::open(&params.water_ri_mask_path)?)
        } else {
            None
        };
        Self::spawn_with_mask(params, mask, frame)
    }

    /// Spawn with an already-open mask (or none).
    pub fn spawn_with_mask(
        params: RefractionConfig,
        mask: Option<WaterRiMask>,
        mut frame: PhotonFrame,
    ) -> Result<Self> {
        let subaqueous = Arc::new(AtomicU64::new(0));
        let complete = Arc::new((Mutex::new(false), Condvar::new()));

        let counter = subaqueous.clone();
        let done = complete.clone();
        let thread = std::thread::Builder::new()
            .name("refraction".to_string())
            .spawn(move || {
                let result = correct_frame(&mut frame, &params, mask.as_ref(), &counter);

                let (lock, condvar) = &*done;
                *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
                condvar.notify_all();

                result.map(|_| frame)
            })
            .context("Failed to create refraction thread")?;

        Ok(Self {
            thread: Some(thread),
            subaqueous,
            complete,
        })
    }

    /// Running count of subaqueous photons, readable while in flight.
    pub fn subaqueous_photons(&self) -> u64 {
        self.subaqueous.load(Ordering::Relaxed)
    }

    pub fn is_complete(&self) -> bool {
        *self
            .complete
            .0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the pass signals completion or the timeout elapses.
    /// Returns whether the pass completed.
    pub fn wait_complete(&self, timeout: std::time::Duration) -> bool {
        let (lock, condvar) = &*self.complete;
        let mut done = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            let (guard, result) = condvar
                .wait_timeout(done, timeout)
                .unwrap_or_else(|e| e.into_inner());
            done = guard;
            if result.timed_out() {
                break;
            }
        }
        *done
    }

    /// Join the worker and take back the corrected frame.
    pub fn join(mut self) -> Result<PhotonFrame> {
        let thread = self
            .thread
            .take()
            .context("Refraction thread already joined")?;
        match thread.join() {
            Ok(result) => result,
            Err(_) => bail!("Refraction thread panicked"),
        }
    }
}
