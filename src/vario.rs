//! Variometer producer: samples the barometric altimeter, derives the
//! climb rate from the altitude change over the elapsed time, and keeps
//! the vario record fresh. Falls back to GPS altitude when the baro is out.

use bme280::i2c::AsyncBME280;
use embassy_time::{Delay, Instant, Ticker};
#[cfg(test)]
use embassy_time::Duration;
use embedded_hal_async::i2c::I2c;
use micromath::F32Ext;

use crate::config::TaskConfig;
use crate::state::{Store, VarioRecord};

// First-order smoothing weight for the climb-rate estimate.
const SMOOTHING: f32 = 0.3;

pub trait Altimeter {
    /// `None` when no altitude is available this cycle.
    async fn altitude_m(&mut self) -> Option<f32>;
}

/// Pressure altitude per the barometric formula, pressure in Pa.
pub fn pressure_altitude_m(pressure_pa: f32) -> f32 {
    const SEA_LEVEL_PA: f32 = 101_325.0;
    44_330.0 * (1.0 - f32::powf(pressure_pa / SEA_LEVEL_PA, 0.1903))
}

/// Exponentially smoothed finite-difference climb rate. Deterministic:
/// the same (altitude, dt) sequence always yields the same output.
pub struct Vario {
    last_altitude_m: Option<f32>,
    last_update: Option<Instant>,
    vertical_speed_mps: f32,
    smoothing: f32,
}

impl Vario {
    pub const fn new(smoothing: f32) -> Self {
        Self {
            last_altitude_m: None,
            last_update: None,
            vertical_speed_mps: 0.0,
            smoothing,
        }
    }

    /// Feed one successful acquisition. Elapsed time is measured from the
    /// previous *successful* one, so an acquisition outage widens the
    /// altitude delta and the time base together and the first cycle after
    /// recovery yields the average rate over the gap, not a spike.
    pub fn advance(&mut self, altitude_m: f32, now: Instant) -> f32 {
        let dt_s = match self.last_update {
            Some(prev) => (now - prev).as_micros() as f32 / 1_000_000.0,
            None => 0.0,
        };
        self.last_update = Some(now);
        self.update(altitude_m, dt_s)
    }

    pub fn update(&mut self, altitude_m: f32, dt_s: f32) -> f32 {
        if let Some(prev) = self.last_altitude_m {
            if dt_s > 0.0 {
                let raw = (altitude_m - prev) / dt_s;
                self.vertical_speed_mps += self.smoothing * (raw - self.vertical_speed_mps);
            }
        }
        self.last_altitude_m = Some(altitude_m);
        self.vertical_speed_mps
    }
}

pub async fn run(mut altimeter: impl Altimeter, store: &'static Store, cfg: TaskConfig) -> ! {
    info!(
        "vario task up: period {} ms, prio {}, stack {} B",
        cfg.period.as_millis(),
        cfg.priority,
        cfg.stack_bytes
    );
    let mut vario = Vario::new(SMOOTHING);
    let mut ticker = Ticker::every(cfg.period);

    loop {
        ticker.next().await;

        // Acquire first; the GPS fallback copies the record out and drops
        // the lock before any arithmetic happens.
        let altitude = match altimeter.altitude_m().await {
            Some(alt) => Some(alt),
            None => {
                let gps = store.gps.read().await;
                gps.fix_valid.then(|| gps.altitude_m as f32)
            }
        };

        let Some(altitude_m) = altitude else {
            warn!("no altitude source this cycle");
            continue;
        };

        let vertical_speed_mps = vario.advance(altitude_m, Instant::now());
        store
            .vario
            .write(VarioRecord {
                altitude_m,
                vertical_speed_mps,
            })
            .await;
    }
}

/// BME280-backed altimeter. Init is retried lazily so a flaky bus at
/// power-on degrades to "unavailable" instead of wedging the task.
pub struct Bme280Altimeter<I2C> {
    device: AsyncBME280<I2C>,
    ready: bool,
}

impl<I2C: I2c> Bme280Altimeter<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self {
            device: AsyncBME280::new_primary(i2c),
            ready: false,
        }
    }
}

impl<I2C: I2c> Altimeter for Bme280Altimeter<I2C> {
    async fn altitude_m(&mut self) -> Option<f32> {
        if !self.ready {
            if self.device.init(&mut Delay).await.is_err() {
                warn!("bme280 init failed");
                return None;
            }
            self.ready = true;
        }
        match self.device.measure(&mut Delay).await {
            Ok(m) => Some(pressure_altitude_m(m.pressure)),
            Err(_) => {
                warn!("bme280 measure failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sea_level_pressure_is_zero_altitude() {
        assert!(pressure_altitude_m(101_325.0).abs() < 0.5);
    }

    #[test]
    fn lower_pressure_is_higher_altitude() {
        // ~540 m should come out somewhere near the Bern plateau.
        let alt = pressure_altitude_m(95_000.0);
        assert!(alt > 400.0 && alt < 700.0, "got {alt}");
    }

    #[test]
    fn steady_climb_converges_to_the_true_rate() {
        let mut vario = Vario::new(0.3);
        let mut out = 0.0;
        // 1.0 m/s climb sampled at 10 Hz.
        for i in 0..100 {
            out = vario.update(600.0 + i as f32 * 0.1, 0.1);
        }
        assert!((out - 1.0).abs() < 0.01, "got {out}");
    }

    #[test]
    fn identical_input_sequences_give_identical_output() {
        let seq = [(600.0, 0.1), (600.3, 0.1), (600.5, 0.12), (600.2, 0.1)];
        let mut a = Vario::new(0.3);
        let mut b = Vario::new(0.3);
        for (alt, dt) in seq {
            assert_eq!(a.update(alt, dt), b.update(alt, dt));
        }
    }

    // Altimeter drops out for ten cycles during a steady 1.0 m/s climb.
    // The first reading after recovery spans the whole gap, so the rate
    // must come out near the true rate, not a multiple of it.
    #[test]
    fn an_acquisition_outage_does_not_spike_the_climb_rate() {
        let mut vario = Vario::new(0.3);
        let period = Duration::from_millis(100);
        let mut now = Instant::from_millis(0);
        let mut altitude = 600.0;
        let mut out = 0.0;

        for _ in 0..50 {
            out = vario.advance(altitude, now);
            now += period;
            altitude += 0.1;
        }
        assert!((out - 1.0).abs() < 0.01, "pre-outage rate {out}");

        // Ten dry cycles: the aircraft keeps climbing, the estimator sees
        // nothing and its time base stays parked at the last good sample.
        for _ in 0..10 {
            now += period;
            altitude += 0.1;
        }

        let recovered = vario.advance(altitude, now);
        assert!(
            (recovered - 1.0).abs() < 0.05,
            "post-outage rate spiked: {recovered}"
        );
    }

    #[test]
    fn first_sample_and_zero_dt_produce_no_spike() {
        let mut vario = Vario::new(0.3);
        assert_eq!(vario.update(600.0, 0.1), 0.0);
        assert_eq!(vario.update(601.0, 0.0), 0.0);
    }
}
