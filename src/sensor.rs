//! Sensor producer: polls the board's IMU and keeps the sensor record
//! fresh. The IMU itself is a black box behind [`SensorSource`].

use embassy_time::Ticker;

use crate::config::TaskConfig;
use crate::state::{SensorRecord, Store};

/// One inertial sample from whatever IMU the board carries.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorSample {
    pub accel_g: [f32; 3],
    pub gyro_dps: [f32; 3],
}

pub trait SensorSource {
    /// `None` when the device has no usable sample this cycle.
    async fn sample(&mut self) -> Option<SensorSample>;
}

/// Fold one acquisition result into the record. A miss only clears the
/// validity flag; the last good reading stays in place so consumers keep
/// showing something plausible.
pub fn apply(record: &mut SensorRecord, sample: Option<SensorSample>) {
    match sample {
        Some(s) => {
            record.accel_g = s.accel_g;
            record.gyro_dps = s.gyro_dps;
            record.valid = true;
        }
        None => record.valid = false,
    }
}

pub async fn run(mut source: impl SensorSource, store: &'static Store, cfg: TaskConfig) -> ! {
    info!(
        "sensor task up: period {} ms, prio {}, stack {} B",
        cfg.period.as_millis(),
        cfg.priority,
        cfg.stack_bytes
    );
    let mut ticker = Ticker::every(cfg.period);
    loop {
        ticker.next().await;
        // Acquire outside the lock; only the copy below runs under it.
        let sample = source.sample().await;
        if sample.is_none() {
            warn!("sensor read miss");
        }
        store.sensor.update(|r| apply(r, sample)).await;
    }
}
