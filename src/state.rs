//! Shared state store: one record per data domain, each behind its own
//! mutex. Producers are the sole writers of their record; everything else
//! only takes copies. Critical sections are field copies, nothing more.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use serde::{Deserialize, Serialize};

// Fallback ground position reported until the first GPS fix (Bern, CH).
pub const FALLBACK_LATITUDE: f64 = 46.947597;
pub const FALLBACK_LONGITUDE: f64 = 7.440434;
pub const FALLBACK_ALTITUDE_M: f64 = 542.5;

/// Latest inertial sample, written only by the sensor task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorRecord {
    pub accel_g: [f32; 3],
    pub gyro_dps: [f32; 3],
    pub valid: bool,
}

/// Latest position solution, written only by the GPS task.
///
/// `fix_valid == false` means everything but the validity flag is either the
/// startup fallback or a stale previous fix. `test_data` is set when the
/// record came from the canned bench source instead of a live receiver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GpsRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub course_deg: f64,
    pub speed_kmh: f64,
    pub timestamp: u32,
    pub fix_valid: bool,
    pub test_data: bool,
}

impl GpsRecord {
    pub const INITIAL: Self = Self {
        latitude: FALLBACK_LATITUDE,
        longitude: FALLBACK_LONGITUDE,
        altitude_m: FALLBACK_ALTITUDE_M,
        course_deg: 0.0,
        speed_kmh: 0.0,
        timestamp: 0,
        fix_valid: false,
        test_data: false,
    };
}

impl Default for GpsRecord {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// Latest derived altitude and climb rate, written only by the vario task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VarioRecord {
    pub altitude_m: f32,
    pub vertical_speed_mps: f32,
}

/// A single record slot. The mutex never leaves this wrapper, so a caller
/// cannot hold the lock across I/O or computation.
pub struct Record<T: Copy> {
    inner: Mutex<CriticalSectionRawMutex, T>,
}

impl<T: Copy> Record<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Copy the latest value out. The lock is held for the copy only.
    pub async fn read(&self) -> T {
        *self.inner.lock().await
    }

    /// Replace the whole record in one critical section.
    pub async fn write(&self, value: T) {
        *self.inner.lock().await = value;
    }

    /// Mutate the record in place under the lock. `f` must only touch
    /// fields; readers never observe a partially applied update.
    pub async fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut *self.inner.lock().await);
    }
}

/// The three record slots the pipeline runs on.
pub struct Store {
    pub sensor: Record<SensorRecord>,
    pub gps: Record<GpsRecord>,
    pub vario: Record<VarioRecord>,
}

impl Store {
    pub const fn new() -> Self {
        Self {
            sensor: Record::new(SensorRecord {
                accel_g: [0.0; 3],
                gyro_dps: [0.0; 3],
                valid: false,
            }),
            gps: Record::new(GpsRecord::INITIAL),
            vario: Record::new(VarioRecord {
                altitude_m: 0.0,
                vertical_speed_mps: 0.0,
            }),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

// Records live for the whole process; there is no teardown path.
pub static STORE: Store = Store::new();

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn startup_defaults_are_the_fallback_position() {
        let store = Store::new();
        let gps = block_on(store.gps.read());
        assert_eq!(gps.latitude, 46.947597);
        assert_eq!(gps.longitude, 7.440434);
        assert_eq!(gps.altitude_m, 542.5);
        assert!(!gps.fix_valid);
        assert!(!gps.test_data);

        let sensor = block_on(store.sensor.read());
        assert!(!sensor.valid);

        let vario = block_on(store.vario.read());
        assert_eq!(vario.altitude_m, 0.0);
        assert_eq!(vario.vertical_speed_mps, 0.0);
    }

    #[test]
    fn read_is_idempotent_without_intervening_write() {
        let record = Record::new(GpsRecord::INITIAL);
        let a = block_on(record.read());
        let b = block_on(record.read());
        assert_eq!(a, b);
    }

    #[test]
    fn write_then_read_returns_the_written_value() {
        let record = Record::new(VarioRecord::default());
        let value = VarioRecord {
            altitude_m: 1203.5,
            vertical_speed_mps: -0.8,
        };
        block_on(record.write(value));
        assert_eq!(block_on(record.read()), value);
    }

    // Writer flips the whole record between two self-consistent patterns;
    // a concurrent reader must never see a mix of the two.
    #[test]
    fn readers_never_observe_a_torn_write() {
        use std::sync::Arc;

        let record = Arc::new(Record::new(SensorRecord::default()));
        let writer = {
            let record = Arc::clone(&record);
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    let v = if i % 2 == 0 { 1.0 } else { -1.0 };
                    block_on(record.write(SensorRecord {
                        accel_g: [v; 3],
                        gyro_dps: [v; 3],
                        valid: true,
                    }));
                }
            })
        };

        for _ in 0..10_000 {
            let snapshot = block_on(record.read());
            assert_eq!(
                snapshot.accel_g, snapshot.gyro_dps,
                "mixed fields from two writes: {snapshot:?}"
            );
        }
        writer.join().unwrap();
    }

    #[test]
    fn update_touches_only_what_the_closure_touches() {
        let record = Record::new(GpsRecord {
            latitude: 47.0,
            longitude: 7.5,
            fix_valid: true,
            ..GpsRecord::INITIAL
        });
        block_on(record.update(|r| r.fix_valid = false));
        let after = block_on(record.read());
        assert!(!after.fix_valid);
        assert_eq!(after.latitude, 47.0);
        assert_eq!(after.longitude, 7.5);
    }
}
