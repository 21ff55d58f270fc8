//! Telemetry publisher: on a fixed period, snapshot the three records and
//! push one serialized frame to the paired client. Latest value wins —
//! nothing is queued while the peer is away, a failed send is dropped.

use embassy_time::Ticker;
use heapless::Vec;
use postcard::to_vec;
use serde::{Deserialize, Serialize};

use crate::config::TaskConfig;
use crate::link::Link;
use crate::state::{GpsRecord, SensorRecord, Store, VarioRecord};

/// Everything the paired client gets per notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    pub sensor: SensorRecord,
    pub gps: GpsRecord,
    pub vario: VarioRecord,
}

/// Wire budget per frame; a postcard-encoded [`Frame`] stays well inside.
pub const MAX_FRAME: usize = 128;

/// Copy all three records out: three short lock sections, one per record,
/// never nested. The combined snapshot may mix samples a few cycles apart;
/// consumers tolerate that skew.
pub async fn snapshot(store: &Store) -> Frame {
    Frame {
        sensor: store.sensor.read().await,
        gps: store.gps.read().await,
        vario: store.vario.read().await,
    }
}

pub fn encode(frame: &Frame) -> Result<Vec<u8, MAX_FRAME>, postcard::Error> {
    to_vec(frame)
}

/// One publish cycle. While disconnected this returns before touching the
/// store or the link; failures are logged and dropped, the next period
/// tries again naturally.
pub async fn publish(link: &mut impl Link, store: &Store) {
    if !link.is_connected() {
        return;
    }

    let frame = snapshot(store).await;
    match encode(&frame) {
        Ok(bytes) => {
            if link.send(&bytes).await.is_err() {
                warn!("telemetry send failed, dropping frame");
            }
        }
        Err(_) => warn!("telemetry frame over {} bytes, dropping", MAX_FRAME),
    }
}

pub async fn run(mut link: impl Link, store: &'static Store, cfg: TaskConfig) -> ! {
    info!(
        "telemetry task up: period {} ms, prio {}, stack {} B",
        cfg.period.as_millis(),
        cfg.priority,
        cfg.stack_bytes
    );
    let mut ticker = Ticker::every(cfg.period);
    loop {
        ticker.next().await;
        publish(&mut link, store).await;
    }
}
