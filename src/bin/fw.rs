#![deny(unsafe_code)]
#![no_main]
#![no_std]

use bleps::{
    ad_structure::{
        create_advertising_data, AdStructure, BR_EDR_NOT_SUPPORTED, LE_GENERAL_DISCOVERABLE,
    },
    async_attribute_server::AttributeServer,
    asynch::Ble,
    att::Uuid,
    attribute_server::NotificationData,
    gatt,
};
use defmt::{info, warn};
use embassy_embedded_hal::shared_bus::asynch::i2c::I2cDevice;
use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, NoopRawMutex};
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::{Delay, Timer};
use esp_backtrace as _;
use esp_hal::{
    gpio::AnyPin,
    i2c::master::I2c,
    peripherals::{Peripherals, BT, I2C0, RADIO_CLK, RNG, TIMG0, TIMG1, UART0},
    prelude::*,
    rng::Rng,
    time,
    timer::timg::TimerGroup,
    uart::{Config as UartConfig, Uart, UartRx},
    Async,
};
use esp_wifi::{ble::controller::BleConnector, init as wifi_init, EspWifiController};
use heapless::Vec;
use static_cell::StaticCell;

use xc_vario::config;
use xc_vario::gps::{self, NmeaGps};
use xc_vario::link::{self, Link, LinkEvent, SendError};
use xc_vario::sensor::{self, SensorSample, SensorSource};
use xc_vario::state::STORE;
use xc_vario::telemetry;
use xc_vario::vario::{self, Bme280Altimeter};

macro_rules! mk_static {
    ($t:ty,$val:expr) => {{
        static STATIC_CELL: static_cell::StaticCell<$t> = static_cell::StaticCell::new();
        #[deny(unused_attributes)]
        let x = STATIC_CELL.uninit().write(($val));
        x
    }};
}

// The four periodic tasks have to fit the executor arena.
const _: () = assert!(
    config::SENSOR.stack_bytes
        + config::GPS.stack_bytes
        + config::VARIO.stack_bytes
        + config::TELEMETRY.stack_bytes
        <= 16384
);

// The advertised name the paired flight-computer app looks for. The GATT
// service/characteristic UUIDs live in the `gatt!` block below.
const DEVICE_NAME: &str = "m5-stack";

type SharedI2c = I2cDevice<'static, NoopRawMutex, I2c<'static, Async>>;

struct Pins {
    gps_rx: AnyPin,
    gps_tx: AnyPin,

    i2c_scl: AnyPin,
    i2c_sda: AnyPin,

    timg: TIMG0,
    timg1: TIMG1,
    uart: UART0,
    i2c: I2C0,
    rng: RNG,
    radio_clk: RADIO_CLK,
    bt: BT,
}

fn board_pins(p: Peripherals) -> Pins {
    Pins {
        gps_rx: p.GPIO4.degrade(),
        gps_tx: p.GPIO5.degrade(),

        i2c_scl: p.GPIO8.degrade(),
        i2c_sda: p.GPIO9.degrade(),

        timg: p.TIMG0,
        timg1: p.TIMG1,
        uart: p.UART0,
        i2c: p.I2C0,
        rng: p.RNG,
        radio_clk: p.RADIO_CLK,
        bt: p.BT,
    }
}

// ── Sensor source ────────────────────────────────────────────────────────────

/// BNO055 behind the shared I2C bus. Init is lazy for the same reason as
/// the altimeter's: a flaky bus at power-on degrades to "no sample".
struct Bno055Source {
    imu: bno055::Bno055<SharedI2c>,
    ready: bool,
}

impl Bno055Source {
    fn new(i2c: SharedI2c) -> Self {
        Self {
            imu: bno055::Bno055::new(i2c),
            ready: false,
        }
    }
}

impl SensorSource for Bno055Source {
    async fn sample(&mut self) -> Option<SensorSample> {
        if !self.ready {
            self.imu.init(&mut Delay).await.ok()?;
            self.imu
                .set_mode(bno055::BNO055OperationMode::NDOF, &mut Delay)
                .await
                .ok()?;
            self.ready = true;
        }

        let accel = self.imu.accel_data().await.ok()?;
        let gyro = self.imu.gyro_data().await.ok()?;
        Some(SensorSample {
            accel_g: [accel.x / 9.81, accel.y / 9.81, accel.z / 9.81],
            gyro_dps: [gyro.x, gyro.y, gyro.z],
        })
    }
}

// ── BLE link adapter ─────────────────────────────────────────────────────────

// Hand-off from the publisher to the notify loop. Capacity 1: a fresh frame
// replaces an unread one.
static NOTIFY_FRAMES: Channel<CriticalSectionRawMutex, Vec<u8, { telemetry::MAX_FRAME }>, 1> =
    Channel::new();

struct BleLink;

impl Link for BleLink {
    fn is_connected(&self) -> bool {
        link::is_connected()
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), SendError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(frame).map_err(|_| SendError::Transport)?;
        let _ = NOTIFY_FRAMES.try_receive();
        NOTIFY_FRAMES.try_send(buf).map_err(|_| SendError::Transport)
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────────

#[embassy_executor::task]
async fn sensor_task(source: Bno055Source) -> ! {
    sensor::run(source, &STORE, config::SENSOR).await
}

#[embassy_executor::task]
async fn gps_task(source: NmeaGps<UartRx<'static, Async>>) -> ! {
    gps::run(source, &STORE, config::GPS).await
}

#[embassy_executor::task]
async fn vario_task(altimeter: Bme280Altimeter<SharedI2c>) -> ! {
    vario::run(altimeter, &STORE, config::VARIO).await
}

#[embassy_executor::task]
async fn telemetry_task() -> ! {
    telemetry::run(BleLink, &STORE, config::TELEMETRY).await
}

#[embassy_executor::task]
async fn status_task() -> ! {
    loop {
        let gps = STORE.gps.read().await;
        let vario = STORE.vario.read().await;
        info!(
            "fix={} lat={} lon={} alt={}m vspd={}m/s",
            gps.fix_valid, gps.latitude, gps.longitude, vario.altitude_m, vario.vertical_speed_mps
        );
        Timer::after_millis(5_000).await;
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) -> ! {
    info!("initializing");

    let peripherals = esp_hal::init(esp_hal::Config::default());

    esp_alloc::heap_allocator!(72 * 1024);

    let pins = board_pins(peripherals);

    let wifi_timg = TimerGroup::new(pins.timg);
    let wifi = &*mk_static!(
        EspWifiController<'static>,
        wifi_init(wifi_timg.timer0, Rng::new(pins.rng), pins.radio_clk).unwrap()
    );

    let timg1 = TimerGroup::new(pins.timg1);
    esp_hal_embassy::init(timg1.timer0);

    // UART for the GPS receiver. The task owns the RX line completely.
    let uart_config = UartConfig::default().baudrate(9600);
    let uart = Uart::new_with_config(pins.uart, uart_config, pins.gps_rx, pins.gps_tx)
        .unwrap()
        .into_async();
    let (gps_rx, _) = uart.split();

    // Baro and IMU share the I2C bus.
    let i2c = I2c::new(pins.i2c, esp_hal::i2c::master::Config::default())
        .with_scl(pins.i2c_scl)
        .with_sda(pins.i2c_sda)
        .into_async();
    static I2C_BUS: StaticCell<Mutex<NoopRawMutex, I2c<'static, Async>>> = StaticCell::new();
    let i2c_bus = I2C_BUS.init(Mutex::new(i2c));

    spawner.spawn(gps_task(NmeaGps::new(gps_rx))).unwrap();
    spawner
        .spawn(sensor_task(Bno055Source::new(I2cDevice::new(i2c_bus))))
        .unwrap();
    spawner
        .spawn(vario_task(Bme280Altimeter::new(I2cDevice::new(i2c_bus))))
        .unwrap();
    spawner.spawn(telemetry_task()).unwrap();
    spawner.spawn(status_task()).unwrap();

    info!("tasks up, starting ble");

    let mut bluetooth = pins.bt;
    let connector = BleConnector::new(wifi, &mut bluetooth);
    let now = || time::now().ticks();
    let mut ble = Ble::new(connector, now);

    loop {
        if let Err(e) = ble.init().await {
            warn!("ble init failed: {:?}", defmt::Debug2Format(&e));
            Timer::after_millis(1_000).await;
            continue;
        }
        let _ = ble.cmd_set_le_advertising_parameters().await;
        let _ = ble
            .cmd_set_le_advertising_data(
                create_advertising_data(&[
                    AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                    AdStructure::ServiceUuids16(&[Uuid::Uuid16(0x4fa1)]),
                    AdStructure::CompleteLocalName(DEVICE_NAME),
                ])
                .unwrap(),
            )
            .await;
        let _ = ble.cmd_set_le_advertise_enable(true).await;

        info!("advertising as {}", DEVICE_NAME);

        let mut read_fn = |_offset: usize, data: &mut [u8]| {
            link::dispatch(LinkEvent::PeerRead);
            let msg = b"Hello World!";
            data[..msg.len()].copy_from_slice(msg);
            msg.len()
        };
        let mut write_fn = |_offset: usize, data: &[u8]| {
            link::dispatch(LinkEvent::PeerWrite(data));
        };

        gatt!([service {
            uuid: "4fafc201-1fb5-459e-8fcc-c5c9c331914b",
            characteristics: [characteristic {
                name: "snapshot",
                uuid: "beb5483e-36e1-4688-b7f5-ea07361b26a8",
                notify: true,
                read: read_fn,
                write: write_fn,
            }],
        }]);

        let mut rng = bleps::no_rng::NoRng;
        let mut srv = AttributeServer::new(&mut ble, &mut gatt_attributes, &mut rng);

        let mut notifier = || async {
            let frame = NOTIFY_FRAMES.receive().await;
            NotificationData::new(snapshot_handle, &frame)
        };

        // The controller gives no connect callback here; the first peer
        // read or write marks the link up (see the dispatcher), and it
        // goes back down when the server stops being serviced.
        let _ = srv.run(&mut notifier).await;
        link::dispatch(LinkEvent::Disconnected);
    }
}
