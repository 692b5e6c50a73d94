#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::Timer;
use esp_hal::{
    Blocking,
    clock::CpuClock,
    delay::Delay,
    gpio::{Level, Output, OutputConfig},
    spi::master::Spi,
    time::{Instant, Rate},
    timer::timg::TimerGroup,
    uart::Uart,
};
use log::{LevelFilter, error, info, warn};
use static_cell::StaticCell;
use tracker_core::{
    config::Configuration,
    network::{
        ConnectivityManager, NoProvisioning, PowerSavingMode, Provisioning, SignalReporter,
        WifiCredentials,
    },
    status::{Status, StatusFlags},
};
use tracker_hal_esp32s3::{
    network::EspRadio,
    provisioning::uart::UartProvisioning,
    storage::{flash_credentials::FlashCredentialStore, sd_fs::SdFilesystem},
};

const SD_SPI_HZ: u32 = 1_000_000;
const CONSOLE_BAUD: u32 = 115_200;
const UPKEEP_INTERVAL_MS: u64 = 100;

const WIFI_SSID: Option<&str> = option_env!("TRACKER_WIFI_SSID");
const WIFI_PASSWORD: Option<&str> = option_env!("TRACKER_WIFI_PASSWORD");

static STATUS: StatusFlags = StatusFlags::new();
static RADIO_CONTROLLER: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<embassy_net::StackResources<4>> = StaticCell::new();

/// Logs link quality samples; there is no upstream server to forward them to.
#[derive(Default)]
struct LogSignalReporter {
    last_rssi: Option<i8>,
}

impl SignalReporter for LogSignalReporter {
    fn report_signal_strength(&mut self, rssi: i8) {
        if self.last_rssi != Some(rssi) {
            info!("wifi: rssi={} dBm", rssi);
        }
        self.last_rssi = Some(rssi);
    }
}

/// Serial provisioning when the console UART comes up, none otherwise.
enum ConsoleProvisioning {
    Uart(UartProvisioning<'static>),
    Disabled(NoProvisioning),
}

impl Provisioning for ConsoleProvisioning {
    fn start(&mut self) {
        match self {
            Self::Uart(uart) => uart.start(),
            Self::Disabled(none) => none.start(),
        }
    }

    fn stop(&mut self) {
        match self {
            Self::Uart(uart) => uart.stop(),
            Self::Disabled(none) => none.stop(),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Self::Uart(uart) => uart.is_done(),
            Self::Disabled(none) => none.is_done(),
        }
    }

    fn poll(&mut self, now_ms: u64) -> Option<WifiCredentials> {
        match self {
            Self::Uart(uart) => uart.poll(now_ms),
            Self::Disabled(none) => none.poll(now_ms),
        }
    }
}

fn hardcoded_credentials() -> Option<WifiCredentials> {
    let ssid = WIFI_SSID?;
    let credentials = WifiCredentials::new(ssid, WIFI_PASSWORD.unwrap_or(""));
    if credentials.is_none() {
        warn!("wifi: build-time credentials exceed 802.11 limits; ignoring them");
    }
    credentials
}

async fn halt(reason: &str) -> ! {
    error!("boot: {}; halting", reason);
    loop {
        Timer::after_secs(1).await;
    }
}

esp_bootloader_esp_idf::esp_app_desc!();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    esp_println::logger::init_logger(LevelFilter::Info);
    esp_println::println!("boot: tracker starting");

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // esp-radio requires an allocator.
    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 65536);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    STATUS.set_status(Status::Loading, true);

    // SD SPI wiring: CS=GPIO8, SCK=GPIO4, MOSI=GPIO40, MISO=GPIO41
    let sd_cs = Output::new(peripherals.GPIO8, Level::High, OutputConfig::default());
    let sd_spi_config = esp_hal::spi::master::Config::default()
        .with_frequency(Rate::from_hz(SD_SPI_HZ))
        // SD cards in SPI mode use CPOL=0, CPHA=0.
        .with_mode(esp_hal::spi::Mode::_0);
    let sd_spi = match Spi::new(peripherals.SPI3, sd_spi_config) {
        Ok(spi) => Some(
            spi.with_sck(peripherals.GPIO4)
                .with_mosi(peripherals.GPIO40)
                .with_miso(peripherals.GPIO41),
        ),
        Err(err) => {
            warn!("sd: spi config rejected: {:?}", err);
            None
        }
    };

    let configuration = match sd_spi.map(|spi| SdFilesystem::new(spi, sd_cs, Delay::new())) {
        Some(Ok(fs)) => {
            let mut configuration = Configuration::new(fs);
            match configuration.load(&STATUS) {
                Ok(()) => configuration.print(),
                Err(err) => error!("config: load failed, running on defaults: {:?}", err),
            }
            Some(configuration)
        }
        Some(Err(err)) => {
            error!("sd: card init failed: {:?}", err);
            None
        }
        None => None,
    };
    if configuration.is_none() {
        STATUS.set_status(Status::StorageError, true);
        STATUS.set_status(Status::Loading, false);
    }
    let power_saving = configuration
        .as_ref()
        .map(|configuration| configuration.power_saving())
        .unwrap_or(PowerSavingMode::DEFAULT);

    let credential_store = match FlashCredentialStore::new() {
        Ok(store) => Some(store),
        Err(err) => {
            warn!("flash: credential store unavailable: {:?}", err);
            None
        }
    };

    let radio: &'static esp_radio::Controller<'static> = match esp_radio::init() {
        Ok(radio) => RADIO_CONTROLLER.init(radio),
        Err(err) => {
            info!("esp-radio init failed: {:?}", err);
            halt("radio unavailable").await
        }
    };

    let (wifi_controller, interfaces) =
        match esp_radio::wifi::new(radio, peripherals.WIFI, esp_radio::wifi::Config::default()) {
            Ok(parts) => parts,
            Err(err) => {
                info!("wifi peripheral init failed: {:?}", err);
                halt("wifi unavailable").await
            }
        };

    let stack_config = embassy_net::Config::dhcpv4(Default::default());
    let (stack, mut net_runner) = embassy_net::new(
        interfaces.sta,
        stack_config,
        NET_RESOURCES.init(embassy_net::StackResources::<4>::new()),
        0x7A3C_51E2_90B4_D611,
    );

    // Console wiring: TX=GPIO17 RX=GPIO18
    let uart_config = esp_hal::uart::Config::default().with_baudrate(CONSOLE_BAUD);
    let provisioning = match Uart::new(peripherals.UART1, uart_config) {
        Ok(uart) => {
            let uart: Uart<'static, Blocking> = uart
                .with_tx(peripherals.GPIO17)
                .with_rx(peripherals.GPIO18);
            ConsoleProvisioning::Uart(UartProvisioning::new(uart))
        }
        Err(err) => {
            warn!("provisioning: console uart unavailable: {:?}", err);
            ConsoleProvisioning::Disabled(NoProvisioning)
        }
    };

    let radio = EspRadio::new(wifi_controller, stack, credential_store);
    let mut connectivity = ConnectivityManager::new(radio, provisioning, hardcoded_credentials());

    let loop_start = Instant::now();
    connectivity.configure(loop_start.elapsed().as_millis(), power_saving);
    STATUS.set_status(Status::WifiConnecting, true);

    let net_future = net_runner.run();
    let upkeep_future = async {
        let mut reporter = LogSignalReporter::default();
        let mut last_status_revision = u32::MAX;
        loop {
            let now_ms = loop_start.elapsed().as_millis();
            connectivity.upkeep(now_ms, &STATUS, &mut reporter);

            let status = STATUS.snapshot();
            if status.revision != last_status_revision {
                last_status_revision = status.revision;
                for flag in Status::ALL.iter().filter(|flag| status.has(**flag)) {
                    info!("status: {} active", flag.as_str());
                }
                if status.is_clear() {
                    info!("status: all clear");
                }
            }

            Timer::after_millis(UPKEEP_INTERVAL_MS).await;
        }
    };

    let _ = embassy_futures::join::join(net_future, upkeep_future).await;
    unreachable!()
}
