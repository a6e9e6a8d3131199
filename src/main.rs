#![no_std]
#![no_main]

use esp_hal::Blocking;
use esp_hal::clock::CpuClock;
use esp_hal::efuse::Efuse;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::rng::Rng;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::uart::{self, Uart};
use esp_println::println;
use esp_storage::FlashStorage;

// WiFi imports
use esp_wifi::wifi;

// Embassy-net imports
use embassy_net::{Config, Stack, StackResources};
use esp_hal_embassy::Executor;
use static_cell::{ConstStaticCell, StaticCell};

// Import our library modules
use netclient_rs::bridge::NetworkBridge;
use netclient_rs::broker::TransportPolicy;
use netclient_rs::config;
use netclient_rs::connection::ConnectionManager;
use netclient_rs::indicator::Indicator;
use netclient_rs::link::SerialLink;
use netclient_rs::platform::EmbassyClock;
use netclient_rs::settings::ConfigStore;
use netclient_rs::uplink::{self, HardwareRng, Uplink, UplinkBuffers, UplinkHandle};
use netclient_rs::wifi::esp::EspWifiRadio;

// Add app descriptor for espflash compatibility
esp_bootloader_esp_idf::esp_app_desc!();

type FirmwareBridge = NetworkBridge<
    Uart<'static, Blocking>,
    Output<'static>,
    EmbassyClock,
    FlashStorage,
    EspWifiRadio<'static>,
    UplinkHandle<'static>,
>;

// Static cells for embassy components
static WIFI_INIT_CELL: StaticCell<esp_wifi::EspWifiController<'static>> = StaticCell::new();
static UPLINK_BUFFERS: ConstStaticCell<UplinkBuffers> = ConstStaticCell::new(UplinkBuffers::new());
static UPLINK: Uplink = Uplink::new();
static BRIDGE_CELL: StaticCell<FirmwareBridge> = StaticCell::new();

// Static executor for embassy tasks
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[MAIN] Panic: {}", info);
    loop {}
}

// Embassy task to run the network stack
#[embassy_executor::task]
async fn net_task(
    mut runner: embassy_net::Runner<'static, esp_wifi::wifi::WifiDevice<'static>>,
) -> ! {
    runner.run().await
}

/// Broker sessions, plain or TLS
#[embassy_executor::task]
async fn uplink_task(
    stack: Stack<'static>,
    buffers: &'static mut UplinkBuffers,
    rng: HardwareRng,
) -> ! {
    uplink::run(&UPLINK, stack, buffers, rng).await
}

/// Serial to broker bridge
#[embassy_executor::task]
async fn bridge_task(bridge: &'static mut FirmwareBridge) -> ! {
    bridge.run().await
}

/// Chip id printed by `*NI`: the device-specific lower half of the MAC
fn chip_id(mac: &[u8; 6]) -> u32 {
    u32::from_be_bytes([0, mac[3], mac[4], mac[5]])
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger(log::LevelFilter::Info);

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    // Initialize heap allocator for WiFi (72KB)
    esp_alloc::heap_allocator!(size: 72 * 1024);

    // Initialize embassy time system
    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);

    // Robot serial line
    let uart_config = uart::Config::default().with_baudrate(config::ROBOT_BAUD_RATE);
    let serial = match Uart::new(peripherals.UART0, uart_config) {
        Ok(uart) => uart.with_tx(peripherals.GPIO21).with_rx(peripherals.GPIO20),
        Err(e) => {
            println!("[SERIAL] ❌ Failed to configure UART: {:?}", e);
            panic!("UART initialization failed");
        }
    };

    // Status LED, lit when driven low
    let led_pin = Output::new(peripherals.GPIO8, Level::High, OutputConfig::default());
    let link = SerialLink::new(serial, Indicator::new(led_pin, true));

    let store = ConfigStore::new(FlashStorage::new(), config::SETTINGS_FLASH_OFFSET);

    // Initialize WiFi driver
    let timer_group1 = TimerGroup::new(peripherals.TIMG1);
    let mut rng = Rng::new(peripherals.RNG);
    let wifi_init = match esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK) {
        Ok(init) => init,
        Err(e) => {
            println!("[WIFI] ❌ Failed to initialize WiFi driver: {:?}", e);
            panic!("WiFi initialization failed");
        }
    };
    let wifi_init_ref = WIFI_INIT_CELL.init(wifi_init);

    let (wifi_controller, wifi_interfaces) = match wifi::new(wifi_init_ref, peripherals.WIFI) {
        Ok(parts) => parts,
        Err(e) => {
            println!("[WIFI] ❌ Failed to create WiFi controller: {:?}", e);
            panic!("WiFi initialization failed");
        }
    };
    let wifi_device = wifi_interfaces.sta;

    let mac = Efuse::read_base_mac_address();
    let radio = EspWifiRadio::new(wifi_controller, mac);

    // Create embassy-net stack with DHCP configuration
    static STACK_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();
    let stack_resources = STACK_RESOURCES.init(StackResources::new());
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let (stack, runner): (Stack<'static>, _) = embassy_net::new(
        wifi_device,
        Config::dhcpv4(Default::default()),
        stack_resources,
        seed,
    );

    let connection = ConnectionManager::new(radio, UPLINK.handle(), TransportPolicy::default());

    let bridge = BRIDGE_CELL.init(NetworkBridge::new(
        link,
        EmbassyClock,
        store,
        connection,
        chip_id(&mac),
    ));

    // Initialize embassy executor and run tasks
    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        println!("[MAIN] Spawning network task...");
        spawner.spawn(net_task(runner)).ok();

        println!("[MAIN] Spawning uplink task...");
        let buffers = UPLINK_BUFFERS.take();
        if let Err(e) = spawner.spawn(uplink_task(stack, buffers, HardwareRng::new(rng))) {
            println!("[MAIN] ❌ Failed to spawn uplink task: {:?}", e);
        }

        println!("[MAIN] Spawning bridge task...");
        if let Err(e) = spawner.spawn(bridge_task(bridge)) {
            println!("[MAIN] ❌ Failed to spawn bridge task: {:?}", e);
        }
    });
}
