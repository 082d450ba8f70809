use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg};
use cubesat_obc::hal::SystemControl;
use cubesat_obc::protocol::Beacon;
use cubesat_obc::{FlightConfig, FlightSoftware, SimulatedBoard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{error, info, warn, Level};

const DEFAULT_PORT: &str = "8080";
const PHYSICS_STEP: Duration = Duration::from_millis(1000);

type Flight = Arc<Mutex<FlightSoftware>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("obc-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("CubeSat on-board computer running against a simulated board")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Flight configuration (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port exposing the companion link")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for the radiation and sensor noise generator")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match matches.value_of("config") {
        Some(path) => FlightConfig::from_json_file(path)?,
        None => FlightConfig::default(),
    };
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let board = match matches.value_of("seed") {
        Some(seed) => SimulatedBoard::new(seed.parse::<u64>()?),
        None => SimulatedBoard::default(),
    };

    println!("CubeSat OBC simulator");
    println!("=====================");
    println!("companion link on 127.0.0.1:{port}");
    println!("watchdog window {} ms", config.watchdog_timeout().window().as_millis());

    let flight: Flight = Arc::new(Mutex::new(FlightSoftware::spawn(&config, board.board())?));

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let tcp_server = tokio::spawn(serve(listener, Arc::clone(&flight), board.clone()));
    let physics = tokio::spawn(run_physics(Arc::clone(&flight), board.clone()));
    let radio = tokio::spawn(log_beacons(board.radio().subscribe()));

    let mut supervision = time::interval(Duration::from_millis(500));
    let window = config.watchdog_timeout().window();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = board.wait_for_reset() => {
                info!("reset line asserted, rebooting");
                reboot(&flight, &board, &config).await?;
            }
            _ = supervision.tick() => {
                if board.watchdog_expired(window) {
                    error!(window_ms = window.as_millis() as u64, "independent watchdog expired, rebooting");
                    board.reset();
                    reboot(&flight, &board, &config).await?;
                }
            }
        }
    }

    tcp_server.abort();
    physics.abort();
    radio.abort();
    println!("OBC simulator stopped");
    Ok(())
}

/// Replaces the running flight software with a fresh boot: volatile state
/// is lost, the boot counter advances.
async fn reboot(flight: &Flight, board: &SimulatedBoard, config: &FlightConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut guard = flight.lock().await;
    board.complete_reset();
    *guard = FlightSoftware::spawn(config, board.board())?;
    info!(boot_count = guard.shared().boot_count(), "flight software rebooted");
    Ok(())
}

async fn run_physics(flight: Flight, board: SimulatedBoard) {
    let mut ticker = time::interval(PHYSICS_STEP);
    loop {
        ticker.tick().await;
        let pulses = board.step(PHYSICS_STEP);
        let guard = flight.lock().await;
        for _ in 0..pulses {
            guard.radiation_pulse();
        }
    }
}

async fn log_beacons(mut beacons: broadcast::Receiver<Vec<u8>>) {
    loop {
        match beacons.recv().await {
            Ok(bytes) => match Beacon::parse(&bytes) {
                Ok(beacon) => info!(
                    state = %beacon.system_state,
                    boot_count = beacon.boot_count,
                    battery_mv = beacon.battery_voltage,
                    "beacon"
                ),
                Err(e) => warn!(error = %e, "malformed beacon on radio link"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(missed = n, "beacon log lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn serve(listener: TcpListener, flight: Flight, board: SimulatedBoard) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "ground client connected");
                let flight = Arc::clone(&flight);
                let downlink = board.companion().subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, flight, downlink).await {
                        warn!(%addr, error = %e, "client error");
                    }
                    info!(%addr, "ground client disconnected");
                });
            }
            Err(e) => error!(error = %e, "failed to accept connection"),
        }
    }
}

/// Bytes from the client are the companion computer's transmit line; every
/// frame the flight software sends on the companion link goes back out.
async fn handle_client(
    stream: TcpStream,
    flight: Flight,
    mut downlink: broadcast::Receiver<Vec<u8>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, mut writer) = stream.into_split();

    let forward = tokio::spawn(async move {
        loop {
            match downlink.recv().await {
                Ok(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!(error = %e, "failed to forward frame");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(missed = n, "client lagged behind downlink"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut buf = [0u8; 256];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let report = flight.lock().await.ingress().on_bytes(&buf[..n]);
        if report.rejected_frames > 0 || report.commands_dropped > 0 {
            warn!(?report, "uplink bytes partly rejected");
        }
    }

    forward.abort();
    Ok(())
}
