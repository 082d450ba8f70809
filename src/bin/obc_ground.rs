use std::collections::VecDeque;
use std::time::Duration;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use cubesat_obc::framing::{Frame, FrameDecoder};
use cubesat_obc::protocol::{
    Ack, ACK_FRAME_LEN, CommandId, CommandPacket, ErrorFlag, SystemState, TelemetryPacket, MAX_PARAMETERS,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_TIMEOUT_MS: &str = "3000";

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Table,
    Json,
}

struct Link {
    stream: TcpStream,
    decoder: FrameDecoder,
    /// Raw downlink bytes not yet searched for an acknowledgement.
    backlog: Vec<u8>,
    frames: VecDeque<Frame>,
    timeout: Duration,
    format: Format,
}

#[tokio::main]
async fn main() -> CliResult {
    let state_names: Vec<&str> = SystemState::ALL.iter().map(|s| s.name()).collect();

    let matches = App::new("obc-ground")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ground and companion-computer tool for the CubeSat OBC")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Companion link port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("MS")
                .help("How long to wait for a reply")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_MS)
                .global(true),
        )
        .arg(
            Arg::with_name("seq")
                .long("seq")
                .value_name("N")
                .help("Command sequence number (defaults to the wall clock)")
                .takes_value(true)
                .global(true)
                .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|_| "sequence must fit in 16 bits".into())),
        )
        .subcommand(SubCommand::with_name("ping").about("Check the OBC answers on the companion link"))
        .subcommand(SubCommand::with_name("telemetry").about("Request the latest telemetry snapshot"))
        .subcommand(SubCommand::with_name("capture-image").about("Pulse the payload wake line"))
        .subcommand(
            SubCommand::with_name("set-mode")
                .about("Request an operating mode")
                .arg(
                    Arg::with_name("mode")
                        .help("Target mode")
                        .required(true)
                        .possible_values(&state_names),
                ),
        )
        .subcommand(
            SubCommand::with_name("reset")
                .about("Reset the on-board computer")
                .arg(
                    Arg::with_name("confirm")
                        .long("confirm")
                        .help("Confirm the reset")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("transmit-file")
                .about("Ask the OBC to forward a block to the companion computer")
                .arg(
                    Arg::with_name("data")
                        .help("Block as hex, at most 64 bytes")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Print the telemetry stream")
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("N")
                        .help("Stop after N snapshots")
                        .takes_value(true),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let timeout = Duration::from_millis(matches.value_of("timeout").unwrap_or(DEFAULT_TIMEOUT_MS).parse()?);
    let format = match matches.value_of("format") {
        Some("json") => Format::Json,
        _ => Format::Table,
    };
    let seq = match matches.value_of("seq") {
        Some(s) => s.parse::<u16>()?,
        None => wall_clock_sequence(),
    };

    let mut link = Link::connect(host, port, timeout, format).await?;

    match matches.subcommand() {
        ("ping", _) => handle_ping(&mut link, seq).await,
        ("telemetry", _) => handle_telemetry(&mut link, seq).await,
        ("capture-image", _) => {
            link.send(&CommandPacket::new(CommandId::CaptureImage, seq, &[])?).await?;
            print_sent("capture-image", seq, format);
            Ok(())
        }
        ("set-mode", Some(sub)) => handle_set_mode(&mut link, sub, seq).await,
        ("reset", Some(_)) => {
            link.send(&CommandPacket::new(CommandId::Reset, seq, &[])?).await?;
            print_sent("reset", seq, format);
            Ok(())
        }
        ("transmit-file", Some(sub)) => handle_transmit_file(&mut link, sub, seq).await,
        ("monitor", Some(sub)) => handle_monitor(&mut link, sub).await,
        _ => Ok(()),
    }
}

impl Link {
    async fn connect(host: &str, port: u16, timeout: Duration, format: Format) -> CliResult<Self> {
        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("{} cannot reach the OBC at {}:{}", "error:".red(), host, port);
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    eprintln!("  start the simulator with {}", "obc-sim".bright_cyan());
                }
                return Err(e.into());
            }
        };
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            backlog: Vec::new(),
            frames: VecDeque::new(),
            timeout,
            format,
        })
    }

    async fn send(&mut self, packet: &CommandPacket) -> CliResult {
        self.stream.write_all(&packet.to_frame()).await?;
        Ok(())
    }

    /// Reads downlink bytes until `pick` accepts something, or the timeout
    /// expires.
    async fn wait_for<T>(&mut self, mut pick: impl FnMut(&mut Self) -> Option<T>) -> CliResult<Option<T>> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut buf = [0u8; 512];
        loop {
            if let Some(found) = pick(self) {
                return Ok(Some(found));
            }
            let n = match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => return Ok(None),
            };
            if n == 0 {
                return Err("OBC closed the link".into());
            }
            self.ingest(&buf[..n]);
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.backlog.extend_from_slice(bytes);
        for frame in self.decoder.decode(bytes).flatten() {
            self.frames.push_back(frame);
        }
    }

    fn take_frame(&mut self, wanted: impl Fn(&Frame) -> bool) -> Option<Frame> {
        let at = self.frames.iter().position(wanted)?;
        self.frames.remove(at)
    }

    fn next_telemetry(&mut self) -> Option<TelemetryPacket> {
        match self.take_frame(|f| matches!(f, Frame::Telemetry(_)))? {
            Frame::Telemetry(packet) => Some(packet),
            Frame::Command(_) => None,
        }
    }

    fn next_ack(&mut self, expected: Ack) -> Option<Ack> {
        let found = find_ack(&self.backlog, expected);
        if found.is_some() {
            self.backlog.clear();
        } else {
            // Keep a tail in case an ack straddles two reads.
            let keep = self.backlog.len().min(ACK_FRAME_LEN - 1);
            self.backlog.drain(..self.backlog.len() - keep);
        }
        found
    }
}

fn find_ack(bytes: &[u8], expected: Ack) -> Option<Ack> {
    let mut rest = bytes;
    while let Some(ack) = Ack::find(rest) {
        if ack == expected {
            return Some(ack);
        }
        // Skip past this ack and keep looking.
        let at = rest.windows(ACK_FRAME_LEN).position(|w| *w == ack.to_bytes()).map_or(rest.len(), |p| p + 1);
        rest = &rest[at..];
    }
    None
}

async fn handle_ping(link: &mut Link, seq: u16) -> CliResult {
    let expected = Ack::for_sequence(seq);
    let started = tokio::time::Instant::now();
    link.send(&CommandPacket::new(CommandId::Ping, seq, &[])?).await?;

    let ack = link.wait_for(|l| l.next_ack(expected)).await?;
    let elapsed_ms = started.elapsed().as_millis();
    match (ack, link.format) {
        (Some(ack), Format::Json) => println!(
            "{}",
            serde_json::json!({ "ack": true, "sequence_low": ack.sequence_low, "round_trip_ms": elapsed_ms as u64 })
        ),
        (Some(ack), Format::Table) => println!(
            "{} ack for seq low byte 0x{:02X} in {} ms",
            "ok".green(),
            ack.sequence_low,
            elapsed_ms
        ),
        (None, Format::Json) => println!("{}", serde_json::json!({ "ack": false })),
        (None, Format::Table) => println!("{} no acknowledgement within {:?}", "timeout".red(), link.timeout),
    }
    Ok(())
}

async fn handle_telemetry(link: &mut Link, seq: u16) -> CliResult {
    link.send(&CommandPacket::new(CommandId::GetTelemetry, seq, &[])?).await?;
    match link.wait_for(Link::next_telemetry).await? {
        Some(packet) => print_snapshot(&packet, link.format, true)?,
        None => println!("{} no telemetry within {:?}", "timeout".red(), link.timeout),
    }
    Ok(())
}

async fn handle_set_mode(link: &mut Link, matches: &ArgMatches<'_>, seq: u16) -> CliResult {
    let target: SystemState = matches.value_of("mode").unwrap_or_default().parse()?;
    link.send(&CommandPacket::new(CommandId::SetMode, seq, &[target.as_u8()])?).await?;

    // Snapshots lag the command by up to one sensor period.
    let confirmed = link
        .wait_for(|l| match l.take_frame(|f| matches!(f, Frame::Telemetry(p) if p.system_state == target))? {
            Frame::Telemetry(packet) => Some(packet),
            Frame::Command(_) => None,
        })
        .await?;

    match (confirmed, link.format) {
        (Some(p), Format::Json) => println!("{}", serde_json::json!({ "mode": target.name(), "confirmed": true, "sequence": p.sequence_number })),
        (None, Format::Json) => println!("{}", serde_json::json!({ "mode": target.name(), "confirmed": false })),
        (Some(_), Format::Table) => println!("{} mode is now {}", "ok".green(), target.name().bright_cyan()),
        (None, Format::Table) => println!(
            "{} {} not seen in telemetry within {:?}",
            "warning".yellow(),
            target.name().bright_cyan(),
            link.timeout
        ),
    }
    Ok(())
}

async fn handle_transmit_file(link: &mut Link, matches: &ArgMatches<'_>, seq: u16) -> CliResult {
    let data = parse_hex(matches.value_of("data").unwrap_or_default())?;
    if data.len() > MAX_PARAMETERS {
        return Err(format!("block is {} bytes, at most {MAX_PARAMETERS} fit in one command", data.len()).into());
    }
    let packet = CommandPacket::new(CommandId::TransmitFile, seq, &data)?;
    link.send(&packet).await?;

    let forwarded = link
        .wait_for(|l| match l.take_frame(|f| matches!(f, Frame::Command(c) if c.sequence_number == seq))? {
            Frame::Command(cmd) => Some(cmd),
            Frame::Telemetry(_) => None,
        })
        .await?;

    match (forwarded, link.format) {
        (Some(cmd), Format::Json) => println!("{}", serde_json::to_string(&cmd)?),
        (Some(cmd), Format::Table) => println!("{} forwarded {} bytes", "ok".green(), cmd.params().len()),
        (None, _) => println!("{} forward not observed within {:?}", "timeout".red(), link.timeout),
    }
    Ok(())
}

async fn handle_monitor(link: &mut Link, matches: &ArgMatches<'_>) -> CliResult {
    let limit = matches.value_of("count").map(str::parse::<u32>).transpose()?;
    // The stream arrives once per sensor period; wait well beyond it.
    link.timeout = link.timeout.max(Duration::from_secs(10));

    if link.format == Format::Table {
        println!("{}", "  seq  uptime  state         battery   temp     rad/s  flags".bright_white());
    }

    let mut shown = 0u32;
    while limit.map_or(true, |n| shown < n) {
        match link.wait_for(Link::next_telemetry).await? {
            Some(packet) => {
                print_snapshot(&packet, link.format, false)?;
                shown += 1;
            }
            None => {
                println!("{} telemetry stream stalled", "warning".yellow());
                break;
            }
        }
    }
    Ok(())
}

fn print_snapshot(p: &TelemetryPacket, format: Format, detailed: bool) -> CliResult {
    if format == Format::Json {
        println!("{}", serde_json::to_string(p)?);
        return Ok(());
    }

    let state = match p.system_state {
        s if s.is_safing() => s.name().bright_red(),
        SystemState::Nominal | SystemState::Idle => p.system_state.name().bright_green(),
        s => s.name().yellow(),
    };
    let battery = format!("{:>5}mV", p.battery_voltage);
    let battery = if p.battery_voltage < 3400 { battery.red() } else { battery.green() };
    let temp = format!("{:>6.1}C", p.temperature_bme);
    let temp = if p.temperature_bme > 70.0 || p.temperature_bme < -20.0 { temp.red() } else { temp.white() };
    let flags: Vec<String> = p.error_flags.iter().map(|f: ErrorFlag| format!("{f:?}")).collect();
    let flags = if flags.is_empty() { "-".dimmed() } else { flags.join(",").bright_red() };

    println!(
        "{:>5} {:>7}  {:<12} {}  {}  {:>6}  {}",
        p.sequence_number, p.uptime, state, battery, temp, p.radiation_cps, flags
    );

    if detailed {
        println!("  boot count    {}", p.boot_count);
        println!("  timestamp     {} ms", p.timestamp);
        println!("  magnetometer  {:.3} {:.3} {:.3} G", p.mag_x, p.mag_y, p.mag_z);
        println!("  pressure      {:.0} Pa, humidity {:.1} %", p.pressure, p.humidity);
        println!("  precision T   {:.2} C", p.temperature_tmp);
        println!("  corrosion     {}", p.corrosion_raw);
        println!("  battery I     {} mA", p.battery_current);
    }
    Ok(())
}

fn print_sent(action: &str, seq: u16, format: Format) {
    match format {
        Format::Json => println!("{}", serde_json::json!({ "command": action, "sequence": seq, "sent": true })),
        Format::Table => println!("{} {} sent (seq {})", "ok".green(), action.bright_white(), seq),
    }
}

fn parse_hex(text: &str) -> CliResult<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err("hex block needs an even number of digits".into());
    }
    digits
        .chunks(2)
        .map(|pair| -> CliResult<u8> {
            let s = std::str::from_utf8(pair)?;
            Ok(u8::from_str_radix(s, 16)?)
        })
        .collect()
}

fn wall_clock_sequence() -> u16 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u16)
        .unwrap_or(1)
}
