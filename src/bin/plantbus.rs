use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use plantbus::station::DEFAULT_TICK_INTERVAL_MS;
use plantbus::{SnapshotStore, StationAgent, StationConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("plantbus")
        .version("0.1.0")
        .author("Grid Storage Systems Team")
        .about("Battery plant control-and-telemetry console")
        .arg(
            Arg::with_name("host")
                .short("H")
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
                .help("Simulator port")
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
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("actor")
                .long("actor")
                .value_name("ACTOR")
                .help("Who issues command writes")
                .takes_value(true)
                .possible_values(&["local", "remote"])
                .default_value("local")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("status")
                .about("Get station status, commands, and the auto-power preview"),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Monitor the live tick summary stream")
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("TICKS")
                        .help("Stop after this many summaries (default: infinite)")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("agc")
                .about("Enable AGC with a station power target")
                .arg(
                    Arg::with_name("kw")
                        .help("Target power in kW (negative charges)")
                        .required(true)
                        .validator(|v| {
                            v.parse::<f64>()
                                .map(|_| ())
                                .map_err(|_| "target must be a number".into())
                        }),
                )
                .arg(
                    Arg::with_name("ramp")
                        .long("ramp")
                        .value_name("KW_PER_MIN")
                        .help("Ramp rate in kW/min")
                        .takes_value(true)
                        .default_value("20"),
                ),
        )
        .subcommand(
            SubCommand::with_name("avc")
                .about("Enable AVC with a bus voltage target")
                .arg(
                    Arg::with_name("volts")
                        .help("Target voltage in V")
                        .required(true)
                        .validator(|v| {
                            v.parse::<f64>()
                                .map(|_| ())
                                .map_err(|_| "voltage must be a number".into())
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("manual")
                .about("Enable manual power override (wins over AGC)")
                .arg(
                    Arg::with_name("kw")
                        .help("Target power in kW")
                        .required(true)
                        .validator(|v| {
                            v.parse::<f64>()
                                .map(|_| ())
                                .map_err(|_| "target must be a number".into())
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("stop").about("Disable AGC/AVC/manual and hold zero"))
        .subcommand(
            SubCommand::with_name("reset-unit")
                .about("Reset a latched battery unit")
                .arg(
                    Arg::with_name("id")
                        .help("Unit id")
                        .required(true)
                        .validator(|v| {
                            v.parse::<u8>()
                                .map(|_| ())
                                .map_err(|_| "unit id must be 1-255".into())
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("reset-protection")
                .about("Reset a tripped protection device")
                .arg(
                    Arg::with_name("device")
                        .help("Protection device")
                        .required(true)
                        .possible_values(&[
                            "ac_side_protection",
                            "dc_side_protection",
                            "fire_interlock",
                            "battery_early_warning",
                            "insulation_monitor",
                        ]),
                ),
        )
        .subcommand(
            SubCommand::with_name("impair")
                .about("Set bus impairment rates")
                .arg(
                    Arg::with_name("drop")
                        .help("Drop probability 0..1")
                        .required(true),
                )
                .arg(
                    Arg::with_name("corrupt")
                        .help("Corruption probability 0..1")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run an offline simulation and print per-tick summaries")
                .arg(
                    Arg::with_name("ticks")
                        .short("n")
                        .long("ticks")
                        .value_name("TICKS")
                        .help("Number of ticks to run")
                        .takes_value(true)
                        .default_value("30"),
                )
                .arg(
                    Arg::with_name("units")
                        .long("units")
                        .value_name("COUNT")
                        .help("Number of battery units")
                        .takes_value(true)
                        .default_value("10"),
                )
                .arg(
                    Arg::with_name("drop")
                        .long("drop")
                        .value_name("RATE")
                        .help("Bus drop probability 0..1")
                        .takes_value(true)
                        .default_value("0"),
                )
                .arg(
                    Arg::with_name("corrupt")
                        .long("corrupt")
                        .value_name("RATE")
                        .help("Bus corruption probability 0..1")
                        .takes_value(true)
                        .default_value("0"),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap();
    let port = matches.value_of("port").unwrap().parse::<u16>()?;
    let format = matches.value_of("format").unwrap();
    let actor = matches.value_of("actor").unwrap();

    match matches.subcommand() {
        ("status", _) => {
            let response = send_request(host, port, r#"{"op":"status"}"#.to_string()).await?;
            print_status(&response, format);
        }
        ("monitor", Some(sub)) => {
            let count = sub.value_of("count").map(|v| v.parse::<u64>()).transpose()?;
            monitor(host, port, format, count).await?;
        }
        ("agc", Some(sub)) => {
            let kw: f64 = sub.value_of("kw").unwrap().parse()?;
            let ramp: f64 = sub.value_of("ramp").unwrap().parse()?;
            let request = serde_json::json!({
                "op": "set_commands",
                "actor": actor,
                "agc": { "enabled": true, "target_power_kw": kw, "ramp_rate_kw_per_min": ramp, "deadband_kw": 5.0 },
            });
            let response = send_request(host, port, request.to_string()).await?;
            print_result("AGC target", &format!("{kw} kW"), &response, format);
        }
        ("avc", Some(sub)) => {
            let volts: f64 = sub.value_of("volts").unwrap().parse()?;
            let request = serde_json::json!({
                "op": "set_commands",
                "actor": actor,
                "avc": { "enabled": true, "target_voltage_v": volts, "range": { "min_v": 380.0, "max_v": 420.0 } },
            });
            let response = send_request(host, port, request.to_string()).await?;
            print_result("AVC target", &format!("{volts} V"), &response, format);
        }
        ("manual", Some(sub)) => {
            let kw: f64 = sub.value_of("kw").unwrap().parse()?;
            let request = serde_json::json!({
                "op": "set_commands",
                "actor": actor,
                "manual_power": { "enabled": true, "target_power_kw": kw },
            });
            let response = send_request(host, port, request.to_string()).await?;
            print_result("Manual power", &format!("{kw} kW"), &response, format);
        }
        ("stop", _) => {
            let request = serde_json::json!({
                "op": "set_commands",
                "actor": actor,
                "agc": { "enabled": false, "target_power_kw": 0.0, "ramp_rate_kw_per_min": 20.0, "deadband_kw": 5.0 },
                "manual_power": { "enabled": false, "target_power_kw": 0.0 },
            });
            let response = send_request(host, port, request.to_string()).await?;
            print_result("Station", "STOP", &response, format);
        }
        ("reset-unit", Some(sub)) => {
            let id: u8 = sub.value_of("id").unwrap().parse()?;
            let request = serde_json::json!({ "op": "reset_unit", "unit_id": id });
            let response = send_request(host, port, request.to_string()).await?;
            print_result("Unit reset", &format!("unit-{id}"), &response, format);
        }
        ("reset-protection", Some(sub)) => {
            let device = sub.value_of("device").unwrap();
            let request = serde_json::json!({ "op": "reset_protection", "device": device });
            let response = send_request(host, port, request.to_string()).await?;
            print_result("Protection reset", device, &response, format);
        }
        ("impair", Some(sub)) => {
            let drop: f64 = sub.value_of("drop").unwrap().parse()?;
            let corrupt: f64 = sub.value_of("corrupt").unwrap().parse()?;
            let request = serde_json::json!({
                "op": "set_impairment",
                "drop_rate": drop,
                "corrupt_rate": corrupt,
            });
            let response = send_request(host, port, request.to_string()).await?;
            print_result("Impairment", &format!("drop={drop} corrupt={corrupt}"), &response, format);
        }
        ("run", Some(sub)) => {
            run_offline(sub)?;
        }
        _ => {
            println!(
                "{}",
                "No command specified. Use --help for usage information.".yellow()
            );
            println!("{}", "Quick start:".bright_green());
            println!("  {}  Offline demo run", "plantbus run -n 30".bright_cyan());
            println!("  {}  Live tick stream", "plantbus monitor".bright_cyan());
            println!("  {}  Dispatch 300 kW", "plantbus agc 300".bright_cyan());
        }
    }

    Ok(())
}

fn run_offline(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let ticks: u64 = matches.value_of("ticks").unwrap().parse()?;
    let units: u8 = matches.value_of("units").unwrap().parse()?;
    let drop: f64 = matches.value_of("drop").unwrap().parse()?;
    let corrupt: f64 = matches.value_of("corrupt").unwrap().parse()?;

    let mut agent = StationAgent::with_config(StationConfig {
        unit_count: units,
        drop_rate: drop,
        corrupt_rate: corrupt,
        ..StationConfig::default()
    });

    println!(
        "{}",
        format!("Plant Bus offline run: {units} units, {ticks} ticks").bright_blue().bold()
    );
    println!(
        "{}",
        "tick | mode     | P_target  | P_actual  | SOC   | frames | latched".bright_white()
    );

    for i in 1..=ticks {
        let report = agent.tick(i * DEFAULT_TICK_INTERVAL_MS);
        let soc = agent
            .store()
            .latest_telemetry()
            .map_or(0.0, |t| t.system_soc_pct);
        let mode = format!("{:?}", report.ems.mode);
        let mode_str = if report.ems.ready {
            mode.green()
        } else {
            mode.red()
        };
        let latched = if report.latched_units.is_empty() {
            "-".normal()
        } else {
            format!("{:?}", report.latched_units).red()
        };
        println!(
            "{:>4} | {:<8} | {:>7.1}kW | {:>7.1}kW | {:>4.1}% | {:>6} | {}",
            i,
            mode_str,
            report.ems.station_target_power_kw,
            agent.plant().total_actual_kw(),
            soc,
            report.frames.len(),
            latched,
        );
        for occ in &report.new_occurrences {
            println!(
                "     {} {}",
                "!".bright_red().bold(),
                format!("unit-{} {}: {}", occ.unit_id, occ.kind, occ.description).bright_red()
            );
        }
    }

    Ok(())
}

async fn monitor(
    host: &str,
    port: u16,
    format: &str,
    count: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "{}",
        "Monitoring plant tick stream (Press Ctrl+C to stop)...".bright_blue().bold()
    );
    let stream = TcpStream::connect((host, port)).await?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let mut seen = 0u64;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if format == "json" {
            println!("{trimmed}");
        } else if let Ok(summary) = serde_json::from_str::<serde_json::Value>(trimmed) {
            let ts = summary["ts"].as_u64().unwrap_or(0);
            let mode = summary["mode"].as_str().unwrap_or("?");
            let ready = summary["ready"].as_bool().unwrap_or(false);
            let target = summary["station_target_power_kw"].as_f64().unwrap_or(0.0);
            let soc = summary["telemetry"]["system_soc_pct"].as_f64().unwrap_or(0.0);
            let latched = summary["latched_units"]
                .as_array()
                .map_or(0, |a| a.len());
            let mode_str = if ready { mode.green() } else { mode.red() };
            println!(
                "[{}] {} | target {:>7.1} kW | SOC {:>4.1}% | latched {}",
                ts / 1000,
                mode_str,
                target,
                soc,
                latched,
            );
        }
        seen += 1;
        if count.is_some_and(|n| seen >= n) {
            break;
        }
    }

    Ok(())
}

async fn send_request(
    host: &str,
    port: u16,
    request: String,
) -> Result<String, Box<dyn std::error::Error>> {
    let addr = format!("{host}:{port}");
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!(
                "{} Failed to connect to the plant simulator at {}",
                "error:".red(),
                addr.bright_white()
            );
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "hint:".yellow());
                eprintln!("   {}", "cargo run --bin plantbus-simulator".bright_cyan());
            }
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        writer.write_all(request.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        // Tick summaries share the socket; the response is the first object
        // carrying an "ok" field.
        let mut line = String::new();
        loop {
            line.clear();
            if buf_reader.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed connection",
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(trimmed) {
                if parsed.get("ok").is_some() {
                    return Ok(trimmed.to_string());
                }
            }
        }
    })
    .await
    .map_err(|_| -> Box<dyn std::error::Error> { "request timeout".into() })?
    .map_err(Into::into)
}

fn print_result(action: &str, value: &str, response: &str, format: &str) {
    if format == "json" {
        println!("{response}");
        return;
    }
    match serde_json::from_str::<serde_json::Value>(response) {
        Ok(parsed) if parsed["ok"].as_bool() == Some(true) => {
            println!(
                "{} {} set to {}",
                "ok:".green(),
                action.bright_white(),
                value.bright_cyan()
            );
        }
        Ok(parsed) => {
            let message = parsed["error"].as_str().unwrap_or("request rejected");
            println!(
                "{} {} failed: {}",
                "error:".red(),
                action.bright_white(),
                message.bright_red()
            );
        }
        Err(_) => {
            println!("{} {}", "ok:".green(), "request completed".bright_green());
        }
    }
}

fn print_status(response: &str, format: &str) {
    if format == "json" {
        println!("{response}");
        return;
    }
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(response) else {
        println!("{} failed to parse status response", "error:".red());
        return;
    };
    println!("{}", "Station Status".bright_blue().bold());
    println!("{}", "==============".bright_blue());
    if let Some(t) = parsed.get("telemetry").filter(|t| !t.is_null()) {
        println!(
            "SOC {}%  SOH {}%  {} kW  bus {} V",
            t["system_soc_pct"],
            t["system_soh_pct"],
            t["total_power_kw"],
            t["average_voltage_v"],
        );
    } else {
        println!("{}", "no telemetry yet".yellow());
    }
    let commands = &parsed["commands"];
    println!(
        "AGC {} target {} kW | AVC {} target {} V | manual {}",
        on_off(commands["agc"]["enabled"].as_bool()),
        commands["agc"]["target_power_kw"],
        on_off(commands["avc"]["enabled"].as_bool()),
        commands["avc"]["target_voltage_v"],
        on_off(commands["manual_power"]["enabled"].as_bool()),
    );
    let auto = &parsed["auto_preview"];
    println!(
        "auto preview: {} target {} kW, limit {} kW",
        auto["mode"].as_str().unwrap_or("?"),
        auto["station_target_power_kw"],
        auto["power_limit_kw"],
    );
}

fn on_off(v: Option<bool>) -> ColoredString {
    if v == Some(true) {
        "ON".green()
    } else {
        "off".normal()
    }
}
