use plantbus::command::{Actor, CommandRequest};
use plantbus::protection::ProtectionDeviceName;
use plantbus::{SnapshotStore, StationAgent, StationConfig};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{error, info, warn};

const TCP_PORT: u16 = 8080;
const TICK_INTERVAL_MS: u64 = 2_000;
const BROADCAST_BUFFER_SIZE: usize = 256;

/// One JSON line per request on the operator socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum OperatorRequest {
    SetCommands {
        actor: Actor,
        #[serde(flatten)]
        request: CommandRequest,
    },
    ResetUnit {
        unit_id: u8,
    },
    ResetProtection {
        device: ProtectionDeviceName,
    },
    SetImpairment {
        drop_rate: f64,
        corrupt_rate: f64,
    },
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Plant Bus Simulator");
    println!("===================");

    let agent = Arc::new(Mutex::new(StationAgent::with_config(
        StationConfig::default(),
    )));

    let (summary_tx, _) = broadcast::channel(BROADCAST_BUFFER_SIZE);

    let tcp_agent = Arc::clone(&agent);
    let tcp_summary_tx = summary_tx.clone();
    let _tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(tcp_agent, tcp_summary_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let mut interval = time::interval(Duration::from_millis(TICK_INTERVAL_MS));
    loop {
        interval.tick().await;

        let summary = {
            let mut agent_guard = agent.lock().await;
            let report = agent_guard.tick(now_ms());
            let telemetry = agent_guard.store().latest_telemetry().cloned();
            serde_json::json!({
                "ts": report.ts,
                "mode": report.ems.mode,
                "ready": report.ems.ready,
                "station_target_power_kw": report.ems.station_target_power_kw,
                "station_target_voltage_v": report.ems.station_target_voltage_v,
                "latched_units": report.latched_units,
                "frames": report.frames.len(),
                "new_occurrences": report.new_occurrences,
                "telemetry": telemetry,
            })
            .to_string()
        };

        if summary_tx.receiver_count() > 0 {
            if let Err(e) = summary_tx.send(summary.clone()) {
                warn!("Failed to broadcast tick summary: {}", e);
            }
        }
        info!("TICK: {}", summary);
    }
}

async fn start_tcp_server(
    agent: Arc<Mutex<StationAgent>>,
    summary_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{TCP_PORT}")).await?;
    info!("TCP server listening on port {}", TCP_PORT);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New client connected: {}", addr);
                let client_agent = Arc::clone(&agent);
                let client_summary_rx = summary_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_agent, client_summary_rx).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    agent: Arc<Mutex<StationAgent>>,
    mut summary_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    // Stream tick summaries alongside request/response traffic.
    let summary_writer = Arc::clone(&writer);
    let summary_task = tokio::spawn(async move {
        while let Ok(summary) = summary_rx.recv().await {
            let mut writer_guard = summary_writer.lock().await;
            if writer_guard.write_all(summary.as_bytes()).await.is_err() {
                break;
            }
            if writer_guard.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<OperatorRequest>(trimmed) {
                    Ok(request) => {
                        info!("Received request: {:?}", request);
                        let mut agent_guard = agent.lock().await;
                        handle_request(&mut agent_guard, request)
                    }
                    Err(e) => {
                        error!("Failed to parse request: {}", e);
                        serde_json::json!({
                            "ok": false,
                            "error": format!("invalid request: {e}"),
                        })
                    }
                };

                let response_json = response.to_string();
                {
                    let mut writer_guard = writer.lock().await;
                    writer_guard.write_all(response_json.as_bytes()).await?;
                    writer_guard.write_all(b"\n").await?;
                }
                info!("Sent response: {}", response_json);
            }
            Err(e) => {
                error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    summary_task.abort();
    Ok(())
}

fn handle_request(agent: &mut StationAgent, request: OperatorRequest) -> serde_json::Value {
    let ts = now_ms();
    match request {
        OperatorRequest::SetCommands { actor, request } => {
            let applied = agent.apply_commands(request, actor, ts);
            serde_json::json!({ "ok": true, "commands": applied })
        }
        OperatorRequest::ResetUnit { unit_id } => {
            let outcome = agent.reset_unit(unit_id, ts, "operator");
            serde_json::json!({ "ok": outcome.ok, "unit_id": outcome.unit_id, "reset_at": outcome.reset_at })
        }
        OperatorRequest::ResetProtection { device } => {
            let was_tripped = agent.reset_protection_device(device);
            serde_json::json!({ "ok": true, "was_tripped": was_tripped })
        }
        OperatorRequest::SetImpairment {
            drop_rate,
            corrupt_rate,
        } => {
            agent.set_impairment(drop_rate, corrupt_rate);
            serde_json::json!({ "ok": true, "drop_rate": drop_rate, "corrupt_rate": corrupt_rate })
        }
        OperatorRequest::Status => {
            serde_json::json!({
                "ok": true,
                "telemetry": agent.store().latest_telemetry(),
                "commands": agent.effective_commands(),
                "auto_preview": agent.auto_power_preview(ts),
            })
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
