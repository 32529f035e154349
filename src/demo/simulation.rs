//! Simulated temperature controller device
//!
//! Serves the demo line protocol on TCP. Each ramp, once enabled, moves its
//! target from `start` towards `end` at the shared ramp rate and switches
//! itself off on arrival. The actual temperature is the target plus noise.
//!
//! | Request          | Reply                            |
//! |------------------|----------------------------------|
//! | `ID?`            | device identifier                |
//! | `R?` / `R=x`     | ramp rate (units per second)     |
//! | `P?`             | total power                      |
//! | `V?`             | JSON array of ramp voltages      |
//! | `Snn?` / `Snn=x` | start of ramp `nn` (from 01)     |
//! | `Enn?` / `Enn=x` | end of ramp `nn`                 |
//! | `Nnn?` / `Nnn=b` | ramp enabled, `0` or `1`         |
//! | `Tnn?`           | target temperature               |
//! | `Ann?`           | actual temperature               |
//!
//! Setters and unrecognised lines get no reply.

use parking_lot::Mutex;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEVICE_ID: &str = "SIMTCONT123";

/// Volts per degree is 1/17; power is 50 W per volt.
const DEGREES_PER_VOLT: f64 = 17.0;
const WATTS_PER_VOLT: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    pub num_ramp_controllers: usize,
    pub default_start: i64,
    pub default_end: i64,
    /// Ramp rate at power-on
    pub ramp_rate: f64,
    /// Physics step
    pub tick: Duration,
}

impl SimulatorSettings {
    pub fn new(num_ramp_controllers: usize) -> Self {
        Self {
            num_ramp_controllers,
            default_start: 0,
            default_end: 50,
            ramp_rate: 1.0,
            tick: Duration::from_millis(100),
        }
    }
}

// =============================================================================
// Device model
// =============================================================================

#[derive(Debug, Clone)]
struct Ramp {
    start: i64,
    end: i64,
    target: f64,
    actual: f64,
    enabled: bool,
}

/// State of the simulated device.
#[derive(Debug, Clone)]
pub struct TempControllerDevice {
    ramps: Vec<Ramp>,
    ramp_rate: f64,
}

impl TempControllerDevice {
    pub fn new(settings: &SimulatorSettings) -> Self {
        let ramp = Ramp {
            start: settings.default_start,
            end: settings.default_end,
            target: 0.0,
            actual: 0.0,
            enabled: false,
        };
        Self {
            ramps: vec![ramp; settings.num_ramp_controllers],
            ramp_rate: settings.ramp_rate,
        }
    }

    pub fn num_ramps(&self) -> usize {
        self.ramps.len()
    }

    pub fn ramp_rate(&self) -> f64 {
        self.ramp_rate
    }

    pub fn target(&self, index: usize) -> Option<f64> {
        self.ramps.get(index).map(|r| r.target)
    }

    pub fn is_enabled(&self, index: usize) -> Option<bool> {
        self.ramps.get(index).map(|r| r.enabled)
    }

    pub fn voltages(&self) -> Vec<f64> {
        self.ramps
            .iter()
            .map(|r| r.actual / DEGREES_PER_VOLT)
            .collect()
    }

    pub fn power(&self) -> f64 {
        self.voltages().iter().sum::<f64>() * WATTS_PER_VOLT
    }

    fn set_enabled(&mut self, index: usize, enabled: bool) {
        let ramp = &mut self.ramps[index];
        if enabled {
            ramp.target = ramp.start as f64;
            ramp.enabled = true;
            info!(ramp = index + 1, start = ramp.start, end = ramp.end, "Started ramp");
        } else {
            ramp.enabled = false;
            info!(ramp = index + 1, "Stopped ramp");
        }
    }

    /// Advance every enabled ramp by `elapsed`.
    pub fn step(&mut self, elapsed: Duration) {
        let delta = self.ramp_rate * elapsed.as_secs_f64();
        let mut rng = rand::thread_rng();
        for ramp in &mut self.ramps {
            let end = ramp.end as f64;
            if ramp.enabled && ramp.target < end {
                ramp.target = (ramp.target + delta).min(end);
            }
            if ramp.target >= end {
                ramp.enabled = false;
            }
            ramp.actual = if ramp.enabled {
                ramp.target + rng.gen_range(-0.5..0.5)
            } else {
                0.0
            };
        }
    }

    /// Apply one request line, returning the reply if there is one.
    pub fn handle(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        match line {
            "" => return None,
            "ID?" => return Some(DEVICE_ID.to_string()),
            "R?" => return Some(self.ramp_rate.to_string()),
            "P?" => return Some(self.power().to_string()),
            "V?" => return serde_json::to_string(&self.voltages()).ok(),
            _ => {}
        }

        if let Some(value) = line.strip_prefix("R=") {
            match value.parse::<f64>() {
                Ok(rate) if rate.is_finite() && rate >= 0.0 => {
                    self.ramp_rate = rate;
                    info!(rate, "Set ramp rate");
                }
                _ => warn!(%line, "Rejected ramp rate"),
            }
            return None;
        }

        self.handle_indexed(line)
    }

    fn handle_indexed(&mut self, line: &str) -> Option<String> {
        let register = line.chars().next()?;
        let digits = line.get(1..3)?;
        let rest = line.get(3..)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            debug!(%line, "Ignoring unrecognised request");
            return None;
        }
        let index = match digits.parse::<usize>() {
            Ok(n) if n >= 1 && n <= self.ramps.len() => n - 1,
            _ => {
                warn!(%line, "Ramp index out of range");
                return None;
            }
        };

        if rest == "?" {
            let ramp = &self.ramps[index];
            return match register {
                'S' => Some(ramp.start.to_string()),
                'E' => Some(ramp.end.to_string()),
                'N' => Some(if ramp.enabled { "1" } else { "0" }.to_string()),
                'T' => Some(ramp.target.to_string()),
                'A' => Some(ramp.actual.to_string()),
                _ => {
                    debug!(%line, "Ignoring unrecognised request");
                    None
                }
            };
        }

        let Some(value) = rest.strip_prefix('=') else {
            debug!(%line, "Ignoring unrecognised request");
            return None;
        };
        match (register, value) {
            ('N', "0") => self.set_enabled(index, false),
            ('N', "1") => self.set_enabled(index, true),
            ('S' | 'E', value) => match value.parse::<f64>() {
                Ok(v) if v.is_finite() => {
                    let ramp = &mut self.ramps[index];
                    if register == 'S' {
                        ramp.start = v as i64;
                    } else {
                        ramp.end = v as i64;
                    }
                    info!(ramp = index + 1, register = %register, value = v as i64, "Set ramp limit");
                }
                _ => warn!(%line, "Rejected ramp limit"),
            },
            _ => debug!(%line, "Ignoring unrecognised request"),
        }
        None
    }
}

// =============================================================================
// TCP server
// =============================================================================

/// The simulated device bound to a TCP port.
pub struct Simulator {
    listener: TcpListener,
    device: Arc<Mutex<TempControllerDevice>>,
    tick: Duration,
}

impl Simulator {
    /// Bind to `addr`. Port 0 picks a free port, see [`Simulator::local_addr`].
    pub async fn bind(addr: &str, settings: SimulatorSettings) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            address = %listener.local_addr()?,
            ramps = settings.num_ramp_controllers,
            "Temperature controller simulator listening"
        );
        Ok(Self {
            listener,
            device: Arc::new(Mutex::new(TempControllerDevice::new(&settings))),
            tick: settings.tick,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle on the device state.
    pub fn device(&self) -> Arc<Mutex<TempControllerDevice>> {
        self.device.clone()
    }

    /// Serve clients and step the physics until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(run_physics(self.device.clone(), self.tick, shutdown.child_token()));

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let device = self.device.clone();
                        let token = shutdown.child_token();
                        tasks.spawn(async move {
                            if let Err(e) = handle_client(socket, peer, device, token).await {
                                warn!(%peer, error = %e, "Client error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept error"),
                },
            }
        }

        tasks.shutdown().await;
        info!("Simulator stopped");
        Ok(())
    }
}

async fn run_physics(
    device: Arc<Mutex<TempControllerDevice>>,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = Instant::now();
        device.lock().step(now - last);
        last = now;
    }
}

async fn handle_client(
    socket: TcpStream,
    peer: SocketAddr,
    device: Arc<Mutex<TempControllerDevice>>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(%peer, "Client connected");
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!(%peer, "Client disconnected");
            break;
        };

        let reply = device.lock().handle(&line);
        if let Some(reply) = reply {
            writer.write_all(format!("{reply}\r\n").as_bytes()).await?;
        }
    }
    Ok(())
}
