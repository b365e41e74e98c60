//! Mock Hardware Implementations
//!
//! Provides simulated station hardware for testing without physical devices.
//! All mock devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockSmu` - Keithley-style SMU answering the sweep command set, with a
//!   single-diode solar cell behind it
//! - `MockPositioner` - XY stage with travel time and a move log
//! - `MockRelay` - relay board recording the tokens it receives
//!
//! Every mock is `Clone`; clones share state, so a test keeps one handle for
//! inspection and gives the other to the station.

use crate::config::PixelDefinition;
use crate::instrument::capabilities::{PixelSelector, Positioner, ScpiTransport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockSmu - Simulated Source-Measure Unit
// =============================================================================

/// Single-diode cell model: `I = Iph - I0 * (exp(V / nVt) - 1)`.
#[derive(Debug, Clone, Copy)]
pub struct DiodeModel {
    pub photocurrent_amps: f64,
    pub saturation_current_amps: f64,
    /// Ideality factor times thermal voltage (V)
    pub thermal_voltage: f64,
}

impl Default for DiodeModel {
    fn default() -> Self {
        Self {
            photocurrent_amps: 0.03,
            saturation_current_amps: 1e-10,
            thermal_voltage: 0.0385,
        }
    }
}

impl DiodeModel {
    pub fn current(&self, voltage: f64) -> f64 {
        self.photocurrent_amps
            - self.saturation_current_amps * ((voltage / self.thermal_voltage).exp() - 1.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct ProgrammedSweep {
    start: f64,
    stop: f64,
    points: u32,
    delay_secs: f64,
}

#[derive(Debug)]
struct SmuState {
    connected: bool,
    sweep: Option<ProgrammedSweep>,
    current_limit: f64,
    started_at: Option<Instant>,
    opc_armed: bool,
    error_queue: VecDeque<String>,
    call_log: Vec<String>,
    sweeps_started: usize,
    // failure injection
    fail_remaining: usize,
    fail_connect: bool,
    reject_next_sweep: bool,
    hang: bool,
    dropped_points: usize,
}

/// Simulated SMU speaking the SCPI subset used by the sweep session.
///
/// # Example
///
/// ```
/// use pixel_iv_daq::hardware::mock::MockSmu;
///
/// let smu = MockSmu::new().with_time_scale(0.0);
/// smu.hang_sweeps(true);
/// assert_eq!(smu.sweeps_started(), 0);
/// ```
#[derive(Clone)]
pub struct MockSmu {
    state: Arc<Mutex<SmuState>>,
    model: DiodeModel,
    time_scale: f64,
}

impl Default for MockSmu {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSmu {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SmuState {
                connected: false,
                sweep: None,
                current_limit: 1.0,
                started_at: None,
                opc_armed: false,
                error_queue: VecDeque::new(),
                call_log: Vec::new(),
                sweeps_started: 0,
                fail_remaining: 0,
                fail_connect: false,
                reject_next_sweep: false,
                hang: false,
                dropped_points: 0,
            })),
            model: DiodeModel::default(),
            time_scale: 1.0,
        }
    }

    pub fn with_model(mut self, model: DiodeModel) -> Self {
        self.model = model;
        self
    }

    /// Scale the simulated sweep duration (0.0 completes instantly).
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    /// Fail the next transport operation.
    pub fn inject_next_failure(&self) {
        self.inject_failures(1);
    }

    /// Fail the next `count` transport operations.
    pub fn inject_failures(&self, count: usize) {
        lock(&self.state).fail_remaining = count;
    }

    /// Refuse connections.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).fail_connect = refuse;
    }

    /// Push a range error into the error queue on the next sweep definition.
    pub fn reject_next_sweep(&self) {
        lock(&self.state).reject_next_sweep = true;
    }

    /// Never report operation-complete.
    pub fn hang_sweeps(&self, hang: bool) {
        lock(&self.state).hang = hang;
    }

    /// Return this many fewer (voltage, current) pairs than programmed.
    pub fn drop_trace_points(&self, count: usize) {
        lock(&self.state).dropped_points = count;
    }

    pub fn call_log(&self) -> Vec<String> {
        lock(&self.state).call_log.clone()
    }

    pub fn clear_log(&self) {
        lock(&self.state).call_log.clear();
    }

    /// Number of `:INIT` commands accepted.
    pub fn sweeps_started(&self) -> usize {
        lock(&self.state).sweeps_started
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).connected
    }

    fn check_failure(state: &mut SmuState) -> Result<()> {
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(anyhow!("Injected failure"));
        }
        if !state.connected {
            return Err(anyhow!("Not connected"));
        }
        Ok(())
    }

    fn handle_write(&self, state: &mut SmuState, command: &str) {
        let command = command.trim();
        if command == "*RST" {
            state.sweep = None;
            state.started_at = None;
            state.opc_armed = false;
            state.current_limit = 1.0;
        } else if command == "*CLS" {
            state.error_queue.clear();
            state.opc_armed = false;
        } else if command == "*OPC" {
            state.opc_armed = true;
        } else if command == ":INIT" {
            if state.sweep.is_some() {
                state.started_at = Some(Instant::now());
                state.sweeps_started += 1;
            } else {
                state
                    .error_queue
                    .push_back("-221,\"Settings conflict; no sweep defined\"".to_string());
            }
        } else if let Some(limit) = command.strip_prefix("SOUR:VOLT:ILIM ") {
            match limit.trim().parse::<f64>() {
                Ok(value) => state.current_limit = value,
                Err(_) => state.error_queue.push_back("-102,\"Syntax error\"".to_string()),
            }
        } else if let Some(args) = command.strip_prefix("SOUR:SWE:VOLT:LIN ") {
            if std::mem::take(&mut state.reject_next_sweep) {
                state
                    .error_queue
                    .push_back("-222,\"Data out of range\"".to_string());
                return;
            }
            match parse_sweep(args) {
                Some(sweep) => state.sweep = Some(sweep),
                None => state.error_queue.push_back("-102,\"Syntax error\"".to_string()),
            }
        }
    }

    fn handle_query(&self, state: &mut SmuState, command: &str) -> Result<String> {
        let command = command.trim();
        match command {
            "*IDN?" => Ok("KEITHLEY INSTRUMENTS,MODEL 2450,MOCK0001,1.7.0".to_string()),
            "SYST:ERR?" => Ok(state
                .error_queue
                .pop_front()
                .unwrap_or_else(|| "0,\"No error\"".to_string())),
            "*ESR?" => {
                let done = match (state.sweep, state.started_at) {
                    (Some(sweep), Some(started)) if state.opc_armed && !state.hang => {
                        let nominal = sweep.delay_secs * f64::from(sweep.points) * self.time_scale;
                        started.elapsed() >= Duration::from_secs_f64(nominal)
                    }
                    _ => false,
                };
                if done {
                    // reading the event register clears it
                    state.opc_armed = false;
                    Ok("1".to_string())
                } else {
                    Ok("0".to_string())
                }
            }
            cmd if cmd.starts_with("TRAC:DATA?") => {
                let sweep = state
                    .sweep
                    .ok_or_else(|| anyhow!("Trace buffer is empty"))?;
                let points = (sweep.points as usize).saturating_sub(state.dropped_points);
                Ok(self.render_trace(&sweep, points, state.current_limit))
            }
            other => Err(anyhow!("Unsupported query: {}", other)),
        }
    }

    fn render_trace(&self, sweep: &ProgrammedSweep, points: usize, limit: f64) -> String {
        let step = if sweep.points > 1 {
            (sweep.stop - sweep.start) / f64::from(sweep.points - 1)
        } else {
            0.0
        };
        (0..points)
            .flat_map(|i| {
                let voltage = sweep.start + step * i as f64;
                let current = self.model.current(voltage).clamp(-limit, limit);
                [format!("{:.6E}", voltage), format!("{:.6E}", current)]
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn parse_sweep(args: &str) -> Option<ProgrammedSweep> {
    let fields: Vec<&str> = args.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return None;
    }
    Some(ProgrammedSweep {
        start: fields[0].parse().ok()?,
        stop: fields[1].parse().ok()?,
        points: fields[2].parse().ok()?,
        delay_secs: fields[3].parse().ok()?,
    })
}

#[async_trait]
impl ScpiTransport for MockSmu {
    async fn connect(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.call_log.push("connect".to_string());
        if state.fail_connect {
            return Err(anyhow!("Mock SMU refused the connection"));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.call_log.push("disconnect".to_string());
        state.connected = false;
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.call_log.push(command.to_string());
        Self::check_failure(&mut state)?;
        self.handle_write(&mut state, command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state.call_log.push(command.to_string());
        Self::check_failure(&mut state)?;
        self.handle_query(&mut state, command)
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn info(&self) -> String {
        "MockSmu(diode model)".to_string()
    }
}

// =============================================================================
// MockPositioner - Simulated XY Stage
// =============================================================================

#[derive(Debug)]
struct StageState {
    connected: bool,
    accept_connect: bool,
    position: (f64, f64),
    moves: Vec<(f64, f64)>,
    hang_home: bool,
    fail_next_home: bool,
}

/// Mock XY stage with travel time proportional to distance.
#[derive(Clone)]
pub struct MockPositioner {
    state: Arc<Mutex<StageState>>,
    speed_mm_per_sec: f64,
    settle: Duration,
    home_settle: Duration,
}

impl Default for MockPositioner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPositioner {
    /// Instant stage parked at the origin.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StageState {
                connected: false,
                accept_connect: true,
                position: (0.0, 0.0),
                moves: Vec::new(),
                hang_home: false,
                fail_next_home: false,
            })),
            speed_mm_per_sec: f64::INFINITY,
            settle: Duration::ZERO,
            home_settle: Duration::ZERO,
        }
    }

    /// Stage with realistic travel speed and settling times.
    pub fn with_motion(
        mut self,
        speed_mm_per_sec: f64,
        settle: Duration,
        home_settle: Duration,
    ) -> Self {
        self.speed_mm_per_sec = speed_mm_per_sec;
        self.settle = settle;
        self.home_settle = home_settle;
        self
    }

    /// Make `connect()` report that the device did not answer.
    pub fn refuse_connections(&self) {
        lock(&self.state).accept_connect = false;
    }

    /// Stall every homing move without ever finishing.
    pub fn hang_homing(&self, hang: bool) {
        lock(&self.state).hang_home = hang;
    }

    /// Fail the next homing move.
    pub fn fail_next_home(&self) {
        lock(&self.state).fail_next_home = true;
    }

    /// Every target commanded so far, homing included.
    pub fn moves(&self) -> Vec<(f64, f64)> {
        lock(&self.state).moves.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn travel(&self, target: (f64, f64), settle: Duration) -> Result<()> {
        let current = {
            let state = lock(&self.state);
            if !state.connected {
                return Err(anyhow!("Positioner not connected"));
            }
            state.position
        };
        let distance = (target.0 - current.0).hypot(target.1 - current.1);
        let travel = Duration::from_secs_f64(distance / self.speed_mm_per_sec);
        debug!(
            "MockPositioner: ({:.2}, {:.2}) -> ({:.2}, {:.2}) in {:?}",
            current.0, current.1, target.0, target.1, travel
        );
        sleep(travel + settle).await;

        let mut state = lock(&self.state);
        state.position = target;
        state.moves.push(target);
        Ok(())
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    async fn connect(&mut self) -> Result<bool> {
        let mut state = lock(&self.state);
        state.connected = state.accept_connect;
        Ok(state.connected)
    }

    async fn move_to(&mut self, x_mm: f64, y_mm: f64) -> Result<()> {
        self.travel((x_mm, y_mm), self.settle).await
    }

    async fn return_home(&mut self) -> Result<()> {
        let (hang, fail) = {
            let mut state = lock(&self.state);
            (state.hang_home, std::mem::take(&mut state.fail_next_home))
        };
        if hang {
            debug!("MockPositioner: homing stalled");
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(anyhow!("Injected homing failure"));
        }
        self.travel((0.0, 0.0), self.home_settle).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        lock(&self.state).connected = false;
        Ok(())
    }

    fn position(&self) -> (f64, f64) {
        lock(&self.state).position
    }
}

// =============================================================================
// MockRelay - Simulated Pixel Selector
// =============================================================================

/// Relay board double recording every token written.
#[derive(Clone, Default)]
pub struct MockRelay {
    open: Arc<AtomicBool>,
    fail_next: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_next_failure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Tokens written so far, in order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PixelSelector for MockRelay {
    async fn open(&mut self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn select(&mut self, pixel: &PixelDefinition) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("Injected relay failure"));
        }
        if !self.is_open() {
            return Err(anyhow!("Relay port not open"));
        }
        lock(&self.sent).push(pixel.relay_command.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
