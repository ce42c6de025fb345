//! In-process Sinamics drive answering RTU frames from a register bank.
//!
//! Used by `--simulate` and by tests that need a realistic slave: control
//! words move the drive between stopped, running and faulted, the speed ramps
//! towards the setpoint on every read, and link failures can be injected
//! through [`SimulatorControls`].

use async_trait::async_trait;
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::protocol::{
    encode_exception, encode_read_response, ModbusRequest, EXCEPTION_ILLEGAL_ADDRESS,
    EXCEPTION_ILLEGAL_VALUE,
};
use super::transport::Transport;
use crate::devices::motor::ControlWords;
use crate::devices::registers::{Register, RegisterAddress, MAX_REGISTERS_PER_READ};
use crate::utils::error::TransportError;

pub const ZSW_STOPPED: u16 = 0xEB31;
pub const ZSW_RUNNING: u16 = 0xEF37;
pub const ZSW_FAULTED: u16 = 0xEA38;

const RATED_SPEED_RPM: f64 = 1500.0;
const RATED_FREQ_HZ: f64 = 50.0;
const STW_FAULT_ACK_BIT: u16 = 0x0080;

/// One-shot link misbehaviour consumed by the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    /// No answer until the caller's timeout expires.
    Timeout,
    /// Valid response with a damaged checksum.
    CorruptCrc,
    /// Exception response with the given code.
    Exception(u8),
    /// Hard I/O failure; the link stays broken until reopened.
    Io,
}

#[derive(Debug)]
struct DriveBank {
    registers: HashMap<Register, u16>,
    running: bool,
    fault: Option<u16>,
    speed_rpm: f64,
    injections: VecDeque<Injection>,
    persistent: Option<Injection>,
    latency: Duration,
    requests: u64,
}

impl DriveBank {
    fn new() -> Self {
        let mut registers: HashMap<Register, u16> =
            Register::ALL.iter().map(|r| (*r, 0u16)).collect();
        registers.insert(Register::RefFreq, 5000);
        registers.insert(Register::AccelTime, 1000);
        registers.insert(Register::DecelTime, 1000);
        registers.insert(Register::RatedPower, 75);
        registers.insert(Register::DcBusVolts, 540);
        registers.insert(Register::InverterModel, 0x0012);
        registers.insert(Register::FirmwareVersion, 402);
        registers.insert(Register::Zsw, ZSW_STOPPED);

        Self {
            registers,
            running: false,
            fault: None,
            speed_rpm: 0.0,
            injections: VecDeque::new(),
            persistent: None,
            latency: Duration::ZERO,
            requests: 0,
        }
    }

    fn get(&self, register: Register) -> u16 {
        self.registers.get(&register).copied().unwrap_or(0)
    }

    fn setpoint_percent(&self) -> f64 {
        self.get(Register::Hsw) as i16 as f64 * 100.0 / 16384.0
    }

    fn write(&mut self, register: Register, value: u16, words: &ControlWords) {
        let previous = self.get(register);
        self.registers.insert(register, value);

        if register == Register::Stw {
            let rising_ack = previous & STW_FAULT_ACK_BIT == 0 && value & STW_FAULT_ACK_BIT != 0;
            if value == words.fault_ack && rising_ack {
                if let Some(code) = self.fault.take() {
                    info!("🛠️  Simulated drive: fault F{} acknowledged", code);
                    self.registers.insert(Register::LastFault, code);
                    self.registers.insert(Register::Fault, 0);
                }
            } else if value == words.start && self.fault.is_none() {
                self.running = true;
            } else if value == words.stop {
                self.running = false;
            }
        }
        self.refresh();
    }

    fn trip(&mut self, code: u16) {
        self.fault = Some(code);
        self.running = false;
        self.registers.insert(Register::Fault, code);
        self.refresh();
    }

    /// Moves the measured speed a quarter of the way towards the target.
    fn advance(&mut self) {
        let target = if self.running {
            self.setpoint_percent() / 100.0 * RATED_SPEED_RPM
        } else {
            0.0
        };
        let step = (target - self.speed_rpm) * 0.25;
        self.speed_rpm = if step.abs() < 1.0 { target } else { self.speed_rpm + step };
        self.refresh();
    }

    fn refresh(&mut self) {
        let zsw = if self.fault.is_some() {
            ZSW_FAULTED
        } else if self.running {
            ZSW_RUNNING
        } else {
            ZSW_STOPPED
        };
        let speed = self.speed_rpm.round() as i16;
        let fraction = self.speed_rpm / RATED_SPEED_RPM;
        let current = (fraction.abs() * 420.0).round() as u16;
        let power = (fraction.abs() * 75.0).round() as u16;

        self.registers.insert(Register::Zsw, zsw);
        self.registers.insert(Register::Speed, speed as u16);
        self.registers
            .insert(Register::FreqOutput, (fraction * RATED_FREQ_HZ * 100.0).round() as i16 as u16);
        self.registers.insert(Register::Hiw, (fraction * 16384.0).round() as i16 as u16);
        self.registers.insert(Register::Current, current);
        self.registers.insert(Register::ActualPower, power);
        self.registers
            .insert(Register::OutputVolts, (fraction.abs() * 400.0).round() as u16);
        self.registers.insert(Register::StopRun, self.running as u16);
    }
}

/// Shared handle for steering a [`SimulatedDrive`] from outside the monitor.
#[derive(Debug, Clone)]
pub struct SimulatorControls {
    bank: Arc<Mutex<DriveBank>>,
}

impl SimulatorControls {
    fn bank(&self) -> MutexGuard<'_, DriveBank> {
        // A poisoned bank only means a test thread panicked mid-update.
        self.bank.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn inject(&self, injection: Injection) {
        self.bank().injections.push_back(injection);
    }

    pub fn inject_many(&self, injection: Injection, count: usize) {
        let mut bank = self.bank();
        for _ in 0..count {
            bank.injections.push_back(injection);
        }
    }

    /// Applies `injection` to every request until cleared with `None`.
    pub fn set_persistent(&self, injection: Option<Injection>) {
        self.bank().persistent = injection;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.bank().latency = latency;
    }

    pub fn trip(&self, fault_code: u16) {
        self.bank().trip(fault_code);
    }

    /// Forces the drive into a running state at the given speed.
    pub fn force_running(&self, speed_rpm: f64) {
        let mut bank = self.bank();
        bank.fault = None;
        bank.running = true;
        bank.speed_rpm = speed_rpm;
        let setpoint = (speed_rpm / RATED_SPEED_RPM * 16384.0).round() as i16;
        bank.registers.insert(Register::Hsw, setpoint as u16);
        bank.refresh();
    }

    pub fn set_register(&self, register: Register, value: u16) {
        self.bank().registers.insert(register, value);
    }

    pub fn register(&self, register: Register) -> u16 {
        self.bank().get(register)
    }

    pub fn request_count(&self) -> u64 {
        self.bank().requests
    }
}

pub struct SimulatedDrive {
    slave_id: u8,
    control_words: ControlWords,
    bank: Arc<Mutex<DriveBank>>,
    broken: bool,
}

impl SimulatedDrive {
    pub fn new(slave_id: u8, control_words: ControlWords) -> Self {
        info!("🧪 Simulated Sinamics drive on slave {}", slave_id);
        Self {
            slave_id,
            control_words,
            bank: Arc::new(Mutex::new(DriveBank::new())),
            broken: false,
        }
    }

    pub fn controls(&self) -> SimulatorControls {
        SimulatorControls {
            bank: Arc::clone(&self.bank),
        }
    }

    fn serve(&self, bank: &mut DriveBank, request: &ModbusRequest) -> Vec<u8> {
        match *request {
            ModbusRequest::ReadHoldingRegisters { slave, start, quantity } => {
                if quantity == 0 || quantity > MAX_REGISTERS_PER_READ {
                    return encode_exception(slave, request.function_code(), EXCEPTION_ILLEGAL_VALUE)
                        .to_vec();
                }
                bank.advance();
                let mut words = Vec::with_capacity(quantity as usize);
                for offset in 0..quantity {
                    match Register::from_address(RegisterAddress(start.0.wrapping_add(offset))) {
                        Some(register) => words.push(bank.get(register)),
                        None => {
                            return encode_exception(
                                slave,
                                request.function_code(),
                                EXCEPTION_ILLEGAL_ADDRESS,
                            )
                            .to_vec()
                        }
                    }
                }
                encode_read_response(slave, &words).to_vec()
            }
            ModbusRequest::WriteSingleRegister { slave, address, value } => {
                match Register::from_address(address).filter(|r| r.is_writable()) {
                    Some(register) => {
                        debug!("🧪 Simulated write {} = 0x{:04x}", register, value);
                        bank.write(register, value, &self.control_words);
                        request.encode().to_vec()
                    }
                    None => encode_exception(slave, request.function_code(), EXCEPTION_ILLEGAL_ADDRESS)
                        .to_vec(),
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SimulatedDrive {
    async fn request(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.broken {
            return Err(TransportError::Connection("simulated link is broken".to_string()));
        }

        let (injection, latency, response) = {
            let mut bank = self.bank.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            bank.requests += 1;
            let injection = bank.injections.pop_front().or(bank.persistent);
            let latency = bank.latency;

            let response = match ModbusRequest::parse(payload) {
                Ok(request) if request.slave() == self.slave_id => match injection {
                    Some(Injection::Timeout) | Some(Injection::Io) => None,
                    Some(Injection::Exception(code)) => {
                        Some(encode_exception(request.slave(), request.function_code(), code).to_vec())
                    }
                    Some(Injection::CorruptCrc) | None => Some(self.serve(&mut bank, &request)),
                },
                // Frames for other slaves or garbled frames get no answer on a real bus.
                _ => None,
            };
            (injection, latency, response)
        };

        if injection == Some(Injection::Io) {
            self.broken = true;
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated link failure",
            )));
        }

        match response {
            Some(mut frame) if latency < timeout => {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                if injection == Some(Injection::CorruptCrc) {
                    if let Some(last) = frame.last_mut() {
                        *last ^= 0xFF;
                    }
                }
                Ok(frame)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn reopen(&mut self) -> Result<(), TransportError> {
        info!("🔄 Simulated link reopened");
        self.broken = false;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulated drive (slave {})", self.slave_id)
    }
}
