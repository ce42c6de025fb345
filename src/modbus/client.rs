use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::time::Duration;

use super::protocol::{ModbusRequest, ModbusResponse};
use super::transport::Transport;
use crate::config::settings::Config;
use crate::devices::motor::RegisterWrite;
use crate::devices::registers::{Register, RegisterAddress, MAX_REGISTERS_PER_READ};
use crate::devices::sample::RawSample;
use crate::utils::error::{FrameError, ProtocolError, TransportError};

/// Bounded retry with a backoff lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per operation, including the first.
    pub attempts: u32,
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Delay after `failed` attempts have failed; the last table entry repeats.
    pub fn delay_after(&self, failed: u32) -> Duration {
        if self.backoff.is_empty() || failed == 0 {
            return Duration::ZERO;
        }
        let index = (failed as usize - 1).min(self.backoff.len() - 1);
        self.backoff[index]
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200),
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub slave_id: u8,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            slave_id: config.slave_id,
            timeout: config.timeout(),
            retry: RetryPolicy::new(config.retry_count, config.retry_backoff()),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            slave_id: 2,
            timeout: Duration::from_millis(3000),
            retry: RetryPolicy::default(),
        }
    }
}

/// One contiguous block of registers read with a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRange {
    pub start: RegisterAddress,
    pub registers: Vec<Register>,
}

/// Groups registers into contiguous address ranges of at most
/// [`MAX_REGISTERS_PER_READ`] registers. Duplicates are read once.
pub fn coalesce(registers: &[Register]) -> Vec<ReadRange> {
    let mut sorted: Vec<Register> = registers.to_vec();
    sorted.sort_by_key(|r| r.address());
    sorted.dedup();

    let mut ranges: Vec<ReadRange> = Vec::new();
    for register in sorted {
        let address = register.address();
        match ranges.last_mut() {
            Some(range)
                if range.registers.len() < MAX_REGISTERS_PER_READ as usize
                    && range.start.0 as usize + range.registers.len() == address.0 as usize =>
            {
                range.registers.push(register);
            }
            _ => ranges.push(ReadRange {
                start: address,
                registers: vec![register],
            }),
        }
    }
    ranges
}

enum AttemptFailure {
    Connection(String),
    Exception(u8),
    Exhausted { attempts: u32, last_error: String },
}

/// Register-level access to the drive over an owned [`Transport`].
pub struct RegisterClient<T: Transport> {
    transport: T,
    settings: ClientSettings,
}

impl<T: Transport> RegisterClient<T> {
    pub fn new(transport: T, settings: ClientSettings) -> Self {
        info!(
            "📡 Register client on {} (slave {}, timeout {:?}, {} attempts)",
            transport.describe(),
            settings.slave_id,
            settings.timeout,
            settings.retry.attempts
        );
        Self { transport, settings }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_broken(&self) -> bool {
        self.transport.is_broken()
    }

    pub async fn reopen(&mut self) -> Result<(), TransportError> {
        self.transport.reopen().await
    }

    /// Reads every requested register, one frame per contiguous range.
    pub async fn read_registers(&mut self, registers: &[Register]) -> Result<RawSample, ProtocolError> {
        if registers.is_empty() {
            return Err(ProtocolError::InvalidRequest("no registers requested".to_string()));
        }

        let ranges = coalesce(registers);
        debug!(
            "📊 Reading {} registers in {} frame(s) from slave {}",
            registers.len(),
            ranges.len(),
            self.settings.slave_id
        );

        let mut values = BTreeMap::new();
        for range in ranges {
            let request = ModbusRequest::ReadHoldingRegisters {
                slave: self.settings.slave_id,
                start: range.start,
                quantity: range.registers.len() as u16,
            };
            let attempts = self.settings.retry.attempts;
            match self.execute(&request, attempts).await {
                Ok(ModbusResponse::Registers(words)) => {
                    values.extend(range.registers.iter().copied().zip(words));
                }
                Ok(other) => {
                    return Err(ProtocolError::InvalidRequest(format!(
                        "unexpected response to {}: {:?}",
                        request.describe(),
                        other
                    )))
                }
                Err(failure) => return Err(Self::surface(&request, failure)),
            }
        }

        Ok(RawSample::new(values))
    }

    /// Writes one register. Idempotent writes are retried; an edge-triggered
    /// write gets a single attempt and reports [`ProtocolError::UnconfirmedWrite`]
    /// when its outcome is unknown.
    pub async fn write_register(&mut self, write: RegisterWrite) -> Result<(), ProtocolError> {
        if !write.register.is_writable() {
            return Err(ProtocolError::InvalidRequest(format!("{} is read-only", write.register)));
        }

        let request = ModbusRequest::WriteSingleRegister {
            slave: self.settings.slave_id,
            address: write.register.address(),
            value: write.value,
        };
        debug!("✏️  {}", request.describe());

        let attempts = if write.idempotent { self.settings.retry.attempts } else { 1 };
        match self.execute(&request, attempts).await {
            Ok(_) => Ok(()),
            Err(AttemptFailure::Exhausted { last_error, .. }) if !write.idempotent => {
                warn!("⚠️  Write to {} not confirmed: {}", write.register, last_error);
                Err(ProtocolError::UnconfirmedWrite {
                    register: write.register,
                    reason: last_error,
                })
            }
            Err(failure) => Err(Self::surface(&request, failure)),
        }
    }

    fn surface(request: &ModbusRequest, failure: AttemptFailure) -> ProtocolError {
        match failure {
            AttemptFailure::Connection(reason) => ProtocolError::Connection(reason),
            AttemptFailure::Exception(code) => ProtocolError::Exception {
                operation: request.describe(),
                code,
            },
            AttemptFailure::Exhausted { attempts, last_error } => {
                warn!(
                    "⚠️  {} failed after {} attempts: {}",
                    request.describe(),
                    attempts,
                    last_error
                );
                ProtocolError::RetriesExhausted {
                    operation: request.describe(),
                    attempts,
                    last_error,
                }
            }
        }
    }

    async fn execute(
        &mut self,
        request: &ModbusRequest,
        attempts: u32,
    ) -> Result<ModbusResponse, AttemptFailure> {
        let frame = request.encode();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if self.transport.is_broken() {
                return Err(AttemptFailure::Connection(format!(
                    "{} is broken",
                    self.transport.describe()
                )));
            }

            match self.transport.request(&frame, self.settings.timeout).await {
                Ok(bytes) => match request.decode_response(&bytes) {
                    Ok(response) => return Ok(response),
                    Err(FrameError::Exception(code)) => return Err(AttemptFailure::Exception(code)),
                    // Checksum and framing failures count as a lost response.
                    Err(e) => last_error = e.to_string(),
                },
                Err(TransportError::Timeout(t)) => {
                    last_error = TransportError::Timeout(t).to_string();
                }
                Err(e) => return Err(AttemptFailure::Connection(e.to_string())),
            }

            if attempt < attempts {
                let delay = self.settings.retry.delay_after(attempt);
                debug!(
                    "🔄 Attempt {}/{} for {} failed ({}), retrying in {:?}",
                    attempt,
                    attempts,
                    request.describe(),
                    last_error,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(AttemptFailure::Exhausted { attempts, last_error })
    }
}
