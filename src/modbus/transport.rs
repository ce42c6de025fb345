use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use serialport::{ClearBuffer, SerialPort};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::settings::{ParityConfig, SerialSettings};
use crate::utils::error::TransportError;

/// Exclusive request/response channel to the drive.
///
/// `request` takes `&mut self`, so a single owner serialises every exchange
/// on the half-duplex medium. After a timeout the channel stays usable; after
/// an I/O error it is broken and fails fast until [`Transport::reopen`].
#[async_trait]
pub trait Transport: Send {
    async fn request(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;

    fn is_broken(&self) -> bool;

    async fn reopen(&mut self) -> Result<(), TransportError>;

    fn describe(&self) -> String;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn request(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).request(payload, timeout).await
    }

    fn is_broken(&self) -> bool {
        (**self).is_broken()
    }

    async fn reopen(&mut self) -> Result<(), TransportError> {
        (**self).reopen().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// RTU frame end: 3.5 character times of silence, 1.75 ms floor above 19200 baud.
pub fn inter_frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(1_750);
    }
    // 11 bits per character on the wire.
    Duration::from_micros((35_000_000u64 * 11 / 10) / baud_rate as u64)
}

pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    frame_gap: Duration,
}

impl SerialTransport {
    pub fn open(settings: &SerialSettings) -> Result<Self, TransportError> {
        let frame_gap = inter_frame_gap(settings.baud_rate);
        let port = Self::open_port(settings, frame_gap)?;
        Ok(Self {
            settings: settings.clone(),
            port: Some(Arc::new(Mutex::new(port))),
            frame_gap,
        })
    }

    fn open_port(settings: &SerialSettings, frame_gap: Duration) -> Result<Box<dyn SerialPort>, TransportError> {
        info!("🔌 Connecting to Modbus RTU port: {}", settings.port);
        info!(
            "⚙️  Configuration: {} baud, 8 data bits, {:?} parity, 1 stop bit",
            settings.baud_rate, settings.parity
        );

        let serial_parity = match settings.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(settings.port.as_str(), settings.baud_rate)
            .timeout(frame_gap)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serial_parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", settings.port, e);
                TransportError::Connection(format!("Failed to open port {}: {}", settings.port, e))
            })?;

        info!("✅ Modbus RTU connection established successfully");
        Ok(port)
    }

    fn exchange(
        port: &mut dyn SerialPort,
        payload: &[u8],
        timeout: Duration,
        frame_gap: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        // Stale bytes from an abandoned exchange must not prefix this response.
        port.clear(ClearBuffer::All)
            .map_err(|e| TransportError::Io(e.into()))?;
        port.write_all(payload)?;
        port.flush()?;

        let deadline = Instant::now() + timeout;
        let mut response = Vec::new();
        let mut buffer = [0u8; 256];
        let mut last_rx: Option<Instant> = None;

        loop {
            match port.read(&mut buffer) {
                Ok(n) if n > 0 => {
                    response.extend_from_slice(&buffer[..n]);
                    last_rx = Some(Instant::now());
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(TransportError::Io(e)),
            }

            if let Some(at) = last_rx {
                if at.elapsed() >= frame_gap {
                    return Ok(response);
                }
            }
            if Instant::now() >= deadline {
                if response.is_empty() {
                    return Err(TransportError::Timeout(timeout));
                }
                return Ok(response);
            }
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn request(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port.clone().ok_or_else(|| {
            TransportError::Connection(format!("{} is broken, reopen required", self.settings.port))
        })?;

        trace!("📤 Sending frame: [{}]", hex::encode(payload));
        let frame = payload.to_vec();
        let frame_gap = self.frame_gap;

        // The lock also covers a previous exchange whose caller was cancelled.
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = port
                .lock()
                .map_err(|_| TransportError::Connection("Serial port lock poisoned".to_string()))?;
            Self::exchange(guard.as_mut(), &frame, timeout, frame_gap)
        })
        .await
        .map_err(|e| TransportError::Connection(format!("Serial worker failed: {}", e)))?;

        match result {
            Ok(response) => {
                trace!("📥 Complete response: [{}] ({} bytes)", hex::encode(&response), response.len());
                Ok(response)
            }
            Err(TransportError::Timeout(t)) => {
                debug!("⏰ No response within {:?}", t);
                Err(TransportError::Timeout(t))
            }
            Err(e) => {
                error!("❌ Serial link {} broken: {}", self.settings.port, e);
                self.port = None;
                Err(e)
            }
        }
    }

    fn is_broken(&self) -> bool {
        self.port.is_none()
    }

    async fn reopen(&mut self) -> Result<(), TransportError> {
        warn!("🔄 Reopening serial port {}", self.settings.port);
        self.port = None;
        let port = Self::open_port(&self.settings, self.frame_gap)?;
        self.port = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.settings.port, self.settings.baud_rate)
    }
}

/// Lists serial ports the way an operator needs to pick one.
pub fn list_serial_ports() -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::Connection(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "{} (USB {:04x}:{:04x}{})",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.manufacturer.map(|m| format!(", {}", m)).unwrap_or_default()
            ),
            _ => port.port_name,
        })
        .collect())
}
