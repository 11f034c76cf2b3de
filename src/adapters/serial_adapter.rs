use crate::adapters::SensorPort;
use crate::error::{BenchError, BenchResult};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Serial adapter for the magnetometer's USB link
///
/// This adapter wraps the serialport crate. All I/O is blocking: the scan runs
/// on a single thread of control and every wait is an explicit settle delay
/// in the protocol layer, so reads only ever drain what is already buffered.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0")
    port_name: String,

    /// Baud rate (115200 for the magnetometer)
    baud_rate: u32,

    /// The actual serial port
    #[cfg(feature = "instrument_serial")]
    port: Box<dyn SerialPort>,
}

impl SerialAdapter {
    /// Open `port_name` at `baud_rate`, 8N1 without flow control.
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Communication speed (e.g., 115200)
    /// * `timeout` - Read/write timeout of the underlying port
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> BenchResult<Self> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(port_name, baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(timeout)
                .open()
                .map_err(|e| {
                    BenchError::Serial(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        port_name, baud_rate, e
                    ))
                })?;

            debug!("Serial port '{}' opened at {} baud", port_name, baud_rate);
            Ok(Self {
                port_name: port_name.to_string(),
                baud_rate,
                port,
            })
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (port_name, baud_rate, timeout);
            Err(BenchError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl SensorPort for SerialAdapter {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn write_command(&mut self, command: &[u8]) -> BenchResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            use std::io::Write;

            self.port.write_all(command)?;
            self.port.flush()?;
            debug!("Sent serial command: {}", String::from_utf8_lossy(command));
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(BenchError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    fn read_available(&mut self) -> BenchResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            use std::io::Read;

            let pending = self
                .port
                .bytes_to_read()
                .map_err(|e| BenchError::Serial(format!("{}: {}", self.port_name, e)))?
                as usize;
            let mut buffer = vec![0u8; pending];
            if pending > 0 {
                self.port.read_exact(&mut buffer)?;
            }
            debug!("Received {} bytes from {}", pending, self.port_name);
            Ok(buffer)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(BenchError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }
}
