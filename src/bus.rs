//! Register-oriented bus transports used by the acquisition modules.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use i2cdev::{core::I2CDevice, linux::LinuxI2CDevice};
use serialport::SerialPort;

use crate::outcome::{ModuleError, TransportError};

/// An open device handle. Dropping it closes the device.
pub trait BusHandle: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Opens handles on one kind of bus.
pub trait BusConnector: Send + Sync {
    fn open(&self, device: &Path, address: u16) -> Result<Box<dyn BusHandle>, TransportError>;
}

/// Runs one blocking bus transaction on tokio's blocking pool.
///
/// A transaction that panics or is cancelled is a concurrency fault.
pub async fn transact<T, F>(transaction: F) -> Result<T, ModuleError>
where
    F: FnOnce() -> Result<T, ModuleError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(transaction)
        .await
        .map_err(|e| ModuleError::Concurrency(format!("bus transaction did not complete: {e}")))?
}

/// Writes the whole frame or reports a short transfer.
pub fn write_all(
    handle: &mut dyn BusHandle,
    device: &Path,
    bytes: &[u8],
) -> Result<(), TransportError> {
    let n = handle.write(bytes)?;
    if n != bytes.len() {
        return Err(TransportError::short(device.display().to_string(), "write()", bytes.len(), n));
    }
    Ok(())
}

/// Fills `buf` in one read or reports a short transfer.
pub fn read_exact(
    handle: &mut dyn BusHandle,
    device: &Path,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    let n = handle.read(buf)?;
    if n != buf.len() {
        return Err(TransportError::short(device.display().to_string(), "read()", buf.len(), n));
    }
    Ok(())
}

/// Linux I2C character devices (`/dev/i2c-N`).
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxI2c;

struct I2cHandle {
    device: PathBuf,
    dev: LinuxI2CDevice,
}

impl BusConnector for LinuxI2c {
    fn open(&self, device: &Path, address: u16) -> Result<Box<dyn BusHandle>, TransportError> {
        let dev = LinuxI2CDevice::new(device, address).map_err(|e| {
            TransportError::new(device.display().to_string(), "open()/ioctl(I2C_SLAVE)", e)
        })?;
        Ok(Box::new(I2cHandle {
            device: device.to_path_buf(),
            dev,
        }))
    }
}

impl BusHandle for I2cHandle {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.dev
            .write(bytes)
            .map(|()| bytes.len())
            .map_err(|e| TransportError::new(self.device.display().to_string(), "write()", e))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.dev
            .read(buf)
            .map(|()| buf.len())
            .map_err(|e| TransportError::new(self.device.display().to_string(), "read()", e))
    }
}

/// Serial lines (`/dev/ttyUSB0`, ...). The bus address is ignored; framing
/// protocols carry their own.
#[derive(Debug, Clone, Copy)]
pub struct SerialLine {
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl Default for SerialLine {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            timeout: Duration::from_millis(1000),
        }
    }
}

struct SerialHandle {
    device: PathBuf,
    port: Box<dyn SerialPort>,
}

impl BusConnector for SerialLine {
    fn open(&self, device: &Path, _address: u16) -> Result<Box<dyn BusHandle>, TransportError> {
        let path = device.display().to_string();
        let port = serialport::new(path.as_str(), self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| TransportError::new(path.clone(), "open()", e))?;
        Ok(Box::new(SerialHandle {
            device: device.to_path_buf(),
            port,
        }))
    }
}

impl BusHandle for SerialHandle {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.port
            .write_all(bytes)
            .and_then(|()| self.port.flush())
            .map(|()| bytes.len())
            .map_err(|e| TransportError::new(self.device.display().to_string(), "write()", e))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.port
            .read_exact(buf)
            .map(|()| buf.len())
            .map_err(|e| TransportError::new(self.device.display().to_string(), "read()", e))
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::FakeBus, *};
    use pretty_assertions::assert_eq;

    #[test]
    fn short_read_is_reported_with_device() {
        let bus = FakeBus::new();
        bus.reply(&[1, 2, 3]);
        let dev = Path::new("/dev/i2c-1");
        let mut handle = bus.open(dev, 0x44).unwrap();

        let mut buf = [0u8; 6];
        let err = read_exact(handle.as_mut(), dev, &mut buf).unwrap_err();
        assert_eq!(err.device, "/dev/i2c-1");
        assert_eq!(err.op, "read()");
    }

    #[test]
    fn write_all_records_frame() {
        let bus = FakeBus::new();
        let dev = Path::new("/dev/i2c-1");
        let mut handle = bus.open(dev, 0x44).unwrap();
        write_all(handle.as_mut(), dev, &[0x2C, 0x06]).unwrap();
        assert_eq!(bus.writes(), vec![vec![0x2C, 0x06]]);
    }

    #[tokio::test]
    async fn transaction_panic_is_concurrency_fault() {
        let result: Result<(), _> = transact(|| panic!("driver bug")).await;
        assert!(matches!(result, Err(ModuleError::Concurrency(_))));
    }

    #[tokio::test]
    async fn transaction_error_is_passed_through() {
        let result: Result<(), _> = transact(|| Err(ModuleError::validation("bad frame"))).await;
        assert!(matches!(result, Err(ModuleError::Validation(_))));
    }

    #[test]
    fn serial_defaults() {
        let line = SerialLine::default();
        assert_eq!(line.baud_rate, 9600);
        assert_eq!(line.timeout, Duration::from_secs(1));
    }

    #[test]
    fn missing_i2c_device_is_transport_error() {
        let err = LinuxI2c
            .open(Path::new("/nonexistent/i2c-99"), 0x44)
            .err()
            .unwrap();
        assert_eq!(err.op, "open()/ioctl(I2C_SLAVE)");
    }
}
