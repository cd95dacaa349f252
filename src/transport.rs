use crate::config::DeviceConfig;
use crate::error::{Result, StreamError};
use crate::frame::{ReadDeviceInfo, Transaction};
use bytes::Bytes;
use nusb::{DeviceInfo, Interface, transfer::RequestBuffer};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// Constants for USB device identification
pub const VID: u16 = 0x0CD5;
pub const PID: u16 = 0x0003;
pub const INTERFACE: u8 = 0;
pub const ENDPOINT_OUT: u8 = 0x01;
pub const ENDPOINT_IN: u8 = 0x82;
pub const ENDPOINT_STREAM: u8 = 0x83;

/// Blocking byte transport to one device.
///
/// `read` and `stream_read` may return fewer bytes than asked for; callers
/// decide whether that is an error.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Reads a command response.
    fn read(&mut self, max_len: usize) -> Result<Bytes>;

    /// Reads from the stream endpoint.
    fn stream_read(&mut self, expected_len: usize) -> Result<Bytes>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write(data)
    }

    fn read(&mut self, max_len: usize) -> Result<Bytes> {
        (**self).read(max_len)
    }

    fn stream_read(&mut self, expected_len: usize) -> Result<Bytes> {
        (**self).stream_read(expected_len)
    }
}

/// Sends one command frame and parses the response.
pub fn transact<T, X>(transport: &mut T, transaction: &X) -> Result<X::Response>
where
    T: Transport + ?Sized,
    X: Transaction,
{
    let request = transaction.request();
    debug!(command = %X::COMMAND, bytes = hex::encode(&request), "USB Write");
    let written = transport.write(&request)?;
    if written < request.len() {
        return Err(StreamError::ShortWrite {
            command: X::COMMAND,
            expected: request.len(),
            actual: written,
        });
    }

    let response = transport.read(X::RESPONSE_LEN)?;
    debug!(command = %X::COMMAND, bytes = hex::encode(&response), "USB Read");
    if response.len() < X::RESPONSE_LEN {
        return Err(StreamError::ShortRead {
            command: X::COMMAND,
            expected: X::RESPONSE_LEN,
            actual: response.len(),
        });
    }
    transaction.parse(&response)
}

/// Lists every attached LabJack U3.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    Ok(nusb::list_devices()?
        .filter(|d| d.vendor_id() == VID && d.product_id() == PID)
        .collect())
}

/// Serial number from the USB string descriptor, when the device reports one.
fn descriptor_serial(device_info: &DeviceInfo) -> Option<u32> {
    device_info.serial_number().and_then(|s| s.trim().parse::<u32>().ok())
}

/// Opens candidates in order and returns the first whose ConfigU3 response
/// carries `serial`.
///
/// Candidates that fail to open or to answer are skipped. Rejected transports
/// are dropped, which releases them.
pub fn select_by_serial<C, T, F>(candidates: impl IntoIterator<Item = C>, serial: u32, mut open: F) -> Result<T>
where
    T: Transport,
    F: FnMut(C) -> Result<T>,
{
    for candidate in candidates {
        let mut transport = match open(candidate) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Skipping U3 that could not be opened: {}", e);
                continue;
            }
        };
        match transact(&mut transport, &ReadDeviceInfo) {
            Ok(device) if device.serial_number == serial => {
                info!(serial, "Matched U3 by ConfigU3 serial");
                return Ok(transport);
            }
            Ok(device) => debug!(found = device.serial_number, wanted = serial, "Serial does not match"),
            Err(e) => warn!("Skipping U3 that did not answer ConfigU3: {}", e),
        }
    }
    Err(StreamError::DeviceNotFound)
}

/// [`Transport`] over nusb bulk transfers.
///
/// Transfers are driven on a private current-thread runtime so each one can be
/// bounded by a timeout. The device is released when this is dropped.
pub struct NusbTransport {
    interface: Interface,
    runtime: Runtime,
    timeout: Duration,
}

impl NusbTransport {
    /// Opens the U3 with the configured serial number, or the first one found.
    ///
    /// A U3 whose string descriptor already carries the serial is taken as is.
    /// Otherwise every U3 is asked for its serial with ConfigU3.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        info!("Searching for LabJack U3...");
        let devices = list_devices()?;
        let timeout = config.timeout();

        let Some(serial) = config.serial else {
            let device_info = devices.first().ok_or(StreamError::DeviceNotFound)?;
            return Self::open_device(device_info, timeout);
        };

        let (described, others): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|d| descriptor_serial(d) == Some(serial));
        if let Some(device_info) = described.first() {
            return Self::open_device(device_info, timeout);
        }
        select_by_serial(others, serial, |device_info| Self::open_device(&device_info, timeout))
    }

    fn open_device(device_info: &DeviceInfo, timeout: Duration) -> Result<Self> {
        info!(
            "Found device on bus {} addr {}",
            device_info.bus_number(),
            device_info.device_address()
        );

        let device = device_info.open()?;
        let interface = device.detach_and_claim_interface(INTERFACE)?;
        info!("Interface claimed successfully.");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(StreamError::Runtime)?;

        Ok(Self {
            interface,
            runtime,
            timeout,
        })
    }

    fn bulk_in(&mut self, endpoint: u8, len: usize) -> Result<Bytes> {
        let transfer = self.interface.bulk_in(endpoint, RequestBuffer::new(len));
        let completion = self.runtime.block_on(timeout(self.timeout, transfer))?;
        let data = completion.into_result()?;
        Ok(Bytes::from(data))
    }
}

impl Transport for NusbTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let transfer = self.interface.bulk_out(ENDPOINT_OUT, data.to_vec());
        let completion = self.runtime.block_on(timeout(self.timeout, transfer))?;
        let sent = completion.into_result()?;
        Ok(sent.actual_length())
    }

    fn read(&mut self, max_len: usize) -> Result<Bytes> {
        self.bulk_in(ENDPOINT_IN, max_len)
    }

    fn stream_read(&mut self, expected_len: usize) -> Result<Bytes> {
        self.bulk_in(ENDPOINT_STREAM, expected_len)
    }
}
