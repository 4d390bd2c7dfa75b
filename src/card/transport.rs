/*
    navcard
    https://github.com/navcard/navcard

    Copyright 2025 navcard contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/card/transport.rs

    Bulk and control transfer plumbing shared by both programmer drivers.
    The UsbPort trait is the seam the drivers are written against, so the
    protocol state machines can be exercised without hardware.
*/

use std::time::Duration;

use rusb::{Context, DeviceHandle};

use super::DeviceError;

/// Default transfer timeout.
pub const TIMEOUT: Duration = Duration::from_secs(5);

const OPEN_RETRIES: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Synchronous bulk and control transfers against one device handle.
/// Single-threaded use only; a port is never shared between threads.
pub trait UsbPort {
    fn bulk_read(&mut self, length: usize) -> Result<Vec<u8>, DeviceError>;
    fn bulk_write(&mut self, data: &[u8]) -> Result<(), DeviceError>;
    fn control_read(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<Vec<u8>, DeviceError>;
    fn control_write(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), DeviceError>;
}

pub(crate) fn map_usb_error(err: rusb::Error) -> DeviceError {
    match err {
        rusb::Error::NoDevice => DeviceError::UsbNoDevice,
        rusb::Error::Io => DeviceError::UsbIo,
        other => DeviceError::Usb(other.to_string()),
    }
}

/// A claimed handle with its endpoint pair. The handle is released when the
/// transport is dropped.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    read_endpoint: u8,
    write_endpoint: u8,
    timeout: Duration,
}

impl UsbTransport {
    /// Open the device, enable kernel driver auto-detach when the platform
    /// supports it, claim interface 0, and reset. Transient errors are
    /// retried before giving up with `OpenFailed`.
    pub fn open(
        device: &rusb::Device<Context>,
        read_endpoint: u8,
        write_endpoint: u8,
    ) -> Result<Self, DeviceError> {
        let mut retry = 0;
        let handle = loop {
            match Self::try_open(device) {
                Ok(handle) => break handle,
                Err(err) => {
                    retry += 1;
                    if retry == OPEN_RETRIES {
                        return Err(DeviceError::OpenFailed(err.to_string()));
                    }
                    log::debug!("retrying device open: {}", err);
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
            }
        };

        Ok(UsbTransport {
            handle,
            read_endpoint,
            write_endpoint,
            timeout: TIMEOUT,
        })
    }

    fn try_open(device: &rusb::Device<Context>) -> Result<DeviceHandle<Context>, rusb::Error> {
        let mut handle = device.open()?;
        // Not supported on all platforms; harmless to proceed without it.
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(0)?;
        handle.reset()?;
        Ok(handle)
    }
}

impl UsbPort for UsbTransport {
    fn bulk_read(&mut self, length: usize) -> Result<Vec<u8>, DeviceError> {
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .read_bulk(self.read_endpoint, &mut buf, self.timeout)
            .map_err(map_usb_error)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn bulk_write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.handle
            .write_bulk(self.write_endpoint, data, self.timeout)
            .map_err(map_usb_error)?;
        Ok(())
    }

    fn control_read(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<Vec<u8>, DeviceError> {
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .read_control(request_type, request, value, index, &mut buf, self.timeout)
            .map_err(map_usb_error)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_write(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.handle
            .write_control(request_type, request, value, index, data, self.timeout)
            .map_err(map_usb_error)?;
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(0);
    }
}
