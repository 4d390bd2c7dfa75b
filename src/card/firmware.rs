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

    src/card/firmware.rs

    Firmware bootstrap for uninitialized Garmin card programmers. A firmware
    image is a stream of <addr u16 LE><len u16 LE><len bytes> records, each
    uploaded with a vendor control write. The device re-enumerates under the
    operational product id once an upload completes, which can surface as
    the handle disappearing mid-stream; that is success, not failure.
*/

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use super::{DeviceError, UsbPort};

const REQ_FIRMWARE_LOAD: u8 = 0xA0;
const REQ_FIRMWARE_VERSION: u8 = 0x8A;

const IO_RETRIES: u32 = 3;
const IO_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Version string of the factory stage-1 firmware. Seeing anything else
/// means the stage-2 image is already installed.
const STAGE1_VERSION: &[u8] = b"Aviation Card Programmer Ver 3.02 Aug 10 2015 13:21:51\x00";

pub const FIRMWARE_0300_PART1: &str = "grmn0300-part1.dat";
pub const FIRMWARE_0300_PART2: &str = "grmn0300-part2.dat";
pub const FIRMWARE_STAGE1: &str = "grmn0500.dat";
pub const FIRMWARE_STAGE2: &str = "grmn1300.dat";

pub struct FirmwareWriter<P> {
    port: P,
}

impl<P: UsbPort> FirmwareWriter<P> {
    pub fn new(port: P) -> Self {
        FirmwareWriter { port }
    }

    /// Upload both images for the oldest (0x0300) reader revision.
    pub fn write_firmware_0x300(&mut self, firmware_dir: &Path) -> Result<(), DeviceError> {
        log::info!("writing 0x300 firmware, part 1 of 2");
        self.write_firmware_file(&firmware_dir.join(FIRMWARE_0300_PART1))?;
        std::thread::sleep(Duration::from_secs(2));
        log::info!("writing 0x300 firmware, part 2 of 2");
        self.write_firmware_file(&firmware_dir.join(FIRMWARE_0300_PART2))?;
        std::thread::sleep(Duration::from_secs(2));
        Ok(())
    }

    pub fn write_firmware_stage1(&mut self, firmware_dir: &Path) -> Result<(), DeviceError> {
        log::info!("writing stage 1 firmware");
        self.write_firmware_file(&firmware_dir.join(FIRMWARE_STAGE1))
    }

    /// Probe whether the stage-2 image is still needed. `AlreadyUpdated`
    /// means there is nothing to do; the caller continues with the
    /// operational device.
    pub fn init_stage2(&mut self) -> Result<(), DeviceError> {
        let version = self
            .port
            .control_read(0xC0, REQ_FIRMWARE_VERSION, 0, 0, 512)?;
        log::debug!("device firmware: {:?}", String::from_utf8_lossy(&version));
        if version != STAGE1_VERSION {
            return Err(DeviceError::AlreadyUpdated);
        }
        Ok(())
    }

    pub fn write_firmware_stage2(&mut self, firmware_dir: &Path) -> Result<(), DeviceError> {
        log::info!("writing stage 2 firmware");
        self.write_firmware_file(&firmware_dir.join(FIRMWARE_STAGE2))
    }

    fn write_firmware_file(&mut self, path: &Path) -> Result<(), DeviceError> {
        let mut file = File::open(path)?;
        self.write_firmware(&mut file)
    }

    /// Stream firmware records to the device. I/O errors are retried a few
    /// times; the device disappearing means it is re-enumerating and the
    /// upload is done.
    pub fn write_firmware(&mut self, image: &mut dyn Read) -> Result<(), DeviceError> {
        loop {
            let mut header = [0u8; 4];
            match read_full(image, &mut header)? {
                0 => break,
                4 => {}
                _ => return Err(DeviceError::MalformedFirmware),
            }

            let addr = u16::from_le_bytes([header[0], header[1]]);
            let len = u16::from_le_bytes([header[2], header[3]]) as usize;
            let mut data = vec![0u8; len];
            if read_full(image, &mut data)? != len {
                return Err(DeviceError::MalformedFirmware);
            }

            let mut attempts = 0;
            loop {
                match self.port.control_write(0x40, REQ_FIRMWARE_LOAD, addr, 0, &data) {
                    Ok(()) => break,
                    Err(DeviceError::UsbNoDevice) => return Ok(()),
                    Err(DeviceError::UsbIo) => {
                        attempts += 1;
                        if attempts >= IO_RETRIES {
                            return Err(DeviceError::UsbIo);
                        }
                        std::thread::sleep(IO_RETRY_DELAY);
                    }
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(())
    }
}

fn read_full(r: &mut dyn Read, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
