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

    src/card/detect.rs

    USB enumeration and the firmware-upgrade dance. Garmin programmers ship
    without operational firmware and re-enumerate under a different product
    id after each upload, so detection may open, flash, and rescan several
    times before it can hand back a usable device.
*/

use std::time::Duration;

use rusb::{Context, Device, UsbContext};

use super::firmware::FirmwareWriter;
use super::garmin::GarminCardDevice;
use super::skybound::{self, SkyboundDevice};
use super::transport::{map_usb_error, UsbTransport};
use super::{DeviceError, Programmer};

const SKYBOUND_VID_PID: (u16, u16) = (0x0E39, 0x1250);
const GARMIN_EARLY_VID_PID: (u16, u16) = (0x091E, 0x0300);
const GARMIN_UNINIT_VID_PID: (u16, u16) = (0x091E, 0x0500);
const CYPRESS_FX2_VID_PID: (u16, u16) = (0x04B4, 0x8613);
const GARMIN_VID_PID: (u16, u16) = (0x091E, 0x1300);

const RESCAN_ATTEMPTS: u32 = 20;
const RESCAN_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKind {
    Skybound,
    /// Oldest reader revision; takes the two-part firmware image.
    GarminEarly,
    /// Blank programmer (or raw Cypress FX2); takes stage 1 then stage 2.
    GarminUninitialized,
    /// Already enumerates operationally, but may still want stage 2.
    GarminOperational,
}

fn classify(vid: u16, pid: u16) -> Option<DeviceKind> {
    match (vid, pid) {
        v if v == SKYBOUND_VID_PID => Some(DeviceKind::Skybound),
        v if v == GARMIN_EARLY_VID_PID => Some(DeviceKind::GarminEarly),
        v if v == GARMIN_UNINIT_VID_PID || v == CYPRESS_FX2_VID_PID => {
            Some(DeviceKind::GarminUninitialized)
        }
        v if v == GARMIN_VID_PID => Some(DeviceKind::GarminOperational),
        _ => None,
    }
}

/// Discover the bulk endpoint pair from configuration 0: the first IN
/// endpoint becomes the read endpoint, the first OUT endpoint the write
/// endpoint.
fn read_endpoints(device: &Device<Context>) -> Result<(u8, u8), DeviceError> {
    let config = device.config_descriptor(0).map_err(map_usb_error)?;

    let mut read_endpoint = None;
    let mut write_endpoint = None;
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                let address = endpoint.address();
                if address & 0xF0 == 0x80 && read_endpoint.is_none() {
                    read_endpoint = Some(address);
                } else if address & 0xF0 == 0x00 && write_endpoint.is_none() {
                    write_endpoint = Some(address);
                }
            }
        }
    }

    match (read_endpoint, write_endpoint) {
        (Some(read), Some(write)) => Ok((read, write)),
        _ => Err(DeviceError::NoSuitableEndpoints),
    }
}

/// Wait for the operational Garmin device to re-enumerate after a firmware
/// upload.
fn rescan_for_operational(context: &Context) -> Result<Device<Context>, DeviceError> {
    for _ in 0..RESCAN_ATTEMPTS {
        std::thread::sleep(RESCAN_DELAY);
        let devices = context.devices().map_err(map_usb_error)?;
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if (descriptor.vendor_id(), descriptor.product_id()) == GARMIN_VID_PID {
                log::info!("found the operational device at bus {:03}", device.bus_number());
                return Ok(device);
            }
        }
    }
    Err(DeviceError::DeviceNotFound)
}

/// Enumerate USB devices, bring a programmer to its operational state, and
/// open it. The returned programmer has its card left untouched; call
/// `init_data_card` before any card operation.
pub fn open_programming_device() -> Result<Programmer<UsbTransport>, DeviceError> {
    let context = Context::new().map_err(map_usb_error)?;
    let firmware_dir = crate::config::firmware_dir();

    let mut found = None;
    let devices = context.devices().map_err(map_usb_error)?;
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if let Some(kind) = classify(descriptor.vendor_id(), descriptor.product_id()) {
            log::info!(
                "found {:?} at bus {:03} device {:03}",
                kind,
                device.bus_number(),
                device.address()
            );
            found = Some((kind, device));
            break;
        }
    }

    let Some((kind, mut device)) = found else {
        return Err(DeviceError::DeviceNotFound);
    };

    if kind == DeviceKind::Skybound {
        let transport =
            UsbTransport::open(&device, skybound::READ_ENDPOINT, skybound::WRITE_ENDPOINT)?;
        let mut dev = SkyboundDevice::new(transport);
        dev.init()?;
        return Ok(Programmer::Skybound(dev));
    }

    match kind {
        DeviceKind::GarminEarly => {
            {
                let (read, write) = read_endpoints(&device)?;
                let transport = UsbTransport::open(&device, read, write)?;
                let mut writer = FirmwareWriter::new(transport);
                writer.write_firmware_0x300(&firmware_dir)?;
            }
            log::info!("re-scanning for the operational device");
            device = rescan_for_operational(&context)?;
        }
        DeviceKind::GarminUninitialized => {
            {
                let (read, write) = read_endpoints(&device)?;
                let transport = UsbTransport::open(&device, read, write)?;
                let mut writer = FirmwareWriter::new(transport);
                writer.write_firmware_stage1(&firmware_dir)?;
            }
            log::info!("re-scanning for the operational device");
            device = rescan_for_operational(&context)?;
        }
        DeviceKind::GarminOperational | DeviceKind::Skybound => {}
    }

    // The operational device may still be running the factory stage-1
    // image; probe it and finish the upgrade if so.
    let stage2_written = {
        let (read, write) = read_endpoints(&device)?;
        let transport = UsbTransport::open(&device, read, write)?;
        let mut writer = FirmwareWriter::new(transport);
        match writer.init_stage2() {
            Ok(()) => {
                writer.write_firmware_stage2(&firmware_dir)?;
                true
            }
            Err(DeviceError::AlreadyUpdated) => false,
            Err(other) => return Err(other),
        }
    };
    if stage2_written {
        log::info!("re-scanning for the operational device");
        device = rescan_for_operational(&context)?;
    }

    let (read, write) = read_endpoints(&device)?;
    let transport = UsbTransport::open(&device, read, write)?;
    let mut dev = GarminCardDevice::new(transport);
    dev.init()?;
    Ok(Programmer::Garmin(dev))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(0x0E39, 0x1250), Some(DeviceKind::Skybound));
        assert_eq!(classify(0x091E, 0x0300), Some(DeviceKind::GarminEarly));
        assert_eq!(classify(0x091E, 0x0500), Some(DeviceKind::GarminUninitialized));
        assert_eq!(classify(0x04B4, 0x8613), Some(DeviceKind::GarminUninitialized));
        assert_eq!(classify(0x091E, 0x1300), Some(DeviceKind::GarminOperational));
        assert_eq!(classify(0x1234, 0x5678), None);
    }
}
