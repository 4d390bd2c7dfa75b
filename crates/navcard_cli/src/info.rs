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
*/

use anyhow::{bail, Error, Result};
use navcard::catalog::Catalog;
use navcard::config;

use crate::args::{GlobalOptions, InfoParams};

const DETAIL_FIELDS: &[(&str, &str)] = &[
    ("Aircraft Manufacturer", "oracle_aircraft_manufacturer"),
    ("Aircraft Model", "oracle_aircraft_model"),
    ("Aircraft Tail Number", "oracle_aircraft_tail_number"),
    ("", ""),
    ("Avionics", "avionics"),
    ("Coverage", "coverage_desc"),
    ("Service Type", "service_type"),
    ("Service Code", "service_code"),
    ("Service ID", "unique_service_id"),
    ("Service Renewal Date", "service_renewal_date"),
    ("", ""),
    ("Version", "display_version"),
    ("Version Start Date", "version_start_date"),
    ("Version End Date", "version_end_date"),
    ("", ""),
    ("Next Version", "next_display_version"),
    ("Next Version Available Date", "next_version_avail_date"),
    ("Next Version Start Date", "next_version_start_date"),
    ("", ""),
    ("File Name", "filename"),
    ("File Size", "file_size"),
    ("File CRC32", "file_crc"),
    ("SFF File Names", "oem_garmin_sff_filenames"),
    ("Serial Number", "serial_number"),
    ("System ID", "avionics_id"),
];

pub(crate) fn run(_global: &GlobalOptions, params: &InfoParams) -> Result<(), Error> {
    let catalog = Catalog::load(&config::services_path())?;
    let Some(service) = catalog.services.get(params.id) else {
        bail!("invalid subscription id: {}", params.id);
    };

    for (label, field) in DETAIL_FIELDS {
        if label.is_empty() {
            println!();
        } else {
            let value = service.optional_property(field).unwrap_or_default();
            println!("{:<30}{}", format!("{}:", label), value);
        }
    }

    let downloads = config::downloads_dir();
    println!();
    println!("Downloads:");
    for name in service.database_filenames()? {
        let path = downloads.join(&name);
        let status = if path.exists() { "" } else { "  (missing)" };
        println!("  {}{}", path.display(), status);
    }

    Ok(())
}
