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
use indicatif::{ProgressBar, ProgressStyle};
use navcard::card::UsbTransport;
use navcard::catalog::Catalog;
use navcard::transfer::{parse_volume_id, transfer_service, TransferOptions, TransferTarget};
use navcard::{config, open_programming_device};

use crate::args::{GlobalOptions, TransferParams};
use crate::confirm;

pub(crate) fn run(global: &GlobalOptions, params: &TransferParams) -> Result<(), Error> {
    let catalog = Catalog::load(&config::services_path())?;
    let Some(service) = catalog.services.get(params.id) else {
        bail!("invalid subscription id: {}", params.id);
    };

    let downloads = config::downloads_dir();
    for name in service.database_filenames()? {
        if !downloads.join(&name).exists() {
            bail!("{} has not been downloaded yet", name);
        }
    }

    let options = TransferOptions {
        vol_id: params
            .vol_id
            .as_deref()
            .map(parse_volume_id)
            .transpose()?,
        full_erase: params.full_erase,
    };

    let sff_dir = sff_dir_for(service);
    let keychain = config::keychain_path();
    let keychain = keychain.exists().then_some(keychain);

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {bytes} transferred ({bytes_per_sec})")
            .expect("progress template"),
    );
    let mut progress = |n: u64| bar.inc(n);

    match &params.device {
        Some(device) => {
            if !device.is_dir() {
                bail!(
                    "{} is not a directory; pass the mount point of the card",
                    device.display()
                );
            }
            confirm(
                &format!("Transfer databases to {}?", device.display()),
                global.yes,
            )?;
            transfer_service::<UsbTransport>(
                service,
                &downloads,
                sff_dir.as_deref(),
                keychain.as_deref(),
                TransferTarget::Directory(device),
                &options,
                &mut progress,
            )?;
        }
        None => {
            let mut programmer = open_programming_device()?;
            programmer.init_data_card()?;
            let card = programmer.card()?;
            confirm(
                &format!("Transfer the database to the {} card?", card.name()),
                global.yes,
            )?;
            transfer_service(
                service,
                &downloads,
                sff_dir.as_deref(),
                keychain.as_deref(),
                TransferTarget::Programmer(&mut programmer),
                &options,
                &mut progress,
            )?;
            programmer.close()?;
        }
    }

    bar.finish_and_clear();
    if !global.silent {
        println!("Done");
    }
    Ok(())
}

fn sff_dir_for(service: &navcard::catalog::ServiceHandle) -> Option<std::path::PathBuf> {
    let sid = service.optional_property("unique_service_id")?;
    let version = service.optional_property("version")?;
    let dir = config::downloads_dir()
        .join("sff")
        .join(format!("{}_{}", sid, version));
    dir.is_dir().then_some(dir)
}
