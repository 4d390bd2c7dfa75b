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

use anyhow::{Error, Result};
use navcard::card::DeviceError;
use navcard::open_programming_device;

use crate::args::GlobalOptions;

pub(crate) fn run(_global: &GlobalOptions) -> Result<(), Error> {
    let mut programmer = open_programming_device()?;

    println!("Firmware: {}", programmer.firmware_description()?);

    match programmer.init_data_card() {
        Ok(()) => {
            let card = programmer.card()?;
            println!("Card inserted: {}", card.name());
            println!("  {}", card.description());
            println!("  Total size: {} bytes", card.total_size());
            let iids = programmer.chip_iids()?;
            let iids: Vec<String> = iids.iter().map(|iid| format!("{:08x}", iid)).collect();
            println!("  Chip IIDs: {}", iids.join(", "));
        }
        Err(DeviceError::NoCard) => println!("No card"),
        Err(err) => return Err(err.into()),
    }

    programmer.close()?;
    Ok(())
}
