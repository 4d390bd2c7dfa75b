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

    Raw data card access: dump a card to a file, or write an image back with
    the full erase/write/verify cycle.
*/

use anyhow::{Error, Result};
use indicatif::{ProgressBar, ProgressStyle};
use navcard::open_programming_device;
use navcard::transfer::{read_card_image, write_card_image};

use crate::args::{GlobalOptions, ReadCardParams, WriteCardParams};
use crate::confirm;

fn byte_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} ({bytes_per_sec})")
            .expect("progress template"),
    );
    bar
}

pub(crate) fn run_read(global: &GlobalOptions, params: &ReadCardParams) -> Result<(), Error> {
    let mut programmer = open_programming_device()?;
    programmer.init_data_card()?;
    let card = programmer.card()?;
    if !global.silent {
        println!("Reading the {} card", card.name());
    }

    let bar = byte_bar(programmer.total_size()?);
    let mut progress = |n: u64| bar.inc(n);
    read_card_image(&mut programmer, &params.out_file, &mut progress)?;
    bar.finish();

    programmer.close()?;
    if !global.silent {
        println!("Done");
    }
    Ok(())
}

pub(crate) fn run_write(global: &GlobalOptions, params: &WriteCardParams) -> Result<(), Error> {
    let mut programmer = open_programming_device()?;
    programmer.init_data_card()?;
    programmer.check_supports_write()?;
    let card = programmer.card()?;

    confirm(
        &format!(
            "Transfer {} to the {} card?",
            params.in_file.display(),
            card.name()
        ),
        global.yes,
    )?;

    let size = std::fs::metadata(&params.in_file)?.len();
    // The image is read twice over the card: once written, once verified.
    let bar = byte_bar(size * 2);
    let mut progress = |n: u64| bar.inc(n);
    write_card_image(&mut programmer, &params.in_file, params.full_erase, &mut progress)?;
    bar.finish();

    programmer.close()?;
    if !global.silent {
        println!("Done");
    }
    Ok(())
}
