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
use navcard::catalog::Catalog;
use navcard::config;

use crate::args::GlobalOptions;

fn style(text: &str, code: &str) -> String {
    if code.is_empty() {
        text.to_string()
    } else {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    }
}

pub(crate) fn run(_global: &GlobalOptions) -> Result<(), Error> {
    let catalog = Catalog::load(&config::services_path())?;
    let styles = config::Config::load().list;
    let downloads = config::downloads_dir();

    let header = format!(
        "{:>3}  {:<40}  {:<24}  {:<8}  {:<10}  {:<10}  {:<10}",
        "ID", "Name", "Coverage", "Version", "Start Date", "End Date", "Downloaded"
    );
    println!("{}", style(&header, &styles.header_style));

    for (idx, service) in catalog.services.iter().enumerate() {
        let avionics = service.optional_property("avionics").unwrap_or_default();
        let service_type = service.optional_property("service_type").unwrap_or_default();
        let name = format!("{} - {}", avionics, service_type);

        let mut coverage = service.optional_property("coverage_desc").unwrap_or_default();
        if coverage.chars().count() > 24 {
            coverage = coverage.chars().take(23).collect();
            coverage.push('…');
        }

        let version = service.optional_property("display_version").unwrap_or_default();
        let start = service
            .optional_property("version_start_date")
            .unwrap_or_default()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        let end = service
            .optional_property("version_end_date")
            .unwrap_or_default()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();

        let downloaded = service
            .database_filenames()
            .map(|names| names.iter().all(|name| downloads.join(name).exists()))
            .unwrap_or(false);

        let row = format!(
            "{:>3}  {:<40}  {:<24}  {:<8}  {:<10}  {:<10}  {:<10}",
            idx,
            name,
            coverage,
            version,
            start,
            end,
            if downloaded { "Y" } else { "" }
        );
        let code = if idx % 2 == 1 {
            &styles.odd_row_style
        } else {
            &styles.even_row_style
        };
        println!("{}", style(&row, code));
    }

    Ok(())
}
