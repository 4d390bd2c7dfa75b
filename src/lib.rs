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

//! # navcard
//!
//! navcard is a Rust library for moving Jeppesen navigation databases onto the
//! physical media used by small-aircraft avionics: USB-attached data card
//! programmers for the Garmin GNS series, and mounted removable filesystems
//! for Avidyne IFD and Garmin G1000 units.
//!
//! The library covers the whole media pipeline: the vendor checksum engines,
//! the xBase codec used by electronic charts, the Skybound and Garmin card
//! programmer drivers with their firmware bootstrap, the Avidyne
//! self-extracting archive codec, the G1000 feature-unlock records, the
//! ChartView merger, and the TAWS card block layout.
//!
//! The main entry point for moving a subscription onto media is
//! [`transfer::transfer_service`], driven by a [`catalog::ServiceHandle`]
//! describing the subscription and a [`transfer::TransferTarget`] naming the
//! destination. Card programmers are discovered and opened with
//! [`card::detect::open_programming_device`].

pub mod avidyne;
pub mod card;
pub mod catalog;
pub mod chartview;
pub mod checksum;
pub mod config;
pub mod dbf;
pub mod featunlk;
pub mod jdm;
pub mod ngt;
pub mod taws;
pub mod transfer;

use thiserror::Error;

/// Progress callback invoked with the number of bytes just processed.
/// All long-running operations report through this; there is no worker pool,
/// so the callback always runs on the calling thread.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64);

#[derive(Debug, Error)]
pub enum NavCardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Device(#[from] card::DeviceError),
    #[error(transparent)]
    Sfx(#[from] avidyne::SfxError),
    #[error(transparent)]
    Dbf(#[from] dbf::DbfError),
    #[error(transparent)]
    Chart(#[from] chartview::ChartError),
    #[error(transparent)]
    Taws(#[from] taws::TawsError),
    #[error(transparent)]
    FeatUnlk(#[from] featunlk::FeatUnlkError),
    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("verification failed: sector {sector}, block {block} does not match")]
    VerifyFailed { sector: u32, block: u32 },
    #[error("data card size {card} is outside the service range {min}..={max}")]
    CardSizeMismatch { card: u64, min: u64, max: u64 },
    #[error("{0}")]
    Unsupported(String),
}

pub use crate::card::{detect::open_programming_device, CardType, Programmer};
pub use crate::catalog::{Catalog, ServiceHandle};
pub use crate::transfer::{transfer_service, TransferOptions, TransferTarget};
