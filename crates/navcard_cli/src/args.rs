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

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use bpaf::*;

#[derive(Clone, Debug)]
pub(crate) enum Command {
    Version,
    List,
    Info(InfoParams),
    Transfer(TransferParams),
    Detect,
    ReadCard(ReadCardParams),
    WriteCard(WriteCardParams),
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Version => write!(f, "version"),
            Command::List => write!(f, "list"),
            Command::Info(_) => write!(f, "info"),
            Command::Transfer(_) => write!(f, "transfer"),
            Command::Detect => write!(f, "detect"),
            Command::ReadCard(_) => write!(f, "read-card"),
            Command::WriteCard(_) => write!(f, "write-card"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct AppParams {
    pub global: GlobalOptions,
    pub command: Command,
}

#[derive(Debug)]
pub struct GlobalOptions {
    pub silent: bool,
    pub yes: bool,
}

pub fn global_options_parser() -> impl Parser<GlobalOptions> {
    let silent = long("silent")
        .help("Suppress all output except required output")
        .switch();

    let yes = long("yes")
        .short('y')
        .help("Skip confirmation prompts")
        .switch();

    construct!(GlobalOptions { silent, yes })
}

#[derive(Clone, Debug)]
pub(crate) struct InfoParams {
    pub id: usize,
}

fn info_parser() -> impl Parser<InfoParams> {
    let id = positional::<usize>("ID").help("Subscription id from 'list'");
    construct!(InfoParams { id })
}

#[derive(Clone, Debug)]
pub(crate) struct TransferParams {
    pub vol_id: Option<String>,
    pub full_erase: bool,
    pub id: usize,
    pub device: Option<PathBuf>,
}

fn transfer_parser() -> impl Parser<TransferParams> {
    let vol_id = long("vol-id")
        .help("Volume id of the destination media, e.g. 1234-ABCD")
        .argument::<String>("VOL_ID")
        .optional();

    let full_erase = long("full-erase")
        .help("Erase the whole data card before writing")
        .switch();

    let id = positional::<usize>("ID").help("Subscription id from 'list'");

    let device = positional::<PathBuf>("DEVICE")
        .help("Mount point of the destination card (omit for programmer devices)")
        .optional();

    construct!(TransferParams {
        vol_id,
        full_erase,
        id,
        device
    })
}

#[derive(Clone, Debug)]
pub(crate) struct ReadCardParams {
    pub out_file: PathBuf,
}

fn read_card_parser() -> impl Parser<ReadCardParams> {
    let out_file = positional::<PathBuf>("OUTPUT_FILE").help("File to write the card image to");
    construct!(ReadCardParams { out_file })
}

#[derive(Clone, Debug)]
pub(crate) struct WriteCardParams {
    pub full_erase: bool,
    pub in_file: PathBuf,
}

fn write_card_parser() -> impl Parser<WriteCardParams> {
    let full_erase = long("full-erase")
        .help("Erase the whole data card before writing")
        .switch();
    let in_file = positional::<PathBuf>("INPUT_FILE").help("Card image to write");
    construct!(WriteCardParams { full_erase, in_file })
}

pub(crate) fn command_parser() -> impl Parser<AppParams> {
    let global = global_options_parser();

    let version = pure(Command::Version)
        .to_options()
        .command("version")
        .help("Display version information and exit");

    let list = pure(Command::List)
        .to_options()
        .command("list")
        .help("Show the cached list of subscriptions");

    let info = construct!(Command::Info(info_parser()))
        .to_options()
        .command("info")
        .help("Show detailed information about a subscription");

    let transfer = construct!(Command::Transfer(transfer_parser()))
        .to_options()
        .command("transfer")
        .help("Transfer a downloaded subscription onto its media");

    let detect = pure(Command::Detect)
        .to_options()
        .command("detect")
        .help("Detect a card programmer and the inserted card");

    let read_card = construct!(Command::ReadCard(read_card_parser()))
        .to_options()
        .command("read-card")
        .help("Dump the contents of a data card to a file");

    let write_card = construct!(Command::WriteCard(write_card_parser()))
        .to_options()
        .command("write-card")
        .help("Write a card image to a data card and verify it");

    let command = construct!([version, list, info, transfer, detect, read_card, write_card]);

    construct!(AppParams { global, command })
}
