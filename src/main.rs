/*
    Copyright (C) 2020  John Goerzen <jgoerzen@complete.org

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <http://www.gnu.org/licenses/>.

*/

use log::*;
use simplelog::*;
use std::io;
use std::io::{Read, Write};
use structopt::StructOpt;

use xbboot::error::XbbResult;
use xbboot::session::XBBootSession;
use xbboot::transport::MAX_CHUNK;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "xbboot",
    about = "Over-The-Air AVR programming via XBee Series 2 radios",
    author = "John Goerzen <jgoerzen@complete.org>"
)]
struct Opt {
    /// Activate debug mode
    #[structopt(short, long)]
    debug: bool,

    /// Serial baud rate (default: 19200 direct, 9600 over the air)
    #[structopt(long)]
    baud: Option<u32>,

    /// XBee IO port wired to the target's reset line (1-6; 7 is
    /// reserved for CTS flow control)
    #[structopt(long = "xbeeresetpin", default_value = "3")]
    xbeeresetpin: u8,

    /// Target port: [<64-bit-hex-address>]@<serial-device>.  An empty
    /// address selects a direct (no local XBee) connection.
    port: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Open a session, sync with the bootloader, and close.  A quick
    /// end-to-end connectivity check.
    Sync,
    /// Carry a programmer byte stream between stdin/stdout and the
    /// target bootloader.
    Pipe,
}

fn main() {
    let opt = Opt::from_args();

    if opt.debug {
        WriteLogger::init(LevelFilter::Trace, Config::default(), io::stderr())
            .expect("Failed to init log");
    }
    info!("xbboot starting");

    let mut session = match XBBootSession::open(&opt.port, opt.baud, opt.xbeeresetpin) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("xbboot: {}", e);
            std::process::exit(1);
        }
    };

    let result = match opt.cmd {
        // Opening already performed the sync.
        Command::Sync => {
            println!("bootloader in sync");
            Ok(())
        }
        Command::Pipe => pipe(&mut session),
    };

    session.close();

    if let Err(e) = result {
        eprintln!("xbboot: {}", e);
        std::process::exit(1);
    }
}

/// Pump programmer bytes from stdin to the target and replies back to
/// stdout.  The dialogue is command/response, so forwarding a block and
/// then collecting whatever the target answered keeps pace with it.
fn pipe(session: &mut XBBootSession) -> XbbResult<()> {
    let stdin = io::stdin();
    let mut reader = io::BufReader::new(stdin.lock());
    let mut stdout = io::stdout();
    let mut buf = vec![0u8; MAX_CHUNK];
    let mut replies = Vec::new();

    loop {
        let count = reader.read(&mut buf)?;
        if count == 0 {
            // EOF: programmer is done.
            return Ok(());
        }
        session.send(&buf[0..count])?;

        replies.clear();
        session.recv_available(&mut replies)?;
        if !replies.is_empty() {
            stdout.write_all(&replies)?;
            stdout.flush()?;
        }
    }
}
