/*! Over-The-Air AVR programming transport for XBee Series 2 radios.

The programmer speaks STK500v1 (optiboot) at one end; a bootloader on
the target CPU speaks it at the other.  In between, this crate carries
that byte stream over a lossy ZigBee mesh: it frames and escapes XBee
API packets, configures the local and remote radios, pulses the target's
reset line over the air, maintains a source route, and runs a sequenced
stop-and-wait channel so the programmer sees a reliable pipe. */

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

pub mod error;
pub mod route;
pub mod ser;
pub mod session;
pub mod stats;
pub mod transport;
pub mod xbpacket;

#[cfg(test)]
pub(crate) mod testutil;
