//! Serial console driver for kernel logging.
//!
//! Uses the `uart_16550` crate to drive COM1 at the standard I/O port
//! 0x3F8. All kernel log output (the `log` facade, `println!`/`print!`)
//! goes through here; there is no framebuffer fallback in the core (text
//! console rendering is handled by whatever boots this kernel, not by it).

use core::fmt::Write;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

use crate::arch::x86::without_interrupts;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 I/O base; no other driver
        // touches this port range.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("printing to serial failed");
    });
}
