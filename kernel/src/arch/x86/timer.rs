//! Programmable Interval Timer (8253/8254) driver.
//!
//! Channel 0 is wired to IRQ0 and drives the scheduler's preemption clock.
//! There is no APIC on this target; the PIT is the only timer source.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86::{inb, outb};

const PIT_FREQUENCY_HZ: u32 = 1_193_182;
const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 2 (rate generator), binary.
const PIT_CMD_CHANNEL0_RATE_GENERATOR: u8 = 0x34;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Total timer ticks since [`init`] was called.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the IRQ0 handler on every PIT tick.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::timer_tick();
}

/// Programs PIT channel 0 to fire roughly every `interval_ms` milliseconds.
/// Interrupt delivery itself is handled by the IDT/PIC setup; this only
/// configures the divisor.
pub fn init(interval_ms: u32) {
    let divisor = PIT_FREQUENCY_HZ / (1000 / interval_ms);

    // SAFETY: 0x40/0x43 are the standard PIT ports; this sequence (command
    // byte, then low byte, then high byte of the divisor) is the documented
    // 8253/8254 programming procedure and runs once during boot before
    // interrupts are enabled.
    unsafe {
        outb(PIT_COMMAND, PIT_CMD_CHANNEL0_RATE_GENERATOR);
        outb(PIT_CHANNEL0_DATA, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0_DATA, (divisor >> 8) as u8);
    }

    println!("[timer] PIT programmed for {interval_ms}ms ticks (divisor {divisor})");
}

/// Reads the current channel 0 counter value, latching it first so both
/// byte reads observe the same snapshot.
pub fn read_counter() -> u16 {
    // SAFETY: command byte 0 selects channel 0, latch command (bits 4-5 =
    // 00); the two subsequent reads of the same port return the latched
    // low/high bytes per the 8253/8254 protocol.
    unsafe {
        outb(PIT_COMMAND, 0x00);
        let low = inb(PIT_CHANNEL0_DATA) as u16;
        let high = inb(PIT_CHANNEL0_DATA) as u16;
        (high << 8) | low
    }
}
