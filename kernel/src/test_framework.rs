//! In-kernel test framework.
//!
//! Bare-metal tests run as `#[test_case]` functions collected by the custom
//! test runner below (see `lib.rs`'s `test_runner` attribute): each prints
//! its name, runs, and reports `[ok]`/`[failed]` over serial, then the whole
//! suite exits QEMU via the isa-debug-exit device with a pass/fail code so
//! CI can read the process exit status. Host builds (`cfg(not(target_os =
//! "none"))`) use the standard `#[test]` harness instead and never call any
//! of this.

use core::panic::PanicInfo;

use crate::{error::KernelError, serial_print, serial_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Anything a `#[test_case]` can point at: a zero-argument function
/// returning `Result<(), KernelError>`.
pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("running {} tests", tests.len());
    let mut passed = 0;
    let mut failed = 0;

    for test in tests {
        match test.run() {
            Ok(()) => passed += 1,
            Err(_) => failed += 1,
        }
    }

    serial_println!("\ntest result: {passed} passed, {failed} failed");

    if failed == 0 {
        exit_qemu(QemuExitCode::Success);
    } else {
        exit_qemu(QemuExitCode::Failed);
    }
}

/// Panic handler installed while running the bare-metal test suite: reports
/// the panic over serial instead of the normal panic handler's framebuffer
/// dump, then exits QEMU with a failure code.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("error: {info}\n");
    exit_qemu(QemuExitCode::Failed)
}

/// Exits QEMU via the isa-debug-exit device configured in
/// `scripts/run-qemu.sh` (`-device isa-debug-exit,iobase=0xf4`). Writing the
/// exit code there causes QEMU to terminate with status `(code << 1) | 1`.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    // SAFETY: port 0xf4 is only meaningful when QEMU was launched with the
    // isa-debug-exit device present, which is the only way this binary runs
    // under test; the write's only effect is terminating the VM.
    unsafe {
        crate::arch::x86::outl(0xf4, exit_code as u32);
    }
    loop {
        core::hint::spin_loop();
    }
}

/// Defines a `#[test_case]` from a name and a body returning
/// `Result<(), KernelError>`.
#[macro_export]
macro_rules! kernel_test {
    ($name:ident, $test:expr) => {
        #[test_case]
        const $name: &dyn $crate::test_framework::Testable =
            &|| -> Result<(), $crate::error::KernelError> { $test };
    };
}

#[macro_export]
macro_rules! kernel_assert {
    ($cond:expr) => {
        if !$cond {
            panic!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            panic!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! kernel_assert_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            panic!(
                "assertion failed: {} != {}\n  left: {:?}\n right: {:?}",
                stringify!($left),
                stringify!($right),
                $left,
                $right
            );
        }
    };
}
