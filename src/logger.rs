//! Console logger on the char-out debug device.
//!
//! Every record is written as one `[LEVEL target] message` line with
//! interrupts masked, so lines from tasks and trap handlers never interleave.

use core::fmt::{self, Write};

use tock_registers::interfaces::Writeable;

use crate::arch::Machine;
use crate::config::LOG_LEVEL;
use crate::kernel;
use crate::platform::{CharOutRegisters, Peripheral, CHAROUT};

/// Byte-at-a-time output device.
pub trait ByteSink {
    fn put(&self, byte: u8);
}

impl ByteSink for CharOutRegisters {
    #[inline]
    fn put(&self, byte: u8) {
        self.char.set(byte);
    }
}

impl<T: ByteSink> ByteSink for Peripheral<T> {
    #[inline]
    fn put(&self, byte: u8) {
        (**self).put(byte)
    }
}

struct SinkWriter<'a, S>(&'a S);

impl<S: ByteSink> Write for SinkWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            self.0.put(b);
        }
        Ok(())
    }
}

pub struct Logger<S> {
    sink: S,
}

impl<S> Logger<S> {
    pub const fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S: ByteSink + Sync + Send> log::Log for Logger<S> {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        interrupt_free(kernel::port().machine(), || {
            // The sink cannot fail.
            let _ = writeln!(
                SinkWriter(&self.sink),
                "[{:5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        });
    }

    fn flush(&self) {}
}

/// Run `f` with interrupts masked, restoring the previous enable state.
/// Unlike a critical section this is safe inside trap handlers.
#[inline]
fn interrupt_free<M: Machine + ?Sized, T>(machine: &M, f: impl FnOnce() -> T) -> T {
    let unmask = machine.interrupts_enabled();
    machine.disable_interrupts();

    let ret = f();

    if unmask {
        machine.enable_interrupts();
    }
    ret
}

static LOGGER: Logger<Peripheral<CharOutRegisters>> = Logger::new(CHAROUT);

/// Install the char-out logger.
///
/// # Safety
/// Must be called once, before interrupts are enabled or any task runs.
pub unsafe fn init() {
    if log::set_logger_racy(&LOGGER).is_ok() {
        log::set_max_level_racy(LOG_LEVEL);
    }
}
