//! # UART Driver
//!
//! Interrupt-driven serial port with a DMA transmitter.
//!
//! ## Receive
//!
//! The RX interrupt drains the hardware FIFO into a bounded byte queue. A
//! full queue drops the byte: there is no flow control at this layer.
//! [`Uart::read`] blocks for the first byte, then takes whatever else is
//! already queued without blocking again, so reads are often partial.
//!
//! ## Transmit
//!
//! [`Uart::write`] serializes writers with a mutex and picks a
//! [`TxStrategy`] from whether the scheduler is running:
//!
//! ```text
//!   Polled (before start)           InterruptDriven (after start)
//!   ─────────────────────           ─────────────────────────────
//!   spin until TXE                  start DMA
//!   start DMA                       enable TX interrupt
//!   spin until TXE                  block on tx_done ◄── TX ISR: disable
//!                                                         TX interrupt,
//!                                                         give tx_done
//! ```
//!
//! Before the scheduler starts there is no task that could block, yet boot
//! diagnostics still need the port, hence the polled path.

use core::fmt;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use crate::arch::Machine;
use crate::kernel::System;
use crate::platform::{Interrupt, Peripheral, UartControl, UartRegisters, UartStatus};
use crate::rtos::{Kernel, Queue, Semaphore, Wait};

/// Register-level operations the driver needs from the hardware.
pub trait SerialPort {
    /// Whether the receive FIFO holds a byte.
    fn rx_ready(&self) -> bool;

    /// Pop one byte from the receive FIFO.
    fn read_data(&self) -> u8;

    /// Whether the transmitter is idle.
    fn tx_empty(&self) -> bool;

    /// Start transmitting `bytes` by DMA. The buffer must stay alive until
    /// the transmitter reports empty.
    fn start_dma(&self, bytes: &[u8]);

    fn enable_tx_interrupt(&self);

    fn disable_tx_interrupt(&self);

    /// Reset the control register with only the receive interrupt enabled.
    fn enable_rx_interrupt(&self);
}

impl SerialPort for UartRegisters {
    #[inline]
    fn rx_ready(&self) -> bool {
        self.sr.is_set(UartStatus::RXNE)
    }

    #[inline]
    fn read_data(&self) -> u8 {
        self.data.get() as u8
    }

    #[inline]
    fn tx_empty(&self) -> bool {
        self.sr.is_set(UartStatus::TXE)
    }

    fn start_dma(&self, bytes: &[u8]) {
        self.tx_dma_addr.set(bytes.as_ptr() as usize as u32);
        self.tx_dma_size.set(bytes.len() as u32);
        self.cr.modify(UartControl::TXDMASTART::SET);
    }

    fn enable_tx_interrupt(&self) {
        self.cr.modify(UartControl::TXIE::SET);
    }

    fn disable_tx_interrupt(&self) {
        self.cr.modify(UartControl::TXIE::CLEAR);
    }

    fn enable_rx_interrupt(&self) {
        self.cr.write(UartControl::RXIE::SET);
    }
}

impl<T: SerialPort> SerialPort for Peripheral<T> {
    fn rx_ready(&self) -> bool {
        (**self).rx_ready()
    }

    fn read_data(&self) -> u8 {
        (**self).read_data()
    }

    fn tx_empty(&self) -> bool {
        (**self).tx_empty()
    }

    fn start_dma(&self, bytes: &[u8]) {
        (**self).start_dma(bytes)
    }

    fn enable_tx_interrupt(&self) {
        (**self).enable_tx_interrupt()
    }

    fn disable_tx_interrupt(&self) {
        (**self).disable_tx_interrupt()
    }

    fn enable_rx_interrupt(&self) {
        (**self).enable_rx_interrupt()
    }
}

/// How a write waits for the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStrategy {
    /// Busy-wait on the status register; usable without a scheduler.
    Polled,
    /// Block the writing task until the TX-complete interrupt fires.
    InterruptDriven,
}

impl TxStrategy {
    pub fn for_kernel<K: Kernel>(kernel: &K) -> Self {
        if kernel.is_running() {
            TxStrategy::InterruptDriven
        } else {
            TxStrategy::Polled
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct Uart<K: Kernel, P> {
    kernel: K,
    port: P,
    rx_queue: K::ByteQueue,
    tx_lock: K::Semaphore,
    tx_done: K::Semaphore,
}

impl<P: SerialPort> Uart<System, P> {
    /// A driver bound to the crate's scheduler.
    pub const fn for_system(port: P) -> Self {
        use crate::blocking::{BinarySemaphore, BoundedQueue};

        Self::new(
            System,
            port,
            BoundedQueue::new(),
            BinarySemaphore::new_given(),
            BinarySemaphore::new(),
        )
    }
}

impl<K: Kernel, P: SerialPort> Uart<K, P> {
    /// `tx_lock` must be created given (available), `tx_done` empty.
    pub const fn new(
        kernel: K,
        port: P,
        rx_queue: K::ByteQueue,
        tx_lock: K::Semaphore,
        tx_done: K::Semaphore,
    ) -> Self {
        Self {
            kernel,
            port,
            rx_queue,
            tx_lock,
            tx_done,
        }
    }

    /// Enable reception and unmask both UART interrupt lines.
    pub fn init(&self) {
        self.port.enable_rx_interrupt();
        self.kernel
            .port()
            .machine()
            .enable_lines(Interrupt::UartRx.mask() | Interrupt::UartTx.mask());
    }

    /// RX interrupt body: move every received byte into the queue.
    pub fn on_rx_interrupt(&self) {
        let mut woken = false;
        while self.port.rx_ready() {
            let byte = self.port.read_data();
            // Dropped if the queue is full.
            if let Ok(higher_priority_woken) = self.rx_queue.send_from_isr(byte) {
                woken |= higher_priority_woken;
            }
        }
        self.kernel.yield_from_isr(woken);
    }

    /// TX interrupt body: the DMA transfer completed.
    pub fn on_tx_interrupt(&self) {
        self.port.disable_tx_interrupt();
        let woken = self.tx_done.give_from_isr();
        self.kernel.yield_from_isr(woken);
    }

    /// Read at least one byte into `buffer`, blocking until one arrives,
    /// plus any others already received. If fewer than `buffer.len()` bytes
    /// are returned, a NUL follows them.
    pub fn read(&self, buffer: &mut [u8]) -> usize {
        if buffer.is_empty() {
            return 0;
        }

        let mut count = 0;
        if let Some(first) = self.rx_queue.receive(Wait::Forever) {
            buffer[0] = first;
            count = 1;
            while count < buffer.len() {
                match self.rx_queue.receive(Wait::Poll) {
                    Some(byte) => {
                        buffer[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
        }

        if count < buffer.len() {
            buffer[count] = 0;
        }
        count
    }

    /// Transmit all of `bytes`, returning once the hardware is done with
    /// the buffer.
    pub fn write(&self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }

        if !self.tx_lock.take(Wait::Forever) {
            self.kernel
                .port()
                .fatal(format_args!("cannot take the UART transmit lock"));
        }

        match TxStrategy::for_kernel(&self.kernel) {
            TxStrategy::Polled => {
                self.wait_tx_empty();
                self.port.start_dma(bytes);
                self.wait_tx_empty();
            }
            TxStrategy::InterruptDriven => {
                self.port.start_dma(bytes);
                self.port.enable_tx_interrupt();
                self.tx_done.take(Wait::Forever);
            }
        }

        self.tx_lock.give();
        bytes.len()
    }

    fn wait_tx_empty(&self) {
        while !self.port.tx_empty() {
            core::hint::spin_loop();
        }
    }

    /// A [`fmt::Write`] adapter, for `write!` on the port.
    pub fn writer(&self) -> UartWriter<'_, K, P> {
        UartWriter { uart: self }
    }
}

pub struct UartWriter<'a, K: Kernel, P> {
    uart: &'a Uart<K, P>,
}

impl<K: Kernel, P: SerialPort> fmt::Write for UartWriter<'_, K, P> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.uart.write(s.as_bytes());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostMachine;
    use crate::rtos::mock::{MockKernel, MockQueue, MockSemaphore};
    use std::boxed::Box;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    #[derive(Default)]
    struct FakeSerial {
        fifo: Mutex<VecDeque<u8>>,
        sent: Mutex<Vec<u8>>,
        dma_starts: AtomicUsize,
        tx_empty_polls: AtomicUsize,
        tx_interrupt: AtomicBool,
        rx_interrupt: AtomicBool,
    }

    impl FakeSerial {
        fn receive(&self, bytes: &[u8]) {
            self.fifo.lock().unwrap().extend(bytes);
        }
    }

    impl SerialPort for FakeSerial {
        fn rx_ready(&self) -> bool {
            !self.fifo.lock().unwrap().is_empty()
        }

        fn read_data(&self) -> u8 {
            self.fifo.lock().unwrap().pop_front().unwrap_or(0)
        }

        fn tx_empty(&self) -> bool {
            self.tx_empty_polls.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn start_dma(&self, bytes: &[u8]) {
            self.sent.lock().unwrap().extend_from_slice(bytes);
            self.dma_starts.fetch_add(1, Ordering::SeqCst);
        }

        fn enable_tx_interrupt(&self) {
            self.tx_interrupt.store(true, Ordering::SeqCst);
        }

        fn disable_tx_interrupt(&self) {
            self.tx_interrupt.store(false, Ordering::SeqCst);
        }

        fn enable_rx_interrupt(&self) {
            self.rx_interrupt.store(true, Ordering::SeqCst);
        }
    }

    type TestUart = Uart<MockKernel, FakeSerial>;

    fn uart(kernel: MockKernel, rx_capacity: usize) -> TestUart {
        Uart::new(
            kernel,
            FakeSerial::default(),
            MockQueue::with_capacity(rx_capacity),
            MockSemaphore::mutex(),
            MockSemaphore::binary(),
        )
    }

    fn machine(uart: &TestUart) -> &HostMachine {
        uart.kernel.port().machine()
    }

    fn wait_until(condition: impl Fn() -> bool) {
        while !condition() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn init_enables_reception_and_both_lines() {
        let uart = uart(MockKernel::new(), 8);
        uart.init();
        assert!(uart.port.rx_interrupt.load(Ordering::SeqCst));
        assert_eq!(
            machine(&uart).enabled_lines(),
            Interrupt::UartRx.mask() | Interrupt::UartTx.mask()
        );
    }

    #[test]
    fn empty_write_touches_nothing() {
        let uart = uart(MockKernel::running(), 8);
        assert_eq!(uart.write(&[]), 0);
        assert_eq!(uart.tx_lock.takes(), 0);
        assert_eq!(uart.port.dma_starts.load(Ordering::SeqCst), 0);
        assert_eq!(uart.port.tx_empty_polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn write_before_start_polls_around_the_transfer() {
        let uart = uart(MockKernel::new(), 8);
        assert_eq!(TxStrategy::for_kernel(&uart.kernel), TxStrategy::Polled);

        assert_eq!(uart.write(b"boot"), 4);

        assert_eq!(uart.port.sent.lock().unwrap().as_slice(), b"boot");
        assert!(uart.port.tx_empty_polls.load(Ordering::SeqCst) >= 2);
        assert!(!uart.port.tx_interrupt.load(Ordering::SeqCst));
        assert_eq!(uart.tx_done.takes(), 0);
        assert_eq!(uart.tx_lock.count(), 1);
    }

    #[test]
    fn write_while_running_waits_for_the_tx_interrupt() {
        let uart = uart(MockKernel::running(), 8);

        let written = thread::scope(|scope| {
            let writer = scope.spawn(|| uart.write(b"hello, world"));

            wait_until(|| uart.tx_done.waiters() == 1);
            assert!(uart.port.tx_interrupt.load(Ordering::SeqCst));
            assert_eq!(uart.port.dma_starts.load(Ordering::SeqCst), 1);
            assert_eq!(uart.tx_lock.count(), 0);

            uart.on_tx_interrupt();
            writer.join().unwrap()
        });

        assert_eq!(written, 12);
        assert_eq!(uart.port.sent.lock().unwrap().as_slice(), b"hello, world");
        assert!(!uart.port.tx_interrupt.load(Ordering::SeqCst));
        assert_eq!(uart.port.tx_empty_polls.load(Ordering::SeqCst), 0);
        assert_eq!(uart.tx_lock.count(), 1);
        assert!(machine(&uart).switch_requested());
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let uart = uart(MockKernel::new(), 8);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        assert_eq!(uart.write(b"ab"), 2);
                    }
                });
            }
        });

        let sent = uart.port.sent.lock().unwrap();
        assert_eq!(sent.len(), 200);
        assert!(sent.chunks(2).all(|pair| pair == b"ab"));
        assert_eq!(uart.tx_lock.takes(), 100);
    }

    #[test]
    fn read_blocks_until_the_rx_interrupt_delivers() {
        let uart = uart(MockKernel::running(), 8);

        let (count, buffer) = thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut buffer = [0xffu8; 8];
                let count = uart.read(&mut buffer);
                (count, buffer)
            });

            wait_until(|| uart.rx_queue.waiters() == 1);
            uart.port.receive(b"h");
            uart.on_rx_interrupt();
            reader.join().unwrap()
        });

        assert_eq!(count, 1);
        assert_eq!(&buffer[..2], b"h\0");
        assert!(machine(&uart).switch_requested());
    }

    #[test]
    fn read_returns_what_is_queued_and_terminates_short_reads() {
        let uart = uart(MockKernel::running(), 8);
        uart.port.receive(b"hello");
        uart.on_rx_interrupt();
        assert!(!uart.port.rx_ready());

        let mut truncated = [0u8; 3];
        assert_eq!(uart.read(&mut truncated), 3);
        assert_eq!(&truncated, b"hel");

        let mut rest = [0xffu8; 8];
        assert_eq!(uart.read(&mut rest), 2);
        assert_eq!(&rest[..3], b"lo\0");
        assert_eq!(rest[3], 0xff);

        assert_eq!(uart.read(&mut []), 0);
    }

    #[test]
    fn full_rx_queue_drops_bytes_silently() {
        let uart = uart(MockKernel::running(), 4);
        uart.port.receive(b"abcdef");
        uart.on_rx_interrupt();

        assert!(!uart.port.rx_ready(), "the FIFO is drained even when full");
        assert_eq!(uart.rx_queue.len(), 4);
        assert!(!machine(&uart).switch_requested());

        let mut buffer = [0u8; 8];
        assert_eq!(uart.read(&mut buffer), 4);
        assert_eq!(&buffer[..5], b"abcd\0");
    }

    #[test]
    fn formatted_output_goes_through_write() {
        use core::fmt::Write as _;

        let uart = uart(MockKernel::new(), 8);
        write!(uart.writer(), "tick {}", 42).unwrap();
        assert_eq!(uart.port.sent.lock().unwrap().as_slice(), b"tick 42");
    }

    #[test]
    fn register_dma_start_programs_a_32_bit_transfer() {
        // Safety: the register block is plain integer cells.
        let registers: Box<UartRegisters> = Box::new(unsafe { core::mem::zeroed() });
        registers.cr.write(UartControl::RXIE::SET);
        let bytes = [1u8, 2, 3];

        registers.start_dma(&bytes);

        assert_eq!(registers.tx_dma_addr.get(), bytes.as_ptr() as usize as u32);
        assert_eq!(registers.tx_dma_size.get(), 3);
        assert!(registers.cr.is_set(UartControl::TXDMASTART));
        assert!(registers.cr.is_set(UartControl::RXIE), "other control bits survive");
    }
}
