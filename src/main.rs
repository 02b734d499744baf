//! # Harvey Firmware
//!
//! Boots the port layer with three tasks:
//!
//! | Task          | Priority | Behavior                                      |
//! |---------------|----------|-----------------------------------------------|
//! | `echo_task`   | 3        | Blocks on the UART and echoes what arrives    |
//! | `heap_task`   | 2        | Builds a vector on the heap once per second   |
//! | `ticker_task` | 1        | Logs the tick count every 500 ms              |
//!
//! The UART is usable before `kernel::start`: the boot banner goes out
//! through the polled transmit path, everything after that is interrupt
//! driven.

#![cfg_attr(target_arch = "riscv32", no_std, no_main)]

#[cfg(target_arch = "riscv32")]
mod firmware {
    extern crate alloc;

    use alloc::vec::Vec;
    use core::fmt::Write;

    use panic_halt as _;
    use riscv_rt::entry;

    use harvey_port::blocking::ReentrantMutex;
    use harvey_port::config::HEAP_SIZE;
    use harvey_port::heap::{FreeListHeap, LockedAllocator};
    use harvey_port::kernel::{self, System};
    use harvey_port::logger;
    use harvey_port::platform::{self, Interrupt, Peripheral, UartRegisters};
    use harvey_port::task::{TaskConfig, TaskEntry};
    use harvey_port::trap::{Trap, VectorTable};
    use harvey_port::uart::Uart;

    static UART: Uart<System, Peripheral<UartRegisters>> = Uart::for_system(platform::UART);

    #[global_allocator]
    static HEAP: LockedAllocator<ReentrantMutex, FreeListHeap<HEAP_SIZE>> =
        LockedAllocator::new(ReentrantMutex::new(), FreeListHeap::new());

    static VECTORS: VectorTable = kernel::port_vectors()
        .with_interrupt(Interrupt::UartRx, uart_rx_handler)
        .with_interrupt(Interrupt::UartTx, uart_tx_handler);

    fn uart_rx_handler(_trap: &mut Trap<'_>) {
        UART.on_rx_interrupt();
    }

    fn uart_tx_handler(_trap: &mut Trap<'_>) {
        UART.on_tx_interrupt();
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    extern "C" fn echo_task(_argument: usize) {
        let mut buffer = [0u8; 32];
        loop {
            let count = UART.read(&mut buffer);
            UART.write(&buffer[..count]);
        }
    }

    extern "C" fn heap_task(_argument: usize) {
        let mut round: u32 = 0;
        loop {
            let squares: Vec<u32> = (0..=round % 16).map(|n| n * n).collect();
            let sum: u32 = squares.iter().sum();
            let _ = writeln!(UART.writer(), "heap: {} squares sum to {}", squares.len(), sum);

            round = round.wrapping_add(1);
            kernel::delay_ms(1000);
        }
    }

    extern "C" fn ticker_task(_argument: usize) {
        loop {
            log::info!("tick {}", kernel::tick_count());
            kernel::delay_ms(500);
        }
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    #[entry]
    fn main() -> ! {
        kernel::init();
        unsafe { logger::init() };

        UART.init();
        let _ = writeln!(UART.writer(), "harvey-port booting");

        let tasks: [(TaskEntry, u8); 3] = [(echo_task, 3), (heap_task, 2), (ticker_task, 1)];
        for (entry, priority) in tasks {
            if let Err(error) = kernel::create_task(entry, TaskConfig::with_priority(priority), 0) {
                kernel::port().fatal(format_args!("cannot create task: {}", error));
            }
        }

        kernel::start(&VECTORS)
    }
}

#[cfg(not(target_arch = "riscv32"))]
fn main() {
    eprintln!("harvey-port is firmware for riscv32im-unknown-none-elf; run `cargo test` on the host");
}
