//! # Harvey Platform Peripherals
//!
//! Memory-mapped register blocks for the peripherals the port layer touches:
//! the tick timer, the UART, the power controller and the char-out debug
//! sink. Only the fields used by this crate are described.
//!
//! Peripherals are reached through [`Peripheral`] handles which, like the
//! core peripherals of the Cortex-M crates, are plain addresses that
//! dereference to the register block.

use core::marker::PhantomData;
use core::ops::Deref;

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadWrite, WriteOnly};

pub const CHAROUT_BASE: usize = 0x1000_0000;
pub const TIMER_BASE: usize = 0x2201_0000;
pub const UART_BASE: usize = 0x2208_0000;
pub const POWERDOWN_BASE: usize = 0x220a_0000;

/// Value whose write to the power controller stops the machine.
pub const POWERDOWN_REQUEST: u32 = 0xdead_beef;

register_bitfields! [u32,
    pub TimerControl [
        /// Counter enable
        EN OFFSET(0) NUMBITS(1) [],
        /// Update interrupt enable
        IE OFFSET(1) NUMBITS(1) []
    ],
    pub TimerStatus [
        /// Update event flag, set on every reload
        UEF OFFSET(0) NUMBITS(1) []
    ],
    pub UartControl [
        RXIE OFFSET(0) NUMBITS(1) [],
        TXIE OFFSET(1) NUMBITS(1) [],
        /// Starts a transmit DMA transfer of `TX_DMA_SIZE` bytes
        TXDMASTART OFFSET(8) NUMBITS(1) []
    ],
    pub UartStatus [
        /// Receive FIFO not empty
        RXNE OFFSET(0) NUMBITS(1) [],
        /// Transmitter idle, no DMA transfer in flight
        TXE OFFSET(1) NUMBITS(1) [],
        TXERR OFFSET(8) NUMBITS(1) []
    ]
];

#[repr(C)]
pub struct TimerRegisters {
    pub cr: ReadWrite<u32, TimerControl::Register>,
    pub sr: ReadWrite<u32, TimerStatus::Register>,
    pub cnt: ReadWrite<u32>,
    /// Auto-reload value: the timer fires every `arr + 1` clock periods.
    pub arr: ReadWrite<u32>,
}

#[repr(C)]
pub struct UartRegisters {
    pub cr: ReadWrite<u32, UartControl::Register>,
    pub sr: ReadWrite<u32, UartStatus::Register>,
    pub data: ReadWrite<u32>,
    /// Bus address of the transmit buffer. The bus is 32 bits wide.
    pub tx_dma_addr: ReadWrite<u32>,
    pub tx_dma_size: ReadWrite<u32>,
}

#[repr(C)]
pub struct PowerDownRegisters {
    pub req: WriteOnly<u32>,
}

#[repr(C)]
pub struct CharOutRegisters {
    pub char: WriteOnly<u8>,
    _reserved: [u8; 3],
    pub dec: WriteOnly<u32>,
    pub hex: WriteOnly<u32>,
}

/// Handle to a memory-mapped register block at a fixed address.
pub struct Peripheral<T> {
    base: usize,
    _marker: PhantomData<*const T>,
}

// Safety: a handle is only an address; all register accesses are volatile
// and the blocks are designed to be shared between tasks and handlers.
unsafe impl<T> Send for Peripheral<T> {}
unsafe impl<T> Sync for Peripheral<T> {}

impl<T> Peripheral<T> {
    /// # Safety
    /// `base` must be the address of a live `T` for as long as the handle
    /// (and anything dereferenced from it) is used.
    pub const unsafe fn new(base: usize) -> Self {
        Self {
            base,
            _marker: PhantomData,
        }
    }

    pub const fn as_ptr(&self) -> *const T {
        self.base as *const T
    }
}

impl<T> Clone for Peripheral<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Peripheral<T> {}

impl<T> Deref for Peripheral<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        unsafe { &*self.as_ptr() }
    }
}

pub const TIMER: Peripheral<TimerRegisters> = unsafe { Peripheral::new(TIMER_BASE) };
pub const UART: Peripheral<UartRegisters> = unsafe { Peripheral::new(UART_BASE) };
pub const POWERDOWN: Peripheral<PowerDownRegisters> = unsafe { Peripheral::new(POWERDOWN_BASE) };
pub const CHAROUT: Peripheral<CharOutRegisters> = unsafe { Peripheral::new(CHAROUT_BASE) };

// ---------------------------------------------------------------------------
// Interrupt lines
// ---------------------------------------------------------------------------

/// Peripheral interrupt lines. The discriminant is both the bit position in
/// the interrupt enable/pending registers and the interrupt cause code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Interrupt {
    Audio = 16,
    Mouse = 17,
    Keyboard = 18,
    Video = 19,
    Timer = 20,
    BlockDevice = 21,
    UartRx = 22,
    UartTx = 23,
    NicRx = 24,
    NicTx = 25,
    Software = 31,
}

impl Interrupt {
    pub const ALL: [Interrupt; 11] = [
        Interrupt::Audio,
        Interrupt::Mouse,
        Interrupt::Keyboard,
        Interrupt::Video,
        Interrupt::Timer,
        Interrupt::BlockDevice,
        Interrupt::UartRx,
        Interrupt::UartTx,
        Interrupt::NicRx,
        Interrupt::NicTx,
        Interrupt::Software,
    ];

    #[inline]
    pub const fn number(self) -> u32 {
        self as u32
    }

    /// Bit of this line in the interrupt enable/pending registers.
    #[inline]
    pub const fn mask(self) -> u32 {
        1 << self.number()
    }

    pub const fn from_number(number: u32) -> Option<Self> {
        Some(match number {
            16 => Interrupt::Audio,
            17 => Interrupt::Mouse,
            18 => Interrupt::Keyboard,
            19 => Interrupt::Video,
            20 => Interrupt::Timer,
            21 => Interrupt::BlockDevice,
            22 => Interrupt::UartRx,
            23 => Interrupt::UartTx,
            24 => Interrupt::NicRx,
            25 => Interrupt::NicTx,
            31 => Interrupt::Software,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_numbers_round_trip_through_lookup() {
        for line in Interrupt::ALL {
            assert_eq!(Interrupt::from_number(line.number()), Some(line));
        }
        assert_eq!(Interrupt::from_number(7), None);
        assert_eq!(Interrupt::Software.mask(), 0x8000_0000);
        assert_eq!(Interrupt::Timer.mask(), 0x0010_0000);
    }

    #[test]
    fn register_block_layouts_match_the_hardware() {
        use core::mem::offset_of;
        assert_eq!(offset_of!(TimerRegisters, arr), 12);
        assert_eq!(offset_of!(UartRegisters, data), 8);
        assert_eq!(offset_of!(UartRegisters, tx_dma_addr), 12);
        assert_eq!(offset_of!(UartRegisters, tx_dma_size), 16);
        assert_eq!(core::mem::size_of::<UartRegisters>(), 20);
        assert_eq!(offset_of!(CharOutRegisters, dec), 4);
        assert_eq!(offset_of!(CharOutRegisters, hex), 8);
    }
}
