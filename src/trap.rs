//! # Trap Vector Table
//!
//! Maps every exception and interrupt cause to a handler. The table is an
//! ordinary value built at compile time: start from [`VectorTable::new`],
//! where every slot holds its safe default, and override individual slots
//! with [`VectorTable::with_exception`] / [`VectorTable::with_interrupt`].
//!
//! ```ignore
//! static VECTORS: VectorTable = kernel::port_vectors()
//!     .with_interrupt(Interrupt::UartRx, uart_rx_handler)
//!     .with_interrupt(Interrupt::UartTx, uart_tx_handler);
//! ```
//!
//! Defaults disable interrupts, log the cause together with the faulting
//! program counter and trap value, and halt the machine. The environment
//! call and breakpoint defaults only log and step over the instruction.
//! Causes the table has no slot for go to the generic defaults.

use crate::arch::{self, Machine};
use crate::platform::Interrupt;

/// Bit of the cause register that distinguishes interrupts from
/// exceptions.
pub const INTERRUPT_FLAG: usize = 1 << (usize::BITS - 1);

/// Synchronous exceptions the table dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadFault,
    StoreMisaligned,
    StoreFault,
    EnvironmentCall,
}

impl Exception {
    const COUNT: usize = 9;

    pub const fn from_code(code: usize) -> Option<Self> {
        Some(match code {
            0 => Exception::InstructionMisaligned,
            1 => Exception::InstructionFault,
            2 => Exception::IllegalInstruction,
            3 => Exception::Breakpoint,
            4 => Exception::LoadMisaligned,
            5 => Exception::LoadFault,
            6 => Exception::StoreMisaligned,
            7 => Exception::StoreFault,
            // From user or machine mode.
            8 | 11 => Exception::EnvironmentCall,
            _ => return None,
        })
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

/// Decoded trap cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    Exception(Exception),
    Interrupt(Interrupt),
    UnknownException(usize),
    UnknownInterrupt(usize),
}

impl TrapCause {
    pub const fn from_bits(bits: usize) -> Self {
        let code = bits & !INTERRUPT_FLAG;
        if bits & INTERRUPT_FLAG != 0 {
            match Interrupt::from_number(code as u32) {
                Some(line) if code <= u32::MAX as usize => TrapCause::Interrupt(line),
                _ => TrapCause::UnknownInterrupt(code),
            }
        } else {
            match Exception::from_code(code) {
                Some(exception) => TrapCause::Exception(exception),
                None => TrapCause::UnknownException(code),
            }
        }
    }

    pub const fn is_interrupt(&self) -> bool {
        matches!(self, TrapCause::Interrupt(_) | TrapCause::UnknownInterrupt(_))
    }
}

/// State of the trap being handled, passed to every handler.
pub struct Trap<'a> {
    pub cause: TrapCause,
    /// Raw cause register, as printed in diagnostics.
    pub bits: usize,
    /// Program counter the interrupted context resumes at. Handlers may
    /// move it, e.g. past an `ecall`.
    pub epc: usize,
    pub tval: usize,
    machine: &'a dyn Machine,
}

impl<'a> Trap<'a> {
    pub fn new(bits: usize, epc: usize, tval: usize, machine: &'a dyn Machine) -> Self {
        Self {
            cause: TrapCause::from_bits(bits),
            bits,
            epc,
            tval,
            machine,
        }
    }

    pub fn machine(&self) -> &'a dyn Machine {
        self.machine
    }
}

pub type Handler = fn(&mut Trap<'_>);

// ---------------------------------------------------------------------------
// The table
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct VectorTable {
    exceptions: [Handler; Exception::COUNT],
    interrupts: [Handler; Interrupt::ALL.len()],
}

impl VectorTable {
    /// A table where every slot holds its default handler.
    pub const fn new() -> Self {
        Self {
            exceptions: [
                instruction_misaligned_handler,
                instruction_fault_handler,
                illegal_instruction_handler,
                breakpoint_handler,
                load_misaligned_handler,
                load_fault_handler,
                store_misaligned_handler,
                store_fault_handler,
                environment_call_handler,
            ],
            interrupts: [default_interrupt_handler; Interrupt::ALL.len()],
        }
    }

    pub const fn with_exception(mut self, exception: Exception, handler: Handler) -> Self {
        self.exceptions[exception.slot()] = handler;
        self
    }

    pub const fn with_interrupt(mut self, line: Interrupt, handler: Handler) -> Self {
        self.interrupts[line_slot(line)] = handler;
        self
    }

    pub fn exception_handler(&self, exception: Exception) -> Handler {
        self.exceptions[exception.slot()]
    }

    pub fn interrupt_handler(&self, line: Interrupt) -> Handler {
        self.interrupts[line_slot(line)]
    }

    /// Run the handler resolved for `trap.cause`.
    pub fn dispatch(&self, trap: &mut Trap<'_>) {
        let handler = match trap.cause {
            TrapCause::Exception(exception) => self.exception_handler(exception),
            TrapCause::Interrupt(line) => self.interrupt_handler(line),
            TrapCause::UnknownException(_) => default_exception_handler,
            TrapCause::UnknownInterrupt(_) => default_interrupt_handler,
        };
        handler(trap);
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}

const fn line_slot(line: Interrupt) -> usize {
    let mut slot = 0;
    while slot < Interrupt::ALL.len() {
        if Interrupt::ALL[slot] as u8 == line as u8 {
            return slot;
        }
        slot += 1;
    }
    // `ALL` lists every variant.
    0
}

// ---------------------------------------------------------------------------
// Default handlers
// ---------------------------------------------------------------------------

/// Width of an `ecall` / `ebreak` instruction.
const TRAP_INSTRUCTION_LEN: usize = 4;

pub fn default_exception_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!(
        "unhandled exception, mepc: {:#010x}, mcause: {}, mtval: {:#010x}",
        trap.epc, trap.bits, trap.tval
    ))
}

pub fn default_interrupt_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!(
        "unhandled interrupt, trap number {}",
        trap.bits & !INTERRUPT_FLAG
    ))
}

fn instruction_misaligned_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!(
        "instruction address misaligned @ pc {:#010x}, target: {:#010x}",
        trap.epc, trap.tval
    ))
}

fn instruction_fault_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!("instruction access fault @ pc {:#010x}", trap.epc))
}

fn illegal_instruction_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!(
        "illegal instruction @ pc {:#010x}, instruction: {:#010x}",
        trap.epc, trap.tval
    ))
}

fn load_misaligned_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!(
        "load address misaligned @ pc {:#010x}, target: {:#010x}",
        trap.epc, trap.tval
    ))
}

fn load_fault_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!(
        "load access fault @ pc {:#010x}, target: {:#010x}",
        trap.epc, trap.tval
    ))
}

fn store_misaligned_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!(
        "store address misaligned @ pc {:#010x}, target: {:#010x}",
        trap.epc, trap.tval
    ))
}

fn store_fault_handler(trap: &mut Trap<'_>) {
    arch::fatal(trap.machine(), format_args!(
        "store access fault @ pc {:#010x}, target: {:#010x}",
        trap.epc, trap.tval
    ))
}

pub fn environment_call_handler(trap: &mut Trap<'_>) {
    log::warn!("environment call @ pc {:#010x}", trap.epc);
    trap.epc = trap.epc.wrapping_add(TRAP_INSTRUCTION_LEN);
}

pub fn breakpoint_handler(trap: &mut Trap<'_>) {
    log::warn!("environment break @ pc {:#010x}", trap.epc);
    trap.epc = trap.epc.wrapping_add(TRAP_INSTRUCTION_LEN);
}
