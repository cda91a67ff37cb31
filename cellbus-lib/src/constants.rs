// Protocol constants for the cell module bus

/// Lowest address a module can claim
pub const MIN_ADDRESS: u8 = 1;

/// Highest address a module can claim
pub const MAX_ADDRESS: u8 = 63;

/// Address used by broadcast commands
pub const BROADCAST_ADDRESS: u8 = 0xAA;

/// Size of the master's per-module stores
pub const MAX_MODULES: usize = 64;

/// Number of external analog inputs (cell voltages) per module
pub const NUM_INPUTS: usize = 4;

/// Number of temperature inputs per module
pub const NUM_TEMP: usize = 1;

/// Total number of measured values in a measurement block
pub const NUM_VALUES: usize = NUM_INPUTS + NUM_TEMP;

/// Index of the temperature channel in the value array
pub const TEMP_INDEX: usize = NUM_INPUTS;

/// Number of shunt channels a module can switch
pub const NUM_SHUNTS: usize = 4;

/// Cell voltages at or above this are treated as unused channels (mV)
pub const IMPLAUSIBLE_CELL_MV: u16 = 5000;

/// Cell voltages at or below this are treated as unused channels (mV)
pub const MIN_PLAUSIBLE_CELL_MV: u16 = 50;

/// Size of one encoded command word on the wire
pub const COMMAND_WORD_SIZE: usize = 2;

/// Size of a command carrying a second argument word
pub const WIDE_COMMAND_SIZE: usize = 2 * COMMAND_WORD_SIZE;

/// Size of a measurement block: address + values + crc (13 bytes)
pub const MEASUREMENT_BLOCK_SIZE: usize = 1 + NUM_VALUES * 2 + 2;

/// Size of a version block: sw + hw + serial + crc (12 bytes)
pub const VERSION_BLOCK_SIZE: usize = 4 + 2 + 4 + 2;

/// Words per module flash page
pub const PAGE_WORDS: usize = 32;

/// Bytes per module flash page
pub const PAGE_BYTES: usize = PAGE_WORDS * 2;

/// Size of a page buffer: page number + page + crc (67 bytes)
pub const PAGE_FRAME_SIZE: usize = 1 + PAGE_BYTES + 2;

/// Application pages of the cell module flash
pub const MAX_APPLICATION_PAGES: u8 = 56;

/// Padding pages sent after the last real page so it can still be retried
pub const UPDATE_TRAILING_PAGES: u8 = 4;

/// Master bus baud rate
pub const BUS_BAUD: u32 = 10_000;

/// Baud rate of the UART based updater variant
pub const UPDATER_UART_BAUD: u32 = 115_200;

/// Capacity of the master receive ring. Address mode floods it with breaks.
pub const RX_RING_SIZE: usize = 512;

/// Bit slots of a module-transmitted symbol: start + 8 data + 2 stop
pub const SYMBOL_TICKS: u8 = 11;

/// Stop bits the master appends to every byte
pub const MASTER_STOP_BITS: usize = 2;

/// Zero bits forming a break
pub const BREAK_BITS: usize = 10;
