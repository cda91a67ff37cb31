pub mod acquisition;
pub mod bitserial;
pub mod blocks;
pub mod calc;
pub mod comm;
pub mod command;
pub mod config;
pub mod constants;
pub mod crc;
pub mod error;
pub mod hamming;
pub mod line;
pub mod module;
pub mod onewire;
pub mod sim;
pub mod uart;
pub mod updater;


// Re-export the main session types for easy access
pub use acquisition::{Acquisition, CellModuleOp, MasterState};
pub use command::{Command, Opcode};
pub use config::{BmsConfig, ModuleConfig};
pub use error::{BusError, BusResult};
pub use module::ModuleSession;
