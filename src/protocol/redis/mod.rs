mod catalog;
mod codec;
mod command;
pub mod reply;
mod slots;
mod types;

pub use catalog::{CommandKeyType, CommandKind, CommandType, RedisCommand, SupportType};
pub use codec::RespCodec;
pub use command::{Command, SLOT_COUNT};
pub use slots::{hash_slot, SlotMap};
pub use types::RespValue;
