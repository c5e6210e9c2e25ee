pub mod common;
pub mod room_generation;
pub mod room_regen;

pub use room_generation::RoomGenerationProcessor;
pub use room_regen::RoomRegenProcessor;
