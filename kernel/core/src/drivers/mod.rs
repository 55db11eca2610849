pub mod disk;
pub mod keyboard;
