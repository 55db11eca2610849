pub mod fat16;
pub mod path;
pub mod ramfs;
pub mod vfs;

pub use fat16::Fat16;
pub use ramfs::Ramfs;
pub use vfs::{Fd, FileSystem, FsHandle, MountId, MountInfo, Vfs};
