// Heap
pub const HEAP_ALIGN: usize = 16;
/// Default heap size used by the freestanding kernel when the boot info gives no region.
pub const DEFAULT_HEAP_SIZE: usize = 16 * 1024 * 1024;

// Block layer
pub const BLOCK_SIZE: usize = 512;
pub const CACHE_SLOTS: usize = 64;
pub const MAX_BLOCK_DEVICES: usize = 4;
pub const MAX_DEVICE_NAME: usize = 16;

// ATA PIO (primary bus)
pub const ATA_PRIMARY_IO: u16 = 0x1F0;
pub const ATA_PRIMARY_CONTROL: u16 = 0x3F6;
/// Status polls before a command is declared timed out.
pub const ATA_POLL_LIMIT: u32 = 100_000;
/// Sectors transferred by one READ/WRITE SECTORS command at most.
pub const ATA_MAX_SECTORS_PER_COMMAND: usize = 256;

// VFS
pub const MAX_OPEN_FILES: usize = 32;
pub const MAX_MOUNTS: usize = 8;
pub use cupid_api_types::{MAX_NAME, MAX_PATH};

// Ramfs
pub const RAMFS_NODE_CAP: usize = 1024 * 1024;
pub const RAMFS_MIN_GROWTH: usize = 64;

// Processes
pub const MAX_PROCESSES: usize = 16;
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
pub const MIN_STACK_SIZE: usize = 4 * 1024;
pub const MAX_PROCESS_NAME: usize = 32;
pub const STACK_CANARY: u64 = 0xC0FF_EE00_DEAD_BEEF;
pub const SUSPEND_DEPTH: usize = 4;

// Timer
pub const DEFAULT_TIMER_HZ: u32 = 100;
pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;
pub const KEY_QUEUE_LEN: usize = 128;

// Shell
pub const HISTORY_LEN: usize = 16;
pub const REDIRECT_CAP: usize = 16 * 1024;
pub const MAX_LINE: usize = 256;
pub const MAX_TOKENS: usize = 32;
pub const MAX_TOKEN_LEN: usize = 128;
pub const SOURCE_EXTENSION: &str = ".cc";
pub const SEARCH_DIRS: [&str; 2] = ["/bin", "/home/bin"];

// JIT program region
pub const JIT_CODE_SIZE: usize = 256 * 1024;
pub const JIT_DATA_SIZE: usize = 256 * 1024;
