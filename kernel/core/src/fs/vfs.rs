//! Mount table, file-descriptor table and dispatch to file-system drivers.
//!
//! Drivers implement [`FileSystem`]; every capability defaults to `NotSupported`.
//! Paths handed to a driver are canonical and relative to its mount point, rooted at
//! `/`.

use super::path::{self, PathBuf};
use crate::consts::{MAX_MOUNTS, MAX_OPEN_FILES};
use alloc::boxed::Box;
use alloc::vec::Vec;
use cupid_api_types::fs::{DirEntry, OpenFlags, Stat, Whence};
use cupid_api_types::{Errno, FsResult};

/// Driver-private open-file identifier.
pub type FsHandle = u32;
/// Index into the VFS file-descriptor table.
pub type Fd = usize;

#[allow(unused_variables)]
pub trait FileSystem: Send {
    fn name(&self) -> &'static str;

    /// Called once when the driver is attached to the mount table.
    fn mount(&mut self) -> FsResult<()> {
        Ok(())
    }

    /// Called once when the driver is detached. Must leave the backing store consistent.
    fn unmount(&mut self) -> FsResult<()> {
        Ok(())
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<FsHandle> {
        Err(Errno::NotSupported)
    }

    fn close(&mut self, handle: FsHandle) -> FsResult<()> {
        Err(Errno::NotSupported)
    }

    fn read(&mut self, handle: FsHandle, buf: &mut [u8]) -> FsResult<usize> {
        Err(Errno::NotSupported)
    }

    fn write(&mut self, handle: FsHandle, buf: &[u8]) -> FsResult<usize> {
        Err(Errno::NotSupported)
    }

    fn seek(&mut self, handle: FsHandle, offset: i64, whence: Whence) -> FsResult<u64> {
        Err(Errno::NotSupported)
    }

    fn stat(&mut self, path: &str) -> FsResult<Stat> {
        Err(Errno::NotSupported)
    }

    /// Next entry of an open directory, `None` once exhausted.
    fn readdir(&mut self, handle: FsHandle) -> FsResult<Option<DirEntry>> {
        Err(Errno::NotSupported)
    }

    fn mkdir(&mut self, path: &str) -> FsResult<()> {
        Err(Errno::NotSupported)
    }

    fn unlink(&mut self, path: &str) -> FsResult<()> {
        Err(Errno::NotSupported)
    }

    /// Pushes buffered state to the backing store.
    fn sync(&mut self) -> FsResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountId(u32);

struct Mount {
    id: MountId,
    point: PathBuf,
    fs: Box<dyn FileSystem>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountInfo {
    pub point: PathBuf,
    pub fs_name: &'static str,
}

#[derive(Clone, Copy)]
struct OpenFile {
    mount: MountId,
    handle: FsHandle,
    flags: OpenFlags,
    refcount: u32,
}

pub struct Vfs {
    mounts: Vec<Mount>,
    next_mount_id: u32,
    files: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self { mounts: Vec::new(), next_mount_id: 0, files: [None; MAX_OPEN_FILES] }
    }

    pub fn mount(&mut self, point: &str, mut fs: Box<dyn FileSystem>) -> FsResult<MountId> {
        let point = path::canonicalize(point)?;
        if self.mounts.iter().any(|m| m.point == point) {
            return Err(Errno::AlreadyExists);
        }
        if self.mounts.len() >= MAX_MOUNTS {
            return Err(Errno::NoSpace);
        }
        fs.mount()?;
        let id = MountId(self.next_mount_id);
        self.next_mount_id += 1;
        log::info!("vfs: mounted {} at {}", fs.name(), point);
        self.mounts.push(Mount { id, point, fs });
        Ok(id)
    }

    /// Detaches the file system at `point`. Refused while any descriptor refers to it.
    pub fn unmount(&mut self, point: &str) -> FsResult<()> {
        let point = path::canonicalize(point)?;
        let idx = self.mounts.iter().position(|m| m.point == point).ok_or(Errno::NotFound)?;
        let id = self.mounts[idx].id;
        if self.files.iter().flatten().any(|f| f.mount == id) {
            return Err(Errno::Busy);
        }
        self.mounts[idx].fs.unmount()?;
        let mount = self.mounts.remove(idx);
        log::info!("vfs: unmounted {} from {}", mount.fs.name(), mount.point);
        Ok(())
    }

    pub fn list_mounts(&self) -> Vec<MountInfo> {
        self.mounts
            .iter()
            .map(|m| MountInfo { point: m.point.clone(), fs_name: m.fs.name() })
            .collect()
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<Fd> {
        if !flags.is_valid() {
            return Err(Errno::InvalidArgument);
        }
        let fd = self.files.iter().position(Option::is_none).ok_or(Errno::NoSpace)?;
        let (mount, rest) = self.resolve(path)?;
        let mount_id = mount.id;
        let handle = mount.fs.open(&rest, flags)?;
        self.files[fd] = Some(OpenFile { mount: mount_id, handle, flags, refcount: 1 });
        Ok(fd)
    }

    /// Makes a second descriptor sharing the same driver handle and position.
    pub fn dup(&mut self, fd: Fd) -> FsResult<Fd> {
        let file = self.file(fd)?;
        let new_fd = self.files.iter().position(Option::is_none).ok_or(Errno::NoSpace)?;
        for f in self.files.iter_mut().flatten() {
            if f.mount == file.mount && f.handle == file.handle {
                f.refcount += 1;
            }
        }
        self.files[new_fd] = Some(OpenFile { refcount: file.refcount + 1, ..file });
        Ok(new_fd)
    }

    pub fn close(&mut self, fd: Fd) -> FsResult<()> {
        let file = self.file(fd)?;
        self.files[fd] = None;
        let mut remaining = 0;
        for f in self.files.iter_mut().flatten() {
            if f.mount == file.mount && f.handle == file.handle {
                f.refcount -= 1;
                remaining = f.refcount;
            }
        }
        if remaining == 0 {
            self.mount_by_id(file.mount)?.fs.close(file.handle)?;
        }
        Ok(())
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> FsResult<usize> {
        let file = self.file(fd)?;
        if !file.flags.contains(OpenFlags::READ) {
            return Err(Errno::BadDescriptor);
        }
        self.mount_by_id(file.mount)?.fs.read(file.handle, buf)
    }

    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> FsResult<usize> {
        let file = self.file(fd)?;
        if !file.flags.contains(OpenFlags::WRITE) {
            return Err(Errno::BadDescriptor);
        }
        self.mount_by_id(file.mount)?.fs.write(file.handle, buf)
    }

    pub fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> FsResult<u64> {
        let file = self.file(fd)?;
        self.mount_by_id(file.mount)?.fs.seek(file.handle, offset, whence)
    }

    pub fn readdir(&mut self, fd: Fd) -> FsResult<Option<DirEntry>> {
        let file = self.file(fd)?;
        self.mount_by_id(file.mount)?.fs.readdir(file.handle)
    }

    pub fn stat(&mut self, path: &str) -> FsResult<Stat> {
        let (mount, rest) = self.resolve(path)?;
        mount.fs.stat(&rest)
    }

    pub fn mkdir(&mut self, path: &str) -> FsResult<()> {
        let (mount, rest) = self.resolve(path)?;
        mount.fs.mkdir(&rest)
    }

    pub fn unlink(&mut self, path: &str) -> FsResult<()> {
        let canonical = path::canonicalize(path)?;
        if self.mounts.iter().any(|m| m.point == canonical) {
            return Err(Errno::Busy);
        }
        let (mount, rest) = self.resolve(&canonical)?;
        mount.fs.unlink(&rest)
    }

    /// Asks every mounted driver to flush. Reports the first failure after trying all.
    pub fn sync(&mut self) -> FsResult<()> {
        let mut result = Ok(());
        for mount in &mut self.mounts {
            if let Err(e) = mount.fs.sync() {
                log::warn!("vfs: sync of {} failed: {e}", mount.point);
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Lists a directory by path.
    pub fn list_dir(&mut self, path: &str) -> FsResult<Vec<DirEntry>> {
        let fd = self.open(path, OpenFlags::READ)?;
        let mut entries = Vec::new();
        let result = loop {
            match self.readdir(fd) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break Ok(entries),
                Err(e) => break Err(e),
            }
        };
        self.close(fd)?;
        result
    }

    /// Reads a whole file.
    pub fn read_all(&mut self, path: &str) -> FsResult<Vec<u8>> {
        let fd = self.open(path, OpenFlags::READ)?;
        let mut data = Vec::new();
        let mut chunk = [0u8; 512];
        let result = loop {
            match self.read(fd, &mut chunk) {
                Ok(0) => break Ok(data),
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) => break Err(e),
            }
        };
        self.close(fd)?;
        result
    }

    /// Creates or replaces (or appends to) a file with `data`.
    pub fn write_all(&mut self, path: &str, data: &[u8], append: bool) -> FsResult<()> {
        let mode = if append { OpenFlags::APPEND } else { OpenFlags::TRUNCATE };
        let fd = self.open(path, OpenFlags::WRITE | OpenFlags::CREATE | mode)?;
        let mut written = 0;
        let result = loop {
            if written == data.len() {
                break Ok(());
            }
            match self.write(fd, &data[written..]) {
                Ok(0) => break Err(Errno::NoSpace),
                Ok(n) => written += n,
                Err(e) => break Err(e),
            }
        };
        self.close(fd)?;
        result
    }

    pub fn open_count(&self) -> usize {
        self.files.iter().flatten().count()
    }

    fn file(&self, fd: Fd) -> FsResult<OpenFile> {
        self.files.get(fd).copied().flatten().ok_or(Errno::BadDescriptor)
    }

    fn mount_by_id(&mut self, id: MountId) -> FsResult<&mut Mount> {
        // A descriptor keeps its mount alive, so a miss here means a stale table.
        self.mounts.iter_mut().find(|m| m.id == id).ok_or(Errno::BadDescriptor)
    }

    /// Longest-prefix match of a canonicalised `path` against the mount table.
    fn resolve(&mut self, path: &str) -> FsResult<(&mut Mount, PathBuf)> {
        let canonical = path::canonicalize(path)?;
        let mount = self
            .mounts
            .iter_mut()
            .filter(|m| path::is_under(&canonical, &m.point))
            .max_by_key(|m| m.point.len())
            .ok_or(Errno::NotFound)?;
        let mut rest = PathBuf::new();
        rest.push_str(path::strip_mount(&canonical, &mount.point))
            .map_err(|_| Errno::InvalidArgument)?;
        Ok((mount, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Ramfs;
    use alloc::string::String;
    use alloc::sync::Arc;
    use alloc::vec;

    /// Records which paths reach it.
    struct Recorder {
        name: &'static str,
        seen: Arc<spin::Mutex<Vec<String>>>,
    }

    impl FileSystem for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn stat(&mut self, path: &str) -> FsResult<Stat> {
            self.seen.lock().push(alloc::format!("{}:{path}", self.name));
            Ok(Stat { size: 0, file_type: cupid_api_types::fs::FileType::File })
        }
    }

    fn recorder(name: &'static str, seen: &Arc<spin::Mutex<Vec<String>>>) -> Box<dyn FileSystem> {
        Box::new(Recorder { name, seen: seen.clone() })
    }

    #[test]
    fn longest_prefix_wins_regardless_of_mount_order() {
        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        let mut vfs = Vfs::new();
        vfs.mount("/home/user", recorder("deep", &seen)).unwrap();
        vfs.mount("/home", recorder("mid", &seen)).unwrap();
        vfs.mount("/", recorder("root", &seen)).unwrap();

        vfs.stat("/home/user/notes").unwrap();
        vfs.stat("/home/other").unwrap();
        vfs.stat("/homework").unwrap();
        vfs.stat("/home/user").unwrap();
        assert_eq!(
            *seen.lock(),
            vec!["deep:/notes", "mid:/other", "root:/homework", "deep:/"]
        );
    }

    #[test]
    fn missing_capability_is_not_supported() {
        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        let mut vfs = Vfs::new();
        vfs.mount("/", recorder("root", &seen)).unwrap();
        assert_eq!(vfs.mkdir("/x"), Err(Errno::NotSupported));
        assert_eq!(vfs.open("/x", OpenFlags::READ), Err(Errno::NotSupported));
    }

    #[test]
    fn descriptors_are_validated() {
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(Ramfs::new())).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(3, &mut buf), Err(Errno::BadDescriptor));
        assert_eq!(vfs.close(MAX_OPEN_FILES + 1), Err(Errno::BadDescriptor));

        let fd = vfs.open("/f", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        assert_eq!(vfs.read(fd, &mut buf), Err(Errno::BadDescriptor));
        vfs.close(fd).unwrap();
        assert_eq!(vfs.write(fd, b"x"), Err(Errno::BadDescriptor));
    }

    #[test]
    fn unmount_is_refused_while_files_are_open() {
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(Ramfs::new())).unwrap();
        vfs.mount("/tmp", Box::new(Ramfs::new())).unwrap();
        let fd = vfs.open("/tmp/a", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        assert_eq!(vfs.unmount("/tmp"), Err(Errno::Busy));
        vfs.close(fd).unwrap();
        vfs.unmount("/tmp").unwrap();
        assert_eq!(vfs.stat("/tmp/a"), Err(Errno::NotFound));
    }

    #[test]
    fn duplicate_mount_points_are_rejected() {
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(Ramfs::new())).unwrap();
        assert_eq!(vfs.mount("//", Box::new(Ramfs::new())), Err(Errno::AlreadyExists));
        assert_eq!(vfs.list_mounts().len(), 1);
    }

    #[test]
    fn fd_table_is_bounded() {
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(Ramfs::new())).unwrap();
        vfs.write_all("/f", b"x", false).unwrap();
        for _ in 0..MAX_OPEN_FILES {
            vfs.open("/f", OpenFlags::READ).unwrap();
        }
        assert_eq!(vfs.open("/f", OpenFlags::READ), Err(Errno::NoSpace));
    }

    #[test]
    fn dup_shares_position_until_last_close() {
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(Ramfs::new())).unwrap();
        vfs.write_all("/f", b"abcdef", false).unwrap();
        let a = vfs.open("/f", OpenFlags::READ).unwrap();
        let b = vfs.dup(a).unwrap();
        let mut buf = [0u8; 3];
        vfs.read(a, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        vfs.close(a).unwrap();
        vfs.read(b, &mut buf).unwrap();
        assert_eq!(&buf, b"def");
        vfs.close(b).unwrap();
        assert_eq!(vfs.open_count(), 0);
    }

    #[test]
    fn relative_paths_are_rejected() {
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(Ramfs::new())).unwrap();
        assert_eq!(vfs.stat("bin"), Err(Errno::InvalidArgument));
        assert_eq!(vfs.stat("/bin/../tmp"), Err(Errno::InvalidArgument));
    }
}
