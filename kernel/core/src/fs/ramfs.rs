//! In-memory tree file system.
//!
//! Nodes live in an arena and link to their parent, first child and next sibling, so
//! each node has exactly one parent and the root has none. File contents grow by
//! doubling up to `RAMFS_NODE_CAP`.

use super::path;
use super::vfs::{FileSystem, FsHandle};
use crate::consts::{RAMFS_MIN_GROWTH, RAMFS_NODE_CAP};
use alloc::vec::Vec;
use cupid_api_types::fs::{DirEntry, FileType, OpenFlags, Stat, Whence, seek_target};
use cupid_api_types::{Errno, FsResult, MAX_NAME};
use heapless::String;

type NodeId = usize;

const ROOT: NodeId = 0;

struct Node {
    name: String<MAX_NAME>,
    kind: FileType,
    data: Vec<u8>,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
    open_handles: u32,
}

struct RamHandle {
    node: NodeId,
    pos: usize,
    flags: OpenFlags,
    /// Next child to return from `readdir`.
    cursor: Option<NodeId>,
}

pub struct Ramfs {
    nodes: Vec<Option<Node>>,
    handles: Vec<Option<RamHandle>>,
}

impl Default for Ramfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Ramfs {
    pub fn new() -> Self {
        let root = Node {
            name: String::new(),
            kind: FileType::Directory,
            data: Vec::new(),
            parent: None,
            first_child: None,
            next_sibling: None,
            open_handles: 0,
        };
        Self { nodes: alloc::vec![Some(root)], handles: Vec::new() }
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("ramfs: dangling node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("ramfs: dangling node id")
    }

    fn children(&self, dir: NodeId) -> Children<'_> {
        Children { fs: self, next: self.node(dir).first_child }
    }

    fn find_child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.children(dir).find(|&id| self.node(id).name == name)
    }

    fn lookup(&self, path: &str) -> FsResult<NodeId> {
        let mut current = ROOT;
        for component in path::components(path) {
            if self.node(current).kind != FileType::Directory {
                return Err(Errno::NotADirectory);
            }
            current = self.find_child(current, component).ok_or(Errno::NotFound)?;
        }
        Ok(current)
    }

    fn create_child(&mut self, parent: NodeId, name: &str, kind: FileType) -> FsResult<NodeId> {
        let mut owned = String::new();
        owned.push_str(name).map_err(|_| Errno::InvalidArgument)?;
        let node = Node {
            name: owned,
            kind,
            data: Vec::new(),
            parent: Some(parent),
            first_child: None,
            next_sibling: None,
            open_handles: 0,
        };
        let id = match self.nodes.iter().position(Option::is_none) {
            Some(free) => {
                self.nodes[free] = Some(node);
                free
            }
            None => {
                self.nodes.try_reserve(1).map_err(|_| Errno::NoSpace)?;
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        // Append so listings come out in creation order.
        match self.children(parent).last() {
            Some(last) => self.node_mut(last).next_sibling = Some(id),
            None => self.node_mut(parent).first_child = Some(id),
        }
        Ok(id)
    }

    /// Walks `path`, creating missing directories on the way and, at the end, a file.
    fn create_path(&mut self, path: &str, exclusive: bool) -> FsResult<NodeId> {
        let (parent_path, name) = path::split_last(path).ok_or(Errno::IsADirectory)?;
        let mut dir = ROOT;
        for component in path::components(parent_path) {
            dir = match self.find_child(dir, component) {
                Some(id) if self.node(id).kind == FileType::Directory => id,
                Some(_) => return Err(Errno::NotADirectory),
                None => self.create_child(dir, component, FileType::Directory)?,
            };
        }
        match self.find_child(dir, name) {
            Some(_) if exclusive => Err(Errno::AlreadyExists),
            Some(id) => Ok(id),
            None => self.create_child(dir, name, FileType::File),
        }
    }

    fn handle_mut(&mut self, handle: FsHandle) -> FsResult<&mut RamHandle> {
        self.handles
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(Errno::BadDescriptor)
    }

    /// Makes room for `end` bytes of file data, doubling the buffer.
    fn grow(data: &mut Vec<u8>, end: usize) -> FsResult<()> {
        if end <= data.capacity() {
            return Ok(());
        }
        let target = (data.capacity() * 2).max(end).max(RAMFS_MIN_GROWTH).min(RAMFS_NODE_CAP);
        data.try_reserve_exact(target - data.len()).map_err(|_| Errno::NoSpace)
    }
}

struct Children<'a> {
    fs: &'a Ramfs,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.fs.node(id).next_sibling;
        Some(id)
    }
}

impl FileSystem for Ramfs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<FsHandle> {
        let node = if flags.contains(OpenFlags::CREATE) {
            self.create_path(path, flags.contains(OpenFlags::EXCLUSIVE))?
        } else {
            self.lookup(path)?
        };
        let is_dir = self.node(node).kind == FileType::Directory;
        if is_dir && flags.contains(OpenFlags::WRITE) {
            return Err(Errno::IsADirectory);
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            self.node_mut(node).data.clear();
        }
        let cursor = if is_dir { self.node(node).first_child } else { None };
        let handle = RamHandle { node, pos: 0, flags, cursor };
        let idx = match self.handles.iter().position(Option::is_none) {
            Some(free) => {
                self.handles[free] = Some(handle);
                free
            }
            None => {
                self.handles.push(Some(handle));
                self.handles.len() - 1
            }
        };
        self.node_mut(node).open_handles += 1;
        Ok(idx as FsHandle)
    }

    fn close(&mut self, handle: FsHandle) -> FsResult<()> {
        let node = self.handle_mut(handle)?.node;
        self.handles[handle as usize] = None;
        self.node_mut(node).open_handles -= 1;
        Ok(())
    }

    fn read(&mut self, handle: FsHandle, buf: &mut [u8]) -> FsResult<usize> {
        let h = self.handle_mut(handle)?;
        let (node_id, pos) = (h.node, h.pos);
        let node = self.node(node_id);
        if node.kind == FileType::Directory {
            return Err(Errno::IsADirectory);
        }
        let available = node.data.len().saturating_sub(pos);
        let n = available.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        buf[..n].copy_from_slice(&node.data[pos..pos + n]);
        self.handle_mut(handle)?.pos += n;
        Ok(n)
    }

    fn write(&mut self, handle: FsHandle, buf: &[u8]) -> FsResult<usize> {
        let h = self.handle_mut(handle)?;
        let (node_id, flags, pos) = (h.node, h.flags, h.pos);
        let data = &mut self.node_mut(node_id).data;
        let start = if flags.contains(OpenFlags::APPEND) { data.len() } else { pos };
        if start >= RAMFS_NODE_CAP {
            return Err(Errno::NoSpace);
        }
        let end = (start + buf.len()).min(RAMFS_NODE_CAP);
        Self::grow(data, end)?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(&buf[..end - start]);
        self.handle_mut(handle)?.pos = end;
        Ok(end - start)
    }

    fn seek(&mut self, handle: FsHandle, offset: i64, whence: Whence) -> FsResult<u64> {
        let h = self.handle_mut(handle)?;
        let (node_id, pos) = (h.node, h.pos);
        let size = self.node(node_id).data.len() as u64;
        let target = seek_target(pos as u64, size, offset, whence).ok_or(Errno::InvalidArgument)?;
        self.handle_mut(handle)?.pos = usize::try_from(target).map_err(|_| Errno::InvalidArgument)?;
        Ok(target)
    }

    fn stat(&mut self, path: &str) -> FsResult<Stat> {
        let node = self.node(self.lookup(path)?);
        Ok(Stat { size: node.data.len() as u64, file_type: node.kind })
    }

    fn readdir(&mut self, handle: FsHandle) -> FsResult<Option<DirEntry>> {
        let h = self.handle_mut(handle)?;
        let (dir, cursor) = (h.node, h.cursor);
        if self.node(dir).kind != FileType::Directory {
            return Err(Errno::NotADirectory);
        }
        let Some(id) = cursor else {
            return Ok(None);
        };
        let node = self.node(id);
        let entry = DirEntry::new(&node.name, node.data.len() as u64, node.kind).ok_or(Errno::Io)?;
        let next = node.next_sibling;
        self.handle_mut(handle)?.cursor = next;
        Ok(Some(entry))
    }

    fn mkdir(&mut self, path: &str) -> FsResult<()> {
        let (parent_path, name) = path::split_last(path).ok_or(Errno::AlreadyExists)?;
        let parent = self.lookup(parent_path)?;
        if self.node(parent).kind != FileType::Directory {
            return Err(Errno::NotADirectory);
        }
        if self.find_child(parent, name).is_some() {
            return Err(Errno::AlreadyExists);
        }
        self.create_child(parent, name, FileType::Directory)?;
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> FsResult<()> {
        let id = self.lookup(path)?;
        if id == ROOT {
            return Err(Errno::InvalidArgument);
        }
        let node = self.node(id);
        if node.first_child.is_some() {
            return Err(Errno::NotEmpty);
        }
        if node.open_handles > 0 {
            return Err(Errno::Busy);
        }
        let (parent, next) = (node.parent.unwrap_or(ROOT), node.next_sibling);

        let prev = self.children(parent).take_while(|&c| c != id).last();
        match prev {
            Some(prev) => self.node_mut(prev).next_sibling = next,
            None => self.node_mut(parent).first_child = next,
        }
        // Directory listings in progress skip over the removed entry.
        for h in self.handles.iter_mut().flatten() {
            if h.cursor == Some(id) {
                h.cursor = next;
            }
        }
        self.nodes[id] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    const RW_CREATE: OpenFlags = OpenFlags::READ_WRITE.union(OpenFlags::CREATE);

    fn names(fs: &mut Ramfs, path: &str) -> Vec<std::string::String> {
        let h = fs.open(path, OpenFlags::READ).unwrap();
        let mut out = Vec::new();
        while let Some(entry) = fs.readdir(h).unwrap() {
            out.push(std::string::String::from(entry.name.as_str()));
        }
        fs.close(h).unwrap();
        out
    }

    #[test]
    fn write_seek_read() {
        let mut fs = Ramfs::new();
        let h = fs.open("/a", RW_CREATE).unwrap();
        assert_eq!(fs.write(h, b"hello world").unwrap(), 11);
        assert_eq!(fs.seek(h, 6, Whence::Set).unwrap(), 6);
        let mut buf = [0u8; 16];
        let n = fs.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(fs.read(h, &mut buf).unwrap(), 0);
        assert_eq!(fs.seek(h, -1, Whence::Set), Err(Errno::InvalidArgument));
    }

    #[test]
    fn create_makes_intermediate_directories() {
        let mut fs = Ramfs::new();
        let h = fs.open("/a/b/c.txt", RW_CREATE).unwrap();
        fs.close(h).unwrap();
        assert!(fs.stat("/a").unwrap().is_dir());
        assert!(fs.stat("/a/b").unwrap().is_dir());
        assert_eq!(fs.stat("/a/b/c.txt").unwrap().file_type, FileType::File);
    }

    #[test]
    fn every_node_has_one_parent() {
        let mut fs = Ramfs::new();
        fs.mkdir("/d").unwrap();
        for p in ["/d/x", "/d/y", "/z"] {
            let h = fs.open(p, RW_CREATE).unwrap();
            fs.close(h).unwrap();
        }
        for id in 1..fs.nodes.len() {
            let Some(node) = fs.nodes[id].as_ref() else { continue };
            let parent = node.parent.unwrap();
            assert_eq!(fs.children(parent).filter(|&c| c == id).count(), 1);
        }
        assert!(fs.node(ROOT).parent.is_none());
    }

    #[test]
    fn readdir_lists_in_creation_order() {
        let mut fs = Ramfs::new();
        fs.mkdir("/bin").unwrap();
        fs.mkdir("/tmp").unwrap();
        let h = fs.open("/readme", RW_CREATE).unwrap();
        fs.close(h).unwrap();
        assert_eq!(names(&mut fs, "/"), ["bin", "tmp", "readme"]);
    }

    #[test]
    fn unlink_rules() {
        let mut fs = Ramfs::new();
        let h = fs.open("/d/f", RW_CREATE).unwrap();
        assert_eq!(fs.unlink("/d"), Err(Errno::NotEmpty));
        assert_eq!(fs.unlink("/d/f"), Err(Errno::Busy));
        fs.close(h).unwrap();
        fs.unlink("/d/f").unwrap();
        fs.unlink("/d").unwrap();
        assert_eq!(fs.stat("/d"), Err(Errno::NotFound));
        assert_eq!(fs.unlink("/"), Err(Errno::InvalidArgument));
    }

    #[test]
    fn mkdir_existing_is_an_error() {
        let mut fs = Ramfs::new();
        fs.mkdir("/x").unwrap();
        assert_eq!(fs.mkdir("/x"), Err(Errno::AlreadyExists));
        assert_eq!(fs.mkdir("/missing/x"), Err(Errno::NotFound));
    }

    #[test]
    fn append_and_truncate() {
        let mut fs = Ramfs::new();
        let h = fs.open("/log", RW_CREATE).unwrap();
        fs.write(h, b"one\n").unwrap();
        fs.close(h).unwrap();
        let h = fs.open("/log", OpenFlags::WRITE | OpenFlags::APPEND).unwrap();
        fs.write(h, b"two\n").unwrap();
        fs.close(h).unwrap();
        assert_eq!(fs.stat("/log").unwrap().size, 8);
        let h = fs.open("/log", OpenFlags::WRITE | OpenFlags::TRUNCATE).unwrap();
        fs.close(h).unwrap();
        assert_eq!(fs.stat("/log").unwrap().size, 0);
    }

    #[test]
    fn file_size_is_capped() {
        let mut fs = Ramfs::new();
        let h = fs.open("/big", RW_CREATE).unwrap();
        fs.seek(h, (RAMFS_NODE_CAP - 4) as i64, Whence::Set).unwrap();
        assert_eq!(fs.write(h, b"12345678").unwrap(), 4);
        assert_eq!(fs.write(h, b"x"), Err(Errno::NoSpace));
        assert_eq!(fs.stat("/big").unwrap().size, RAMFS_NODE_CAP as u64);
    }

    #[test]
    fn exclusive_create_and_directory_writes() {
        let mut fs = Ramfs::new();
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE;
        let h = fs.open("/once", flags).unwrap();
        fs.close(h).unwrap();
        assert_eq!(fs.open("/once", flags), Err(Errno::AlreadyExists));
        fs.mkdir("/dir").unwrap();
        assert_eq!(fs.open("/dir", OpenFlags::WRITE), Err(Errno::IsADirectory));
        let h = fs.open("/dir", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fs.read(h, &mut buf), Err(Errno::IsADirectory));
    }
}
