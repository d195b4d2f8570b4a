//! FUSE adapter over the node engine.
//!
//! fuser dispatches callbacks synchronously; every operation hops onto the
//! daemon's tokio runtime with `block_on` and runs the async engine op.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
        TimeOrNow,
    };
    use tokio::runtime::Handle;

    use crate::node::{
        mode, now_nanos, AttrChanges, Errno, Node, NodeAttr, NodeFactory, ROOT_INO,
    };

    const TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u32 = 4096;

    pub struct BurrowFs {
        factory: Arc<NodeFactory>,
        runtime: Handle,
        nodes: HashMap<u64, Arc<Node>>,
    }

    impl BurrowFs {
        pub fn new(factory: Arc<NodeFactory>, root: Arc<Node>, runtime: Handle) -> BurrowFs {
            let mut nodes = HashMap::new();
            nodes.insert(ROOT_INO, root);
            BurrowFs {
                factory,
                runtime,
                nodes,
            }
        }

        pub fn mount(self, mountpoint: &Path) -> std::io::Result<()> {
            let options = [
                MountOption::FSName("burrow".to_owned()),
                MountOption::DefaultPermissions,
            ];
            fuser::mount2(self, mountpoint, &options)
        }

        fn node(&self, ino: u64) -> Option<Arc<Node>> {
            self.nodes.get(&ino).cloned()
        }

        fn remember(&mut self, node: &Arc<Node>) {
            self.nodes.insert(node.ino, node.clone());
        }

        fn file_attr(attr: NodeAttr) -> FileAttr {
            let kind = if mode::is_dir(attr.mode) {
                FileType::Directory
            } else if mode::is_symlink(attr.mode) {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            FileAttr {
                ino: attr.ino,
                size: attr.size,
                blocks: attr.size.div_ceil(512),
                atime: timestamp(attr.atime),
                mtime: timestamp(attr.mtime),
                ctime: timestamp(attr.ctime),
                crtime: timestamp(attr.ctime),
                kind,
                perm: (attr.mode & 0o7777) as u16,
                nlink: if kind == FileType::Directory { 2 } else { 1 },
                uid: attr.uid,
                gid: attr.gid,
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE,
            }
        }
    }

    fn timestamp(nanos: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(nanos)
    }

    fn to_nanos(t: TimeOrNow) -> u64 {
        match t {
            TimeOrNow::SpecificTime(t) => t
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            TimeOrNow::Now => now_nanos(),
        }
    }

    fn name_str(name: &OsStr) -> Result<&str, Errno> {
        name.to_str().ok_or(libc::ENOENT)
    }

    impl Filesystem for BurrowFs {
        fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(parent) = self.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let result = self.runtime.block_on(async {
                let child = self.factory.lookup(&parent, name).await?;
                let attr = self.factory.getattr(&child).await?;
                Ok::<_, Errno>((child, attr))
            });
            match result {
                Ok((child, attr)) => {
                    self.remember(&child);
                    reply.entry(&TTL, &Self::file_attr(attr), 0);
                }
                Err(errno) => reply.error(errno),
            }
        }

        fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
            if ino != ROOT_INO {
                self.nodes.remove(&ino);
            }
        }

        fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.runtime.block_on(self.factory.getattr(&node)) {
                Ok(attr) => reply.attr(&TTL, &Self::file_attr(attr)),
                Err(errno) => reply.error(errno),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn setattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            set_mode: Option<u32>,
            uid: Option<u32>,
            gid: Option<u32>,
            size: Option<u64>,
            atime: Option<TimeOrNow>,
            mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let changes = AttrChanges {
                mode: set_mode,
                uid,
                gid,
                size,
                atime: atime.map(to_nanos),
                mtime: mtime.map(to_nanos),
            };
            match self.runtime.block_on(self.factory.setattr(&node, changes)) {
                Ok(attr) => reply.attr(&TTL, &Self::file_attr(attr)),
                Err(errno) => reply.error(errno),
            }
        }

        fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.runtime.block_on(self.factory.readlink(&node)) {
                Ok(target) => reply.data(&target),
                Err(errno) => reply.error(errno),
            }
        }

        fn mkdir(
            &mut self,
            req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            mode_arg: u32,
            umask: u32,
            reply: ReplyEntry,
        ) {
            let Some(parent) = self.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let perm = mode_arg & !umask;
            let result = self.runtime.block_on(async {
                let child = self
                    .factory
                    .mkdir(&parent, name, perm, req.uid(), req.gid())
                    .await?;
                let attr = self.factory.getattr(&child).await?;
                Ok::<_, Errno>((child, attr))
            });
            match result {
                Ok((child, attr)) => {
                    self.remember(&child);
                    reply.entry(&TTL, &Self::file_attr(attr), 0);
                }
                Err(errno) => reply.error(errno),
            }
        }

        fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(parent) = self.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            match self.runtime.block_on(self.factory.unlink(&parent, name)) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        }

        fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(parent) = self.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            match self.runtime.block_on(self.factory.rmdir(&parent, name)) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        }

        fn symlink(
            &mut self,
            req: &Request<'_>,
            parent: u64,
            link_name: &OsStr,
            target: &Path,
            reply: ReplyEntry,
        ) {
            let Some(parent) = self.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(link_name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let target = target.as_os_str().as_bytes();
            let result = self.runtime.block_on(async {
                let child = self
                    .factory
                    .symlink(&parent, name, target, req.uid(), req.gid())
                    .await?;
                let attr = self.factory.getattr(&child).await?;
                Ok::<_, Errno>((child, attr))
            });
            match result {
                Ok((child, attr)) => {
                    self.remember(&child);
                    reply.entry(&TTL, &Self::file_attr(attr), 0);
                }
                Err(errno) => reply.error(errno),
            }
        }

        fn rename(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            let (Some(src), Some(dst)) = (self.node(parent), self.node(newparent)) else {
                reply.error(libc::ENOENT);
                return;
            };
            let (Ok(name), Ok(newname)) = (name_str(name), name_str(newname)) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self
                .runtime
                .block_on(self.factory.rename(&src, name, &dst, newname))
            {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        }

        fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
            reply.opened(0, 0);
        }

        fn read(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let offset = offset.max(0) as u64;
            match self.runtime.block_on(self.factory.read(&node, offset, size)) {
                Ok(data) => reply.data(&data),
                Err(errno) => reply.error(errno),
            }
        }

        fn write(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let offset = offset.max(0) as u64;
            match self.runtime.block_on(self.factory.write(&node, offset, data)) {
                Ok(written) => reply.written(written),
                Err(errno) => reply.error(errno),
            }
        }

        fn flush(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            _fh: u64,
            _lock_owner: u64,
            reply: ReplyEmpty,
        ) {
            // Writes commit synchronously; nothing is buffered here.
            reply.ok();
        }

        fn release(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            _fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            reply.ok();
        }

        fn readdir(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let Some(dir) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let entries = match self.runtime.block_on(self.factory.readdir(&dir)) {
                Ok(entries) => entries,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            if offset == 0 {
                if reply.add(ino, 1, FileType::Directory, ".") {
                    reply.ok();
                    return;
                }
                if reply.add(ROOT_INO, 2, FileType::Directory, "..") {
                    reply.ok();
                    return;
                }
            }
            let skip = if offset > 2 { (offset - 2) as usize } else { 0 };
            for (i, entry) in entries.iter().enumerate().skip(skip) {
                let kind = if mode::is_dir(entry.mode) {
                    FileType::Directory
                } else if mode::is_symlink(entry.mode) {
                    FileType::Symlink
                } else {
                    FileType::RegularFile
                };
                if reply.add(entry.ino, (i + 3) as i64, kind, &entry.name) {
                    break;
                }
            }
            reply.ok();
        }

        fn setxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            value: &[u8],
            _flags: i32,
            _position: u32,
            reply: ReplyEmpty,
        ) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            match self
                .runtime
                .block_on(self.factory.setxattr(&node, name, value))
            {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        }

        fn getxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            size: u32,
            reply: ReplyXattr,
        ) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            match self.runtime.block_on(self.factory.getxattr(&node, name)) {
                Ok(value) => {
                    if size == 0 {
                        reply.size(value.len() as u32);
                    } else if value.len() <= size as usize {
                        reply.data(&value);
                    } else {
                        reply.error(libc::ERANGE);
                    }
                }
                Err(errno) => reply.error(errno),
            }
        }

        fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            match self.runtime.block_on(self.factory.listxattr(&node)) {
                Ok(names) => {
                    let mut data = Vec::new();
                    for name in names {
                        data.extend_from_slice(name.as_bytes());
                        data.push(0);
                    }
                    if size == 0 {
                        reply.size(data.len() as u32);
                    } else if data.len() <= size as usize {
                        reply.data(&data);
                    } else {
                        reply.error(libc::ERANGE);
                    }
                }
                Err(errno) => reply.error(errno),
            }
        }

        fn removexattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            reply: ReplyEmpty,
        ) {
            let Some(node) = self.node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            match self.runtime.block_on(self.factory.removexattr(&node, name)) {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        }

        fn create(
            &mut self,
            req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            mode_arg: u32,
            umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            let Some(parent) = self.node(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let name = match name_str(name) {
                Ok(name) => name,
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            };
            let perm = mode_arg & !umask;
            let result = self.runtime.block_on(async {
                let child = self
                    .factory
                    .create(&parent, name, perm, req.uid(), req.gid())
                    .await?;
                let attr = self.factory.getattr(&child).await?;
                Ok::<_, Errno>((child, attr))
            });
            match result {
                Ok((child, attr)) => {
                    self.remember(&child);
                    reply.created(&TTL, &Self::file_attr(attr), 0, 0, 0);
                }
                Err(errno) => reply.error(errno),
            }
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::path::Path;
    use std::sync::Arc;

    use tokio::runtime::Handle;

    use crate::node::{Node, NodeFactory};

    /// Stub for platforms or builds without FUSE support.
    pub struct BurrowFs;

    impl BurrowFs {
        pub fn new(_factory: Arc<NodeFactory>, _root: Arc<Node>, _runtime: Handle) -> BurrowFs {
            BurrowFs
        }

        pub fn mount(self, _mountpoint: &Path) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "built without FUSE support",
            ))
        }
    }
}

pub use imp::BurrowFs;
