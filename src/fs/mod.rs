//! FUSE surface: one `rfuse3` filesystem dispatching on inodes.
//!
//! The root lists namespace directories, namespace directories list resource
//! files, and files are backed by [`resource::ResourceFile`]. File handles
//! are direct-I/O so every read reaches the resource node and the oversized
//! reported length never feeds stale page-cache data to tools.

pub mod mount;
pub mod resource;
pub mod tree;

use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use futures_util::stream::{Stream, iter};
use kube::Client;
use log::{debug, info, warn};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, Inode, Result, SetAttr, Timestamp};

use self::resource::{ResourceFile, skeleton_manifest};
use self::tree::{NamespaceDir, Node, ROOT_INO, Tree};
use crate::cluster::discovery;
use crate::config::ConfigStore;
use crate::filename;
use crate::filters;

/// Entry/attr validity. Kept short so tree changes show up on the next
/// access.
const TTL: Duration = Duration::from_millis(1);

/// FUSE open flag requesting direct I/O for the handle.
const FOPEN_DIRECT_IO: u32 = 1 << 0;

const MAX_WRITE: NonZeroU32 = NonZeroU32::new(1024 * 1024).unwrap();

pub(crate) fn errno(code: libc::c_int) -> Errno {
    std::io::Error::from_raw_os_error(code).into()
}

pub(crate) fn timestamp(t: SystemTime) -> Timestamp {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => Timestamp::new(d.as_secs() as i64, d.subsec_nanos()),
        Err(_) => Timestamp::new(0, 0),
    }
}

pub struct KubeFs {
    client: Client,
    config: Arc<ConfigStore>,
    tree: Arc<Tree>,
}

impl KubeFs {
    pub fn new(client: Client, config: Arc<ConfigStore>, tree: Arc<Tree>) -> Self {
        KubeFs {
            client,
            config,
            tree,
        }
    }

    fn root_attr(&self) -> FileAttr {
        dir_attr(ROOT_INO, self.tree.created_at)
    }

    fn node(&self, ino: Inode) -> Result<Node> {
        self.tree.node(ino).ok_or_else(|| errno(libc::ENOENT))
    }

    fn resource(&self, ino: Inode) -> Result<Arc<ResourceFile>> {
        match self.node(ino)? {
            Node::Resource(file) => Ok(file),
            Node::Namespace(_) => Err(errno(libc::EISDIR)),
        }
    }

    fn namespace_dir(&self, ino: Inode) -> Result<Arc<NamespaceDir>> {
        if ino == ROOT_INO {
            return Err(errno(libc::EPERM));
        }
        match self.node(ino)? {
            Node::Namespace(dir) => Ok(dir),
            Node::Resource(_) => Err(errno(libc::ENOTDIR)),
        }
    }

    fn attr_of(&self, ino: Inode) -> Result<FileAttr> {
        if ino == ROOT_INO {
            return Ok(self.root_attr());
        }
        Ok(match self.node(ino)? {
            Node::Namespace(dir) => dir_attr(dir.ino, dir.created_at),
            Node::Resource(file) => file.attr(),
        })
    }

    fn entries_for(&self, parent: Inode) -> Result<Vec<(u64, FileType, String, FileAttr)>> {
        let mut entries = Vec::new();
        if parent == ROOT_INO {
            let root = self.root_attr();
            entries.push((ROOT_INO, FileType::Directory, ".".to_string(), root));
            entries.push((ROOT_INO, FileType::Directory, "..".to_string(), root));
            for dir in self.tree.namespace_dirs() {
                entries.push((
                    dir.ino,
                    FileType::Directory,
                    dir.name.clone(),
                    dir_attr(dir.ino, dir.created_at),
                ));
            }
            return Ok(entries);
        }

        let dir = match self.node(parent)? {
            Node::Namespace(dir) => dir,
            Node::Resource(_) => return Err(errno(libc::ENOTDIR)),
        };
        entries.push((
            dir.ino,
            FileType::Directory,
            ".".to_string(),
            dir_attr(dir.ino, dir.created_at),
        ));
        entries.push((
            ROOT_INO,
            FileType::Directory,
            "..".to_string(),
            self.root_attr(),
        ));
        for (basename, file) in dir.children() {
            entries.push((file.ino, FileType::RegularFile, basename, file.attr()));
        }
        Ok(entries)
    }
}

fn dir_attr(ino: u64, created_at: SystemTime) -> FileAttr {
    let ts = timestamp(created_at);
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: ts,
        mtime: ts,
        ctime: ts,
        kind: FileType::Directory,
        perm: 0o555,
        nlink: 2,
        uid: 1000,
        gid: 1000,
        rdev: 0,
        blksize: 4096,
    }
}

impl Filesystem for KubeFs {
    async fn init(&self, _req: Request) -> Result<ReplyInit> {
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: Inode, name: &OsStr) -> Result<ReplyEntry> {
        let name = name.to_str().ok_or_else(|| errno(libc::ENOENT))?;
        if parent == ROOT_INO {
            let dir = self.tree.namespace(name).ok_or_else(|| errno(libc::ENOENT))?;
            return Ok(ReplyEntry {
                ttl: TTL,
                attr: dir_attr(dir.ino, dir.created_at),
                generation: 0,
            });
        }
        let dir = self.namespace_dir(parent)?;
        let file = dir.child(name).ok_or_else(|| errno(libc::ENOENT))?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: file.attr(),
            generation: 0,
        })
    }

    async fn forget(&self, _req: Request, _inode: Inode, _nlookup: u64) {}

    async fn getattr(
        &self,
        _req: Request,
        inode: Inode,
        _fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr> {
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_of(inode)?,
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        inode: Inode,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr> {
        if let Ok(file) = self.resource(inode)
            && let Some(size) = set_attr.size
        {
            file.set_size(size).await?;
        }
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_of(inode)?,
        })
    }

    async fn open(&self, _req: Request, inode: Inode, _flags: u32) -> Result<ReplyOpen> {
        let file = self.resource(inode)?;
        let cfg = self.config.get();
        file.open(&self.client, &cfg).await?;
        Ok(ReplyOpen {
            fh: 0,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn read(
        &self,
        _req: Request,
        inode: Inode,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData> {
        let file = self.resource(inode)?;
        let cfg = self.config.get();
        let data = file.read_at(&self.client, &cfg, offset, size).await?;
        Ok(ReplyData { data: data.into() })
    }

    async fn write(
        &self,
        _req: Request,
        inode: Inode,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite> {
        let file = self.resource(inode)?;
        let written = file.write_at(offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn flush(&self, _req: Request, inode: Inode, _fh: u64, _lock_owner: u64) -> Result<()> {
        let file = self.resource(inode)?;
        let cfg = self.config.get();
        file.flush(&self.client, &cfg).await
    }

    async fn release(
        &self,
        _req: Request,
        inode: Inode,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<()> {
        // An unlinked node may already be gone from the tree; nothing to do.
        let Ok(file) = self.resource(inode) else {
            return Ok(());
        };
        let cfg = self.config.get();
        file.flush(&self.client, &cfg).await
    }

    async fn opendir(&self, _req: Request, inode: Inode, _flags: u32) -> Result<ReplyOpen> {
        if inode != ROOT_INO {
            self.namespace_dir(inode)?;
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn releasedir(&self, _req: Request, _inode: Inode, _fh: u64, _flags: u32) -> Result<()> {
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        parent: Inode,
        _fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<impl Stream<Item = Result<DirectoryEntry>> + Send + 'a>> {
        let entries: Vec<Result<DirectoryEntry>> = self
            .entries_for(parent)?
            .into_iter()
            .enumerate()
            .map(|(idx, (inode, kind, name, _attr))| {
                Ok(DirectoryEntry {
                    inode,
                    kind,
                    name: name.into(),
                    offset: (idx + 1) as i64,
                })
            })
            .skip(offset.max(0) as usize)
            .collect();
        Ok(ReplyDirectory {
            entries: iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: Inode,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<impl Stream<Item = Result<DirectoryEntryPlus>> + Send + 'a>> {
        let entries: Vec<Result<DirectoryEntryPlus>> = self
            .entries_for(parent)?
            .into_iter()
            .enumerate()
            .map(|(idx, (inode, kind, name, attr))| {
                Ok(DirectoryEntryPlus {
                    inode,
                    generation: 0,
                    kind,
                    name: name.into(),
                    offset: (idx + 1) as i64,
                    attr,
                    entry_ttl: TTL,
                    attr_ttl: TTL,
                })
            })
            .skip(offset as usize)
            .collect();
        Ok(ReplyDirectoryPlus {
            entries: iter(entries),
        })
    }

    async fn create(
        &self,
        _req: Request,
        parent: Inode,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> Result<ReplyCreated> {
        let dir = self.namespace_dir(parent)?;
        let basename = name.to_str().ok_or_else(|| errno(libc::EINVAL))?;
        let cfg = self.config.get();
        debug!("Create requested: {}/{}", dir.name, basename);

        if !cfg.allow_create {
            warn!("Create blocked (allowCreate=false): {}/{}", dir.name, basename);
            return Err(errno(libc::EPERM));
        }
        if dir.clusterwide && !cfg.is_cluster_scope() {
            return Err(errno(libc::EPERM));
        }
        if !dir.clusterwide && !cfg.allows_namespace(&dir.name) {
            return Err(errno(libc::EPERM));
        }
        if dir.child(basename).is_some() {
            warn!("Create failed: {}/{} already exists", dir.name, basename);
            return Err(errno(libc::EEXIST));
        }

        let parsed = filename::parse(basename).ok_or_else(|| {
            warn!("Create failed: invalid filename {}/{}", dir.name, basename);
            errno(libc::EINVAL)
        })?;
        let kind = match discovery::resolve_kind(
            &self.client,
            &parsed.group,
            &parsed.version,
            &parsed.kind,
        )
        .await
        {
            Ok(Some(kind)) => kind,
            Ok(None) => {
                warn!("Create failed: unknown kind for {}/{}", dir.name, basename);
                return Err(errno(libc::EINVAL));
            }
            Err(err) => {
                warn!("Failed to resolve kind for {basename}: {err:?}");
                return Err(errno(libc::EIO));
            }
        };
        if !filters::allows_resource(&cfg, &kind.group, &kind.plural) {
            warn!("Create blocked by filters: {}/{}", dir.name, basename);
            return Err(errno(libc::EPERM));
        }

        let namespace = if dir.clusterwide {
            None
        } else {
            Some(dir.name.as_str())
        };
        let data = skeleton_manifest(&kind, &parsed.name, namespace).into_bytes();
        let file = self
            .tree
            .insert_created(&dir, basename, &kind, &parsed.name, data)
            .ok_or_else(|| errno(libc::EEXIST))?;
        info!("Created {}", file.log_ref());
        Ok(ReplyCreated {
            ttl: TTL,
            attr: file.attr(),
            generation: 0,
            fh: 0,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn unlink(&self, _req: Request, parent: Inode, name: &OsStr) -> Result<()> {
        let dir = self.namespace_dir(parent)?;
        let basename = name.to_str().ok_or_else(|| errno(libc::ENOENT))?;
        let cfg = self.config.get();

        if !cfg.allow_delete {
            warn!("Delete blocked (allowDelete=false): {}/{}", dir.name, basename);
            return Err(errno(libc::EPERM));
        }
        let file = dir.child(basename).ok_or_else(|| errno(libc::ENOENT))?;
        file.delete(&self.client).await?;
        self.tree.remove_child(&dir, basename);
        info!("Deleted {}", file.log_ref());
        Ok(())
    }

    async fn access(&self, _req: Request, _inode: Inode, _mask: u32) -> Result<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _inode: Inode) -> Result<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }
}
