//! Per-file state machine for one cluster object.
//!
//! A resource file buffers the object's YAML between open and release. Reads
//! serve the buffer; writes mark it dirty; flush/release applies the buffer
//! back to the cluster (update, create on not-found). The buffer mutex
//! serializes all of this so a write can never interleave with an apply.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

use kube::Client;
use kube::api::{DeleteParams, PostParams};
use log::{error, info, warn};
use rfuse3::FileType;
use rfuse3::raw::reply::FileAttr;
use tokio::sync::Mutex;

use super::{errno, timestamp};
use crate::cluster::{self, KindRef};
use crate::config::Config;
use crate::filename;

/// Reported sizes start at 1 MiB regardless of the real buffer length so
/// standard tools do not truncate their reads early; `read` returns EOF at
/// the true length. The change counter is added so attribute refreshes are
/// observable.
pub const SIZE_FLOOR: u64 = 1024 * 1024;

struct Buffer {
    data: Option<Vec<u8>>,
    dirty: bool,
}

pub struct ResourceFile {
    pub ino: u64,
    /// Object name in the cluster.
    pub name: String,
    pub kind: KindRef,
    /// Parent directory name; `clusterwide` for cluster-scoped kinds.
    pub dir: String,
    pub clusterwide: bool,
    changes: AtomicU64,
    /// Unix nanos of the last observed change.
    updated_at: AtomicI64,
    buffer: Mutex<Buffer>,
}

impl ResourceFile {
    pub fn new(ino: u64, name: &str, kind: KindRef, dir: &str, clusterwide: bool) -> Self {
        Self::with_buffer(ino, name, kind, dir, clusterwide, Buffer {
            data: None,
            dirty: false,
        })
    }

    /// A user-created file: seeded with a skeleton manifest and dirty, so the
    /// first flush performs the create.
    pub fn new_dirty(
        ino: u64,
        name: &str,
        kind: KindRef,
        dir: &str,
        clusterwide: bool,
        data: Vec<u8>,
    ) -> Self {
        Self::with_buffer(ino, name, kind, dir, clusterwide, Buffer {
            data: Some(data),
            dirty: true,
        })
    }

    fn with_buffer(
        ino: u64,
        name: &str,
        kind: KindRef,
        dir: &str,
        clusterwide: bool,
        buffer: Buffer,
    ) -> Self {
        ResourceFile {
            ino,
            name: name.to_string(),
            kind,
            dir: dir.to_string(),
            clusterwide,
            changes: AtomicU64::new(0),
            updated_at: AtomicI64::new(now_nanos()),
            buffer: Mutex::new(buffer),
        }
    }

    pub fn basename(&self) -> String {
        filename::render(&self.name, &self.kind.kind, &self.kind.group, &self.kind.version)
    }

    pub fn log_ref(&self) -> String {
        cluster::log_ref(&self.kind, &self.dir, &self.name)
    }

    /// Bump the change counter and mtime; the reported size shifts, so the
    /// kernel refetches attributes on next access.
    pub fn touch(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
        self.updated_at.store(now_nanos(), Ordering::Relaxed);
    }

    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    pub fn attr(&self) -> FileAttr {
        let nanos = self.updated_at.load(Ordering::Relaxed);
        let ts = timestamp(SystemTime::UNIX_EPOCH + std::time::Duration::from_nanos(nanos.max(0) as u64));
        let size = SIZE_FLOOR + self.changes();
        FileAttr {
            ino: self.ino,
            size,
            blocks: size.div_ceil(512),
            atime: ts,
            mtime: ts,
            ctime: ts,
            kind: FileType::RegularFile,
            perm: 0o664,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            blksize: 4096,
        }
    }

    fn namespace_arg(&self) -> Option<&str> {
        if self.clusterwide {
            None
        } else {
            Some(&self.dir)
        }
    }

    /// Fetch-on-open: a clean buffer is refreshed from the cluster; dirty
    /// local edits are kept.
    pub async fn open(&self, client: &Client, cfg: &Config) -> rfuse3::Result<()> {
        let mut buf = self.buffer.lock().await;
        if buf.data.is_none() || !buf.dirty {
            buf.data = Some(self.fetch_yaml(client, cfg).await?);
        }
        Ok(())
    }

    pub async fn read_at(
        &self,
        client: &Client,
        cfg: &Config,
        offset: u64,
        size: u32,
    ) -> rfuse3::Result<Vec<u8>> {
        let mut buf = self.buffer.lock().await;
        if buf.data.is_none() {
            buf.data = Some(self.fetch_yaml(client, cfg).await?);
        }
        let data = buf.data.as_deref().unwrap_or_default();
        Ok(read_slice(data, offset, size))
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> rfuse3::Result<u32> {
        if offset > i64::MAX as u64 {
            warn!("Rejecting write at offset {offset} for {}", self.log_ref());
            return Err(errno(libc::EINVAL));
        }
        let mut buf = self.buffer.lock().await;
        let current = buf.data.get_or_insert_with(Vec::new);
        let end = offset as usize + data.len();
        if end > current.len() {
            current.resize(end, 0);
        }
        current[offset as usize..end].copy_from_slice(data);
        buf.dirty = true;
        self.touch();
        Ok(data.len() as u32)
    }

    /// Truncate or zero-extend the buffer (setattr with a size).
    pub async fn set_size(&self, size: u64) -> rfuse3::Result<()> {
        if size > i64::MAX as u64 {
            return Err(errno(libc::EINVAL));
        }
        let mut buf = self.buffer.lock().await;
        buf.data.get_or_insert_with(Vec::new).resize(size as usize, 0);
        buf.dirty = true;
        Ok(())
    }

    /// Apply local edits to the cluster. A clean buffer is a no-op. The dirty
    /// flag is cleared before the attempt and stays cleared on failure; the
    /// buffer itself is kept for fast re-reads until the next open refreshes
    /// it.
    pub async fn flush(&self, client: &Client, cfg: &Config) -> rfuse3::Result<()> {
        let mut buf = self.buffer.lock().await;
        if !buf.dirty {
            return Ok(());
        }
        buf.dirty = false;
        let data = buf.data.clone().unwrap_or_default();
        self.apply(client, cfg, &data).await
    }

    /// Issue the cluster delete; already-gone objects count as success.
    pub async fn delete(&self, client: &Client) -> rfuse3::Result<()> {
        let api = cluster::dynamic_api(client, &self.kind, self.namespace_arg());
        match api.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if cluster::is_not_found(&err) => Ok(()),
            Err(err) => {
                error!("Delete failed for {}: {err}", self.log_ref());
                Err(errno(cluster::errno_for(&err)))
            }
        }
    }

    async fn fetch_yaml(&self, client: &Client, cfg: &Config) -> rfuse3::Result<Vec<u8>> {
        let api = cluster::dynamic_api(client, &self.kind, self.namespace_arg());
        let obj = api.get(&self.name).await.map_err(|err| {
            error!("Fetch failed for {}: {err}", self.log_ref());
            errno(libc::EACCES)
        })?;
        cluster::to_yaml(&obj, cfg.show_managed_fields).map_err(|err| {
            error!("Failed to render {}: {err:?}", self.log_ref());
            errno(libc::EACCES)
        })
    }

    async fn apply(&self, client: &Client, cfg: &Config, data: &[u8]) -> rfuse3::Result<()> {
        let obj = cluster::prepare_manifest(
            data,
            &self.kind,
            &self.name,
            self.namespace_arg(),
            cfg.show_managed_fields,
        )
        .map_err(|err| {
            warn!("Rejecting manifest for {}: {err}", self.log_ref());
            errno(libc::EINVAL)
        })?;

        let api = cluster::dynamic_api(client, &self.kind, self.namespace_arg());
        let result = match api.replace(&self.name, &PostParams::default(), &obj).await {
            Err(err) if cluster::is_not_found(&err) => {
                api.create(&PostParams::default(), &obj).await
            }
            other => other,
        };

        match result {
            Ok(_) => {
                info!("Applied {}", self.log_ref());
                Ok(())
            }
            Err(err) => {
                error!("Apply failed for {}: {err}", self.log_ref());
                Err(errno(cluster::errno_for(&err)))
            }
        }
    }

    #[cfg(test)]
    async fn is_dirty(&self) -> bool {
        self.buffer.lock().await.dirty
    }

    #[cfg(test)]
    async fn buffered(&self) -> Option<Vec<u8>> {
        self.buffer.lock().await.data.clone()
    }
}

fn read_slice(data: &[u8], offset: u64, size: u32) -> Vec<u8> {
    if offset >= data.len() as u64 {
        return Vec::new();
    }
    let start = offset as usize;
    let end = start.saturating_add(size as usize).min(data.len());
    data[start..end].to_vec()
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Minimal manifest for a freshly created file.
pub fn skeleton_manifest(kind: &KindRef, name: &str, namespace: Option<&str>) -> String {
    let api_version = kind.api_version();
    match namespace {
        Some(ns) => format!(
            "apiVersion: {api_version}\nkind: {}\nmetadata:\n  name: {name}\n  namespace: {ns}\n",
            kind.kind
        ),
        None => format!(
            "apiVersion: {api_version}\nkind: {}\nmetadata:\n  name: {name}\n",
            kind.kind
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_kind() -> KindRef {
        KindRef {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Pod".to_string(),
            plural: "pods".to_string(),
            namespaced: true,
        }
    }

    fn file() -> ResourceFile {
        ResourceFile::new(7, "web", pod_kind(), "x", false)
    }

    #[tokio::test]
    async fn write_extends_with_zero_fill() {
        let file = file();
        assert_eq!(file.write_at(4, b"abc").await.unwrap(), 3);
        assert_eq!(file.buffered().await.unwrap(), b"\0\0\0\0abc");
        assert!(file.is_dirty().await);
        assert_eq!(file.changes(), 1);
    }

    #[tokio::test]
    async fn write_overlays_existing_bytes() {
        let file = file();
        file.write_at(0, b"hello world").await.unwrap();
        file.write_at(6, b"there").await.unwrap();
        assert_eq!(file.buffered().await.unwrap(), b"hello there");
        assert_eq!(file.changes(), 2);
    }

    #[tokio::test]
    async fn write_rejects_absurd_offsets() {
        let file = file();
        let err = file.write_at(u64::MAX, b"x").await.unwrap_err();
        let ioerr: std::io::Error = err.into();
        assert_eq!(ioerr.raw_os_error(), Some(libc::EINVAL));
    }

    #[tokio::test]
    async fn set_size_truncates_and_extends() {
        let file = file();
        file.write_at(0, b"abcdef").await.unwrap();
        file.set_size(3).await.unwrap();
        assert_eq!(file.buffered().await.unwrap(), b"abc");
        file.set_size(5).await.unwrap();
        assert_eq!(file.buffered().await.unwrap(), b"abc\0\0");
        assert!(file.is_dirty().await);
    }

    #[test]
    fn read_slice_hits_eof_at_true_length() {
        // The reported size is a deliberate overestimate (SIZE_FLOOR); reads
        // past the buffered length must return no bytes so tools stop there.
        let data = b"hello";
        assert_eq!(read_slice(data, 0, 5), b"hello");
        assert_eq!(read_slice(data, 2, 100), b"llo");
        assert_eq!(read_slice(data, 5, 10), b"");
        assert_eq!(read_slice(data, 1000, 10), b"");
    }

    #[test]
    fn attr_reports_the_size_lie() {
        let file = file();
        let attr = file.attr();
        assert_eq!(attr.size, SIZE_FLOOR);
        assert_eq!(attr.perm, 0o664);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.gid, 1000);
        file.touch();
        file.touch();
        assert_eq!(file.attr().size, SIZE_FLOOR + 2);
    }

    #[test]
    fn touch_advances_mtime() {
        let file = file();
        let before = file.attr().mtime;
        file.touch();
        let after = file.attr().mtime;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn created_files_start_dirty() {
        let data = skeleton_manifest(&pod_kind(), "web", Some("x")).into_bytes();
        let file = ResourceFile::new_dirty(9, "web", pod_kind(), "x", false, data);
        assert!(file.is_dirty().await);
        assert!(file.buffered().await.is_some());
    }

    #[test]
    fn basename_uses_the_codec() {
        assert_eq!(file().basename(), "web.pod.core.v1.yaml");
        assert_eq!(file().log_ref(), "core/v1/Pod/x/web");
    }

    #[test]
    fn skeleton_for_namespaced_kind() {
        let text = skeleton_manifest(&pod_kind(), "web", Some("x"));
        assert_eq!(
            text,
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: web\n  namespace: x\n"
        );
    }

    #[test]
    fn skeleton_for_cluster_scoped_kind() {
        let kind = KindRef {
            group: "rbac.authorization.k8s.io".to_string(),
            version: "v1".to_string(),
            kind: "ClusterRole".to_string(),
            plural: "clusterroles".to_string(),
            namespaced: false,
        };
        let text = skeleton_manifest(&kind, "admin", None);
        assert_eq!(
            text,
            "apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: admin\n"
        );
    }
}
