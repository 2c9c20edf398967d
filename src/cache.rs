/// Cache module.
///
/// Converted artifacts are kept on local disk under
/// `<cache_root>/<folder_id>/<filename>` and served from there on later
/// requests. Data sources are layered: a request goes to the cache layer
/// first, which falls through to its next layer (the drive relay) on a miss
/// and keeps what comes back.
use crate::drive::{self, DriveService};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Mutex;

pub struct DiskCache {
    root: PathBuf,
    /// Receives the key of every cache write and hit, when usage tracking
    /// is on.
    usage: Option<Mutex<Sender<String>>>,
}

/// Folder ids may carry sub-folders (`<id>/data3`), names may not.
fn check_segments(value: &str, allow_nested: bool) -> Result<()> {
    let bad = |why: &str| Err(Error::BadRequest(format!("{} `{}`", why, value)));
    if value.is_empty() {
        return bad("empty cache key");
    }
    if value.starts_with('/') || value.contains('\\') || value.contains(':') {
        return bad("absolute cache key");
    }
    if !allow_nested && value.contains('/') {
        return bad("nested cache name");
    }
    for segment in value.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return bad("invalid cache key");
        }
    }
    Ok(())
}

impl DiskCache {
    pub fn new(root: PathBuf) -> DiskCache {
        DiskCache { root, usage: None }
    }

    pub fn with_usage_tracker(root: PathBuf, usage: Option<Sender<String>>) -> DiskCache {
        DiskCache {
            root,
            usage: usage.map(Mutex::new),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The key reported to the usage tracker; also the entry's path relative
    /// to the cache root.
    pub fn key(folder_id: &str, name: &str) -> String {
        format!("{}/{}", folder_id, name)
    }

    pub fn path(&self, folder_id: &str, name: &str) -> Result<PathBuf> {
        check_segments(folder_id, true)?;
        check_segments(name, false)?;
        Ok(self.root.join(folder_id).join(name))
    }

    fn report(&self, folder_id: &str, name: &str) {
        if let Some(usage) = &self.usage {
            let key = DiskCache::key(folder_id, name);
            match usage.lock() {
                Ok(sender) => {
                    if sender.send(key).is_err() {
                        warn!("Usage tracker is gone");
                    }
                }
                Err(_) => warn!("Usage tracker sender poisoned"),
            }
        }
    }

    pub fn is_cached(&self, folder_id: &str, name: &str) -> Result<bool> {
        Ok(self.path(folder_id, name)?.is_file())
    }

    pub fn read(&self, folder_id: &str, name: &str) -> Result<Vec<u8>> {
        let data = self.read_untracked(folder_id, name)?;
        self.report(folder_id, name);
        Ok(data)
    }

    /// Read without telling the usage tracker. Entries the tracker never
    /// hears about are never evicted.
    pub fn read_untracked(&self, folder_id: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.path(folder_id, name)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(DiskCache::key(folder_id, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store `data`, creating folders as needed. The file appears
    /// atomically, so concurrent readers never see half an artifact.
    pub fn write(&self, folder_id: &str, name: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.write_untracked(folder_id, name, data)?;
        self.report(folder_id, name);
        Ok(path)
    }

    /// Store `data` without telling the usage tracker, so it stays until
    /// overwritten.
    pub fn write_untracked(&self, folder_id: &str, name: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.path(folder_id, name)?;
        let dir = self.root.join(folder_id);
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        debug!("Cached {}", path.display());
        Ok(path)
    }

    pub fn local_modified(&self, folder_id: &str, name: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.path(folder_id, name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Cached and written strictly after the remote copy last changed.
    pub fn is_fresh(&self, folder_id: &str, name: &str, remote_modified: DateTime<Utc>) -> Result<bool> {
        Ok(match self.local_modified(folder_id, name)? {
            Some(local) => local > remote_modified,
            None => false,
        })
    }
}

/// Somewhere artifacts can be fetched from.
#[rocket::async_trait]
pub trait ArtifactSource: Send + Sync {
    /// The artifact's bytes, or `None` when this source doesn't have it.
    async fn fetch(&self, folder_id: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// When the artifact last changed here, if known.
    async fn modified(&self, _folder_id: &str, _name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    /// Default to the null source to end the chain.
    fn next_layer(&self) -> &dyn ArtifactSource {
        &NullSource {}
    }
}

/// End of every chain; has nothing.
pub struct NullSource {}

#[rocket::async_trait]
impl ArtifactSource for NullSource {
    async fn fetch(&self, _folder_id: &str, _name: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Reads artifacts straight from the drive.
///
/// A folder id `<id>/a/b` resolves to the folder `b` inside `a` inside the
/// drive folder `<id>`. `subfolder` is spliced in right after `<id>`, for
/// artifacts that live in a fixed folder remotely but not in the cache
/// (`massOverTime.pb` sits in `.vizMetaData`).
pub struct DriveRelay<'a> {
    drive: &'a dyn DriveService,
    subfolder: Option<&'a str>,
}

impl<'a> DriveRelay<'a> {
    pub fn new(drive: &'a dyn DriveService) -> DriveRelay<'a> {
        DriveRelay {
            drive,
            subfolder: None,
        }
    }

    pub fn within(drive: &'a dyn DriveService, subfolder: &'a str) -> DriveRelay<'a> {
        DriveRelay {
            drive,
            subfolder: Some(subfolder),
        }
    }

    async fn resolve_folder(&self, folder_id: &str) -> Result<Option<String>> {
        let mut segments = folder_id.split('/');
        let mut current = match segments.next() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(Error::BadRequest("empty folder id".to_string())),
        };
        for name in self.subfolder.into_iter().chain(segments) {
            match drive::find_file(self.drive, &current, name).await? {
                Some(folder) => current = folder.id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub async fn locate(&self, folder_id: &str, name: &str) -> Result<Option<drive::DriveFile>> {
        match self.resolve_folder(folder_id).await? {
            Some(folder) => drive::find_file(self.drive, &folder, name).await,
            None => Ok(None),
        }
    }
}

#[rocket::async_trait]
impl<'a> ArtifactSource for DriveRelay<'a> {
    async fn fetch(&self, folder_id: &str, name: &str) -> Result<Option<Vec<u8>>> {
        match self.locate(folder_id, name).await? {
            Some(file) => {
                info!("Downloading {} from {}", name, folder_id);
                Ok(Some(self.drive.download(&file.id).await?))
            }
            None => Ok(None),
        }
    }

    async fn modified(&self, folder_id: &str, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.locate(folder_id, name).await? {
            Some(file) => Ok(Some(drive::modified_time(self.drive, &file).await?)),
            None => Ok(None),
        }
    }
}

/// Read-through disk cache in front of another source.
pub struct CacheLayer<'a> {
    cache: &'a DiskCache,
    next_layer: Box<dyn ArtifactSource + 'a>,
    /// Compare cached copies against the next layer's modification time.
    revalidate: bool,
}

impl<'a> CacheLayer<'a> {
    pub fn new(cache: &'a DiskCache, next_layer: Box<dyn ArtifactSource + 'a>) -> CacheLayer<'a> {
        CacheLayer {
            cache,
            next_layer,
            revalidate: false,
        }
    }

    pub fn revalidating(cache: &'a DiskCache, next_layer: Box<dyn ArtifactSource + 'a>) -> CacheLayer<'a> {
        CacheLayer {
            cache,
            next_layer,
            revalidate: true,
        }
    }
}

#[rocket::async_trait]
impl<'a> ArtifactSource for CacheLayer<'a> {
    async fn fetch(&self, folder_id: &str, name: &str) -> Result<Option<Vec<u8>>> {
        if self.cache.is_cached(folder_id, name)? {
            if !self.revalidate {
                return Ok(Some(self.cache.read(folder_id, name)?));
            }
            match self.next_layer().modified(folder_id, name).await? {
                Some(remote) if !self.cache.is_fresh(folder_id, name, remote)? => {
                    info!("Cached {}/{} is stale", folder_id, name);
                }
                _ => {
                    info!("Loading cached {} from {}", name, folder_id);
                    return Ok(Some(self.cache.read(folder_id, name)?));
                }
            }
        }
        match self.next_layer().fetch(folder_id, name).await? {
            Some(data) => {
                self.cache.write(folder_id, name, &data)?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn modified(&self, folder_id: &str, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.cache.local_modified(folder_id, name)
    }

    fn next_layer(&self) -> &dyn ArtifactSource {
        self.next_layer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::mock::MockDrive;
    use chrono::Duration;
    use std::sync::mpsc;

    fn cache() -> (tempfile::TempDir, DiskCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        (dir, cache)
    }

    #[test]
    fn test_write_then_read_nested_folder() {
        let (dir, cache) = cache();
        assert!(!cache.is_cached("abc/data3", "D0.jpg").unwrap());
        let path = cache.write("abc/data3", "D0.jpg", b"jpeg").unwrap();
        assert_eq!(dir.path().join("abc").join("data3").join("D0.jpg"), path);
        assert!(cache.is_cached("abc/data3", "D0.jpg").unwrap());
        assert_eq!(b"jpeg".to_vec(), cache.read("abc/data3", "D0.jpg").unwrap());
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let (_dir, cache) = cache();
        for (folder, name) in &[
            ("..", "x"),
            ("abc/../..", "x"),
            ("/etc", "passwd"),
            ("abc", "../x"),
            ("abc", "a/b"),
            ("", "x"),
            ("abc//def", "x"),
            ("abc", ""),
        ] {
            match cache.path(folder, name) {
                Err(Error::BadRequest(_)) => (),
                other => panic!("{}/{} accepted: {:?}", folder, name, other),
            }
        }
        assert!(cache.path("abc", ".vizMetaData").is_ok());
    }

    #[test]
    fn test_missing_entry_is_not_found() {
        let (_dir, cache) = cache();
        match cache.read("abc", "nope.pb") {
            Err(Error::NotFound(key)) => assert_eq!("abc/nope.pb", key),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(None, cache.local_modified("abc", "nope.pb").unwrap());
    }

    #[test]
    fn test_freshness_needs_strictly_later_local_copy() {
        let (_dir, cache) = cache();
        let now = Utc::now();
        assert!(!cache.is_fresh("abc", "m.pb", now - Duration::hours(1)).unwrap());
        cache.write("abc", "m.pb", b"x").unwrap();
        assert!(cache.is_fresh("abc", "m.pb", now - Duration::hours(1)).unwrap());
        assert!(!cache.is_fresh("abc", "m.pb", now + Duration::hours(1)).unwrap());
        let local = cache.local_modified("abc", "m.pb").unwrap().unwrap();
        assert!(!cache.is_fresh("abc", "m.pb", local).unwrap());
    }

    #[test]
    fn test_writes_and_hits_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let cache = DiskCache::with_usage_tracker(dir.path().to_path_buf(), Some(tx));
        cache.write("abc", "a.csv", b"1").unwrap();
        cache.read("abc", "a.csv").unwrap();
        let keys: Vec<String> = rx.try_iter().collect();
        assert_eq!(vec!["abc/a.csv".to_string(), "abc/a.csv".to_string()], keys);
    }

    #[test]
    fn test_untracked_entries_are_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let cache = DiskCache::with_usage_tracker(dir.path().to_path_buf(), Some(tx));
        cache.write_untracked("datasetList", "exp1.json", b"{}").unwrap();
        assert_eq!(b"{}".to_vec(), cache.read_untracked("datasetList", "exp1.json").unwrap());
        assert!(cache.read_untracked("datasetList", "exp2.json").is_err());
        assert_eq!(0, rx.try_iter().count());
    }

    #[rocket::async_test]
    async fn test_cache_layer_reads_through_to_drive() {
        let (_dir, cache) = cache();
        let drive = MockDrive::default();
        drive.add("data3-id", "data3", "abc", b"");
        drive.add("d0", "D0.jpg", "data3-id", b"remote jpeg");

        let layer = CacheLayer::new(&cache, Box::new(DriveRelay::new(&drive)));
        let first = layer.fetch("abc/data3", "D0.jpg").await.unwrap();
        assert_eq!(Some(b"remote jpeg".to_vec()), first);
        assert!(cache.is_cached("abc/data3", "D0.jpg").unwrap());

        let second = layer.fetch("abc/data3", "D0.jpg").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(vec!["d0".to_string()], *drive.downloads.lock().unwrap());

        assert_eq!(None, layer.fetch("abc/data4", "D0.jpg").await.unwrap());
    }

    #[rocket::async_test]
    async fn test_revalidating_layer_refetches_stale_copy() {
        let (_dir, cache) = cache();
        let drive = MockDrive::default();
        drive.add("meta", ".vizMetaData", "abc", b"");
        drive.add("pb", "massOverTime.pb", "meta", b"new");
        cache.write("abc", "massOverTime.pb", b"old").unwrap();

        drive.touch("pb", Utc::now() + Duration::hours(1));
        let layer = CacheLayer::revalidating(
            &cache,
            Box::new(DriveRelay::within(&drive, ".vizMetaData")),
        );
        let data = layer.fetch("abc", "massOverTime.pb").await.unwrap();
        assert_eq!(Some(b"new".to_vec()), data);

        drive.touch("pb", Utc::now() - Duration::hours(1));
        let data = layer.fetch("abc", "massOverTime.pb").await.unwrap();
        assert_eq!(Some(b"new".to_vec()), data);
        assert_eq!(1, drive.downloads.lock().unwrap().len());
    }
}
