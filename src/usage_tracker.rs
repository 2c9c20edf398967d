/// Usage Tracker module.
///
/// Tracks usage of the artifacts cached locally on disk.
///
/// A single thread receives keys from the request handlers as cached files
/// are written or read. The sending end lives in the managed `DiskCache`.
use super::cache::DiskCache;
use super::config::{self, CacheRoot, CONSOLE_TRACKER, DB_TRACKER, NONE_TRACKER};
use super::db::{MaxCountLruStrategy, SimpleCacheManager, SqliteCacheInterface};
use super::error::Result;
use rocket::fairing;
use rocket::{Build, Rocket};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;

#[derive(Debug, PartialEq)]
pub enum UsageTrackerType {
    None,
    Console,
    Sqlite,
}

/// Map string name of usage tracker to enum.  If no match is found, return
/// UsageTrackerType::None.
pub fn get_tracker_type(name: &str) -> UsageTrackerType {
    let lowered = name.to_lowercase();
    match lowered.as_str() {
        CONSOLE_TRACKER => UsageTrackerType::Console,
        NONE_TRACKER => UsageTrackerType::None,
        DB_TRACKER => UsageTrackerType::Sqlite,
        _ => {
            warn!("Got unknown usage tracker: {}", name);
            UsageTrackerType::None
        }
    }
}

fn usage_tracker_factory(
    kind: UsageTrackerType,
    db_url: &str,
    max_entries: u32,
    cache_root: &std::path::Path,
) -> Result<Box<dyn UsageTracker>> {
    Ok(match kind {
        UsageTrackerType::None => Box::new(NoneTracker {}),
        UsageTrackerType::Console => Box::new(ConsoleUsageTracker {}),
        UsageTrackerType::Sqlite => {
            let db_interface = SqliteCacheInterface::new(db_url, cache_root)?;
            let rc_db_iface = Rc::new(RefCell::new(db_interface));
            let clone = Rc::clone(&rc_db_iface);
            let strategy = MaxCountLruStrategy::new(max_entries, rc_db_iface);
            Box::new(SimpleCacheManager::new(clone, strategy))
        }
    })
}

/// Start the usage tracker thread and hand back the channel that feeds it.
/// Returns `None` when tracking is off.
///
/// # Arguments:
///
/// * `settings` - Which usage tracker to start, and its DB settings
/// * `cache_root` - Absolute path of the cache root
pub fn run(settings: &config::UsageTracker, cache_root: PathBuf) -> Option<mpsc::Sender<String>> {
    let kind = get_tracker_type(&settings.kind);
    if kind == UsageTrackerType::None {
        return None;
    }

    let (tx, rx) = mpsc::channel::<String>();
    let db_url = settings.db_url.clone();
    let max_entries = settings.max_entries;
    thread::spawn(move || {
        // The SQLite connection can't cross threads, so it's opened here.
        let mut usage_mgr = match usage_tracker_factory(kind, &db_url, max_entries, &cache_root) {
            Ok(mgr) => mgr,
            Err(e) => {
                error!("Usage tracker failed to start: {}", e);
                return;
            }
        };
        for key in rx {
            usage_mgr.log_request(key);
        }
    });
    Some(tx)
}

/// Fairing body: start tracking and install the disk cache as managed state.
/// Must run after the cache root and usage tracker settings are managed.
pub fn start_disk_cache(rocket: Rocket<Build>) -> fairing::Result {
    let root = match rocket.state::<CacheRoot>().map(|r| r.abs_path()) {
        Some(Ok(root)) => root,
        Some(Err(e)) => {
            error!("Cache root unusable: {}", e);
            return Err(rocket);
        }
        None => {
            error!("Cache root not configured");
            return Err(rocket);
        }
    };
    let sender = rocket
        .state::<config::UsageTracker>()
        .and_then(|settings| run(settings, root.clone()));
    Ok(rocket.manage(DiskCache::with_usage_tracker(root, sender)))
}

pub trait UsageTracker {
    /// Log request to console or DB.
    fn log_request(&mut self, key: String);
}

/// Empty tracker.
pub struct NoneTracker {}

impl UsageTracker for NoneTracker {
    fn log_request(&mut self, _key: String) {}
}

/// Most basic tracker - output to the log.
pub struct ConsoleUsageTracker {}

impl UsageTracker for ConsoleUsageTracker {
    fn log_request(&mut self, key: String) {
        info!("Request: {}", key);
    }
}
