/*

Copyright 2020 The Johns Hopkins University Applied Physics Laboratory

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.

*/

/// SQL database module.
///
/// Keeps an index of the cached artifacts so the cache can be held to a
/// maximum number of files.
pub mod models;
pub mod schema;

use super::error::{Error, Result};
use super::usage_tracker::UsageTracker;
use chrono::prelude::*;
use diesel::prelude::*;
use models::{CacheEntry, CacheRoot, NewCacheEntry, NewCacheRoot};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[cfg(test)]
pub mod tests;

pub trait Scheduling {
    /// Returns true if it's time to start removing entries from the cache.
    fn ready_for_cleaning(&self) -> bool;
}

pub trait Selection {
    /// Chooses entries to remove from the cache.
    fn select_entries_for_removal(&self) -> Vec<CacheEntry>;
}

pub trait LeastRecentlyUsed {
    /// Find the `num` least recently used entries in the cache.  This is one
    /// selection strategy.
    ///
    /// # Arguments:
    ///
    /// * `num` - How many entries to retrieve.
    fn find_lru(&self, num: u32) -> Vec<CacheEntry>;
}

/// A primitive way of managing the size of the cache.  Just limit the
/// maximum number of files stored.
pub trait LimitNumEntries {
    fn get_max_entries(&self) -> u32;

    fn set_max_entries(&mut self, max: u32);

    /// Get the current number of entries stored in the cache.
    fn size(&self) -> u32;

    fn set_size(&mut self, num: u32);

    /// Update the count by adding the given number.
    fn add(&mut self, num: u32);

    /// Update the count by subtracting the given number.  If result would
    /// be a negative number, count is set to zero.
    fn sub(&mut self, num: u32);
}

/// Limit the number of cached files by evicting the least recently used
/// ones.
pub struct MaxCountLruStrategy {
    max_entries: u32,
    num_entries: u32,
    finder: Rc<RefCell<dyn LeastRecentlyUsed>>,
}

impl Scheduling for MaxCountLruStrategy {
    fn ready_for_cleaning(&self) -> bool {
        self.size() > self.get_max_entries()
    }
}

impl LimitNumEntries for MaxCountLruStrategy {
    fn get_max_entries(&self) -> u32 {
        self.max_entries
    }

    fn set_max_entries(&mut self, max: u32) {
        self.max_entries = max;
    }

    fn size(&self) -> u32 {
        self.num_entries
    }

    fn set_size(&mut self, num: u32) {
        self.num_entries = num;
    }

    fn add(&mut self, num: u32) {
        self.num_entries += num;
    }

    fn sub(&mut self, num: u32) {
        self.num_entries = self.num_entries.saturating_sub(num);
    }
}

impl Selection for MaxCountLruStrategy {
    fn select_entries_for_removal(&self) -> Vec<CacheEntry> {
        let num_to_remove = self.size() as i64 - self.get_max_entries() as i64;
        if num_to_remove <= 0 {
            return Vec::new();
        }
        self.finder.borrow().find_lru(num_to_remove as u32)
    }
}

impl MaxCountLruStrategy {
    pub fn new(max_entries: u32, finder: Rc<RefCell<dyn LeastRecentlyUsed>>) -> MaxCountLruStrategy {
        MaxCountLruStrategy {
            max_entries,
            num_entries: 0,
            finder,
        }
    }
}

/// Do simple cache management with cache data backed by SQLite.
pub struct SimpleCacheManager {
    /// All DB accesses use this object.
    db: Rc<RefCell<SqliteCacheInterface>>,
    /// Keep no more than _n_ files; remove least recently used.
    strategy: MaxCountLruStrategy,
}

impl UsageTracker for SimpleCacheManager {
    fn log_request(&mut self, key: String) {
        if self.db.borrow_mut().log_request(&key) {
            // Added a new entry, so check if time to start cleaning cache.
            self.strategy.add(1);
            if self.strategy.ready_for_cleaning() {
                let entries = self.strategy.select_entries_for_removal();
                let num_removed = self.db.borrow_mut().clean_cache(entries);
                self.strategy.sub(num_removed);
            }
        }
    }
}

impl SimpleCacheManager {
    /// The strategy starts from the number of entries already indexed, so a
    /// restart doesn't let the cache grow past its limit.
    pub fn new(db: Rc<RefCell<SqliteCacheInterface>>, mut strategy: MaxCountLruStrategy) -> SimpleCacheManager {
        strategy.set_size(db.borrow().count());
        SimpleCacheManager { db, strategy }
    }
}

/// Wrap file removal for use in testing.
trait FileRemover {
    fn remove(&self, path: &Path) -> std::io::Result<()>;
}

struct RealFileRemover {}

impl FileRemover for RealFileRemover {
    fn remove(&self, path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Provides an API for maintaining cache metadata via SQLite.
pub struct SqliteCacheInterface {
    connection: SqliteConnection,
    /// id of the cache root in the `cache_roots` table.  Need for inserts into
    /// `cache_entries` table.
    cache_root_id: i32,
    /// Store all cache roots encountered during execution.
    cache_root_map: HashMap<i32, PathBuf>,
    /// Removes cached files from the file system.
    file: Rc<dyn FileRemover>,
}

impl LeastRecentlyUsed for SqliteCacheInterface {
    fn find_lru(&self, num: u32) -> Vec<CacheEntry> {
        use schema::cache_entries::dsl::*;
        match cache_entries
            .order((last_accessed, id))
            .limit(num as i64)
            .load::<CacheEntry>(&self.connection)
        {
            Ok(rows) => rows,
            Err(e) => {
                error!("Error getting LRU cache entries: {}", e);
                Vec::new()
            }
        }
    }
}

diesel_migrations::embed_migrations!();

impl SqliteCacheInterface {
    /// Constructor.
    ///
    /// # Arguments:
    ///
    /// * `db_url` - Connection string for the Sqlite DB
    /// * `cache_root` - Absolute path of the cache the DB indexes
    pub fn new(db_url: &str, cache_root: &Path) -> Result<SqliteCacheInterface> {
        let connection = SqliteConnection::establish(db_url)
            .map_err(|e| Error::Config(format!("Error connecting to {}: {}", db_url, e)))?;
        embedded_migrations::run(&connection)
            .map_err(|e| Error::Config(format!("Error running database migrations: {}", e)))?;
        SqliteCacheInterface::init(connection, cache_root, Rc::new(RealFileRemover {}))
    }

    /// Completes setup of the manager.  Called directly by the `new()` constructor.
    fn init(
        connection: SqliteConnection,
        cache_root: &Path,
        file_remover: Rc<dyn FileRemover>,
    ) -> Result<SqliteCacheInterface> {
        let cache_root_id = SqliteCacheInterface::get_cache_root_id(&connection, cache_root)?;
        let mut cache_root_map = HashMap::new();
        cache_root_map.insert(cache_root_id, cache_root.to_path_buf());

        Ok(SqliteCacheInterface {
            connection,
            cache_root_id,
            cache_root_map,
            file: file_remover,
        })
    }

    /// Remove the given list of entries from the cache.  Returns the number
    /// of entries successfully removed.
    pub fn clean_cache(&mut self, unwanted: Vec<CacheEntry>) -> u32 {
        let mut remove_count: u32 = 0;

        for entry in unwanted.iter() {
            let root_path = match self.get_cache_root_path_from_map(entry.cache_root) {
                Some(root_path) => root_path,
                None => continue,
            };
            let file_path = root_path.join(&entry.entry_key);
            if let Err(e) = self.file.remove(&file_path) {
                warn!("Error removing {}: {}", file_path.display(), e);
                continue;
            }
            match self.remove_entry(entry.id) {
                Ok(()) => remove_count += 1,
                Err(e) => warn!("Error removing {} from DB: {}", entry.entry_key, e),
            }
        }

        remove_count
    }

    /// Number of indexed entries.
    pub fn count(&self) -> u32 {
        use schema::cache_entries::dsl::*;
        cache_entries
            .count()
            .get_result::<i64>(&self.connection)
            .map(|n| n as u32)
            .unwrap_or(0)
    }

    /// Looks up the id of the cache root, adding it if it's new.
    fn get_cache_root_id(connection: &SqliteConnection, root: &Path) -> Result<i32> {
        use schema::cache_roots::dsl::*;
        let root = root.to_string_lossy().to_string();
        let row = cache_roots
            .filter(path.eq(&root))
            .get_result::<CacheRoot>(connection)
            .optional()?;
        match row {
            Some(row) => Ok(row.id),
            None => {
                diesel::insert_into(cache_roots)
                    .values(NewCacheRoot { path: root.clone() })
                    .execute(connection)?;
                Ok(cache_roots
                    .filter(path.eq(&root))
                    .select(id)
                    .get_result::<i32>(connection)?)
            }
        }
    }

    /// Get the cache root path from the internal hashmap.  If it doesn't
    /// exist in the hashmap, load the path from the DB and add it to the
    /// hashmap.
    fn get_cache_root_path_from_map(&mut self, root_id: i32) -> Option<PathBuf> {
        use schema::cache_roots::dsl::*;
        if let Some(root_path) = self.cache_root_map.get(&root_id) {
            return Some(root_path.clone());
        }

        match cache_roots
            .select(path)
            .filter(id.eq(root_id))
            .get_result::<String>(&self.connection)
        {
            Ok(root_path) => {
                let root_path = PathBuf::from(root_path);
                self.cache_root_map.insert(root_id, root_path.clone());
                Some(root_path)
            }
            Err(_) => None,
        }
    }

    /// Record an access to `key`. Returns true when the entry is new.
    fn log_request(&self, key: &str) -> bool {
        use schema::cache_entries::dsl::*;
        let now = Utc::now().naive_utc();

        match diesel::update(
            cache_entries
                .filter(cache_root.eq(self.cache_root_id))
                .filter(entry_key.eq(key)),
        )
        .set((requests.eq(requests + 1), last_accessed.eq(now)))
        .execute(&self.connection)
        {
            Err(err) => {
                error!("Error updating DB: {}", err);
                false
            }
            Ok(num_rows) if num_rows > 0 => false,
            Ok(_) => {
                let new_entry = NewCacheEntry {
                    cache_root: self.cache_root_id,
                    entry_key: key.to_string(),
                    requests: 1,
                    created: now,
                    last_accessed: now,
                };
                match diesel::insert_into(cache_entries)
                    .values(&new_entry)
                    .execute(&self.connection)
                {
                    Ok(_) => true,
                    Err(err) => {
                        error!("Insert failed: {}", err);
                        false
                    }
                }
            }
        }
    }

    fn remove_entry(&self, entry_id: i32) -> QueryResult<()> {
        use schema::cache_entries::dsl::*;
        diesel::delete(cache_entries.filter(id.eq(entry_id))).execute(&self.connection)?;
        Ok(())
    }
}
