use super::schema;
use chrono::NaiveDateTime;
use schema::cache_entries;
use schema::cache_roots;

#[derive(Identifiable, Queryable)]
pub struct CacheRoot {
    pub id: i32,
    pub path: String,
}

#[derive(Insertable)]
#[table_name = "cache_roots"]
pub struct NewCacheRoot {
    pub path: String,
}

/// One cached artifact. `entry_key` is its path relative to the cache root.
#[derive(Debug, PartialEq, Identifiable, Queryable, Insertable)]
#[table_name = "cache_entries"]
pub struct CacheEntry {
    pub id: i32,
    pub cache_root: i32,
    pub entry_key: String,
    pub requests: i64,
    pub created: NaiveDateTime,
    pub last_accessed: NaiveDateTime,
}

#[derive(Insertable)]
#[table_name = "cache_entries"]
pub struct NewCacheEntry {
    pub cache_root: i32,
    pub entry_key: String,
    pub requests: i64,
    pub created: NaiveDateTime,
    pub last_accessed: NaiveDateTime,
}
