use super::{SqlCacheInterfaceTestItems, CACHE_ROOT};
use crate::db::{LimitNumEntries, MaxCountLruStrategy, SimpleCacheManager};
use crate::usage_tracker::UsageTracker;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

const MAX_COUNT: u32 = 10;

struct TestItems {
    cache_mgr: SimpleCacheManager,
    remove_calls: Rc<RefCell<Vec<String>>>,
}

fn setup() -> TestItems {
    let SqlCacheInterfaceTestItems {
        sql_mgr,
        remove_calls,
    } = super::setup_db();
    let db = Rc::new(RefCell::new(sql_mgr));
    let clone = Rc::clone(&db);
    let strat = MaxCountLruStrategy::new(MAX_COUNT, clone);
    TestItems {
        cache_mgr: SimpleCacheManager::new(db, strat),
        remove_calls,
    }
}

#[test]
fn test_cache_management() {
    let TestItems {
        mut cache_mgr,
        remove_calls,
    } = setup();

    let num_reqs = MAX_COUNT + 5;
    let keys: Vec<String> = (0..num_reqs)
        .map(|i| format!("folder/data1/D{}.jpg", i))
        .collect();

    for (i, key) in keys.iter().enumerate() {
        cache_mgr.log_request(key.to_string());
        if i >= MAX_COUNT as usize {
            // Once the cache is full, every new entry evicts the oldest one.
            let ind = i - MAX_COUNT as usize;
            let expected = Path::new(CACHE_ROOT).join(&keys[ind]);
            assert_eq!(expected.to_str().unwrap(), remove_calls.borrow()[ind]);
        }
    }

    let exp_removes = (num_reqs - MAX_COUNT) as usize;
    assert_eq!(exp_removes, remove_calls.borrow().len());
    assert_eq!(MAX_COUNT, cache_mgr.strategy.size());
}

#[test]
fn test_hits_keep_entries_alive() {
    let TestItems {
        mut cache_mgr,
        remove_calls,
    } = setup();

    let first = "folder/massOverTime.pb".to_string();
    cache_mgr.log_request(first.clone());
    for i in 0..MAX_COUNT {
        cache_mgr.log_request(format!("folder/data1/D{}.jpg", i));
        cache_mgr.log_request(first.clone());
    }

    assert_eq!(1, remove_calls.borrow().len());
    assert!(remove_calls.borrow()[0].ends_with("D0.jpg"));
}
