use crate::db::{FileRemover, SqliteCacheInterface};
use diesel::prelude::*;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

pub mod simple_cache_manager;

const CACHE_ROOT: &str = "/var/cellviz/cache";

struct MockFileRemover {
    /// Stores calls to the mock file remover.
    calls: Rc<RefCell<Vec<String>>>,
}

impl FileRemover for MockFileRemover {
    fn remove(&self, path: &Path) -> std::io::Result<()> {
        if let Some(p) = path.to_str() {
            self.calls.borrow_mut().push(p.to_string());
        }
        Ok(())
    }
}

struct SqlCacheInterfaceTestItems {
    sql_mgr: SqliteCacheInterface,
    remove_calls: Rc<RefCell<Vec<String>>>,
}

/// Set up an in-memory Sqlite DB and return a SqliteCacheInterface for testing.
fn setup_db() -> SqlCacheInterfaceTestItems {
    let connection = SqliteConnection::establish(":memory:").unwrap();
    super::embedded_migrations::run(&connection).unwrap();
    let remove_calls = Rc::new(RefCell::new(Vec::<String>::new()));
    let remover = MockFileRemover {
        calls: Rc::clone(&remove_calls),
    };
    let sql_mgr =
        SqliteCacheInterface::init(connection, Path::new(CACHE_ROOT), Rc::new(remover)).unwrap();

    SqlCacheInterfaceTestItems {
        sql_mgr,
        remove_calls,
    }
}
