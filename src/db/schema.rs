table! {
    cache_roots (id) {
        id -> Integer,
        path -> Text,
    }
}

table! {
    cache_entries (id) {
        id -> Integer,
        cache_root -> Integer,
        entry_key -> Text,
        requests -> BigInt,
        created -> Timestamp,
        last_accessed -> Timestamp,
    }
}

joinable!(cache_entries -> cache_roots (cache_root));

allow_tables_to_appear_in_same_query!(
    cache_roots,
    cache_entries,
);
