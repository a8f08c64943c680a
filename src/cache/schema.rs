diesel::table! {
    search_cache (key) {
        key -> Text,
        raw_query -> Text,
        payload -> Text,
        source -> Text,
        written_at -> BigInt,
        ttl_minutes -> Integer,
    }
}
