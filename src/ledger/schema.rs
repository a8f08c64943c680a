diesel::table! {
    conversations (id) {
        id -> Text,
        title -> Nullable<Text>,
        status -> Text,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    messages (id) {
        id -> Integer,
        conversation_id -> Text,
        role -> Text,
        content -> Text,
        created_at -> BigInt,
        processed -> Bool,
        is_error -> Bool,
        parent_message_id -> Nullable<Integer>,
        content_fingerprint -> Text,
    }
}
