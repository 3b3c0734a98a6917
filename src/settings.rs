pub struct Settings {
    // Upper bound on iterations over sentinel-terminated tables (associated objects, debug operations, interface table),
    // in case the terminator is missing or the table is garbage.
    pub max_table_entries: usize,
    // Upper bound on the extended descriptor's field count and on objOffsetsCount.
    pub max_fields: usize,
    // Bound on array payload size when the readable extent of the array's mapping can't be determined.
    pub max_array_bytes: usize,
    pub max_cstring_len: usize, // field names in the extended descriptor
    pub max_string_chars: usize, // kotlin.String contents
    pub max_supertype_chain: usize,

    // Rendering (pretty.rs), not decoding.
    pub print_depth: usize,
    pub print_max_children: usize,
}

impl Default for Settings {
    fn default() -> Self { Settings {
        max_table_entries: 4096,
        max_fields: 1 << 16,
        max_array_bytes: 256 << 20,
        max_cstring_len: 0x1000,
        max_string_chars: 1 << 20,
        max_supertype_chain: 256,

        print_depth: 3,
        print_max_children: 100,
    } }
}
