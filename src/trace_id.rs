/// Identifier a request carries outbound and its response must echo back.
pub type TraceId = u64;

/// Reserved value meaning "unset". Never carried by a real request or response.
pub const UNSET_TRACE_ID: TraceId = 0;

/// Draws random identifiers until one is non-zero and `is_taken` rejects it.
pub fn generate_trace_id(mut is_taken: impl FnMut(TraceId) -> bool) -> TraceId {
    loop {
        let candidate = rand::random::<u64>();
        if candidate != UNSET_TRACE_ID && !is_taken(candidate) {
            return candidate;
        }
    }
}
