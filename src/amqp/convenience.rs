//! Typed access to the headers the retry pipeline reads and writes.

use lapin::types::{AMQPValue, FieldTable};

/// Header carrying the number of times a delivery has been retried.
pub const RETRY_COUNT_HEADER: &str = "retry_nums";

/// Read the retry counter from a delivery's headers.
///
/// The counter travels as a 32-bit signed integer, but headers are dynamically
/// typed on the wire: a missing header or a value of any non-integer type
/// counts as 0.
pub fn retry_count(headers: Option<&FieldTable>) -> i32 {
    let Some(headers) = headers else {
        return 0;
    };
    match headers.inner().get(RETRY_COUNT_HEADER) {
        Some(AMQPValue::LongInt(v)) => *v,
        Some(AMQPValue::ShortShortInt(v)) => i32::from(*v),
        Some(AMQPValue::ShortInt(v)) => i32::from(*v),
        Some(AMQPValue::LongLongInt(v)) => *v as i32,
        _ => 0,
    }
}

/// Build the header table for a republished delivery.
pub fn retry_headers(count: i32) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(count));
    headers
}
